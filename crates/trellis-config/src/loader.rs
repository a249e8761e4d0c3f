use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Resolve a data directory path, expanding ~ to the home directory.
pub fn resolve_data_dir(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

/// Find the config file by searching standard locations.
pub fn find_config_path() -> PathBuf {
    // 1. Current directory
    let local = Path::new("config.json");
    if local.exists() {
        return local.to_path_buf();
    }

    // 2. ~/.trellis/config.json
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".trellis").join("config.json");
        if home_config.exists() {
            return home_config;
        }
    }

    // Default: ~/.trellis/config.json (will use defaults if missing)
    dirs::home_dir()
        .map(|h| h.join(".trellis").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}

/// Load configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Save configuration to a JSON file.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config directory '{}'",
                parent.to_string_lossy()
            )
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_data_dir_plain() {
        assert_eq!(resolve_data_dir("/var/lib/trellis"), PathBuf::from("/var/lib/trellis"));
    }

    #[test]
    fn test_resolve_data_dir_tilde() {
        let resolved = resolve_data_dir("~/.trellis");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolved, home.join(".trellis"));
        }
    }

    #[test]
    fn test_load_missing_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.storage.data_dir, "~/.trellis");
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.agents.defaults.max_iterations = 3;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.agents.defaults.max_iterations, 3);
    }
}
