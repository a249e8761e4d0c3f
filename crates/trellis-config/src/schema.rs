use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub storage: StorageConfig,
    pub agents: AgentsConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    /// Directory holding the per-conversation event logs and the query cache.
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.trellis".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentDefaults {
    pub provider: String,
    pub model: String,
    /// Iteration ceiling handed to spawned subagents when the caller
    /// doesn't supply one.
    pub max_iterations: u32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: String::new(),
            max_iterations: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Capacity of the queue's notification broadcast channel.
    pub notify_buffer: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { notify_buffer: 64 }
    }
}
