use std::io::{BufRead, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{Branch, BranchKind, Message};
use crate::store::StoreError;

/// One durable mutation of a conversation's branch set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BranchEvent {
    BranchCreated {
        branch: Branch,
    },
    BranchUpdated {
        branch_id: String,
        kind: BranchKind,
        updated: chrono::DateTime<chrono::Utc>,
    },
    MessageAdded {
        branch_id: String,
        message: Message,
    },
    MessageUpdated {
        branch_id: String,
        message: Message,
    },
}

/// Append-only JSONL event log, one file per conversation.
///
/// The log is the sole source of truth; the query cache is derived from
/// it. Each event is serialized to a single line and appended with one
/// write call so a crash never leaves a half-written event.
pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    pub fn new(dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn log_path(&self, conversation_id: &str) -> PathBuf {
        // Conversation ids are uuids, but sanitize anyway.
        let safe: String = conversation_id
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | ' ' => '_',
                _ => c,
            })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Durably append one event. A failure here is fatal for the caller's
    /// operation.
    pub fn append(&self, conversation_id: &str, event: &BranchEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(conversation_id))?;
        // Single write keeps the event atomic on the append-only file.
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Replay every event for a conversation in append order, skipping
    /// malformed lines with a warning.
    pub fn replay(&self, conversation_id: &str) -> Result<Vec<BranchEvent>, StoreError> {
        let path = self.log_path(conversation_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&path)?;
        let reader = std::io::BufReader::new(file);

        let mut events = Vec::new();
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => continue,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<BranchEvent>(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping malformed event line in '{conversation_id}': {e}"),
            }
        }
        Ok(events)
    }

    pub fn exists(&self, conversation_id: &str) -> bool {
        self.log_path(conversation_id).exists()
    }

    /// List conversation ids that have a log file.
    pub fn conversations(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    return None;
                }
                path.file_stem().and_then(|s| s.to_str()).map(String::from)
            })
            .collect();
        ids.sort();
        ids
    }

    /// Remove a conversation's log file. Missing files are not an error.
    pub fn delete(&self, conversation_id: &str) -> Result<(), StoreError> {
        let path = self.log_path(conversation_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Role};

    fn human_branch(conversation_id: &str) -> Branch {
        Branch::new(
            conversation_id,
            "m4",
            BranchKind::Human {
                description: Some("alternative answer".into()),
            },
        )
    }

    #[test]
    fn test_append_then_replay_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().to_path_buf()).unwrap();

        let branch = human_branch("conv-1");
        log.append(
            "conv-1",
            &BranchEvent::BranchCreated {
                branch: branch.clone(),
            },
        )
        .unwrap();

        let mut msg = Message::new(Role::User, "hello");
        msg.sequence = 1;
        log.append(
            "conv-1",
            &BranchEvent::MessageAdded {
                branch_id: branch.id.clone(),
                message: msg,
            },
        )
        .unwrap();

        let events = log.replay("conv-1").unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], BranchEvent::BranchCreated { .. }));
        assert!(matches!(events[1], BranchEvent::MessageAdded { .. }));
    }

    #[test]
    fn test_replay_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().to_path_buf()).unwrap();

        let branch = human_branch("conv-2");
        log.append("conv-2", &BranchEvent::BranchCreated { branch }).unwrap();

        // Corrupt the log with a half-written line.
        let path = dir.path().join("conv-2.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        writeln!(file, "{{\"event\":\"branch_cre").unwrap();

        let events = log.replay("conv-2").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_replay_missing_conversation_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().to_path_buf()).unwrap();
        assert!(log.replay("nope").unwrap().is_empty());
    }

    #[test]
    fn test_delete_removes_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path().to_path_buf()).unwrap();

        let branch = human_branch("conv-3");
        log.append("conv-3", &BranchEvent::BranchCreated { branch }).unwrap();
        assert_eq!(log.conversations(), vec!["conv-3".to_string()]);

        log.delete("conv-3").unwrap();
        assert!(log.conversations().is_empty());
        assert!(log.replay("conv-3").unwrap().is_empty());
    }
}
