pub mod cache;
pub mod log;

use std::path::Path;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::model::{Branch, BranchKind, Message, SubagentState};
use cache::QueryCache;
use log::{BranchEvent, EventLog};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("branch {0} is not a subagent branch")]
    NotSubagentBranch(String),
    #[error("query cache lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Event-sourced branch storage: an append-only JSONL log per
/// conversation plus a SQLite projection for reads.
///
/// Log appends are fatal on failure and propagate to the caller. Cache
/// writes are best-effort — the projection can always be rebuilt from
/// the logs, so a failed cache write is logged and swallowed.
pub struct BranchStore {
    log: EventLog,
    cache: QueryCache,
}

impl BranchStore {
    /// Open the store under a data directory. Logs live in
    /// `<data_dir>/logs/`, the cache at `<data_dir>/cache.sqlite`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let log = EventLog::new(data_dir.join("logs"))?;
        let cache = QueryCache::new(&data_dir.join("cache.sqlite"))?;
        Ok(Self { log, cache })
    }

    /// Durably append one event, then apply it to the projection.
    pub fn append_event(
        &self,
        conversation_id: &str,
        event: &BranchEvent,
    ) -> Result<(), StoreError> {
        self.log.append(conversation_id, event)?;
        if let Err(e) = self.cache.apply(event) {
            warn!("Cache write failed for conversation '{conversation_id}' (rebuildable): {e}");
        }
        Ok(())
    }

    pub fn get_branch(&self, branch_id: &str) -> Result<Branch, StoreError> {
        self.cache
            .get_branch(branch_id)?
            .ok_or_else(|| StoreError::BranchNotFound(branch_id.to_string()))
    }

    /// Messages of a branch ordered by sequence number.
    pub fn get_branch_messages(&self, branch_id: &str) -> Result<Vec<Message>, StoreError> {
        self.cache.branch_messages(branch_id)
    }

    pub fn branches_by_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Branch>, StoreError> {
        self.cache.branches_by_conversation(conversation_id)
    }

    pub fn branches_by_message(&self, parent_message_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.cache.branches_by_message(parent_message_id)
    }

    pub fn subagent_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.cache.subagent_branches(conversation_id)
    }

    /// Next sequence number for a branch: max(existing) + 1, computed at
    /// write time. Assumes a single writer per branch at a time.
    pub fn next_sequence(&self, branch_id: &str) -> Result<u64, StoreError> {
        Ok(self.cache.max_sequence(branch_id)? + 1)
    }

    /// Conversation ids known to the log.
    pub fn conversations(&self) -> Vec<String> {
        self.log.conversations()
    }

    /// Rebuild the projection from scratch by replaying every log.
    pub fn rebuild_cache(&self) -> Result<usize, StoreError> {
        self.cache.clear()?;
        let mut applied = 0;
        for conversation_id in self.log.conversations() {
            for event in self.log.replay(&conversation_id)? {
                if let Err(e) = self.cache.apply(&event) {
                    warn!("Replay skipped one event in '{conversation_id}': {e}");
                    continue;
                }
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Delete a conversation: mark its running subagent branches
    /// abandoned, then remove the log file and all cache rows. Returns
    /// the abandoned branches so callers can release executor state.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<Vec<Branch>, StoreError> {
        if !self.log.exists(conversation_id) {
            return Err(StoreError::ConversationNotFound(conversation_id.to_string()));
        }

        let mut abandoned = Vec::new();
        for branch in self.cache.subagent_branches(conversation_id)? {
            let BranchKind::Subagent { meta } = &branch.kind else {
                continue;
            };
            if meta.state != SubagentState::Running {
                continue;
            }
            let mut meta = meta.clone();
            meta.state = SubagentState::Abandoned;
            meta.completed_at = Some(Utc::now());
            let kind = BranchKind::Subagent { meta };
            self.append_event(
                conversation_id,
                &BranchEvent::BranchUpdated {
                    branch_id: branch.id.clone(),
                    kind,
                    updated: Utc::now(),
                },
            )?;
            abandoned.push(self.get_branch(&branch.id)?);
        }

        self.log.delete(conversation_id)?;
        self.cache.delete_conversation(conversation_id)?;
        Ok(abandoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, Role, SubagentMeta};

    fn open_store(dir: &Path) -> BranchStore {
        BranchStore::open(dir).unwrap()
    }

    fn subagent_branch(conversation_id: &str, state: SubagentState) -> Branch {
        Branch::new(
            conversation_id,
            "m0",
            BranchKind::Subagent {
                meta: SubagentMeta {
                    task: "summarize logs".into(),
                    subagent_id: "sa-1".into(),
                    state,
                    iterations: 0,
                    max_iterations: 5,
                    started_at: Utc::now(),
                    completed_at: None,
                    error: None,
                    prefetched_tools: None,
                },
            },
        )
    }

    #[test]
    fn test_branch_created_is_queryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let branch = subagent_branch("conv-1", SubagentState::Running);
        store
            .append_event(
                "conv-1",
                &BranchEvent::BranchCreated {
                    branch: branch.clone(),
                },
            )
            .unwrap();

        let loaded = store.get_branch(&branch.id).unwrap();
        assert_eq!(loaded.conversation_id, "conv-1");
        assert!(!loaded.inherit_context());

        assert_eq!(store.subagent_branches("conv-1").unwrap().len(), 1);
        assert_eq!(store.branches_by_message("m0").unwrap().len(), 1);
    }

    #[test]
    fn test_get_branch_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(matches!(
            store.get_branch("missing"),
            Err(StoreError::BranchNotFound(_))
        ));
    }

    #[test]
    fn test_sequence_numbers_are_monotonic_without_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let branch = subagent_branch("conv-1", SubagentState::Running);
        store
            .append_event(
                "conv-1",
                &BranchEvent::BranchCreated {
                    branch: branch.clone(),
                },
            )
            .unwrap();

        for i in 0..5 {
            let seq = store.next_sequence(&branch.id).unwrap();
            assert_eq!(seq, i + 1);
            let mut msg = Message::new(Role::User, &format!("msg {i}"));
            msg.sequence = seq;
            store
                .append_event(
                    "conv-1",
                    &BranchEvent::MessageAdded {
                        branch_id: branch.id.clone(),
                        message: msg,
                    },
                )
                .unwrap();
        }

        let messages = store.get_branch_messages(&branch.id).unwrap();
        let seqs: Vec<u64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rebuild_cache_answers_same_queries() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let branch = subagent_branch("conv-1", SubagentState::Running);
        store
            .append_event(
                "conv-1",
                &BranchEvent::BranchCreated {
                    branch: branch.clone(),
                },
            )
            .unwrap();
        let mut msg = Message::new(Role::User, "hello");
        msg.sequence = store.next_sequence(&branch.id).unwrap();
        store
            .append_event(
                "conv-1",
                &BranchEvent::MessageAdded {
                    branch_id: branch.id.clone(),
                    message: msg,
                },
            )
            .unwrap();

        let before = store.get_branch(&branch.id).unwrap();

        let applied = store.rebuild_cache().unwrap();
        assert_eq!(applied, 2);

        let after = store.get_branch(&branch.id).unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.messages.len(), before.messages.len());
        assert_eq!(store.subagent_branches("conv-1").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_conversation_abandons_running_subagents() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let running = subagent_branch("conv-1", SubagentState::Running);
        let done = subagent_branch("conv-1", SubagentState::Complete);
        for branch in [&running, &done] {
            store
                .append_event(
                    "conv-1",
                    &BranchEvent::BranchCreated {
                        branch: branch.clone(),
                    },
                )
                .unwrap();
        }

        let abandoned = store.delete_conversation("conv-1").unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].id, running.id);
        let meta = abandoned[0].kind.subagent_meta().unwrap();
        assert_eq!(meta.state, SubagentState::Abandoned);
        assert!(meta.completed_at.is_some());

        // Cascade removed both log and cache rows.
        assert!(store.conversations().is_empty());
        assert!(matches!(
            store.get_branch(&running.id),
            Err(StoreError::BranchNotFound(_))
        ));
    }

    #[test]
    fn test_delete_unknown_conversation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert!(matches!(
            store.delete_conversation("missing"),
            Err(StoreError::ConversationNotFound(_))
        ));
    }
}
