use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::model::{
    Branch, BranchKind, Conversation, Message, SubagentMeta, SubagentState, ToolRef,
};
use crate::store::log::BranchEvent;
use crate::store::{BranchStore, StoreError};

/// Domain operations over the branch store: branch creation, message
/// appends, metadata updates, and LLM context assembly.
pub struct BranchService {
    store: Arc<BranchStore>,
}

impl BranchService {
    pub fn new(store: Arc<BranchStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<BranchStore> {
        &self.store
    }

    /// Create a human alternative-response branch. Inherits context from
    /// the parent conversation up to the fork message.
    pub fn create_human_branch(
        &self,
        conversation_id: &str,
        message_id: &str,
        description: Option<&str>,
    ) -> Result<String, StoreError> {
        let branch = Branch::new(
            conversation_id,
            message_id,
            BranchKind::Human {
                description: description.map(String::from),
            },
        );
        let branch_id = branch.id.clone();
        self.store
            .append_event(conversation_id, &BranchEvent::BranchCreated { branch })?;
        Ok(branch_id)
    }

    /// Create an isolated subagent branch in the running state.
    #[allow(clippy::too_many_arguments)]
    pub fn create_subagent_branch(
        &self,
        conversation_id: &str,
        message_id: &str,
        task: &str,
        subagent_id: &str,
        max_iterations: u32,
        prefetched_tools: Option<Vec<ToolRef>>,
    ) -> Result<String, StoreError> {
        let branch = Branch::new(
            conversation_id,
            message_id,
            BranchKind::Subagent {
                meta: SubagentMeta {
                    task: task.to_string(),
                    subagent_id: subagent_id.to_string(),
                    state: SubagentState::Running,
                    iterations: 0,
                    max_iterations,
                    started_at: Utc::now(),
                    completed_at: None,
                    error: None,
                    prefetched_tools,
                },
            },
        );
        let branch_id = branch.id.clone();
        self.store
            .append_event(conversation_id, &BranchEvent::BranchCreated { branch })?;
        Ok(branch_id)
    }

    /// Append a message to a branch, assigning the next sequence number.
    /// Returns the stored message.
    pub fn add_message(&self, branch_id: &str, mut message: Message) -> Result<Message, StoreError> {
        let branch = self.store.get_branch(branch_id)?;
        message.sequence = self.store.next_sequence(branch_id)?;
        self.store.append_event(
            &branch.conversation_id,
            &BranchEvent::MessageAdded {
                branch_id: branch_id.to_string(),
                message: message.clone(),
            },
        )?;
        Ok(message)
    }

    /// Record a new state for an existing message (e.g. finalizing a
    /// streaming placeholder). The sequence number must be unchanged.
    pub fn update_message(&self, branch_id: &str, message: Message) -> Result<(), StoreError> {
        let branch = self.store.get_branch(branch_id)?;
        self.store.append_event(
            &branch.conversation_id,
            &BranchEvent::MessageUpdated {
                branch_id: branch_id.to_string(),
                message,
            },
        )
    }

    /// Merge a lifecycle update into a subagent branch's metadata.
    /// Fields not supplied keep their current values; `completed_at` is
    /// stamped on the transition into a terminal state.
    pub fn update_subagent_state(
        &self,
        branch_id: &str,
        state: SubagentState,
        iterations: Option<u32>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let branch = self.store.get_branch(branch_id)?;
        let BranchKind::Subagent { meta } = &branch.kind else {
            return Err(StoreError::NotSubagentBranch(branch_id.to_string()));
        };

        let mut meta = meta.clone();
        meta.state = state;
        if let Some(iterations) = iterations {
            meta.iterations = iterations;
        }
        if error.is_some() {
            meta.error = error;
        }
        if state.is_terminal() && meta.completed_at.is_none() {
            meta.completed_at = Some(Utc::now());
        }
        if state == SubagentState::Running {
            // Resuming a max-iterations branch clears the previous end.
            meta.completed_at = None;
        }

        debug!(
            "Branch {branch_id} -> {} (iterations: {})",
            state.as_str(),
            meta.iterations
        );

        self.store.append_event(
            &branch.conversation_id,
            &BranchEvent::BranchUpdated {
                branch_id: branch_id.to_string(),
                kind: BranchKind::Subagent { meta },
                updated: Utc::now(),
            },
        )
    }

    /// Re-enter the running state on an existing subagent branch (the
    /// continue path after a max-iterations stop), re-keying it to the
    /// new subagent id.
    pub fn reopen_subagent_branch(
        &self,
        branch_id: &str,
        subagent_id: &str,
    ) -> Result<(), StoreError> {
        let branch = self.store.get_branch(branch_id)?;
        let BranchKind::Subagent { meta } = &branch.kind else {
            return Err(StoreError::NotSubagentBranch(branch_id.to_string()));
        };

        let mut meta = meta.clone();
        meta.subagent_id = subagent_id.to_string();
        meta.state = SubagentState::Running;
        meta.completed_at = None;
        meta.error = None;

        self.store.append_event(
            &branch.conversation_id,
            &BranchEvent::BranchUpdated {
                branch_id: branch_id.to_string(),
                kind: BranchKind::Subagent { meta },
                updated: Utc::now(),
            },
        )
    }

    /// Build the ordered message list for an LLM call on a branch.
    ///
    /// Context-inheriting branches see the parent conversation up to and
    /// including the fork message, then their own messages. If the fork
    /// message has been deleted from the parent, only the branch's own
    /// messages are returned rather than failing. Non-inheriting
    /// (subagent) branches always get their own messages only.
    pub fn build_llm_context(
        &self,
        conversation: &Conversation,
        branch_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let branch = self.store.get_branch(branch_id)?;
        let own = self.store.get_branch_messages(branch_id)?;

        if !branch.inherit_context() {
            return Ok(own);
        }

        let parent_index = conversation
            .messages
            .iter()
            .position(|m| m.id == branch.parent_message_id);

        match parent_index {
            Some(index) => {
                let mut context: Vec<Message> = conversation.messages[..=index].to_vec();
                context.extend(own);
                Ok(context)
            }
            None => {
                debug!(
                    "Parent message {} missing from conversation {}; using branch messages only",
                    branch.parent_message_id, conversation.id
                );
                Ok(own)
            }
        }
    }

    pub fn get_branch(&self, branch_id: &str) -> Result<Branch, StoreError> {
        self.store.get_branch(branch_id)
    }

    pub fn all_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.store.branches_by_conversation(conversation_id)
    }

    pub fn subagent_branches(&self, conversation_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.store.subagent_branches(conversation_id)
    }

    pub fn branches_by_message(&self, parent_message_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.store.branches_by_message(parent_message_id)
    }

    /// Cascade-delete a conversation's branches. Returns branches whose
    /// subagents were still running (now abandoned).
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<Vec<Branch>, StoreError> {
        self.store.delete_conversation(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn service() -> (tempfile::TempDir, BranchService) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BranchStore::open(dir.path()).unwrap());
        (dir, BranchService::new(store))
    }

    fn conversation_with_messages(count: usize) -> Conversation {
        let mut conversation = Conversation::new("primary");
        for i in 0..count {
            let mut msg = Message::new(
                if i % 2 == 0 { Role::User } else { Role::Assistant },
                &format!("m{i}"),
            );
            msg.id = format!("m{i}");
            conversation.messages.push(msg);
        }
        conversation
    }

    #[test]
    fn test_human_branch_context_includes_parent_prefix() {
        let (_dir, service) = service();
        let conversation = conversation_with_messages(10);

        let branch_id = service
            .create_human_branch(&conversation.id, "m4", Some("alternate reply"))
            .unwrap();
        for text in ["b0", "b1"] {
            service
                .add_message(&branch_id, Message::new(Role::User, text))
                .unwrap();
        }

        let context = service.build_llm_context(&conversation, &branch_id).unwrap();
        let contents: Vec<&str> = context
            .iter()
            .map(|m| m.content.as_deref().unwrap())
            .collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4", "b0", "b1"]);
    }

    #[test]
    fn test_subagent_branch_context_is_isolated() {
        let (_dir, service) = service();
        let conversation = conversation_with_messages(10);

        let branch_id = service
            .create_subagent_branch(&conversation.id, "m4", "task", "sa-1", 3, None)
            .unwrap();
        for text in ["b0", "b1"] {
            service
                .add_message(&branch_id, Message::new(Role::User, text))
                .unwrap();
        }

        let context = service.build_llm_context(&conversation, &branch_id).unwrap();
        let contents: Vec<&str> = context
            .iter()
            .map(|m| m.content.as_deref().unwrap())
            .collect();
        assert_eq!(contents, vec!["b0", "b1"]);
    }

    #[test]
    fn test_missing_parent_message_falls_back_to_branch_messages() {
        let (_dir, service) = service();
        let conversation = conversation_with_messages(3);

        let branch_id = service
            .create_human_branch(&conversation.id, "deleted-message", None)
            .unwrap();
        service
            .add_message(&branch_id, Message::new(Role::User, "b0"))
            .unwrap();

        let context = service.build_llm_context(&conversation, &branch_id).unwrap();
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].content.as_deref(), Some("b0"));
    }

    #[test]
    fn test_update_subagent_state_merges_and_stamps_completed_at() {
        let (_dir, service) = service();
        let branch_id = service
            .create_subagent_branch("conv-1", "m0", "summarize", "sa-1", 5, None)
            .unwrap();

        service
            .update_subagent_state(&branch_id, SubagentState::Complete, Some(2), None)
            .unwrap();

        let branch = service.get_branch(&branch_id).unwrap();
        let meta = branch.kind.subagent_meta().unwrap();
        assert_eq!(meta.state, SubagentState::Complete);
        assert_eq!(meta.iterations, 2);
        assert!(meta.completed_at.is_some());
        // Fields not supplied keep their values.
        assert_eq!(meta.task, "summarize");
        assert_eq!(meta.max_iterations, 5);
        assert!(meta.error.is_none());
    }

    #[test]
    fn test_resume_clears_completed_at() {
        let (_dir, service) = service();
        let branch_id = service
            .create_subagent_branch("conv-1", "m0", "task", "sa-1", 1, None)
            .unwrap();

        service
            .update_subagent_state(&branch_id, SubagentState::MaxIterations, Some(1), None)
            .unwrap();
        service
            .update_subagent_state(&branch_id, SubagentState::Running, None, None)
            .unwrap();

        let meta_branch = service.get_branch(&branch_id).unwrap();
        let meta = meta_branch.kind.subagent_meta().unwrap();
        assert_eq!(meta.state, SubagentState::Running);
        assert!(meta.completed_at.is_none());
    }

    #[test]
    fn test_update_missing_branch_errors() {
        let (_dir, service) = service();
        let result =
            service.update_subagent_state("missing", SubagentState::Complete, None, None);
        assert!(matches!(result, Err(StoreError::BranchNotFound(_))));
    }

    #[test]
    fn test_update_human_branch_state_is_rejected() {
        let (_dir, service) = service();
        let branch_id = service.create_human_branch("conv-1", "m0", None).unwrap();
        let result =
            service.update_subagent_state(&branch_id, SubagentState::Complete, None, None);
        assert!(matches!(result, Err(StoreError::NotSubagentBranch(_))));
    }
}
