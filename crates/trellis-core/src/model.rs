use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A primary conversation: a linear timeline of messages that branches
/// fork from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            messages: Vec::new(),
            created: now,
            updated: now,
        }
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Lifecycle state of a single message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Draft,
    Streaming,
    Complete,
    Aborted,
    Invalid,
}

/// A tool invocation already executed by the streaming collaborator,
/// recorded alongside the assistant message that requested it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A single message on a conversation or branch timeline.
///
/// `content` is `None` for assistant messages that are still streaming.
/// `sequence` is monotonic within the owning branch and assigned at
/// append time by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub state: MessageState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub sequence: u64,
}

impl Message {
    /// Build a complete message with a fresh id. Sequence is assigned
    /// when the message is appended to a branch.
    pub fn new(role: Role, content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: Some(content.to_string()),
            timestamp: Utc::now(),
            state: MessageState::Complete,
            tool_calls: Vec::new(),
            reasoning: None,
            sequence: 0,
        }
    }

    /// Build an empty assistant placeholder in the streaming state.
    pub fn streaming_placeholder() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role: Role::Assistant,
            content: None,
            timestamp: Utc::now(),
            state: MessageState::Streaming,
            tool_calls: Vec::new(),
            reasoning: None,
            sequence: 0,
        }
    }
}

/// Lifecycle state of a subagent run.
///
/// `MaxIterations` is terminal for the run but resumable: a later spawn
/// with a continue-branch id re-enters `Running` on the same branch.
/// `Abandoned` is only ever produced by the conversation-deletion
/// cascade, never by the execution loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubagentState {
    Running,
    Complete,
    Cancelled,
    MaxIterations,
    Abandoned,
}

impl SubagentState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubagentState::Running)
    }

    pub fn as_str(&self) -> &str {
        match self {
            SubagentState::Running => "running",
            SubagentState::Complete => "complete",
            SubagentState::Cancelled => "cancelled",
            SubagentState::MaxIterations => "max_iterations",
            SubagentState::Abandoned => "abandoned",
        }
    }
}

/// Reference to a tool pre-selected for a subagent (agent + tool slug).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolRef {
    pub agent: String,
    pub slug: String,
}

/// Lifecycle metadata carried by a subagent branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentMeta {
    pub task: String,
    pub subagent_id: String,
    pub state: SubagentState,
    pub iterations: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefetched_tools: Option<Vec<ToolRef>>,
}

/// Branch-kind metadata, discriminated by the persisted `type` tag.
///
/// Human branches inherit the parent conversation's context up to the
/// fork point; subagent branches always start from a fresh context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BranchKind {
    Human {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Subagent {
        #[serde(flatten)]
        meta: SubagentMeta,
    },
}

impl BranchKind {
    /// Whether branches of this kind see the parent conversation's
    /// prefix when building LLM context.
    pub fn inherit_context(&self) -> bool {
        match self {
            BranchKind::Human { .. } => true,
            BranchKind::Subagent { .. } => false,
        }
    }

    pub fn type_str(&self) -> &str {
        match self {
            BranchKind::Human { .. } => "human",
            BranchKind::Subagent { .. } => "subagent",
        }
    }

    pub fn subagent_meta(&self) -> Option<&SubagentMeta> {
        match self {
            BranchKind::Human { .. } => None,
            BranchKind::Subagent { meta } => Some(meta),
        }
    }
}

/// An alternate timeline forked from one message of a parent
/// conversation. Owns its messages exclusively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    pub conversation_id: String,
    pub parent_message_id: String,
    pub kind: BranchKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Branch {
    pub fn new(conversation_id: &str, parent_message_id: &str, kind: BranchKind) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            parent_message_id: parent_message_id.to_string(),
            kind,
            messages: Vec::new(),
            created: now,
            updated: now,
        }
    }

    pub fn inherit_context(&self) -> bool {
        self.kind.inherit_context()
    }
}

/// Kind of a deferred-delivery message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueuedKind {
    User,
    SubagentResult,
    System,
}

/// Routing metadata carried by a queued message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A message awaiting delivery into the primary conversation. Lives in
/// memory only; a crash while one is pending loses it (at-most-once).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub kind: QueuedKind,
    pub content: String,
    #[serde(default)]
    pub meta: QueuedMeta,
    pub queued_at: DateTime<Utc>,
}

impl QueuedMessage {
    pub fn new(kind: QueuedKind, content: &str, meta: QueuedMeta) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.to_string(),
            meta,
            queued_at: Utc::now(),
        }
    }
}
