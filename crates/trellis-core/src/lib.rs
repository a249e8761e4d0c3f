pub mod collab;
pub mod executor;
pub mod model;
pub mod queue;
pub mod service;
pub mod store;

// Re-export key types
pub use collab::{ContextFileReader, StreamChunk, StreamOptions, StreamingGenerator, ToolSchema, ToolSchemaFetcher};
pub use executor::{AgentStatus, ExecutorDefaults, ExecutorEvent, SpawnHandle, SpawnRequest, SubagentExecutor};
pub use model::{Branch, BranchKind, Conversation, Message, QueuedKind, QueuedMessage, Role, SubagentState};
pub use queue::{MessageQueue, QueueEvent};
pub use service::BranchService;
pub use store::{BranchStore, StoreError};
