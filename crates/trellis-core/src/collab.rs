use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::model::{Message, ToolCallRecord};

/// Options handed to the streaming generator for one run.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub provider: String,
    pub model: String,
    pub system_prompt: String,
    pub workspace_id: Option<String>,
    pub session_id: Option<String>,
}

/// One increment from the streaming generator. The generator performs
/// the entire tool-call pingpong internally and yields already-executed
/// tool calls alongside incremental content.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content: String,
    pub complete: bool,
    pub tool_calls: Vec<ToolCallRecord>,
    pub reasoning: Option<String>,
    /// Set when the generator's own iteration accounting hit the ceiling.
    pub max_iterations_reached: bool,
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// External LLM collaborator. Implementations own the provider wire
/// protocol and tool execution; the core only consumes the chunk stream.
#[async_trait]
pub trait StreamingGenerator: Send + Sync {
    async fn stream(&self, messages: Vec<Message>, options: StreamOptions) -> Result<ChunkStream>;
}

/// Tool schema for prompt injection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchema {
    pub agent: String,
    pub slug: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Fetches tool schemas for pre-selected tools.
#[async_trait]
pub trait ToolSchemaFetcher: Send + Sync {
    async fn get_tool_schemas(&self, agent: &str, slugs: &[String]) -> Result<Vec<ToolSchema>>;
}

/// Reads referenced context files for prompt construction. Read failures
/// degrade to a placeholder at the call site, never abort the caller.
#[async_trait]
pub trait ContextFileReader: Send + Sync {
    async fn read_file(&self, path: &str) -> Result<String>;
}
