use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collab::{ContextFileReader, StreamOptions, StreamingGenerator, ToolSchemaFetcher};
use crate::model::{
    Message, MessageState, QueuedKind, QueuedMessage, QueuedMeta, Role, SubagentState, ToolRef,
};
use crate::queue::MessageQueue;
use crate::service::BranchService;

const CANCELLED_BY_USER: &str = "Cancelled by user";

const SUBAGENT_RULES: &str = "You are an autonomous background agent working on a single task.\n\
IMPORTANT RULES:\n\
- Act autonomously: never ask clarifying questions, there is no one to answer them\n\
- Use tool calls to make progress until the work is done\n\
- A response without any tool calls means the task is complete\n\
- Stay focused ONLY on your assigned task\n\
- When done, provide a clear summary of what you accomplished";

const DISCOVER_TOOLS: &str = "# Tools\n\nNo tools were pre-selected for this task. Use the tool \
discovery call to find the tools you need before starting work.";

/// Everything needed to start a subagent run.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub conversation_id: String,
    pub parent_message_id: String,
    pub task: String,
    /// Optional free-text context appended to the task message.
    pub context: Option<String>,
    /// Inherited persona prompt, if the caller has one.
    pub agent_prompt: Option<String>,
    /// Inherited workspace context, if the caller has one.
    pub workspace_context: Option<String>,
    /// Pre-selected tools; when absent the subagent discovers its own.
    pub prefetched_tools: Option<Vec<ToolRef>>,
    /// Files whose contents are injected into the system prompt.
    pub context_files: Vec<String>,
    pub max_iterations: u32,
    /// Resume an existing max-iterations branch instead of creating one.
    pub continue_branch_id: Option<String>,
}

impl SpawnRequest {
    pub fn new(
        conversation_id: &str,
        parent_message_id: &str,
        task: &str,
        max_iterations: u32,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            parent_message_id: parent_message_id.to_string(),
            task: task.to_string(),
            context: None,
            agent_prompt: None,
            workspace_context: None,
            prefetched_tools: None,
            context_files: Vec::new(),
            max_iterations,
            continue_branch_id: None,
        }
    }
}

/// Returned synchronously from spawn; completion arrives later via
/// status updates and the result queue.
#[derive(Debug, Clone)]
pub struct SpawnHandle {
    pub subagent_id: String,
    pub branch_id: String,
}

/// In-memory status entry for one tracked subagent.
#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub subagent_id: String,
    pub branch_id: String,
    pub task: String,
    pub state: SubagentState,
    pub iterations: u32,
    pub max_iterations: u32,
    pub started_at: DateTime<Utc>,
}

/// Notifications emitted by the executor for external observers.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    Started {
        subagent_id: String,
        branch_id: String,
    },
    Streaming {
        subagent_id: String,
        content_len: usize,
    },
    Completed {
        subagent_id: String,
        iterations: u32,
    },
    Cancelled {
        subagent_id: String,
    },
    Error {
        subagent_id: String,
        error: String,
    },
}

/// Provider/model handed to the streaming generator.
#[derive(Debug, Clone, Default)]
pub struct ExecutorDefaults {
    pub provider: String,
    pub model: String,
}

struct LoopOutcome {
    state: SubagentState,
    iterations: u32,
    content: String,
    error: Option<String>,
}

/// Owns the autonomous subagent lifecycle: spawn, run loop, cancel,
/// status. Each subagent runs as an independent tokio task; cancellation
/// is cooperative via a token checked before streaming and after every
/// chunk.
pub struct SubagentExecutor {
    service: Arc<BranchService>,
    queue: Arc<MessageQueue>,
    generator: Arc<dyn StreamingGenerator>,
    schemas: Arc<dyn ToolSchemaFetcher>,
    files: Arc<dyn ContextFileReader>,
    defaults: ExecutorDefaults,
    /// Abort tokens for running subagents; removed on cancel or terminal
    /// state, so a second cancel of the same id returns false.
    tokens: DashMap<String, CancellationToken>,
    /// subagent id -> branch id for active tasks.
    active: DashMap<String, String>,
    status: DashMap<String, AgentStatus>,
    events_tx: broadcast::Sender<ExecutorEvent>,
}

impl SubagentExecutor {
    pub fn new(
        service: Arc<BranchService>,
        queue: Arc<MessageQueue>,
        generator: Arc<dyn StreamingGenerator>,
        schemas: Arc<dyn ToolSchemaFetcher>,
        files: Arc<dyn ContextFileReader>,
        defaults: ExecutorDefaults,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            service,
            queue,
            generator,
            schemas,
            files,
            defaults,
            tokens: DashMap::new(),
            active: DashMap::new(),
            status: DashMap::new(),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events_tx.subscribe()
    }

    /// Spawn a subagent. Returns as soon as the branch exists and the
    /// loop task is launched; branch-creation failures propagate
    /// synchronously and the subagent never starts.
    pub fn spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<SpawnHandle> {
        let subagent_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let token = CancellationToken::new();
        self.tokens.insert(subagent_id.clone(), token.clone());

        let branch_id = match self.prepare_branch(&request, &subagent_id) {
            Ok(id) => id,
            Err(e) => {
                self.tokens.remove(&subagent_id);
                return Err(e);
            }
        };

        info!(
            "Spawning subagent {subagent_id} on branch {branch_id}: {}",
            request.task
        );

        self.status.insert(
            subagent_id.clone(),
            AgentStatus {
                subagent_id: subagent_id.clone(),
                branch_id: branch_id.clone(),
                task: request.task.clone(),
                state: SubagentState::Running,
                iterations: 0,
                max_iterations: request.max_iterations,
                started_at: Utc::now(),
            },
        );
        self.active.insert(subagent_id.clone(), branch_id.clone());
        let _ = self.events_tx.send(ExecutorEvent::Started {
            subagent_id: subagent_id.clone(),
            branch_id: branch_id.clone(),
        });

        let executor = Arc::clone(self);
        let task_id = subagent_id.clone();
        let task_branch = branch_id.clone();
        tokio::spawn(async move {
            executor.run(&task_id, &task_branch, request, token).await;
            executor.active.remove(&task_id);
            executor.tokens.remove(&task_id);
            info!("Subagent {task_id} finished");
        });

        Ok(SpawnHandle {
            subagent_id,
            branch_id,
        })
    }

    /// Create a fresh branch, or reopen the branch named by
    /// `continue_branch_id` after a max-iterations stop.
    fn prepare_branch(&self, request: &SpawnRequest, subagent_id: &str) -> Result<String> {
        if let Some(branch_id) = &request.continue_branch_id {
            self.service
                .reopen_subagent_branch(branch_id, subagent_id)
                .with_context(|| format!("resuming branch {branch_id}"))?;
            return Ok(branch_id.clone());
        }

        let branch_id = self
            .service
            .create_subagent_branch(
                &request.conversation_id,
                &request.parent_message_id,
                &request.task,
                subagent_id,
                request.max_iterations,
                request.prefetched_tools.clone(),
            )
            .context("creating subagent branch")?;
        Ok(branch_id)
    }

    /// Cancel a running subagent. Returns false when no matching running
    /// subagent exists (unknown id or already finished).
    pub fn cancel(&self, subagent_id: &str) -> bool {
        match self.tokens.remove(subagent_id) {
            Some((_, token)) => {
                token.cancel();
                if let Some(mut status) = self.status.get_mut(subagent_id) {
                    status.state = SubagentState::Cancelled;
                }
                info!("Cancelled subagent {subagent_id}");
                true
            }
            None => false,
        }
    }

    /// Cancel by branch id instead of subagent id.
    pub fn cancel_by_branch(&self, branch_id: &str) -> bool {
        let subagent_id = self
            .active
            .iter()
            .find(|entry| entry.value() == branch_id)
            .map(|entry| entry.key().clone());
        match subagent_id {
            Some(id) => self.cancel(&id),
            None => false,
        }
    }

    /// All tracked subagents: running entries first, then by most
    /// recently started.
    pub fn status_list(&self) -> Vec<AgentStatus> {
        let mut list: Vec<AgentStatus> =
            self.status.iter().map(|entry| entry.value().clone()).collect();
        list.sort_by(|a, b| {
            let a_running = a.state == SubagentState::Running;
            let b_running = b.state == SubagentState::Running;
            b_running
                .cmp(&a_running)
                .then(b.started_at.cmp(&a.started_at))
        });
        list
    }

    pub fn state_of(&self, subagent_id: &str) -> Option<SubagentState> {
        self.status.get(subagent_id).map(|entry| entry.state)
    }

    /// Cascade a conversation deletion: the store abandons running
    /// subagent branches, and this releases their executor state.
    /// Returns the abandoned subagent ids.
    pub fn abandon_conversation(&self, conversation_id: &str) -> Result<Vec<String>> {
        let abandoned = self.service.delete_conversation(conversation_id)?;
        let mut subagent_ids = Vec::new();
        for branch in &abandoned {
            let Some(meta) = branch.kind.subagent_meta() else {
                continue;
            };
            if let Some((_, token)) = self.tokens.remove(&meta.subagent_id) {
                token.cancel();
            }
            if let Some(mut status) = self.status.get_mut(&meta.subagent_id) {
                status.state = SubagentState::Abandoned;
            }
            subagent_ids.push(meta.subagent_id.clone());
        }
        Ok(subagent_ids)
    }

    async fn run(
        &self,
        subagent_id: &str,
        branch_id: &str,
        request: SpawnRequest,
        token: CancellationToken,
    ) {
        let outcome = match self.run_loop(subagent_id, branch_id, &request, &token).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Collaborator or persistence failure: terminate the run,
                // never the host process.
                warn!("Subagent {subagent_id} failed: {e:#}");
                let error = format!("{e:#}");
                if let Err(persist_err) = self.service.update_subagent_state(
                    branch_id,
                    SubagentState::MaxIterations,
                    None,
                    Some(error.clone()),
                ) {
                    warn!("Failed to persist error state for branch {branch_id}: {persist_err}");
                }
                LoopOutcome {
                    state: SubagentState::MaxIterations,
                    iterations: 0,
                    content: String::new(),
                    error: Some(error),
                }
            }
        };

        if let Some(mut status) = self.status.get_mut(subagent_id) {
            // Abandonment wins over whatever the loop reports afterwards.
            if status.state != SubagentState::Abandoned {
                status.state = outcome.state;
                status.iterations = outcome.iterations;
            }
        }

        let event = match (&outcome.state, &outcome.error) {
            (SubagentState::Complete, _) => ExecutorEvent::Completed {
                subagent_id: subagent_id.to_string(),
                iterations: outcome.iterations,
            },
            (SubagentState::Cancelled, _) => ExecutorEvent::Cancelled {
                subagent_id: subagent_id.to_string(),
            },
            (_, error) => ExecutorEvent::Error {
                subagent_id: subagent_id.to_string(),
                error: error.clone().unwrap_or_default(),
            },
        };
        let _ = self.events_tx.send(event);

        let announcement = match &outcome.error {
            None => format!(
                "[Subagent completed]\nTask: {}\nIterations: {}\nResult: {}",
                request.task, outcome.iterations, outcome.content
            ),
            Some(error) => format!(
                "[Subagent failed]\nTask: {}\nError: {error}",
                request.task
            ),
        };

        let result = QueuedMessage::new(
            QueuedKind::SubagentResult,
            &announcement,
            QueuedMeta {
                subagent_id: Some(subagent_id.to_string()),
                branch_id: Some(branch_id.to_string()),
                conversation_id: Some(request.conversation_id.clone()),
                parent_message_id: Some(request.parent_message_id.clone()),
                is_error: outcome.error.is_some(),
                extra: HashMap::new(),
            },
        );
        self.queue.enqueue(result).await;
    }

    async fn run_loop(
        &self,
        subagent_id: &str,
        branch_id: &str,
        request: &SpawnRequest,
        token: &CancellationToken,
    ) -> Result<LoopOutcome> {
        let system_prompt = self.build_system_prompt(request).await;
        let user_content = match &request.context {
            Some(context) => format!("{}\n\nAdditional context:\n{context}", request.task),
            None => request.task.clone(),
        };

        // Persist the exact inputs before streaming begins, so the log
        // reflects them even if the process dies mid-stream.
        self.service
            .add_message(branch_id, Message::new(Role::System, &system_prompt))
            .context("persisting system prompt")?;
        self.service
            .add_message(branch_id, Message::new(Role::User, &user_content))
            .context("persisting task message")?;

        if token.is_cancelled() {
            self.service.update_subagent_state(
                branch_id,
                SubagentState::Cancelled,
                Some(0),
                Some(CANCELLED_BY_USER.into()),
            )?;
            return Ok(LoopOutcome {
                state: SubagentState::Cancelled,
                iterations: 0,
                content: String::new(),
                error: Some(CANCELLED_BY_USER.into()),
            });
        }

        let mut placeholder = self
            .service
            .add_message(branch_id, Message::streaming_placeholder())
            .context("persisting streaming placeholder")?;

        let history: Vec<Message> = self
            .service
            .store()
            .get_branch_messages(branch_id)?
            .into_iter()
            .filter(|m| m.role != Role::System && m.id != placeholder.id)
            .collect();

        let options = StreamOptions {
            provider: self.defaults.provider.clone(),
            model: self.defaults.model.clone(),
            system_prompt,
            workspace_id: None,
            session_id: Some(subagent_id.to_string()),
        };
        let mut stream = self
            .generator
            .stream(history, options)
            .await
            .context("starting stream")?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut reasoning = String::new();
        let mut hit_max_iterations = false;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("pulling stream chunk")?;
            content.push_str(&chunk.content);
            tool_calls.extend(chunk.tool_calls);
            if let Some(r) = &chunk.reasoning {
                if !reasoning.is_empty() {
                    reasoning.push('\n');
                }
                reasoning.push_str(r);
            }
            let _ = self.events_tx.send(ExecutorEvent::Streaming {
                subagent_id: subagent_id.to_string(),
                content_len: content.len(),
            });

            if token.is_cancelled() {
                let iterations = tool_calls.len() as u32;
                placeholder.content = (!content.is_empty()).then(|| content.clone());
                placeholder.state = MessageState::Aborted;
                placeholder.tool_calls = tool_calls.clone();
                placeholder.reasoning = (!reasoning.is_empty()).then(|| reasoning.clone());
                if let Err(e) = self.service.update_message(branch_id, placeholder) {
                    warn!("Failed to persist partial content for branch {branch_id}: {e}");
                }
                self.service.update_subagent_state(
                    branch_id,
                    SubagentState::Cancelled,
                    Some(iterations),
                    Some(CANCELLED_BY_USER.into()),
                )?;
                debug!("Subagent {subagent_id} cancelled mid-stream");
                return Ok(LoopOutcome {
                    state: SubagentState::Cancelled,
                    iterations,
                    content,
                    error: Some(CANCELLED_BY_USER.into()),
                });
            }

            if chunk.max_iterations_reached {
                hit_max_iterations = true;
                break;
            }
            if chunk.complete {
                break;
            }
        }

        // Iterations are approximated as the number of tool calls the
        // generator executed, or 1 for a plain text-only run.
        let iterations = if tool_calls.is_empty() {
            1
        } else {
            tool_calls.len() as u32
        };

        placeholder.content = Some(content.clone());
        placeholder.state = MessageState::Complete;
        placeholder.tool_calls = tool_calls;
        placeholder.reasoning = (!reasoning.is_empty()).then(|| reasoning.clone());
        self.service
            .update_message(branch_id, placeholder)
            .context("finalizing assistant message")?;

        if hit_max_iterations {
            let error = format!(
                "Reached maximum iterations ({}) before completing the task",
                request.max_iterations
            );
            self.service.update_subagent_state(
                branch_id,
                SubagentState::MaxIterations,
                Some(iterations),
                Some(error.clone()),
            )?;
            return Ok(LoopOutcome {
                state: SubagentState::MaxIterations,
                iterations,
                content,
                error: Some(error),
            });
        }

        self.service.update_subagent_state(
            branch_id,
            SubagentState::Complete,
            Some(iterations),
            None,
        )?;
        Ok(LoopOutcome {
            state: SubagentState::Complete,
            iterations,
            content,
            error: None,
        })
    }

    /// Assemble the system prompt: operating rules, inherited persona
    /// and workspace context, tool schemas (or a discovery instruction),
    /// and referenced file contents. Individual file-read failures are
    /// substituted with a placeholder rather than aborting construction.
    async fn build_system_prompt(&self, request: &SpawnRequest) -> String {
        let mut parts = vec![SUBAGENT_RULES.to_string()];

        if let Some(prompt) = &request.agent_prompt {
            parts.push(format!("# Persona\n\n{prompt}"));
        }
        if let Some(workspace) = &request.workspace_context {
            parts.push(format!("# Workspace Context\n\n{workspace}"));
        }

        match &request.prefetched_tools {
            Some(tools) if !tools.is_empty() => match self.tool_section(tools).await {
                Ok(section) => parts.push(section),
                Err(e) => {
                    warn!("Tool schema fetch failed, falling back to discovery: {e}");
                    parts.push(DISCOVER_TOOLS.to_string());
                }
            },
            _ => parts.push(DISCOVER_TOOLS.to_string()),
        }

        if !request.context_files.is_empty() {
            let mut section = String::from("# Referenced Files");
            for path in &request.context_files {
                match self.files.read_file(path).await {
                    Ok(contents) => {
                        section.push_str(&format!("\n\n## {path}\n\n{contents}"));
                    }
                    Err(e) => {
                        warn!("Failed to read context file '{path}': {e}");
                        section.push_str(&format!("\n\n## {path}\n\n[File could not be read: {e}]"));
                    }
                }
            }
            parts.push(section);
        }

        parts.join("\n\n")
    }

    async fn tool_section(&self, tools: &[ToolRef]) -> Result<String> {
        let mut by_agent: HashMap<&str, Vec<String>> = HashMap::new();
        for tool in tools {
            by_agent
                .entry(tool.agent.as_str())
                .or_default()
                .push(tool.slug.clone());
        }

        let mut section =
            String::from("# Available Tools\n\nThe following tools were pre-selected for this task:");
        for (agent, slugs) in by_agent {
            let schemas = self.schemas.get_tool_schemas(agent, &slugs).await?;
            for schema in schemas {
                section.push_str(&format!(
                    "\n\n- {} ({}/{}): {}\n  parameters: {}",
                    schema.name, schema.agent, schema.slug, schema.description, schema.parameters
                ));
            }
        }
        Ok(section)
    }
}
