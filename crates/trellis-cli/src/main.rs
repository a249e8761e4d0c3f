use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use trellis_config::{find_config_path, load_config, resolve_data_dir};
use trellis_core::model::{Message, SubagentState};
use trellis_core::store::BranchStore;

#[derive(Parser)]
#[command(name = "trellis", about = "Branching conversation store", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List branches of a conversation
    Branches {
        /// Conversation ID
        conversation_id: String,
    },
    /// Show the messages on a branch
    Messages {
        /// Branch ID
        branch_id: String,
        /// Print full message bodies instead of one-line previews
        #[arg(long)]
        full: bool,
    },
    /// List subagent branches of a conversation with their run state
    Agents {
        /// Conversation ID
        conversation_id: String,
    },
    /// Rebuild the query cache by replaying the event logs
    Rebuild,
    /// Show storage status and configuration
    Status,
}

fn main() -> Result<()> {
    let base_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(base_filter))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(find_config_path);

    if let Commands::Status = cli.command {
        return run_status(&config_path);
    }

    let config = load_config(&config_path)?;
    let data_dir = resolve_data_dir(&config.storage.data_dir);
    let store = BranchStore::open(&data_dir)?;

    match cli.command {
        Commands::Branches { conversation_id } => run_branches(&store, &conversation_id),
        Commands::Messages { branch_id, full } => run_messages(&store, &branch_id, full),
        Commands::Agents { conversation_id } => run_agents(&store, &conversation_id),
        Commands::Rebuild => run_rebuild(&store),
        Commands::Status => unreachable!("handled above"),
    }
}

fn run_branches(store: &BranchStore, conversation_id: &str) -> Result<()> {
    let branches = store.branches_by_conversation(conversation_id)?;
    if branches.is_empty() {
        println!("No branches for conversation {conversation_id}");
        return Ok(());
    }

    println!("Branches of {conversation_id}:");
    for branch in branches {
        let messages = store.get_branch_messages(&branch.id)?;
        let state = branch
            .kind
            .subagent_meta()
            .map(|meta| format!(" [{}]", meta.state.as_str()))
            .unwrap_or_default();
        println!(
            "  {}  {:<8}{}  {} messages  forked from {}  created {}",
            branch.id,
            branch.kind.type_str(),
            state,
            messages.len(),
            branch.parent_message_id,
            branch.created.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

fn run_messages(store: &BranchStore, branch_id: &str, full: bool) -> Result<()> {
    let messages = store.get_branch_messages(branch_id)?;
    if messages.is_empty() {
        println!("No messages on branch {branch_id}");
        return Ok(());
    }

    for message in messages {
        print_message(&message, full);
    }
    Ok(())
}

fn print_message(message: &Message, full: bool) {
    let content = message.content.as_deref().unwrap_or("(streaming)");
    let body = if full {
        content.to_string()
    } else {
        preview(content, 80)
    };
    println!("  #{:<4} {:<9} {}", message.sequence, format!("{:?}", message.role).to_lowercase(), body);
    for call in &message.tool_calls {
        let marker = if call.success { "ok" } else { "failed" };
        println!("         tool {} ({marker})", call.name);
    }
}

fn run_agents(store: &BranchStore, conversation_id: &str) -> Result<()> {
    let branches = store.subagent_branches(conversation_id)?;
    if branches.is_empty() {
        println!("No subagent branches for conversation {conversation_id}");
        return Ok(());
    }

    println!("Subagents of {conversation_id}:");
    for branch in branches {
        let Some(meta) = branch.kind.subagent_meta() else {
            continue;
        };
        println!(
            "  {}  {:<14} {}/{} iterations  {}",
            meta.subagent_id,
            meta.state.as_str(),
            meta.iterations,
            meta.max_iterations,
            preview(&meta.task, 60),
        );
        if let Some(error) = &meta.error {
            println!("            error: {error}");
        }
        if meta.state == SubagentState::MaxIterations {
            println!("            resumable: branch {}", branch.id);
        }
    }
    Ok(())
}

fn run_rebuild(store: &BranchStore) -> Result<()> {
    let applied = store.rebuild_cache()?;
    println!("Cache rebuilt: {applied} events replayed");
    Ok(())
}

fn run_status(config_path: &std::path::Path) -> Result<()> {
    println!("trellis status");
    println!();

    if config_path.exists() {
        println!("  Config:   {} (found)", config_path.display());
    } else {
        println!("  Config:   {} (not found, using defaults)", config_path.display());
    }

    let config = if config_path.exists() {
        load_config(config_path)?
    } else {
        trellis_config::Config::default()
    };
    let data_dir = resolve_data_dir(&config.storage.data_dir);
    println!("  Data dir: {}", data_dir.display());

    if !data_dir.exists() {
        println!("  (no data yet)");
        return Ok(());
    }

    let store = BranchStore::open(&data_dir)?;
    let conversations = store.conversations();
    println!("  Conversations: {}", conversations.len());

    let mut branches = 0usize;
    let mut running = 0usize;
    for conversation_id in &conversations {
        let conv_branches = store.branches_by_conversation(conversation_id)?;
        branches += conv_branches.len();
        running += conv_branches
            .iter()
            .filter(|b| {
                b.kind
                    .subagent_meta()
                    .is_some_and(|meta| meta.state == SubagentState::Running)
            })
            .count();
    }
    println!("  Branches:      {branches}");
    println!("  Running subagents: {running}");
    println!();
    println!(
        "  Defaults: provider={} model={} max_iterations={}",
        config.agents.defaults.provider,
        config.agents.defaults.model,
        config.agents.defaults.max_iterations,
    );
    Ok(())
}

fn preview(text: &str, limit: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= limit {
        line.to_string()
    } else {
        let truncated: String = line.chars().take(limit).collect();
        format!("{truncated}…")
    }
}
