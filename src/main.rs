//! Packrat CLI
//!
//! Feeds a conversation transcript through the compression engine and
//! prints the merged context snapshot for the scope. Lines starting with
//! `user:`, `assistant:`, `system:` or `tool:` set the message role;
//! anything else continues as a user message.

use clap::Parser;
use packrat::storage::JsonFileStore;
use packrat::{ContextStore, Message, PackratConfig, Role, Scheduler};
use std::io::{self, BufRead};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Packrat - compress a conversation transcript into a bounded snapshot
#[derive(Parser, Debug)]
#[command(name = "packrat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scope key (project/branch identity) for this transcript
    #[arg(short, long, default_value = "default")]
    scope: String,

    /// Transcript file; reads stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Data directory for checkpoints and scope files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the full snapshot as JSON instead of a text report
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => PackratConfig::load(path)?,
        None => PackratConfig::new(),
    };
    if let Some(dir) = cli.data_dir.clone() {
        config = config.with_data_dir(dir);
    }
    let data_dir = config.resolve_data_dir();
    info!("Data directory: {}", data_dir.display());

    let store = JsonFileStore::new(data_dir.join("scopes")).await?;
    let mut scheduler = Scheduler::new(
        config.scheduler.clone(),
        config.compressor.clone(),
        config.governor.clone(),
        config.checkpoint.clone(),
        data_dir.join("checkpoints"),
        store,
    )
    .await?;

    // An interrupted prior run for this scope resumes where it left off
    if scheduler.checkpoints_mut().needs_recovery(&cli.scope).await {
        let restored = scheduler.checkpoints_mut().resume(&cli.scope).await?;
        info!(
            "Resuming scope {} from {:.0}% (last chunk: {})",
            cli.scope,
            restored.progress.percent_complete,
            restored.progress.last_chunk_id.as_deref().unwrap_or("none"),
        );
    }

    let messages = read_transcript(&cli)?;
    info!("Read {} messages", messages.len());
    for message in messages {
        scheduler.ingest(message).await?;
    }
    scheduler.flush_scope(&cli.scope).await;
    scheduler.drain().await?;

    let status = scheduler.status(&cli.scope);
    let snapshot = scheduler.store().current_context(&cli.scope).await?;

    match snapshot {
        Some(snapshot) if cli.json => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Some(snapshot) => {
            println!("scope:    {}", snapshot.scope_key);
            println!(
                "chunks:   {} merged ({} consumed total)",
                status.merged,
                snapshot.consumed_chunk_ids.len()
            );
            println!("tokens:   {}", snapshot.token_count);
            if !snapshot.tags.is_empty() {
                let tags: Vec<String> = snapshot
                    .tags
                    .iter()
                    .take(10)
                    .map(|t| format!("{} ({:.2})", t.tag, t.weight))
                    .collect();
                println!("tags:     {}", tags.join(", "));
            }
            println!("\n{}", snapshot.summary);
        }
        None => {
            println!("No snapshot produced (input too small to chunk?)");
        }
    }
    Ok(())
}

/// Read the transcript into messages, one per non-empty line.
fn read_transcript(cli: &Cli) -> anyhow::Result<Vec<Message>> {
    let lines: Vec<String> = match &cli.input {
        Some(path) => std::fs::read_to_string(path)?
            .lines()
            .map(str::to_string)
            .collect(),
        None => io::stdin().lock().lines().collect::<Result<_, _>>()?,
    };

    let mut messages = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (role, content) = parse_line(line);
        messages.push(Message::new(
            format!("m{i:06}"),
            role,
            content,
            cli.scope.clone(),
        ));
    }
    Ok(messages)
}

fn parse_line(line: &str) -> (Role, &str) {
    for (prefix, role) in [
        ("user:", Role::User),
        ("assistant:", Role::Assistant),
        ("system:", Role::System),
        ("tool:", Role::Tool),
    ] {
        if let Some(rest) = line.strip_prefix(prefix) {
            return (role, rest.trim_start());
        }
    }
    (Role::User, line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_roles() {
        assert_eq!(parse_line("user: hello").0, Role::User);
        assert_eq!(parse_line("assistant: hi").0, Role::Assistant);
        assert_eq!(parse_line("tool: output").0, Role::Tool);
        let (role, content) = parse_line("plain text line");
        assert_eq!(role, Role::User);
        assert_eq!(content, "plain text line");
    }
}
