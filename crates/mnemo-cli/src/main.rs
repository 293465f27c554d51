//! # mnemo
//!
//! Command-line front end for a saved session: each run loads the session
//! file, applies one command, and saves it back if the command changed anything.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mnemo_context::{
    CompactionOutcome, ExtractiveSummarizer, FileSnapshotStore, Role, Session, SessionConfig,
    SessionDeps,
};
use mnemo_settings::MnemoSettings;
use tracing::debug;

/// Inspect and edit a saved conversation session.
#[derive(Parser, Debug)]
#[command(name = "mnemo", about = "Inspect and edit a saved conversation session", version)]
struct Cli {
    /// Session file (defaults to the configured path, `~/.mnemo/session.json`).
    #[arg(long, global = true)]
    session: Option<PathBuf>,

    /// Settings file (defaults to `$MNEMO_SETTINGS` or `~/.mnemo/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Append a message.
    AddMessage {
        /// Message text.
        content: String,
        /// user, agent (or assistant), or system.
        #[arg(long, default_value = "user")]
        role: String,
    },
    /// Add or overwrite a manual context item.
    AddContext {
        /// Unique label.
        label: String,
        /// Context text.
        content: String,
        /// Where the text came from.
        #[arg(long, default_value = "user")]
        source: String,
    },
    /// Remove a manual context item.
    RemoveContext {
        /// Label to remove.
        label: String,
    },
    /// Print the context summary.
    Summary {
        /// Emit JSON.
        #[arg(long)]
        json: bool,
    },
    /// List tracked entities.
    Entities {
        /// Only entities with this label.
        #[arg(long = "type")]
        label: Option<String>,
        /// Emit JSON.
        #[arg(long)]
        json: bool,
    },
    /// Show or switch the active agent scope.
    Scope {
        /// Scope to switch to.
        name: Option<String>,
    },
    /// Compact old messages now.
    Compact,
    /// Rank messages and entities against a query.
    Relevant {
        /// Query text.
        query: String,
        /// Maximum results.
        #[arg(long, default_value_t = 5)]
        max_items: usize,
    },
}

fn load_settings(cli: &Cli) -> Result<MnemoSettings> {
    let settings = match &cli.settings {
        Some(path) => mnemo_settings::load_settings_from_path(path),
        None => mnemo_settings::load_settings(),
    };
    settings.context("failed to load settings")
}

fn open_session(settings: &MnemoSettings, path: PathBuf) -> Session {
    let store = Arc::new(FileSnapshotStore::new(path));
    let deps = SessionDeps::new(Arc::new(ExtractiveSummarizer), store);
    Session::new(SessionConfig::from_settings(settings), deps)
}

fn describe(outcome: &CompactionOutcome) -> String {
    match outcome {
        CompactionOutcome::Compacted(record) => format!(
            "compacted {} messages: {} -> {} tokens ({} entities pruned)",
            record.messages_replaced,
            record.tokens_before,
            record.tokens_after,
            record.entities_pruned
        ),
        CompactionOutcome::Skipped(reason) => format!("compaction skipped: {reason:?}"),
        CompactionOutcome::Failed { attempts, error } => {
            format!("compaction failed after {attempts} attempt(s): {error}")
        }
        CompactionOutcome::Scheduled => "compaction scheduled".to_owned(),
    }
}

/// Apply one command and let any compaction it scheduled finish.
/// Returns whether the session changed.
async fn run(session: &Session, command: Command, out: &mut impl Write) -> Result<bool> {
    let mutated = apply(session, command, out).await?;
    session.wait_idle().await;
    Ok(mutated)
}

async fn apply(session: &Session, command: Command, out: &mut impl Write) -> Result<bool> {
    match command {
        Command::AddMessage { content, role } => {
            let Some(role) = Role::parse(&role) else {
                bail!("unknown role '{role}' (expected user, agent, or system)");
            };
            let appended = session.add_message(role, &content).await?;
            writeln!(out, "added {} ({} tokens)", appended.id, appended.token_cost)?;
            if let Some(outcome) = &appended.compaction {
                writeln!(out, "{}", describe(outcome))?;
            }
            Ok(true)
        }
        Command::AddContext {
            label,
            content,
            source,
        } => {
            let set = session.add_manual_context(&label, &source, &content).await?;
            writeln!(out, "set {label} ({} tokens)", set.token_cost)?;
            if let Some(outcome) = &set.compaction {
                writeln!(out, "{}", describe(outcome))?;
            }
            Ok(true)
        }
        Command::RemoveContext { label } => {
            let removed = session.remove_manual_context(&label).await?;
            if removed {
                writeln!(out, "removed {label}")?;
            } else {
                writeln!(out, "no context labeled {label}")?;
            }
            Ok(removed)
        }
        Command::Summary { json } => {
            let summary = session.get_context_summary().await;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&summary)?)?;
            } else {
                writeln!(out, "{summary}")?;
            }
            Ok(false)
        }
        Command::Entities { label, json } => {
            let entities = session.get_entities(label.as_deref()).await;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&entities)?)?;
            } else {
                for e in &entities {
                    writeln!(
                        out,
                        "{}\t{}\t(x{}, confidence {:.2})",
                        e.label, e.display_text, e.mention_count, e.confidence
                    )?;
                }
            }
            Ok(false)
        }
        Command::Scope { name: Some(name) } => {
            let scope = session.switch_agent_scope(&name).await?;
            writeln!(out, "scope: {scope}")?;
            Ok(true)
        }
        Command::Scope { name: None } => {
            writeln!(out, "scope: {}", session.agent_scope().await)?;
            Ok(false)
        }
        Command::Compact => {
            let outcome = session.compact_now().await?;
            writeln!(out, "{}", describe(&outcome))?;
            Ok(outcome.is_compacted())
        }
        Command::Relevant { query, max_items } => {
            for item in session.get_relevant_context(&query, max_items).await {
                writeln!(out, "{:.3}\t{}", item.score, item.text)?;
            }
            Ok(false)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    if settings.logging.json {
        mnemo_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        mnemo_core::logging::init_subscriber(&settings.logging.level);
    }

    let path = cli
        .session
        .clone()
        .unwrap_or_else(|| settings.persistence.resolved_path());
    debug!(path = %path.display(), "opening session");
    let session = open_session(&settings, path.clone());
    let _ = session
        .load()
        .await
        .with_context(|| format!("failed to load session from {}", path.display()))?;

    let mut stdout = std::io::stdout().lock();
    let mutated = run(&session, cli.command, &mut stdout).await?;
    if mutated {
        session
            .save()
            .await
            .with_context(|| format!("failed to save session to {}", path.display()))?;
    }
    Ok(())
}
