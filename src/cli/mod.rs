//! CLI module for Mneme
//!
//! Operator commands over the session memory:
//! - `list`, `show`: inspect threads across both tiers
//! - `append`: add a message to a thread
//! - `flush`: force a write-back to the archive
//! - `delete`: remove a thread everywhere
//! - `check-config`: validate and print the effective configuration

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use mneme_core::{ListSource, MessageRole, SessionCoordinator};
use tracing::info;

use crate::loader::AppConfig;

pub mod threads;

/// Mneme session memory CLI
#[derive(Parser, Debug)]
#[command(name = "mneme")]
#[command(about = "Two-tier conversation thread memory")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List known threads
    List {
        /// Tier to list
        #[arg(long, value_enum, default_value_t = SourceArg::All)]
        source: SourceArg,
        /// Maximum number of threads
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show a thread's messages
    Show {
        /// Thread id
        id: String,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Append a message to a thread, creating the thread if needed
    Append {
        /// Thread id
        id: String,
        /// Message role
        #[arg(long, value_enum, default_value_t = RoleArg::User)]
        role: RoleArg,
        /// Message text
        text: String,
    },
    /// Write a thread back to the archive now
    Flush {
        /// Thread id
        id: String,
    },
    /// Delete a thread from the cache and the archive
    Delete {
        /// Thread id
        id: String,
    },
    /// Validate and print the effective configuration
    CheckConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceArg {
    All,
    Cache,
    Archive,
}

impl From<SourceArg> for ListSource {
    fn from(source: SourceArg) -> Self {
        match source {
            SourceArg::All => ListSource::All,
            SourceArg::Cache => ListSource::Cache,
            SourceArg::Archive => ListSource::Archive,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleArg {
    System,
    User,
    Assistant,
    Tool,
}

impl From<RoleArg> for MessageRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::System => MessageRole::System,
            RoleArg::User => MessageRole::User,
            RoleArg::Assistant => MessageRole::Assistant,
            RoleArg::Tool => MessageRole::Tool,
        }
    }
}

/// Run the CLI command
pub async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    if matches!(cli.command, Commands::CheckConfig) {
        return threads::check_config(&config);
    }

    let coordinator = SessionCoordinator::from_config(&config.memory)
        .await
        .context("Failed to open session stores")?;

    let result = threads::run(&coordinator, cli.command).await;

    // Whatever happened, do not leave turns only in the cache
    let flushed = coordinator
        .shutdown()
        .await
        .context("Failed to flush sessions")?;
    if flushed > 0 {
        info!(flushed = flushed, "Flushed sessions to archive");
    }
    result
}
