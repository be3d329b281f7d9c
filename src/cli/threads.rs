//! Thread commands
//!
//! `mneme list` / `show` / `append` / `flush` / `delete` / `check-config`

use super::Commands;
use crate::loader::AppConfig;
use anyhow::{bail, Context, Result};
use mneme_core::{ListSource, Message, SessionCoordinator, Thread, ThreadSummary};

/// Run a thread subcommand.
pub async fn run(coordinator: &SessionCoordinator, command: Commands) -> Result<()> {
    match command {
        Commands::List {
            source,
            limit,
            json,
        } => list(coordinator, source.into(), limit, json).await,
        Commands::Show { id, json } => show(coordinator, &id, json).await,
        Commands::Append { id, role, text } => {
            append(coordinator, &id, Message::new(role.into(), text)).await
        }
        Commands::Flush { id } => flush(coordinator, &id).await,
        Commands::Delete { id } => delete(coordinator, &id).await,
        Commands::CheckConfig => bail!("check-config does not open the stores"),
    }
}

// ── List ─────────────────────────────────────────────────────────────

async fn list(
    coordinator: &SessionCoordinator,
    source: ListSource,
    limit: usize,
    json: bool,
) -> Result<()> {
    let summaries = coordinator
        .list_threads(source, limit)
        .await
        .context("Failed to list threads")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        println!("No threads found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<8} {:>6} {:>6}  {:<9} UPDATED",
        "ID", "WHERE", "MSGS", "MERGES", "PERSISTED"
    );
    for summary in &summaries {
        println!("{}", summary_row(summary));
    }
    Ok(())
}

fn summary_row(summary: &ThreadSummary) -> String {
    format!(
        "{:<38} {:<8} {:>6} {:>6}  {:<9} {}",
        summary.id,
        summary.location.as_str(),
        summary.message_count,
        summary.merge_count,
        if summary.persisted { "yes" } else { "no" },
        summary.last_updated_at.format("%Y-%m-%d %H:%M:%S")
    )
}

// ── Show ─────────────────────────────────────────────────────────────

async fn show(coordinator: &SessionCoordinator, id: &str, json: bool) -> Result<()> {
    let Some(thread) = coordinator
        .resolve(id)
        .await
        .with_context(|| format!("Failed to resolve thread '{id}'"))?
    else {
        bail!("Thread '{id}' not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&thread)?);
    } else {
        print_thread(&thread);
    }
    Ok(())
}

fn print_thread(thread: &Thread) {
    println!("Thread {}", thread.id);
    println!(
        "  created {}  updated {}  merges {}",
        thread.created_at.format("%Y-%m-%d %H:%M:%S"),
        thread.last_updated_at.format("%Y-%m-%d %H:%M:%S"),
        thread.merge_count
    );
    println!();
    for message in &thread.messages {
        println!(
            "[{}] {}: {}",
            message.timestamp.format("%H:%M:%S"),
            message.role.as_str(),
            message.content
        );
    }
}

// ── Append / Flush / Delete ──────────────────────────────────────────

async fn append(coordinator: &SessionCoordinator, id: &str, message: Message) -> Result<()> {
    coordinator
        .resolve_or_create(Some(id))
        .await
        .with_context(|| format!("Failed to resolve thread '{id}'"))?;
    let thread = coordinator
        .mutate(id, vec![message])
        .await
        .with_context(|| format!("Failed to append to thread '{id}'"))?;

    println!("Thread {} now has {} messages.", thread.id, thread.message_count());
    Ok(())
}

async fn flush(coordinator: &SessionCoordinator, id: &str) -> Result<()> {
    match coordinator
        .write_back(id)
        .await
        .with_context(|| format!("Failed to write back thread '{id}'"))?
    {
        Some(record) => println!(
            "Archived {} ({} messages, merge {}).",
            record.thread.id,
            record.thread.message_count(),
            record.thread.merge_count
        ),
        None => bail!("Thread '{id}' not found"),
    }
    Ok(())
}

async fn delete(coordinator: &SessionCoordinator, id: &str) -> Result<()> {
    if coordinator
        .delete(id)
        .await
        .with_context(|| format!("Failed to delete thread '{id}'"))?
    {
        println!("Deleted {id}.");
    } else {
        println!("Thread '{id}' did not exist.");
    }
    Ok(())
}

// ── Check config ─────────────────────────────────────────────────────

/// Validate the configuration and print it.
pub fn check_config(config: &AppConfig) -> Result<()> {
    config
        .memory
        .validate()
        .context("Configuration is invalid")?;
    println!("{}", serde_json::to_string_pretty(config)?);
    println!("Configuration OK.");
    Ok(())
}
