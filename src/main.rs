//! Mneme - operator CLI
//!
//! Inspects and maintains conversation threads held in the cache and
//! archive tiers.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod loader;

use loader::LogFormat;

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mneme=info,mneme_core=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = cli::Cli::parse();
    let config = loader::load_config()?;
    init_tracing(config.logging.format);
    debug!("Mneme v{}", env!("CARGO_PKG_VERSION"));

    cli::run(cli, config).await
}
