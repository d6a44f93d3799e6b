//! Vitalstream binary.
//!
//! This binary provides the entry point for loading, consuming, rolling up
//! and querying wearable time-series data.

use clap::Parser;
use vitalstream_core::cli::{
    commands::Commands,
    handlers::{handle_consume, handle_load, handle_query, handle_rollup},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let logging = cli.command.logging();
    let filter = match (&logging.log_filter, logging.verbose) {
        (Some(filter), _) => filter.clone(),
        (None, 0) => "vitalstream_core=info".to_string(),
        (None, _) => String::new(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(logging.get_effective_level().into())
                .parse_lossy(filter),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Vitalstream starting up");

    match cli.command {
        Commands::Load(cmd) => handle_load(cmd).await,
        Commands::Consume(cmd) => handle_consume(cmd).await,
        Commands::Rollup(cmd) => handle_rollup(cmd).await,
        Commands::Query(cmd) => handle_query(cmd).await,
    }
}
