pub mod consume;
pub mod load;
pub mod query;
pub mod rollup;

pub use consume::ConsumeCommand;
pub use load::LoadCommand;
pub use query::QueryCommand;
pub use rollup::RollupCommand;

use crate::config::ConfigArgs;
use clap::{ArgAction, Args, Subcommand};
use tracing::Level;

#[derive(Subcommand)]
pub enum Commands {
    /// Load a directory of normalized record files
    Load(LoadCommand),
    /// Consume records from the configured broker topic
    Consume(ConsumeCommand),
    /// Rebuild rollup tiers for one series from raw data
    Rollup(RollupCommand),
    /// Query one series over a calendar date range
    Query(QueryCommand),
}

impl Commands {
    pub fn logging(&self) -> &LoggingArgs {
        match self {
            Commands::Load(cmd) => &cmd.logging,
            Commands::Consume(cmd) => &cmd.logging,
            Commands::Rollup(cmd) => &cmd.logging,
            Commands::Query(cmd) => &cmd.logging,
        }
    }

    pub fn config(&self) -> &ConfigArgs {
        match self {
            Commands::Load(cmd) => &cmd.config,
            Commands::Consume(cmd) => &cmd.config,
            Commands::Rollup(cmd) => &cmd.config,
            Commands::Query(cmd) => &cmd.config,
        }
    }
}

/// Logging options shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct LoggingArgs {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Log filter directives, e.g. "vitalstream_core=debug"
    #[arg(long, value_name = "FILTER", env = "VITALSTREAM_LOG")]
    pub log_filter: Option<String>,
}

impl LoggingArgs {
    pub fn get_effective_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}
