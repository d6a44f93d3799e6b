use super::LoggingArgs;
use crate::config::ConfigArgs;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct QueryCommand {
    /// Subject identifier
    #[arg(short, long)]
    pub user: String,

    /// Metric name
    #[arg(short, long)]
    pub metric: String,

    /// First day of the range (YYYY-MM-DD)
    #[arg(long)]
    pub start_date: String,

    /// Last day of the range, inclusive (YYYY-MM-DD)
    #[arg(long)]
    pub end_date: String,

    /// Also write the result as an Arrow IPC stream
    #[arg(long, value_name = "FILE")]
    pub arrow_out: Option<PathBuf>,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}
