use super::LoggingArgs;
use crate::config::ConfigArgs;
use clap::Args;

#[derive(Args)]
pub struct RollupCommand {
    /// Subject identifier
    #[arg(short, long)]
    pub user: String,

    /// Metric name (heart_rate, spo2, activity, breath_rate, hrv, active_zone_minute)
    #[arg(short, long)]
    pub metric: String,

    /// Range start: RFC 3339 timestamp or YYYY-MM-DD
    #[arg(long)]
    pub start: String,

    /// Range end (inclusive): RFC 3339 timestamp or YYYY-MM-DD
    #[arg(long)]
    pub end: String,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}
