use super::LoggingArgs;
use crate::config::ConfigArgs;
use clap::Args;

#[derive(Args)]
pub struct ConsumeCommand {
    /// Stop at the end of the log instead of waiting for new messages
    #[arg(long)]
    pub drain: bool,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}
