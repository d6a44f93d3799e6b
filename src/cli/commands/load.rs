use super::LoggingArgs;
use crate::config::ConfigArgs;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct LoadCommand {
    /// Directory of `*.json` files, each a JSON array of records
    #[arg(value_name = "DIR")]
    pub dir: PathBuf,

    /// Skip rollup updates after each file
    #[arg(long)]
    pub no_rollup: bool,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}
