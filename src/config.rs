//! Configuration management for the Vitalstream service.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/vitalstream/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `VITALSTREAM_`, `__` between
//!    section and key)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! - `VITALSTREAM_STORAGE__ENGINE` - Storage engine (`duckdb` or `memory`)
//! - `VITALSTREAM_STORAGE__CONNECTION` - DuckDB file path or `:memory:`
//! - `VITALSTREAM_RETRY__MAX_ATTEMPTS` - Connection attempts before giving up
//! - `VITALSTREAM_BROKER__TOPIC` - Topic consumed by the stream consumer

use crate::error::{Error, Result};
use crate::query::TierRule;
use crate::retry::RetryPolicy;
use crate::rollup::RollupMode;
use crate::storage::Tier;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration arguments shared by every subcommand
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "VITALSTREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Storage engine type (duckdb, memory)
    #[arg(long)]
    pub engine: Option<String>,

    /// Storage engine connection string
    #[arg(long)]
    pub connection: Option<String>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Storage configuration
    pub storage: StorageConfig,
    /// Connection and transient-failure retry policy
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Broker subscription
    pub broker: BrokerConfig,
    /// Rollup tiers and recompute policy
    pub rollup: RollupConfig,
    /// Query tier selection
    pub query: QueryConfig,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage engine type
    pub engine: String,
    /// Connection string
    pub connection: String,
}

/// File-backed broker log location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Directory holding `<topic>.jsonl` and committed offsets
    pub address: PathBuf,
    pub topic: String,
    /// Consumer group; each group commits its own offset
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupConfig {
    pub tiers: Vec<Tier>,
    #[serde(default)]
    pub mode: RollupMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Ordered `(max_span, tier)` rules; the first rule whose span bound
    /// covers the request wins
    pub rules: Vec<TierRule>,
    /// Tier used when no rule matches
    pub fallback: Tier,
}

impl Settings {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/vitalstream/config.toml").required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VITALSTREAM")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut settings: Settings = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(engine) = &args.engine {
            settings.storage.engine = engine.clone();
        }
        if let Some(connection) = &args.connection {
            settings.storage.connection = connection.clone();
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.rollup.tiers.contains(&Tier::Raw) {
            return Err(Error::Config("rollup.tiers cannot include the raw tier".into()));
        }
        if self
            .query
            .rules
            .windows(2)
            .any(|pair| pair[0].max_span >= pair[1].max_span)
        {
            return Err(Error::Config(
                "query.rules must be ordered by strictly increasing max_span".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_config_defaults() {
        let settings = Settings::load(&ConfigArgs::default()).unwrap();
        assert_eq!(settings.storage.engine, "duckdb");
        assert_eq!(settings.retry.max_attempts, 10);
        assert_eq!(settings.retry.delay, Duration::from_secs(5));
        assert_eq!(settings.broker.topic, "wearipedia_stream");
        assert_eq!(settings.broker.group, "wearipedia-group");
        assert_eq!(settings.rollup.tiers, Tier::ROLLUPS.to_vec());
        assert_eq!(settings.rollup.mode, RollupMode::Recompute);
        assert_eq!(settings.query.rules.len(), 2);
        assert_eq!(settings.query.rules[0].max_span, Duration::from_secs(3 * 86_400));
        assert_eq!(settings.query.rules[0].tier, Tier::Raw);
        assert_eq!(settings.query.rules[1].tier, Tier::Hour);
        assert_eq!(settings.query.fallback, Tier::Day);
    }

    #[test]
    fn test_cli_overrides_storage() {
        let args = ConfigArgs {
            config: None,
            engine: Some("memory".into()),
            connection: Some(":memory:".into()),
        };
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.storage.engine, "memory");
        assert_eq!(settings.storage.connection, ":memory:");
    }

    #[test]
    fn test_user_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[retry]
max_attempts = 3
delay = "250ms"

[rollup]
tiers = ["1h"]
mode = "complete_windows"
"#
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            ..ConfigArgs::default()
        };
        let settings = Settings::load(&args).unwrap();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.delay, Duration::from_millis(250));
        assert_eq!(settings.rollup.tiers, vec![Tier::Hour]);
        assert_eq!(settings.rollup.mode, RollupMode::CompleteWindows);
    }

    #[test]
    fn test_validation_rejects_raw_rollup_tier() {
        let mut settings = Settings::load(&ConfigArgs::default()).unwrap();
        settings.rollup.tiers.push(Tier::Raw);
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_unordered_rules() {
        let mut settings = Settings::load(&ConfigArgs::default()).unwrap();
        settings.query.rules.reverse();
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }
}
