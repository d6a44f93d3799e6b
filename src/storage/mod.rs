//! Storage backends for raw and rolled-up measurements.
//!
//! This module provides:
//! - The [`Tier`] catalogue: one logically independent keyspace per time
//!   granularity (`raw`, `tier_1m`, `tier_1h`, `tier_1d`)
//! - The [`RecordStore`] trait implemented by every engine
//! - Engine selection from configuration and bounded-retry connection
//!
//! Every tier is keyed by `(user_id, metric, timestamp)` and holds a single
//! numeric value. Inserts are conflict-free: a second write for an existing
//! key is a no-op, never an error and never an update.
//!
//! # Configuration
//!
//! ```toml
//! [storage]
//! engine = "duckdb"                 # or "memory"
//! connection = "vitalstream.duckdb" # DuckDB file, or ":memory:"
//! ```

pub mod duckdb;
pub mod memory;

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::record::{Metric, Point, Record, RollupRecord};
use crate::retry::{retry_transient, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use self::duckdb::DuckDbStore;
pub use self::memory::MemoryStore;

/// A storage keyspace holding data at one fixed time granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "raw")]
    Raw,
    #[serde(rename = "1m")]
    Minute,
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1d")]
    Day,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Raw, Tier::Minute, Tier::Hour, Tier::Day];

    /// Tiers derived from raw data by the rollup engine.
    pub const ROLLUPS: [Tier; 3] = [Tier::Minute, Tier::Hour, Tier::Day];

    pub fn table_name(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Minute => "tier_1m",
            Tier::Hour => "tier_1h",
            Tier::Day => "tier_1d",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Minute => "1m",
            Tier::Hour => "1h",
            Tier::Day => "1d",
        }
    }

    /// Window length, `None` for the raw tier.
    pub fn window(&self) -> Option<Duration> {
        match self {
            Tier::Raw => None,
            Tier::Minute => Some(Duration::from_secs(60)),
            Tier::Hour => Some(Duration::from_secs(3_600)),
            Tier::Day => Some(Duration::from_secs(86_400)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Tier::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s || t.table_name() == s)
            .ok_or_else(|| Error::Validation(format!("unknown tier '{}'", s)))
    }
}

/// Durable keyed storage for raw and rolled-up points.
///
/// Implementations must be safe to share between concurrent callers; the
/// store is the only shared mutable resource in the service and resolves
/// conflicting writes as no-ops rather than contested updates.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Creates the tier keyspaces if they do not exist.
    async fn init(&self) -> Result<()>;

    /// Inserts raw records, ignoring keys that already exist.
    ///
    /// Returns the number of rows newly created, not the number submitted.
    async fn upsert_raw(&self, records: &[Record]) -> Result<usize>;

    /// Inserts rollup records into `tier`, ignoring keys that already exist.
    async fn upsert_rollup(&self, tier: Tier, records: &[RollupRecord]) -> Result<usize>;

    /// Recomputes the windows of one series starting at `window_starts`
    /// from the raw tier and overwrites their means in `tier`.
    ///
    /// Reading the raw rows and writing the means is one atomic step against
    /// other writers, so the run that finishes last reflects every raw row
    /// committed before it. Windows without raw rows are left untouched.
    /// Returns the number of rows written.
    async fn recompute_rollup(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        window_starts: &[DateTime<Utc>],
    ) -> Result<usize>;

    /// Points of one series in `[start, end]`, ascending by timestamp.
    ///
    /// Absence of data is an empty vector, never an error.
    async fn scan(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>>;
}

/// Timestamps are persisted as microseconds since the Unix epoch (UTC).
pub(crate) fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {}", micros)))
}

pub(crate) fn ensure_rollup_tier(tier: Tier) -> Result<()> {
    if tier == Tier::Raw {
        return Err(Error::Validation(
            "rollup records cannot be written to the raw tier".to_string(),
        ));
    }
    Ok(())
}

/// Opens the engine named in the configuration without initializing it.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn RecordStore>> {
    match config.engine.as_str() {
        "duckdb" => Ok(Arc::new(DuckDbStore::open(&config.connection)?)),
        "memory" => Ok(Arc::new(MemoryStore::new())),
        other => Err(Error::Config(format!("unsupported storage engine '{}'", other))),
    }
}

/// Opens and initializes the configured store, retrying transient failures.
///
/// Exhausting the retry policy is fatal: the caller receives
/// [`Error::RetriesExhausted`] and must not continue without a store.
pub async fn connect_store(config: &StorageConfig, retry: &RetryPolicy) -> Result<Arc<dyn RecordStore>> {
    let store = retry_transient(retry, "connect to record store", || async {
        let store = open_store(config)?;
        store.init().await?;
        Ok(store)
    })
    .await?;
    info!(engine = %config.engine, connection = %config.connection, "record store ready");
    Ok(store)
}
