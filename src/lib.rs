//! Vitalstream core library.
//!
//! Storage, ingestion, rollup and query for wearable physiological time
//! series. Every write path is idempotent: records are keyed by
//! `(user_id, metric, timestamp)` and a repeated key is a no-op, so batch
//! reloads and broker redelivery have exactly-once effect.
//!
//! - [`storage`]: tiered record store (`raw`, `1m`, `1h`, `1d`) over DuckDB
//!   or memory
//! - [`ingest`]: validating gateway in front of the raw tier
//! - [`loader`] and [`consumer`]: batch directory loads and the broker
//!   stream loop, both feeding the gateway
//! - [`rollup`]: fixed-window means per tier
//! - [`query`]: span-based tier selection and the query endpoint

pub mod broker;
pub mod cli;
pub mod config;
pub mod consumer;
pub mod error;
pub mod export;
pub mod ingest;
pub mod loader;
pub mod query;
pub mod record;
pub mod retry;
pub mod rollup;
pub mod storage;

// Re-export commonly used types
pub use config::Settings;
pub use consumer::{ConsumerState, ConsumerStats, StreamConsumer};
pub use error::{Error, Result};
pub use ingest::{IngestResult, IngestionGateway};
pub use loader::BatchLoader;
pub use query::{QueryRouter, TierPolicy};
pub use record::{Metric, Point, RawRecord, Record, RollupRecord};
pub use rollup::{RollupEngine, RollupMode};
pub use storage::{RecordStore, Tier};
