//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vitalstream_core::error::{Error, Result};
use vitalstream_core::record::{Metric, Point, Record, RollupRecord};
use vitalstream_core::storage::{DuckDbStore, RecordStore, Tier};

/// Store wrapper whose next `n` raw writes fail with a transient error.
pub struct FlakyStore {
    inner: Arc<dyn RecordStore>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn RecordStore>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            attempts: AtomicU32::new(0),
        }
    }

    /// Raw writes attempted, including the failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn upsert_raw(&self, records: &[Record]) -> Result<usize> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::StoreUnavailable("connection reset".into()));
        }
        self.inner.upsert_raw(records).await
    }

    async fn upsert_rollup(&self, tier: Tier, records: &[RollupRecord]) -> Result<usize> {
        self.inner.upsert_rollup(tier, records).await
    }

    async fn recompute_rollup(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        window_starts: &[DateTime<Utc>],
    ) -> Result<usize> {
        self.inner.recompute_rollup(tier, user_id, metric, window_starts).await
    }

    async fn scan(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        self.inner.scan(tier, user_id, metric, start, end).await
    }
}

/// Store wrapper that stalls for `delay` after its first raw-tier read
/// returns, so a rollup run holding that read finishes late.
pub struct SlowFirstRead {
    inner: Arc<dyn RecordStore>,
    delay: Duration,
    stalled: AtomicBool,
}

impl SlowFirstRead {
    pub fn new(inner: Arc<dyn RecordStore>, delay: Duration) -> Self {
        Self {
            inner,
            delay,
            stalled: AtomicBool::new(false),
        }
    }

    async fn maybe_stall(&self) {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl RecordStore for SlowFirstRead {
    async fn init(&self) -> Result<()> {
        self.inner.init().await
    }

    async fn upsert_raw(&self, records: &[Record]) -> Result<usize> {
        self.inner.upsert_raw(records).await
    }

    async fn upsert_rollup(&self, tier: Tier, records: &[RollupRecord]) -> Result<usize> {
        self.inner.upsert_rollup(tier, records).await
    }

    async fn recompute_rollup(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        window_starts: &[DateTime<Utc>],
    ) -> Result<usize> {
        let written = self.inner.recompute_rollup(tier, user_id, metric, window_starts).await?;
        self.maybe_stall().await;
        Ok(written)
    }

    async fn scan(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        let points = self.inner.scan(tier, user_id, metric, start, end).await?;
        if tier == Tier::Raw {
            self.maybe_stall().await;
        }
        Ok(points)
    }
}

/// DuckDB store in a temporary directory; keep the guard alive.
pub async fn duckdb_store() -> (tempfile::TempDir, Arc<DuckDbStore>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vitalstream.duckdb");
    let store = DuckDbStore::open(path.to_str().unwrap()).unwrap();
    store.init().await.unwrap();
    (dir, Arc::new(store))
}

/// One JSON broker message for `u1` heart rate at `second` past midnight.
pub fn heart_rate_message(second: u32, value: f64) -> String {
    format!(
        r#"{{"user_id":"u1","metric":"heart_rate","timestamp":"2024-01-01T00:{:02}:{:02}Z","value":{}}}"#,
        second / 60,
        second % 60,
        value
    )
}
