//! DuckDB record store.
//!
//! One table per tier, each with primary key `(user_id, metric, timestamp)`.
//! Timestamps are stored as BIGINT microseconds since the epoch. All access
//! goes through a single connection guarded by an async mutex, so the row
//! count taken before and after an insert inside the transaction is exact.

use crate::error::Result;
use crate::record::{Metric, Point, Record, RollupRecord};
use crate::rollup::{floor, window_means, window_micros};
use crate::storage::{ensure_rollup_tier, from_micros, to_micros, RecordStore, Tier};
use ::duckdb::{params, Connection, Transaction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

impl DuckDbStore {
    /// Opens a DuckDB database file, or an in-memory database for `:memory:`.
    pub fn open(connection: &str) -> Result<Self> {
        let conn = if connection.is_empty() || connection == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(connection)?
        };
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn row_count(tx: &Transaction<'_>, tier: Tier) -> Result<usize> {
        let count: i64 = tx.query_row(
            &format!("SELECT count(*) FROM {}", tier.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Inserts `(user_id, metric, timestamp_micros, value)` rows with the
    /// given conflict clause and returns the number of rows created.
    fn insert_rows<'a, I>(tx: &Transaction<'_>, tier: Tier, rows: I, on_conflict: &str) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, Metric, i64, f64)>,
    {
        let before = Self::row_count(tx, tier)?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (user_id, metric, timestamp, value) VALUES (?1, ?2, ?3, ?4) {}",
                tier.table_name(),
                on_conflict
            ))?;
            let mut seen = HashSet::new();
            for (user_id, metric, ts, value) in rows {
                // first occurrence of a key within one call wins
                if !seen.insert((user_id, metric, ts)) {
                    continue;
                }
                written += stmt.execute(params![user_id, metric.as_str(), ts, value])?;
            }
        }
        let after = Self::row_count(tx, tier)?;
        debug!(tier = %tier, created = after - before, written, "rows inserted");
        Ok(after - before)
    }

    /// Inserts rows in their own transaction, ignoring existing keys.
    async fn insert_if_absent<'a, I>(&self, tier: Tier, rows: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, Metric, i64, f64)>,
    {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let created = Self::insert_rows(&tx, tier, rows, "ON CONFLICT DO NOTHING")?;
        tx.commit()?;
        Ok(created)
    }

    /// `(timestamp_micros, value)` rows of one series in `[start, end]`.
    fn scan_micros(
        conn: &Connection,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        start: i64,
        end: i64,
    ) -> Result<Vec<(i64, f64)>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT timestamp, value
             FROM {}
             WHERE user_id = ?1 AND metric = ?2 AND timestamp BETWEEN ?3 AND ?4
             ORDER BY timestamp ASC",
            tier.table_name()
        ))?;
        let rows = stmt.query_map(params![user_id, metric.as_str(), start, end], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?;
        let mut points = Vec::new();
        for row in rows {
            points.push(row?);
        }
        Ok(points)
    }
}

#[async_trait]
impl RecordStore for DuckDbStore {
    async fn init(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        for tier in Tier::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    user_id TEXT NOT NULL,
                    metric TEXT NOT NULL,
                    timestamp BIGINT NOT NULL,
                    value DOUBLE NOT NULL,
                    PRIMARY KEY (user_id, metric, timestamp)
                );",
                table = tier.table_name()
            ))?;
        }
        Ok(())
    }

    async fn upsert_raw(&self, records: &[Record]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        self.insert_if_absent(
            Tier::Raw,
            records
                .iter()
                .map(|r| (r.user_id.as_str(), r.metric, to_micros(r.timestamp), r.value)),
        )
        .await
    }

    async fn upsert_rollup(&self, tier: Tier, records: &[RollupRecord]) -> Result<usize> {
        ensure_rollup_tier(tier)?;
        if records.is_empty() {
            return Ok(0);
        }
        self.insert_if_absent(
            tier,
            records
                .iter()
                .map(|r| (r.user_id.as_str(), r.metric, to_micros(r.window_start), r.value)),
        )
        .await
    }

    async fn recompute_rollup(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        window_starts: &[DateTime<Utc>],
    ) -> Result<usize> {
        ensure_rollup_tier(tier)?;
        let window = window_micros(tier)?;
        let starts: BTreeSet<i64> = window_starts
            .iter()
            .map(|start| floor(to_micros(*start), window))
            .collect();
        let (Some(&first), Some(&last)) = (starts.first(), starts.last()) else {
            return Ok(0);
        };

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let raw = Self::scan_micros(&tx, Tier::Raw, user_id, metric, first, last.saturating_add(window) - 1)?;
        let means = window_means(raw, window);
        let rows: Vec<_> = starts
            .iter()
            .filter_map(|start| means.get(start).map(|value| (user_id, metric, *start, *value)))
            .collect();
        let written = rows.len();
        Self::insert_rows(&tx, tier, rows, "ON CONFLICT DO UPDATE SET value = excluded.value")?;
        tx.commit()?;
        debug!(tier = %tier, user_id, metric = %metric, written, "windows recomputed");
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
        if start > end {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().await;
        Self::scan_micros(&conn, tier, user_id, metric, to_micros(start), to_micros(end))?
            .into_iter()
            .map(|(micros, value)| {
                Ok(Point {
                    timestamp: from_micros(micros)?,
                    value,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    async fn store() -> DuckDbStore {
        let store = DuckDbStore::open_in_memory().unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let store = store().await;
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_upsert_raw_reports_newly_created_rows() {
        let store = store().await;
        let batch = vec![
            Record::new("u1", Metric::HeartRate, ts(0, 0, 0), 70.0),
            Record::new("u1", Metric::HeartRate, ts(0, 0, 1), 71.0),
        ];
        assert_eq!(store.upsert_raw(&batch).await.unwrap(), 2);

        let again = vec![
            Record::new("u1", Metric::HeartRate, ts(0, 0, 0), 99.0),
            Record::new("u1", Metric::HeartRate, ts(0, 0, 2), 72.0),
        ];
        assert_eq!(store.upsert_raw(&again).await.unwrap(), 1);

        let points = store
            .scan(Tier::Raw, "u1", Metric::HeartRate, ts(0, 0, 0), ts(0, 0, 2))
            .await
            .unwrap();
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![70.0, 71.0, 72.0]);
    }

    #[tokio::test]
    async fn test_scan_bounds_are_inclusive_and_series_scoped() {
        let store = store().await;
        store
            .upsert_raw(&[
                Record::new("u1", Metric::Spo2, ts(1, 0, 0), 97.0),
                Record::new("u1", Metric::Spo2, ts(2, 0, 0), 98.0),
                Record::new("u1", Metric::Spo2, ts(3, 0, 0), 99.0),
                Record::new("u2", Metric::Spo2, ts(2, 0, 0), 90.0),
                Record::new("u1", Metric::Hrv, ts(2, 0, 0), 40.0),
            ])
            .await
            .unwrap();

        let points = store
            .scan(Tier::Raw, "u1", Metric::Spo2, ts(1, 0, 0), ts(2, 0, 0))
            .await
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, ts(1, 0, 0));
        assert_eq!(points[1].timestamp, ts(2, 0, 0));
    }

    #[tokio::test]
    async fn test_tiers_are_independent_keyspaces() {
        let store = store().await;
        store
            .upsert_raw(&[Record::new("u1", Metric::HeartRate, ts(0, 0, 0), 70.0)])
            .await
            .unwrap();
        let rollup = RollupRecord {
            user_id: "u1".into(),
            metric: Metric::HeartRate,
            window_start: ts(0, 0, 0),
            value: 65.0,
        };
        assert_eq!(store.upsert_rollup(Tier::Minute, &[rollup.clone()]).await.unwrap(), 1);
        assert_eq!(store.upsert_rollup(Tier::Hour, &[rollup.clone()]).await.unwrap(), 1);
        assert_eq!(store.upsert_rollup(Tier::Minute, &[rollup]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recompute_rollup_overwrites_from_raw() {
        let store = store().await;
        store
            .upsert_rollup(
                Tier::Minute,
                &[RollupRecord {
                    user_id: "u1".into(),
                    metric: Metric::HeartRate,
                    window_start: ts(0, 0, 0),
                    value: 62.0,
                }],
            )
            .await
            .unwrap();
        store
            .upsert_raw(&[
                Record::new("u1", Metric::HeartRate, ts(0, 0, 5), 62.0),
                Record::new("u1", Metric::HeartRate, ts(0, 0, 40), 64.0),
                Record::new("u1", Metric::HeartRate, ts(0, 1, 0), 90.0),
            ])
            .await
            .unwrap();

        let written = store
            .recompute_rollup(Tier::Minute, "u1", Metric::HeartRate, &[ts(0, 0, 30), ts(0, 5, 0)])
            .await
            .unwrap();
        // the 00:05 window has no raw rows
        assert_eq!(written, 1);

        let points = store
            .scan(Tier::Minute, "u1", Metric::HeartRate, ts(0, 0, 0), ts(0, 10, 0))
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, ts(0, 0, 0));
        assert_eq!(points[0].value, 63.0);
    }

    #[tokio::test]
    async fn test_rollup_write_to_raw_tier_is_rejected() {
        let store = store().await;
        let err = store.upsert_rollup(Tier::Raw, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vitals.duckdb");
        let path = path.to_str().unwrap();
        {
            let store = DuckDbStore::open(path).unwrap();
            store.init().await.unwrap();
            store
                .upsert_raw(&[Record::new("u1", Metric::Activity, ts(0, 0, 0), 1200.0)])
                .await
                .unwrap();
        }
        let store = DuckDbStore::open(path).unwrap();
        store.init().await.unwrap();
        let points = store
            .scan(Tier::Raw, "u1", Metric::Activity, ts(0, 0, 0), ts(0, 0, 0))
            .await
            .unwrap();
        assert_eq!(points.len(), 1);
    }
}
