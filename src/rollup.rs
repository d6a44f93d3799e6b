//! Rollup engine.
//!
//! Derives fixed-window means from raw records for each configured rollup
//! tier. Grouping is by `(user_id, metric, window_start)` where
//! `window_start` is the timestamp floored to a multiple of the tier window
//! since the Unix epoch.
//!
//! Two write policies are available:
//!
//! - [`RollupEngine::rollup`] aggregates exactly the records it is handed and
//!   writes with insert-if-absent. It is only correct over complete windows,
//!   so windows ending after the engine's watermark are deferred.
//! - [`RollupEngine::recompute`] treats its input as a set of touched windows,
//!   re-reads the full raw contents of each window from the store and
//!   overwrites the stored mean.
//!
//! [`RollupEngine::close_windows`] backs [`RollupMode::CompleteWindows`]: it
//! reads touched windows from the raw tier like `recompute` but writes
//! insert-if-absent and only for windows closed before the watermark.
//!
//! Each tier is computed independently from raw data, and writes are issued
//! per series so one failed write does not affect other series.

use crate::error::{Error, Result};
use crate::record::{Metric, Record, RollupRecord};
use crate::storage::{from_micros, to_micros, RecordStore, Tier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How rollups are written when new raw data lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupMode {
    /// Re-read touched windows from the raw tier and overwrite their means
    #[default]
    Recompute,
    /// Insert-if-absent over windows that closed before the watermark
    CompleteWindows,
}

impl fmt::Display for RollupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollupMode::Recompute => f.write_str("recompute"),
            RollupMode::CompleteWindows => f.write_str("complete_windows"),
        }
    }
}

/// Identifies one rollup row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct WindowKey {
    pub user_id: String,
    pub metric: Metric,
    pub window_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierOutcome {
    pub tier: Tier,
    /// Distinct windows seen in the input
    pub groups: usize,
    /// Rows inserted or overwritten
    pub written: usize,
    /// Windows skipped because they end after the watermark
    pub deferred: usize,
    /// Windows whose series write failed
    pub failed: Vec<WindowKey>,
}

impl TierOutcome {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            groups: 0,
            written: 0,
            deferred: 0,
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub tiers: Vec<TierOutcome>,
}

impl RollupReport {
    pub fn tier(&self, tier: Tier) -> Option<&TierOutcome> {
        self.tiers.iter().find(|outcome| outcome.tier == tier)
    }

    pub fn written(&self) -> usize {
        self.tiers.iter().map(|outcome| outcome.written).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.tiers.iter().any(|outcome| !outcome.failed.is_empty())
    }
}

type Series = (String, Metric);

pub(crate) fn window_micros(tier: Tier) -> Result<i64> {
    tier.window()
        .map(|w| w.as_micros() as i64)
        .filter(|w| *w > 0)
        .ok_or_else(|| Error::Validation(format!("tier {} has no rollup window", tier)))
}

pub(crate) fn floor(micros: i64, window: i64) -> i64 {
    micros.div_euclid(window) * window
}

/// Groups `(timestamp, value)` pairs of one series into windows and returns
/// the mean of each.
///
/// Duplicate timestamps keep their first value. Sums run in ascending
/// timestamp order so equal input sets give bit-identical means regardless
/// of arrival order.
pub(crate) fn window_means<I>(points: I, window: i64) -> BTreeMap<i64, f64>
where
    I: IntoIterator<Item = (i64, f64)>,
{
    let mut by_ts: BTreeMap<i64, f64> = BTreeMap::new();
    for (ts, value) in points {
        by_ts.entry(ts).or_insert(value);
    }

    let mut sums: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (ts, value) in by_ts {
        let slot = sums.entry(floor(ts, window)).or_insert((0.0, 0));
        slot.0 += value;
        slot.1 += 1;
    }
    sums.into_iter()
        .map(|(start, (sum, count))| (start, sum / count as f64))
        .collect()
}

fn by_series(records: &[Record]) -> BTreeMap<Series, Vec<(i64, f64)>> {
    let mut seen = HashSet::new();
    let mut series: BTreeMap<Series, Vec<(i64, f64)>> = BTreeMap::new();
    for record in records {
        let ts = to_micros(record.timestamp);
        if !seen.insert((record.user_id.as_str(), record.metric, ts)) {
            continue;
        }
        series
            .entry((record.user_id.clone(), record.metric))
            .or_default()
            .push((ts, record.value));
    }
    series
}

/// Pure aggregation of `records` into rollup rows for `tier`, ordered by
/// series then window.
pub fn aggregate(tier: Tier, records: &[Record]) -> Result<Vec<RollupRecord>> {
    let window = window_micros(tier)?;
    let mut rows = Vec::new();
    for ((user_id, metric), points) in by_series(records) {
        for (start, value) in window_means(points, window) {
            rows.push(RollupRecord {
                user_id: user_id.clone(),
                metric,
                window_start: from_micros(start)?,
                value,
            });
        }
    }
    Ok(rows)
}

/// Batch job deriving rollup tiers from raw records.
#[derive(Clone)]
pub struct RollupEngine {
    store: Arc<dyn RecordStore>,
    watermark: Option<DateTime<Utc>>,
}

impl RollupEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            watermark: None,
        }
    }

    /// Windows ending after `watermark` are deferred by [`Self::rollup`] and
    /// [`Self::close_windows`].
    pub fn with_watermark(mut self, watermark: DateTime<Utc>) -> Self {
        self.watermark = Some(watermark);
        self
    }

    /// Runs the configured mode. `CompleteWindows` without an explicit
    /// watermark uses the current time.
    pub async fn run(&self, mode: RollupMode, tiers: &[Tier], records: &[Record]) -> Result<RollupReport> {
        match mode {
            RollupMode::Recompute => self.recompute(tiers, records).await,
            RollupMode::CompleteWindows => {
                let engine = Self {
                    store: self.store.clone(),
                    watermark: Some(self.watermark.unwrap_or_else(Utc::now)),
                };
                engine.close_windows(tiers, records).await
            }
        }
    }

    /// Aggregates `source` and inserts each window mean if absent.
    ///
    /// Callers must hand over every raw record of each window: a window
    /// written from partial input is never corrected by a later run.
    pub async fn rollup(&self, tiers: &[Tier], source: &[Record]) -> Result<RollupReport> {
        let mut report = RollupReport::default();
        for &tier in tiers {
            let window = window_micros(tier)?;
            let mut outcome = TierOutcome::new(tier);

            for ((user_id, metric), points) in by_series(source) {
                let mut rows = Vec::new();
                for (start, value) in window_means(points, window) {
                    outcome.groups += 1;
                    let window_start = from_micros(start)?;
                    let window_end = from_micros(start.saturating_add(window))?;
                    if self.watermark.is_some_and(|mark| window_end > mark) {
                        outcome.deferred += 1;
                        continue;
                    }
                    rows.push(RollupRecord {
                        user_id: user_id.clone(),
                        metric,
                        window_start,
                        value,
                    });
                }
                if rows.is_empty() {
                    continue;
                }
                match self.store.upsert_rollup(tier, &rows).await {
                    Ok(created) => outcome.written += created,
                    Err(e) => {
                        warn!(tier = %tier, user_id = %user_id, metric = %metric, error = %e, "rollup write failed");
                        outcome.failed.extend(rows.into_iter().map(window_key));
                    }
                }
            }

            debug!(tier = %tier, groups = outcome.groups, written = outcome.written, deferred = outcome.deferred, "tier rolled up");
            report.tiers.push(outcome);
        }
        info!(written = report.written(), "rollup complete");
        Ok(report)
    }

    /// Recomputes every window touched by `touched` from the raw tier and
    /// overwrites the stored means.
    ///
    /// Each series is recomputed by the store in one atomic read-and-write,
    /// so overlapping runs converge on the mean of the raw tier.
    pub async fn recompute(&self, tiers: &[Tier], touched: &[Record]) -> Result<RollupReport> {
        let mut report = RollupReport::default();
        for &tier in tiers {
            let window = window_micros(tier)?;
            let mut outcome = TierOutcome::new(tier);

            for ((user_id, metric), starts) in touched_windows(touched, window) {
                outcome.groups += starts.len();
                let window_starts = starts
                    .iter()
                    .map(|start| from_micros(*start))
                    .collect::<Result<Vec<_>>>()?;
                match self
                    .store
                    .recompute_rollup(tier, &user_id, metric, &window_starts)
                    .await
                {
                    Ok(written) => outcome.written += written,
                    Err(e) => {
                        warn!(tier = %tier, user_id = %user_id, metric = %metric, error = %e, "rollup recompute failed");
                        outcome.failed.extend(window_keys(&user_id, metric, &starts));
                    }
                }
            }

            debug!(tier = %tier, groups = outcome.groups, written = outcome.written, "tier recomputed");
            report.tiers.push(outcome);
        }
        info!(written = report.written(), "rollup recompute complete");
        Ok(report)
    }

    /// Insert-if-absent rollup of the closed windows touched by `touched`.
    ///
    /// Means come from the raw tier, not from `touched`, so a resubmitted key
    /// carrying a different value never leaks into a rollup. Windows ending
    /// after the watermark are deferred.
    pub async fn close_windows(&self, tiers: &[Tier], touched: &[Record]) -> Result<RollupReport> {
        let mut report = RollupReport::default();
        for &tier in tiers {
            let window = window_micros(tier)?;
            let mut outcome = TierOutcome::new(tier);

            for ((user_id, metric), mut starts) in touched_windows(touched, window) {
                outcome.groups += starts.len();
                if let Some(mark) = self.watermark {
                    // a window is closed once start + window <= watermark
                    let open = starts.split_off(&to_micros(mark).saturating_sub(window).saturating_add(1));
                    outcome.deferred += open.len();
                }
                let (Some(first), Some(last)) = (starts.first(), starts.last()) else {
                    continue;
                };
                let scan_start = from_micros(*first)?;
                let scan_end = from_micros(last.saturating_add(window) - 1)?;
                let points = match self.store.scan(Tier::Raw, &user_id, metric, scan_start, scan_end).await {
                    Ok(points) => points,
                    Err(e) => {
                        warn!(tier = %tier, user_id = %user_id, metric = %metric, error = %e, "raw scan failed");
                        outcome.failed.extend(window_keys(&user_id, metric, &starts));
                        continue;
                    }
                };

                let means = window_means(points.iter().map(|p| (to_micros(p.timestamp), p.value)), window);
                let mut rows = Vec::with_capacity(starts.len());
                for start in &starts {
                    if let Some(value) = means.get(start) {
                        rows.push(RollupRecord {
                            user_id: user_id.clone(),
                            metric,
                            window_start: from_micros(*start)?,
                            value: *value,
                        });
                    }
                }
                if rows.is_empty() {
                    continue;
                }
                match self.store.upsert_rollup(tier, &rows).await {
                    Ok(created) => outcome.written += created,
                    Err(e) => {
                        warn!(tier = %tier, user_id = %user_id, metric = %metric, error = %e, "rollup write failed");
                        outcome.failed.extend(rows.into_iter().map(window_key));
                    }
                }
            }

            debug!(tier = %tier, groups = outcome.groups, written = outcome.written, deferred = outcome.deferred, "closed windows rolled up");
            report.tiers.push(outcome);
        }
        info!(written = report.written(), "rollup complete");
        Ok(report)
    }
}

/// Window starts touched by `records`, per series.
fn touched_windows(records: &[Record], window: i64) -> BTreeMap<Series, BTreeSet<i64>> {
    let mut windows: BTreeMap<Series, BTreeSet<i64>> = BTreeMap::new();
    for record in records {
        windows
            .entry((record.user_id.clone(), record.metric))
            .or_default()
            .insert(floor(to_micros(record.timestamp), window));
    }
    windows
}

fn window_keys(user_id: &str, metric: Metric, starts: &BTreeSet<i64>) -> Vec<WindowKey> {
    starts
        .iter()
        .filter_map(|start| from_micros(*start).ok())
        .map(|window_start| WindowKey {
            user_id: user_id.to_string(),
            metric,
            window_start,
        })
        .collect()
}

fn window_key(row: RollupRecord) -> WindowKey {
    WindowKey {
        user_id: row.user_id,
        metric: row.metric,
        window_start: row.window_start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Point;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    async fn rollups(store: &MemoryStore, tier: Tier, user: &str, metric: Metric) -> Vec<Point> {
        store
            .scan(tier, user, metric, ts(0, 0, 0), ts(23, 59, 59))
            .await
            .unwrap()
    }

    #[test]
    fn test_minute_mean_of_two_points() {
        let records = vec![
            Record::new("u1", Metric::HeartRate, ts(0, 0, 5), 62.0),
            Record::new("u1", Metric::HeartRate, ts(0, 0, 40), 64.0),
        ];
        let rows = aggregate(Tier::Minute, &records).unwrap();
        assert_eq!(
            rows,
            vec![RollupRecord {
                user_id: "u1".into(),
                metric: Metric::HeartRate,
                window_start: ts(0, 0, 0),
                value: 63.0,
            }]
        );
    }

    #[test]
    fn test_aggregate_is_order_independent() {
        let mut records: Vec<Record> = (0..50)
            .map(|i| Record::new("u1", Metric::Hrv, ts(0, i / 10, i % 60), 0.1 * i as f64 + 1.0 / 3.0))
            .collect();
        let forward = aggregate(Tier::Hour, &records).unwrap();
        records.reverse();
        let backward = aggregate(Tier::Hour, &records).unwrap();
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].value.to_bits(), backward[0].value.to_bits());
    }

    #[test]
    fn test_duplicate_keys_keep_first_value() {
        let records = vec![
            Record::new("u1", Metric::Spo2, ts(0, 0, 0), 90.0),
            Record::new("u1", Metric::Spo2, ts(0, 0, 0), 100.0),
            Record::new("u1", Metric::Spo2, ts(0, 0, 30), 96.0),
        ];
        let rows = aggregate(Tier::Minute, &records).unwrap();
        assert_eq!(rows[0].value, 93.0);
    }

    #[test]
    fn test_window_floor_before_epoch() {
        assert_eq!(floor(-1, 60_000_000), -60_000_000);
        assert_eq!(floor(59_999_999, 60_000_000), 0);
    }

    #[test]
    fn test_raw_tier_has_no_window() {
        assert!(matches!(aggregate(Tier::Raw, &[]), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_rollup_twice_is_stable() {
        let store = Arc::new(MemoryStore::new());
        let engine = RollupEngine::new(store.clone());
        let records = vec![
            Record::new("u1", Metric::HeartRate, ts(0, 0, 5), 62.0),
            Record::new("u1", Metric::HeartRate, ts(0, 0, 40), 64.0),
            Record::new("u1", Metric::HeartRate, ts(1, 30, 0), 70.0),
        ];

        let first = engine.rollup(&Tier::ROLLUPS, &records).await.unwrap();
        let minute = rollups(&store, Tier::Minute, "u1", Metric::HeartRate).await;
        let second = engine.rollup(&Tier::ROLLUPS, &records).await.unwrap();

        assert_eq!(first.tier(Tier::Minute).unwrap().written, 2);
        assert_eq!(first.tier(Tier::Hour).unwrap().written, 2);
        assert_eq!(first.tier(Tier::Day).unwrap().written, 1);
        assert_eq!(second.written(), 0);
        assert_eq!(minute, rollups(&store, Tier::Minute, "u1", Metric::HeartRate).await);
        assert_eq!(minute[0].value, 63.0);
    }

    #[tokio::test]
    async fn test_watermark_defers_open_windows() {
        let store = Arc::new(MemoryStore::new());
        let engine = RollupEngine::new(store.clone()).with_watermark(ts(0, 1, 30));
        let records = vec![
            Record::new("u1", Metric::Activity, ts(0, 0, 10), 10.0),
            Record::new("u1", Metric::Activity, ts(0, 1, 10), 20.0),
        ];
        let report = engine.rollup(&[Tier::Minute, Tier::Hour], &records).await.unwrap();

        let minute = report.tier(Tier::Minute).unwrap();
        assert_eq!((minute.groups, minute.written, minute.deferred), (2, 1, 1));
        let hour = report.tier(Tier::Hour).unwrap();
        assert_eq!((hour.written, hour.deferred), (0, 1));
        assert_eq!(store.len(Tier::Hour), 0);
    }

    #[tokio::test]
    async fn test_recompute_corrects_partial_window() {
        let store = Arc::new(MemoryStore::new());
        let engine = RollupEngine::new(store.clone());

        let early = vec![Record::new("u1", Metric::HeartRate, ts(0, 0, 5), 62.0)];
        store.upsert_raw(&early).await.unwrap();
        engine.recompute(&[Tier::Minute], &early).await.unwrap();
        assert_eq!(rollups(&store, Tier::Minute, "u1", Metric::HeartRate).await[0].value, 62.0);

        let late = vec![Record::new("u1", Metric::HeartRate, ts(0, 0, 40), 64.0)];
        store.upsert_raw(&late).await.unwrap();
        let report = engine.recompute(&[Tier::Minute], &late).await.unwrap();

        assert_eq!(report.tier(Tier::Minute).unwrap().written, 1);
        let points = rollups(&store, Tier::Minute, "u1", Metric::HeartRate).await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 63.0);
    }

    #[tokio::test]
    async fn test_close_windows_uses_raw_tier_and_watermark_boundary() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_raw(&[
                Record::new("u1", Metric::Spo2, ts(0, 0, 10), 96.0),
                Record::new("u1", Metric::Spo2, ts(0, 0, 50), 98.0),
                Record::new("u1", Metric::Spo2, ts(0, 1, 10), 90.0),
            ])
            .await
            .unwrap();
        // window [00:00, 00:01) is closed exactly at the watermark
        let engine = RollupEngine::new(store.clone()).with_watermark(ts(0, 1, 0));
        let touched = vec![
            Record::new("u1", Metric::Spo2, ts(0, 0, 50), 0.0),
            Record::new("u1", Metric::Spo2, ts(0, 1, 10), 90.0),
        ];
        let report = engine.close_windows(&[Tier::Minute], &touched).await.unwrap();

        let minute = report.tier(Tier::Minute).unwrap();
        assert_eq!((minute.groups, minute.written, minute.deferred), (2, 1, 1));
        let points = rollups(&store, Tier::Minute, "u1", Metric::Spo2).await;
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 97.0);
    }

    #[tokio::test]
    async fn test_run_dispatches_on_mode() {
        let store = Arc::new(MemoryStore::new());
        let engine = RollupEngine::new(store.clone()).with_watermark(ts(12, 0, 0));
        let records = vec![Record::new("u1", Metric::BreathRate, ts(0, 0, 0), 14.0)];
        store.upsert_raw(&records).await.unwrap();

        let report = engine
            .run(RollupMode::CompleteWindows, &[Tier::Day], &records)
            .await
            .unwrap();
        assert_eq!(report.tier(Tier::Day).unwrap().deferred, 1);

        let report = engine.run(RollupMode::Recompute, &[Tier::Day], &records).await.unwrap();
        assert_eq!(report.tier(Tier::Day).unwrap().written, 1);
    }
}
