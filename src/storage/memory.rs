//! In-process record store.
//!
//! Ordered maps per tier with the same conflict-free semantics as the DuckDB
//! engine. Nothing is persisted; useful for tests and throwaway runs.

use crate::error::Result;
use crate::record::{Metric, Point, Record, RollupRecord};
use crate::rollup::{floor, window_means, window_micros};
use crate::storage::{ensure_rollup_tier, from_micros, to_micros, RecordStore, Tier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};

type SeriesKey = (String, Metric);

#[derive(Default)]
pub struct MemoryStore {
    tiers: RwLock<HashMap<Tier, BTreeMap<SeriesKey, BTreeMap<i64, f64>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows held in `tier`.
    pub fn len(&self, tier: Tier) -> usize {
        self.tiers
            .read()
            .get(&tier)
            .map(|series| series.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, tier: Tier) -> bool {
        self.len(tier) == 0
    }

    fn insert_if_absent<'a, I>(&self, tier: Tier, rows: I) -> usize
    where
        I: IntoIterator<Item = (&'a str, Metric, i64, f64)>,
    {
        let mut tiers = self.tiers.write();
        let table = tiers.entry(tier).or_default();
        let mut created = 0;
        for (user_id, metric, ts, value) in rows {
            let series = table.entry((user_id.to_string(), metric)).or_default();
            if let Entry::Vacant(slot) = series.entry(ts) {
                slot.insert(value);
                created += 1;
            }
        }
        created
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn init(&self) -> Result<()> {
        let mut tiers = self.tiers.write();
        for tier in Tier::ALL {
            tiers.entry(tier).or_default();
        }
        Ok(())
    }

    async fn upsert_raw(&self, records: &[Record]) -> Result<usize> {
        Ok(self.insert_if_absent(
            Tier::Raw,
            records
                .iter()
                .map(|r| (r.user_id.as_str(), r.metric, to_micros(r.timestamp), r.value)),
        ))
    }

    async fn upsert_rollup(&self, tier: Tier, records: &[RollupRecord]) -> Result<usize> {
        ensure_rollup_tier(tier)?;
        Ok(self.insert_if_absent(
            tier,
            records
                .iter()
                .map(|r| (r.user_id.as_str(), r.metric, to_micros(r.window_start), r.value)),
        ))
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

        let key = (user_id.to_string(), metric);
        let mut tiers = self.tiers.write();
        let raw: Vec<(i64, f64)> = tiers
            .get(&Tier::Raw)
            .and_then(|table| table.get(&key))
            .map(|series| {
                series
                    .range(first..=last.saturating_add(window) - 1)
                    .map(|(ts, value)| (*ts, *value))
                    .collect()
            })
            .unwrap_or_default();
        let means = window_means(raw, window);

        let series = tiers.entry(tier).or_default().entry(key).or_default();
        let mut written = 0;
        for start in &starts {
            if let Some(value) = means.get(start) {
                series.insert(*start, *value);
                written += 1;
            }
        }
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
        let tiers = self.tiers.read();
        let Some(series) = tiers
            .get(&tier)
            .and_then(|table| table.get(&(user_id.to_string(), metric)))
        else {
            return Ok(Vec::new());
        };

        series
            .range(to_micros(start)..=to_micros(end))
            .map(|(micros, value)| {
                Ok(Point {
                    timestamp: from_micros(*micros)?,
                    value: *value,
                })
            })
            .collect()
    }
}
