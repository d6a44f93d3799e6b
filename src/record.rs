//! Data model shared by ingestion, rollup and query.
//!
//! A [`Record`] is one validated measurement keyed by `(user_id, metric,
//! timestamp)`. A [`RollupRecord`] carries the same key shape, where the
//! timestamp is the start of a fixed window and the value is the mean of the
//! raw values inside it. [`RawRecord`] is the loosely-typed shape that arrives
//! from the normalizer or the broker before validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of measured quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    HeartRate,
    Spo2,
    Activity,
    BreathRate,
    Hrv,
    ActiveZoneMinute,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::HeartRate,
        Metric::Spo2,
        Metric::Activity,
        Metric::BreathRate,
        Metric::Hrv,
        Metric::ActiveZoneMinute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::HeartRate => "heart_rate",
            Metric::Spo2 => "spo2",
            Metric::Activity => "activity",
            Metric::BreathRate => "breath_rate",
            Metric::Hrv => "hrv",
            Metric::ActiveZoneMinute => "active_zone_minute",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a metric name is not part of the fixed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMetric(pub String);

impl fmt::Display for UnknownMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown metric '{}'", self.0)
    }
}

impl std::error::Error for UnknownMetric {}

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// A single validated measurement.
///
/// `timestamp` carries at most microsecond precision, the resolution keys are
/// stored at; ingestion refuses finer timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub user_id: String,
    pub metric: Metric,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Record {
    pub fn new(user_id: impl Into<String>, metric: Metric, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            user_id: user_id.into(),
            metric,
            timestamp,
            value,
        }
    }

    /// Storage key: at most one value per key exists in a tier.
    pub fn key(&self) -> (&str, Metric, DateTime<Utc>) {
        (&self.user_id, self.metric, self.timestamp)
    }
}

/// The mean of the raw values of one series over one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollupRecord {
    pub user_id: String,
    pub metric: Metric,
    pub window_start: DateTime<Utc>,
    pub value: f64,
}

/// One `(timestamp, value)` pair returned by a scan or query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// A record as it arrives on the wire, before validation.
///
/// Every field is optional and untyped so the gateway can report exactly
/// which field was missing or ill-typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub user_id: Option<serde_json::Value>,
    #[serde(default)]
    pub metric: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

impl RawRecord {
    /// Builds a well-formed wire record, mostly useful for loaders and tests.
    pub fn new(user_id: &str, metric: &str, timestamp: &str, value: f64) -> Self {
        Self {
            user_id: Some(user_id.into()),
            metric: Some(metric.into()),
            timestamp: Some(timestamp.into()),
            value: serde_json::Number::from_f64(value).map(serde_json::Value::Number),
        }
    }
}

impl From<&Record> for RawRecord {
    fn from(record: &Record) -> Self {
        RawRecord::new(
            &record.user_id,
            record.metric.as_str(),
            &record.timestamp.to_rfc3339(),
            record.value,
        )
    }
}
