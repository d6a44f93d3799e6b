//! Ingestion gateway.
//!
//! Validates a batch of wire records one by one and applies the valid ones to
//! the raw tier in a single store call. Validation is best-effort per record:
//! a bad record is reported with a reason code and never aborts the batch.
//! Duplicate keys are absorbed by the store's conflict-free insert, which is
//! what makes batch reloads and broker redelivery safe.

use crate::error::Result;
use crate::record::{Metric, RawRecord, Record};
use crate::storage::RecordStore;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Why a record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    MissingField(&'static str),
    InvalidField(&'static str),
    UnknownMetric(String),
    NonFiniteValue,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingField(field) => write!(f, "missing field '{}'", field),
            RejectReason::InvalidField(field) => write!(f, "invalid value for field '{}'", field),
            RejectReason::UnknownMetric(metric) => write!(f, "unknown metric '{}'", metric),
            RejectReason::NonFiniteValue => f.write_str("value is not finite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Position of the record in the submitted batch
    pub index: usize,
    pub reason: RejectReason,
}

/// Outcome of one ingest call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub submitted: usize,
    /// Rows newly created in the raw tier
    pub accepted: usize,
    /// Valid records whose key already existed
    pub duplicates: usize,
    pub rejected: Vec<Rejection>,
}

/// Validates one wire record.
///
/// Checks run in a fixed order: presence of `user_id`, `metric`, `timestamp`
/// and `value`; then their types; then metric membership; then finiteness.
pub fn validate(raw: &RawRecord) -> std::result::Result<Record, RejectReason> {
    let user_id = present(&raw.user_id, "user_id")?;
    let metric = present(&raw.metric, "metric")?;
    let timestamp = present(&raw.timestamp, "timestamp")?;
    let value = present(&raw.value, "value")?;

    let user_id = match user_id {
        Value::String(s) if !s.trim().is_empty() => s.clone(),
        _ => return Err(RejectReason::InvalidField("user_id")),
    };
    let metric = metric.as_str().ok_or(RejectReason::InvalidField("metric"))?;
    let timestamp = timestamp
        .as_str()
        .and_then(parse_timestamp)
        .ok_or(RejectReason::InvalidField("timestamp"))?;
    let value = match value {
        Value::Number(n) => n.as_f64().ok_or(RejectReason::InvalidField("value"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| RejectReason::InvalidField("value"))?,
        _ => return Err(RejectReason::InvalidField("value")),
    };

    let metric: Metric = metric
        .parse()
        .map_err(|_| RejectReason::UnknownMetric(metric.to_string()))?;
    if !value.is_finite() {
        return Err(RejectReason::NonFiniteValue);
    }

    Ok(Record {
        user_id,
        metric,
        timestamp,
        value,
    })
}

fn present<'a>(field: &'a Option<Value>, name: &'static str) -> std::result::Result<&'a Value, RejectReason> {
    match field {
        None | Some(Value::Null) => Err(RejectReason::MissingField(name)),
        Some(value) => Ok(value),
    }
}

/// RFC 3339 with an explicit offset, or a naive ISO-8601 timestamp read as UTC.
///
/// Keys are stored at microsecond resolution, so a timestamp with a non-zero
/// sub-microsecond part is refused rather than truncated into another key.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let ts = match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(_) => ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())?
            .and_utc(),
    };
    (ts.timestamp_subsec_nanos() % 1_000 == 0).then_some(ts)
}

/// Stateless front door of the raw tier.
#[derive(Clone)]
pub struct IngestionGateway {
    store: Arc<dyn RecordStore>,
}

impl IngestionGateway {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Validates `batch` and writes the valid records in one store call.
    ///
    /// Rejections are reported per record. A store failure fails the call as
    /// a whole so the caller can retry; re-submitting is safe.
    pub async fn ingest(&self, batch: Vec<RawRecord>) -> Result<IngestResult> {
        let mut result = IngestResult {
            submitted: batch.len(),
            ..IngestResult::default()
        };

        let mut valid = Vec::with_capacity(batch.len());
        for (index, raw) in batch.iter().enumerate() {
            match validate(raw) {
                Ok(record) => valid.push(record),
                Err(reason) => {
                    warn!(index, %reason, "rejecting record");
                    result.rejected.push(Rejection { index, reason });
                }
            }
        }

        if !valid.is_empty() {
            result.accepted = self.store.upsert_raw(&valid).await?;
            result.duplicates = valid.len() - result.accepted;
        }

        debug!(
            submitted = result.submitted,
            accepted = result.accepted,
            duplicates = result.duplicates,
            rejected = result.rejected.len(),
            "batch ingested"
        );
        Ok(result)
    }
}
