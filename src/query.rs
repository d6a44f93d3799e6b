//! Query routing across storage tiers.
//!
//! The router bounds the number of points a query returns by trading
//! resolution for range: short spans read the raw tier, longer spans read
//! progressively coarser rollups. The policy is an ordered table of
//! `(max_span, tier)` rules plus a fallback tier, so adding a tier means
//! adding a row.
//!
//! [`QueryRouter::handle`] is the endpoint-facing entry point: it accepts
//! calendar dates and always answers with a [`QueryResponse`], turning
//! malformed input and store failures into a structured error payload.

use crate::config::QueryConfig;
use crate::error::{Error, Result};
use crate::record::{Metric, Point};
use crate::storage::{RecordStore, Tier};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const DAY: Duration = Duration::from_secs(86_400);

/// One row of the tier-selection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierRule {
    /// Largest span (inclusive) served by `tier`
    #[serde(with = "humantime_serde")]
    pub max_span: Duration,
    pub tier: Tier,
}

/// Ordered span → tier table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierPolicy {
    rules: Vec<TierRule>,
    fallback: Tier,
}

impl Default for TierPolicy {
    /// ≤ 3 days → raw, ≤ 30 days → 1h, otherwise 1d.
    fn default() -> Self {
        Self::new(
            vec![
                TierRule {
                    max_span: 3 * DAY,
                    tier: Tier::Raw,
                },
                TierRule {
                    max_span: 30 * DAY,
                    tier: Tier::Hour,
                },
            ],
            Tier::Day,
        )
    }
}

impl TierPolicy {
    pub fn new(mut rules: Vec<TierRule>, fallback: Tier) -> Self {
        rules.sort_by_key(|rule| rule.max_span);
        Self { rules, fallback }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.rules.clone(), config.fallback)
    }

    pub fn select(&self, span: Duration) -> Tier {
        self.rules
            .iter()
            .find(|rule| span <= rule.max_span)
            .map(|rule| rule.tier)
            .unwrap_or(self.fallback)
    }
}

/// Query endpoint input: calendar dates, inclusive on both ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub user_id: String,
    pub metric: String,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDto {
    pub timestamp: String,
    pub value: f64,
}

impl From<Point> for PointDto {
    fn from(point: Point) -> Self {
        Self {
            timestamp: point.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            value: point.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Query endpoint output: ordered points, or a structured error payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResponse {
    Points(Vec<PointDto>),
    Error { error: ErrorBody },
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<std::result::Result<Vec<Point>, ErrorBody>> for QueryResponse {
    fn from(result: std::result::Result<Vec<Point>, ErrorBody>) -> Self {
        match result {
            Ok(points) => QueryResponse::Points(points.into_iter().map(PointDto::from).collect()),
            Err(error) => QueryResponse::Error { error },
        }
    }
}

/// Picks a tier for a time range and reads it from the store.
#[derive(Clone)]
pub struct QueryRouter {
    store: Arc<dyn RecordStore>,
    policy: TierPolicy,
}

impl QueryRouter {
    pub fn new(store: Arc<dyn RecordStore>, policy: TierPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    /// Points of one series in the closed interval `[start, end]`.
    ///
    /// The tier is chosen from `end - start`; an empty range or a range with
    /// no data yields an empty vector.
    pub async fn query(
        &self,
        user_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        let span = (end - start).to_std().unwrap_or(Duration::ZERO);
        let tier = self.policy.select(span);
        self.query_tier(tier, user_id, metric, start, end).await
    }

    async fn query_tier(
        &self,
        tier: Tier,
        user_id: &str,
        metric: Metric,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>> {
        debug!(user_id, metric = %metric, tier = %tier, %start, %end, "routing query");
        self.store.scan(tier, user_id, metric, start, end).await
    }

    /// Calendar-date query: covers `start_date 00:00:00` through the last
    /// instant of `end_date`. The tier is chosen from the whole-day span
    /// `end_date - start_date`.
    pub async fn query_dates(
        &self,
        user_id: &str,
        metric: Metric,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> Result<Vec<Point>> {
        if end_date < start_date {
            return Err(Error::Validation(format!(
                "end_date {} is before start_date {}",
                end_date, start_date
            )));
        }
        let days = u32::try_from((end_date - start_date).num_days()).unwrap_or(u32::MAX);
        let tier = self.policy.select(DAY * days);
        info!(user_id, metric = %metric, span_days = days, tier = %tier, "date range query");

        let start = start_date.and_time(NaiveTime::MIN).and_utc();
        let end = end_date
            .succ_opt()
            .map(|next| next.and_time(NaiveTime::MIN).and_utc() - chrono::Duration::microseconds(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.query_tier(tier, user_id, metric, start, end).await
    }

    /// Resolves an endpoint request to points, or to the error payload the
    /// endpoint should return.
    pub async fn fetch(&self, request: &QueryRequest) -> std::result::Result<Vec<Point>, ErrorBody> {
        let start_date = parse_date(&request.start_date).map_err(|m| ErrorBody::new("invalid_date", m))?;
        let end_date = parse_date(&request.end_date).map_err(|m| ErrorBody::new("invalid_date", m))?;
        let metric: Metric = request
            .metric
            .parse()
            .map_err(|e| ErrorBody::new("invalid_metric", format!("{}", e)))?;

        self.query_dates(&request.user_id, metric, start_date, end_date)
            .await
            .map_err(|err| match err {
                Error::Validation(message) => ErrorBody::new("invalid_range", message),
                err => {
                    error!(error = %err, user_id = %request.user_id, "query failed");
                    ErrorBody::new("storage", err.to_string())
                }
            })
    }

    /// Endpoint entry point; never fails, errors become payloads.
    pub async fn handle(&self, request: &QueryRequest) -> QueryResponse {
        self.fetch(request).await.into()
    }
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| format!("invalid date '{}': expected YYYY-MM-DD ({})", raw, e))
}
