use crate::{
    broker::FileBroker,
    cli::commands::{ConsumeCommand, LoadCommand, QueryCommand, RollupCommand},
    config::{ConfigArgs, Settings},
    consumer::StreamConsumer,
    export::{encode_ipc, points_to_record_batch},
    ingest::{parse_timestamp, IngestionGateway},
    loader::BatchLoader,
    query::{QueryRequest, QueryResponse, QueryRouter, TierPolicy},
    record::{Metric, Record},
    rollup::RollupEngine,
    storage::{connect_store, RecordStore, Tier},
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

async fn open(args: &ConfigArgs) -> Result<(Settings, Arc<dyn RecordStore>)> {
    let settings = Settings::load(args).context("Failed to load configuration")?;
    let store = connect_store(&settings.storage, &settings.retry)
        .await
        .context("Failed to connect to record store")?;
    Ok((settings, store))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", json);
    Ok(())
}

pub async fn handle_load(cmd: LoadCommand) -> Result<()> {
    let (settings, store) = open(&cmd.config).await?;

    let mut loader = BatchLoader::new(IngestionGateway::new(store.clone()));
    if !cmd.no_rollup {
        loader = loader.with_rollups(
            RollupEngine::new(store),
            settings.rollup.tiers.clone(),
            settings.rollup.mode,
        );
    }

    let report = loader
        .load_dir(&cmd.dir)
        .await
        .with_context(|| format!("Failed to load {}", cmd.dir.display()))?;
    print_json(&report)
}

pub async fn handle_consume(cmd: ConsumeCommand) -> Result<()> {
    let (settings, store) = open(&cmd.config).await?;

    let broker = FileBroker::from_config(&settings.broker).follow(!cmd.drain);
    let mut consumer = StreamConsumer::new(IngestionGateway::new(store), settings.retry);
    consumer
        .connect(&broker)
        .await
        .context("Failed to connect to broker")?;

    let stats = consumer
        .run(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down");
            }
        })
        .await
        .context("Stream consumer failed")?;
    print_json(&stats)
}

/// RFC 3339 instant, or a calendar date expanded to the start or the last
/// microsecond of that day.
fn parse_bound(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Some(ts) = parse_timestamp(raw) {
        return Ok(ts);
    }
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("Invalid timestamp or date '{}'", raw))?;
    let start = date.and_time(NaiveTime::MIN).and_utc();
    Ok(if end_of_day {
        start + chrono::Duration::days(1) - chrono::Duration::microseconds(1)
    } else {
        start
    })
}

pub async fn handle_rollup(cmd: RollupCommand) -> Result<()> {
    let metric: Metric = cmd.metric.parse()?;
    let start = parse_bound(&cmd.start, false)?;
    let end = parse_bound(&cmd.end, true)?;
    if end < start {
        return Err(anyhow!("--end is before --start"));
    }

    let (settings, store) = open(&cmd.config).await?;
    let raw: Vec<Record> = store
        .scan(Tier::Raw, &cmd.user, metric, start, end)
        .await
        .context("Failed to read raw tier")?
        .into_iter()
        .map(|point| Record::new(cmd.user.clone(), metric, point.timestamp, point.value))
        .collect();
    info!(user_id = %cmd.user, metric = %metric, records = raw.len(), "rebuilding rollups");

    let report = RollupEngine::new(store)
        .recompute(&settings.rollup.tiers, &raw)
        .await
        .context("Rollup failed")?;
    print_json(&report)?;
    if report.has_failures() {
        return Err(anyhow!("some rollup windows could not be written"));
    }
    Ok(())
}

pub async fn handle_query(cmd: QueryCommand) -> Result<()> {
    let (settings, store) = open(&cmd.config).await?;
    let router = QueryRouter::new(store, TierPolicy::from_config(&settings.query));

    let request = QueryRequest {
        user_id: cmd.user,
        metric: cmd.metric,
        start_date: cmd.start_date,
        end_date: cmd.end_date,
    };
    let result = router.fetch(&request).await;

    if let (Ok(points), Some(path)) = (&result, &cmd.arrow_out) {
        let batch = points_to_record_batch(points).context("Failed to build record batch")?;
        let bytes = encode_ipc(&batch).context("Failed to encode Arrow IPC")?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), rows = points.len(), "wrote Arrow IPC stream");
    }

    print_json(&QueryResponse::from(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_bound_accepts_dates_and_instants() {
        let day = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_bound("2024-01-01", false).unwrap(), day);
        assert_eq!(
            parse_bound("2024-01-01", true).unwrap(),
            day + chrono::Duration::days(1) - chrono::Duration::microseconds(1)
        );
        assert_eq!(parse_bound("2024-01-01T00:00:00Z", true).unwrap(), day);
        assert!(parse_bound("tomorrow", false).is_err());
    }
}
