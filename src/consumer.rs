//! Stream consumer.
//!
//! A single sequential loop per subscription: poll one message, decode it,
//! hand it to the ingestion gateway and acknowledge the offset only after the
//! store write returned. Redelivery after a crash is absorbed by the store's
//! conflict-free insert.
//!
//! State transitions are published on a watch channel:
//!
//! ```text
//! Connecting -> Ready -> Consuming <-> Backoff { attempt } -> Stopped(reason)
//! ```
//!
//! Undecodable payloads and records failing validation are logged,
//! acknowledged and skipped. Transient store or broker failures retry the
//! current step with the configured fixed delay; once the attempt budget is
//! spent the consumer stops with a fatal reason and the offset is left
//! uncommitted.

use crate::broker::{BrokerSource, Delivery, Subscription};
use crate::error::{Error, Result};
use crate::ingest::IngestionGateway;
use crate::record::RawRecord;
use crate::retry::{retry_transient, BoundedConstant, RetryPolicy};
use backoff::backoff::Backoff;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The caller asked the consumer to stop
    Shutdown,
    /// The subscription was closed by the broker
    Drained,
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Ready,
    Consuming,
    Backoff { attempt: u32 },
    Stopped(StopReason),
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerState::Connecting => f.write_str("connecting"),
            ConsumerState::Ready => f.write_str("ready"),
            ConsumerState::Consuming => f.write_str("consuming"),
            ConsumerState::Backoff { attempt } => write!(f, "backoff (attempt {})", attempt),
            ConsumerState::Stopped(StopReason::Shutdown) => f.write_str("stopped: shutdown"),
            ConsumerState::Stopped(StopReason::Drained) => f.write_str("stopped: drained"),
            ConsumerState::Stopped(StopReason::Fatal(msg)) => write!(f, "stopped: {}", msg),
        }
    }
}

/// Counters accumulated over one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Rows newly created in the raw tier
    pub stored: u64,
    pub duplicates: u64,
    /// Records that decoded but failed validation
    pub rejected: u64,
    /// Payloads that could not be decoded at all
    pub malformed: u64,
    /// Transient failures that were retried
    pub retries: u64,
}

/// Decodes one broker payload into a wire record. Only JSON objects are
/// accepted.
pub fn decode(payload: &[u8]) -> Result<RawRecord> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::Serialization(format!("payload is not UTF-8: {}", e)))?;
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(Error::Serialization("payload is not a JSON object".into()));
    }
    Ok(serde_json::from_value(value)?)
}

pub struct StreamConsumer {
    gateway: IngestionGateway,
    retry: RetryPolicy,
    state: watch::Sender<ConsumerState>,
    subscription: Option<Box<dyn Subscription>>,
}

impl StreamConsumer {
    pub fn new(gateway: IngestionGateway, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConsumerState::Connecting);
        Self {
            gateway,
            retry,
            state,
            subscription: None,
        }
    }

    /// Receiver observing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    fn set_state(&self, state: ConsumerState) {
        debug!(state = %state, "consumer state");
        self.state.send_replace(state);
    }

    /// Subscribes to `broker`, retrying transient failures within the retry
    /// budget. Exhausting it stops the consumer.
    pub async fn connect(&mut self, broker: &dyn BrokerSource) -> Result<()> {
        self.set_state(ConsumerState::Connecting);
        let endpoint = broker.describe();
        match retry_transient(&self.retry, "broker subscribe", || broker.subscribe()).await {
            Ok(subscription) => {
                info!(endpoint = %endpoint, "connected to broker");
                self.subscription = Some(subscription);
                self.set_state(ConsumerState::Ready);
                Ok(())
            }
            Err(e) => {
                error!(endpoint = %endpoint, error = %e, "could not connect to broker");
                self.set_state(ConsumerState::Stopped(StopReason::Fatal(e.to_string())));
                Err(e)
            }
        }
    }

    /// Consumes until `shutdown` resolves, the subscription closes, or a
    /// failure outlasts the retry budget.
    pub async fn run<S>(&mut self, shutdown: S) -> Result<ConsumerStats>
    where
        S: Future<Output = ()>,
    {
        let mut subscription = self
            .subscription
            .take()
            .ok_or_else(|| Error::Internal("consumer is not connected".into()))?;
        let mut stats = ConsumerStats::default();

        self.set_state(ConsumerState::Consuming);
        let outcome = self.consume(subscription.as_mut(), &mut stats, shutdown).await;
        let reason = match &outcome {
            Ok(reason) => reason.clone(),
            Err(e) => StopReason::Fatal(e.to_string()),
        };
        info!(
            stored = stats.stored,
            duplicates = stats.duplicates,
            rejected = stats.rejected,
            malformed = stats.malformed,
            retries = stats.retries,
            reason = ?reason,
            "consumer stopped"
        );
        self.set_state(ConsumerState::Stopped(reason));
        outcome.map(|_| stats)
    }

    async fn consume<S>(
        &self,
        subscription: &mut dyn Subscription,
        stats: &mut ConsumerStats,
        shutdown: S,
    ) -> Result<StopReason>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let delivery = tokio::select! {
                biased;
                _ = &mut shutdown => return Ok(StopReason::Shutdown),
                delivery = self.next_delivery(subscription, stats) => delivery?,
            };
            let Some(delivery) = delivery else {
                return Ok(StopReason::Drained);
            };
            self.process(subscription, delivery, stats).await?;
        }
    }

    async fn next_delivery(
        &self,
        subscription: &mut dyn Subscription,
        stats: &mut ConsumerStats,
    ) -> Result<Option<Delivery>> {
        let mut retrier = Retrier::new(self, "broker poll");
        loop {
            match subscription.poll().await {
                Ok(delivery) => {
                    retrier.recovered();
                    return Ok(delivery);
                }
                Err(e) => retrier.wait(e, stats).await?,
            }
        }
    }

    async fn process(
        &self,
        subscription: &mut dyn Subscription,
        delivery: Delivery,
        stats: &mut ConsumerStats,
    ) -> Result<()> {
        let offset = delivery.offset;
        match decode(&delivery.payload) {
            Err(e) => {
                warn!(offset, error = %e, "skipping malformed message");
                stats.malformed += 1;
            }
            Ok(raw) => {
                let mut retrier = Retrier::new(self, "ingest");
                let result = loop {
                    match self.gateway.ingest(vec![raw.clone()]).await {
                        Ok(result) => break result,
                        Err(e) => retrier.wait(e, stats).await?,
                    }
                };
                retrier.recovered();
                for rejection in &result.rejected {
                    warn!(offset, reason = %rejection.reason, "skipping invalid record");
                }
                stats.stored += result.accepted as u64;
                stats.duplicates += result.duplicates as u64;
                stats.rejected += result.rejected.len() as u64;
            }
        }

        let mut retrier = Retrier::new(self, "broker ack");
        loop {
            match subscription.ack(offset).await {
                Ok(()) => break,
                Err(e) => retrier.wait(e, stats).await?,
            }
        }
        retrier.recovered();
        Ok(())
    }
}

/// Bounded fixed-delay retry of one consumer step, reflected in the
/// published state.
struct Retrier<'a> {
    consumer: &'a StreamConsumer,
    operation: &'static str,
    backoff: BoundedConstant,
    attempt: u32,
}

impl<'a> Retrier<'a> {
    fn new(consumer: &'a StreamConsumer, operation: &'static str) -> Self {
        Self {
            consumer,
            operation,
            backoff: consumer.retry.backoff(),
            attempt: 0,
        }
    }

    /// Sleeps before the next attempt, or returns the error when it is
    /// permanent or the budget is spent.
    async fn wait(&mut self, err: Error, stats: &mut ConsumerStats) -> Result<()> {
        if !err.is_transient() {
            error!(operation = self.operation, error = %err, "permanent failure");
            return Err(err);
        }
        self.attempt += 1;
        let Some(delay) = self.backoff.next_backoff() else {
            return Err(Error::RetriesExhausted {
                operation: self.operation.to_string(),
                attempts: self.attempt,
                last_error: err.to_string(),
            });
        };
        stats.retries += 1;
        warn!(
            operation = self.operation,
            attempt = self.attempt,
            error = %err,
            retry_in = ?delay,
            "transient failure, backing off"
        );
        self.consumer.set_state(ConsumerState::Backoff {
            attempt: self.attempt,
        });
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn recovered(&mut self) {
        if self.attempt > 0 {
            self.consumer.set_state(ConsumerState::Consuming);
            self.attempt = 0;
            self.backoff.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChannelBroker;
    use crate::storage::{MemoryStore, Tier};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    fn message(second: u32) -> Vec<u8> {
        format!(
            r#"{{"user_id":"u1","metric":"heart_rate","timestamp":"2024-01-01T00:00:{:02}Z","value":70.0}}"#,
            second
        )
        .into_bytes()
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"\xff\xfe").is_err());
        assert!(decode(b"not json").is_err());
        assert!(decode(b"42").is_err());
        assert!(decode(br#"["u1", "heart_rate", "2024-01-01T00:00:00Z", 70.0]"#).is_err());
        assert!(decode(&message(0)).is_ok());
    }

    #[tokio::test]
    async fn test_poison_message_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let broker = ChannelBroker::new();
        broker.publish(b"{not json".to_vec()).unwrap();
        for second in 0..5 {
            broker.publish(message(second)).unwrap();
        }

        let mut consumer = StreamConsumer::new(IngestionGateway::new(store.clone()), fast_retry(3));
        consumer.connect(&broker).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Ready);
        let state = consumer.watch_state();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            consumer
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.committed() != Some(5) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(store.len(Tier::Raw), 5);
        assert_eq!(*state.borrow(), ConsumerState::Consuming);

        stop_tx.send(()).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.stored, 5);
        assert_eq!(stats.malformed, 1);
        assert_eq!(*state.borrow(), ConsumerState::Stopped(StopReason::Shutdown));
    }

    #[tokio::test]
    async fn test_invalid_record_is_acked_and_counted() {
        let store = Arc::new(MemoryStore::new());
        let broker = ChannelBroker::new();
        broker
            .publish(br#"{"user_id":"u1","metric":"steps","timestamp":"2024-01-01T00:00:00Z","value":1}"#.to_vec())
            .unwrap();
        broker.publish(message(1)).unwrap();
        broker.publish(message(1)).unwrap();
        broker.close();

        let mut consumer = StreamConsumer::new(IngestionGateway::new(store.clone()), fast_retry(3));
        consumer.connect(&broker).await.unwrap();
        let stats = consumer.run(std::future::pending()).await.unwrap();

        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.stored, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(broker.committed(), Some(2));
        assert_eq!(consumer.state(), ConsumerState::Stopped(StopReason::Drained));
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let broker = ChannelBroker::new().fail_subscribes(2);
        let mut consumer = StreamConsumer::new(IngestionGateway::new(Arc::new(MemoryStore::new())), fast_retry(3));
        consumer.connect(&broker).await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Ready);
    }

    #[tokio::test]
    async fn test_connect_exhaustion_is_fatal() {
        let broker = ChannelBroker::new().fail_subscribes(5);
        let mut consumer = StreamConsumer::new(IngestionGateway::new(Arc::new(MemoryStore::new())), fast_retry(3));
        let err = consumer.connect(&broker).await.unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(matches!(consumer.state(), ConsumerState::Stopped(StopReason::Fatal(_))));
    }

    #[tokio::test]
    async fn test_run_without_connect_fails() {
        let mut consumer = StreamConsumer::new(IngestionGateway::new(Arc::new(MemoryStore::new())), fast_retry(1));
        assert!(consumer.run(std::future::pending()).await.is_err());
    }
}
