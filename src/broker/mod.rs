//! Message broker abstraction consumed by the stream consumer.
//!
//! A [`BrokerSource`] hands out a [`Subscription`] for one consumer group.
//! Deliveries carry a monotonically increasing offset; acknowledging an
//! offset commits it, and a later subscription for the same group resumes
//! after the last committed offset. Anything delivered but not acknowledged
//! is delivered again, so consumers must be idempotent.

pub mod channel;
pub mod file;

use crate::error::Result;
use async_trait::async_trait;

pub use self::channel::ChannelBroker;
pub use self::file::FileBroker;

/// One message pulled from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(offset: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            offset,
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits for the next delivery. `None` means the subscription is closed
    /// and nothing further will arrive.
    async fn poll(&mut self) -> Result<Option<Delivery>>;

    /// Commits `offset` and every offset before it.
    async fn ack(&mut self, offset: u64) -> Result<()>;
}

#[async_trait]
pub trait BrokerSource: Send + Sync {
    /// Human-readable endpoint, used in logs.
    fn describe(&self) -> String;

    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
}
