//! In-process broker backed by a tokio channel.

use crate::broker::{BrokerSource, Delivery, Subscription};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const NOTHING_COMMITTED: u64 = u64::MAX;

/// Single-subscriber broker for embedding and tests.
///
/// Offsets are assigned at publish time starting from zero. Closing the
/// broker lets the subscription drain what was published and then end.
pub struct ChannelBroker {
    sender: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    next_offset: AtomicU64,
    committed: Arc<AtomicU64>,
    failing_subscribes: AtomicU32,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBroker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            next_offset: AtomicU64::new(0),
            committed: Arc::new(AtomicU64::new(NOTHING_COMMITTED)),
            failing_subscribes: AtomicU32::new(0),
        }
    }

    /// The next `count` subscribe calls fail with a transient broker error.
    pub fn fail_subscribes(self, count: u32) -> Self {
        self.failing_subscribes.store(count, Ordering::SeqCst);
        self
    }

    /// Publishes a payload and returns its offset.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> Result<u64> {
        let sender = self.sender.lock();
        let sender = sender
            .as_ref()
            .ok_or_else(|| Error::Broker("broker is closed".into()))?;
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        sender
            .send(Delivery::new(offset, payload))
            .map_err(|_| Error::Broker("subscription dropped".into()))?;
        Ok(offset)
    }

    /// Stops accepting publishes; the subscription ends once drained.
    pub fn close(&self) {
        self.sender.lock().take();
    }

    /// Highest acknowledged offset, if any.
    pub fn committed(&self) -> Option<u64> {
        match self.committed.load(Ordering::SeqCst) {
            NOTHING_COMMITTED => None,
            offset => Some(offset),
        }
    }
}

#[async_trait]
impl BrokerSource for ChannelBroker {
    fn describe(&self) -> String {
        "channel://in-process".to_string()
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let remaining = self.failing_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_subscribes.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Broker("broker not reachable".into()));
        }
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or_else(|| Error::Internal("channel broker already has a subscriber".into()))?;
        Ok(Box::new(ChannelSubscription {
            receiver,
            committed: self.committed.clone(),
        }))
    }
}

struct ChannelSubscription {
    receiver: mpsc::UnboundedReceiver<Delivery>,
    committed: Arc<AtomicU64>,
}

#[async_trait]
impl Subscription for ChannelSubscription {
    async fn poll(&mut self) -> Result<Option<Delivery>> {
        Ok(self.receiver.recv().await)
    }

    async fn ack(&mut self, offset: u64) -> Result<()> {
        self.committed.store(offset, Ordering::SeqCst);
        Ok(())
    }
}
