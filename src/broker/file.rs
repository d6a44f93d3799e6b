//! Broker over an append-only newline-delimited JSON log.
//!
//! The topic lives at `<address>/<topic>.jsonl`, one message per line, and
//! the line number is the offset. Each consumer group commits its offset to
//! `<address>/<topic>.<group>.offset`. A new subscription skips every line
//! up to and including the committed offset.

use crate::broker::{BrokerSource, Delivery, Subscription};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct FileBroker {
    address: PathBuf,
    topic: String,
    group: String,
    follow: bool,
    poll_interval: Duration,
}

impl FileBroker {
    pub fn new(address: impl Into<PathBuf>, topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topic: topic.into(),
            group: group.into(),
            follow: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.address, &config.topic, &config.group)
    }

    /// When false, the subscription ends at the current end of the log
    /// instead of waiting for more lines.
    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn log_path(&self) -> PathBuf {
        self.address.join(format!("{}.jsonl", self.topic))
    }

    pub fn offset_path(&self) -> PathBuf {
        self.address.join(format!("{}.{}.offset", self.topic, self.group))
    }

    /// Offset last acknowledged by this group.
    pub async fn committed(&self) -> Result<Option<u64>> {
        read_offset(&self.offset_path()).await
    }
}

async fn read_offset(path: &Path) -> Result<Option<u64>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::Broker(format!("corrupt offset file {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Broker(format!("reading {}: {}", path.display(), e))),
    }
}

#[async_trait]
impl BrokerSource for FileBroker {
    fn describe(&self) -> String {
        format!("file://{}#{}", self.log_path().display(), self.group)
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        let log_path = self.log_path();
        let file = File::open(&log_path)
            .await
            .map_err(|e| Error::Broker(format!("opening {}: {}", log_path.display(), e)))?;

        let resume_at = self.committed().await?.map_or(0, |offset| offset + 1);
        let mut subscription = FileSubscription {
            reader: BufReader::new(file),
            pending: Vec::new(),
            next_offset: 0,
            offset_path: self.offset_path(),
            follow: self.follow,
            poll_interval: self.poll_interval,
        };
        while subscription.next_offset < resume_at {
            if subscription.next_line(false).await?.is_none() {
                break;
            }
        }
        info!(log = %log_path.display(), group = %self.group, resume_at, "subscribed");
        Ok(Box::new(subscription))
    }
}

struct FileSubscription {
    reader: BufReader<File>,
    pending: Vec<u8>,
    next_offset: u64,
    offset_path: PathBuf,
    follow: bool,
    poll_interval: Duration,
}

impl FileSubscription {
    /// Returns the next complete line with its offset, as raw bytes. A
    /// trailing line without a newline is only returned once the log stops
    /// growing and `follow` is off. Content is not inspected here, so every
    /// line consumes exactly one offset.
    async fn next_line(&mut self, follow: bool) -> Result<Option<(u64, Vec<u8>)>> {
        loop {
            let read = self
                .reader
                .read_until(b'\n', &mut self.pending)
                .await
                .map_err(|e| Error::Broker(format!("reading log: {}", e)))?;

            let complete = self.pending.ends_with(b"\n");
            if complete || (read == 0 && !follow && !self.pending.is_empty()) {
                let mut line = std::mem::take(&mut self.pending);
                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                let offset = self.next_offset;
                self.next_offset += 1;
                return Ok(Some((offset, line)));
            }
            if read == 0 {
                if !follow {
                    return Ok(None);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

#[async_trait]
impl Subscription for FileSubscription {
    async fn poll(&mut self) -> Result<Option<Delivery>> {
        let follow = self.follow;
        while let Some((offset, line)) = self.next_line(follow).await? {
            // blank lines still consume an offset
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(Delivery::new(offset, line)));
        }
        Ok(None)
    }

    async fn ack(&mut self, offset: u64) -> Result<()> {
        let tmp = self.offset_path.with_extension("offset.tmp");
        tokio::fs::write(&tmp, offset.to_string())
            .await
            .map_err(|e| Error::Broker(format!("writing {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.offset_path)
            .await
            .map_err(|e| Error::Broker(format!("committing {}: {}", self.offset_path.display(), e)))?;
        debug!(offset, "offset committed");
        Ok(())
    }
}
