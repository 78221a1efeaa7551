use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use {
    async_trait::async_trait,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::error,
};

use crate::{
    channel::Channel,
    error::Result,
    message::{BusMessage, Inbound},
};

/// A raw payload as it came off a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub channel: Channel,
    pub payload: String,
}

/// Transport-agnostic publish/subscribe.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish and return how many subscribers received the payload.
    async fn publish(&self, channel: Channel, payload: String) -> Result<usize>;

    async fn subscribe(&self, channels: &[Channel]) -> Result<Subscription>;

    /// Stop accepting publishes.
    async fn close(&self);
}

/// Counts payloads that failed validation and were discarded.
#[derive(Debug, Default)]
pub struct RejectCounter(AtomicU64);

impl RejectCounter {
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Messages from one or more channels. Dropping it stops the backend's
/// forwarding tasks.
pub struct Subscription {
    rx: mpsc::Receiver<RawMessage>,
    tasks: Vec<JoinHandle<()>>,
    rejected: Arc<RejectCounter>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<RawMessage>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            rx,
            tasks,
            rejected: Arc::new(RejectCounter::default()),
        }
    }

    pub async fn recv_raw(&mut self) -> Option<RawMessage> {
        self.rx.recv().await
    }

    /// Next message that decodes. Malformed payloads are logged, counted and
    /// skipped.
    pub async fn recv(&mut self) -> Option<Inbound> {
        loop {
            let raw = self.rx.recv().await?;
            match BusMessage::decode(raw.channel, &raw.payload) {
                Ok(inbound) => return Some(inbound),
                Err(e) => {
                    self.rejected.bump();
                    error!(
                        channel = %raw.channel,
                        error = %e,
                        rejected = self.rejected.count(),
                        "rejected bus message"
                    );
                },
            }
        }
    }

    pub fn rejected(&self) -> Arc<RejectCounter> {
        Arc::clone(&self.rejected)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
