//! In-process backend on tokio broadcast channels.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    tokio::sync::{broadcast, mpsc},
    tracing::{trace, warn},
};

use crate::{
    channel::Channel,
    error::{Error, Result},
    pubsub::{PubSub, RawMessage, Subscription},
};

const CHANNEL_CAPACITY: usize = 256;

pub struct MemoryBus {
    senders: HashMap<Channel, broadcast::Sender<String>>,
    closed: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            senders: Channel::ALL
                .into_iter()
                .map(|channel| (channel, broadcast::channel(CHANNEL_CAPACITY).0))
                .collect(),
            closed: AtomicBool::new(false),
        }
    }

    fn sender(&self, channel: Channel) -> Result<&broadcast::Sender<String>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.senders
            .get(&channel)
            .ok_or_else(|| Error::UnknownChannel(channel.to_string()))
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, channel: Channel, payload: String) -> Result<usize> {
        trace!(channel = %channel, "memory bus publish");
        // A send error only means nobody is listening.
        Ok(self.sender(channel)?.send(payload).unwrap_or(0))
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut tasks = Vec::with_capacity(channels.len());
        for &channel in channels {
            let mut source = self.sender(channel)?.subscribe();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match source.recv().await {
                        Ok(payload) => {
                            if tx.send(RawMessage { channel, payload }).await.is_err() {
                                break;
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %channel, skipped, "memory bus subscriber lagged");
                        },
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        Ok(Subscription::new(rx, tasks))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
