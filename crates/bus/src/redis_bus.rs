//! Redis/Valkey backend. Publishes over one multiplexed connection; every
//! subscription gets its own pub/sub connection.

use std::sync::atomic::{AtomicBool, Ordering};

use {
    async_trait::async_trait,
    futures::StreamExt,
    redis::{AsyncCommands, aio::MultiplexedConnection},
    tokio::sync::mpsc,
    tracing::{debug, info, warn},
};

use crate::{
    channel::Channel,
    error::{Error, Result},
    pubsub::{PubSub, RawMessage, Subscription},
};

pub struct RedisBus {
    client: redis::Client,
    publisher: MultiplexedConnection,
    closed: AtomicBool,
}

impl RedisBus {
    /// Connect to `host[:port]` (port defaults to 6379).
    pub async fn connect(address: &str) -> Result<Self> {
        let url = if address.contains("://") {
            address.to_string()
        } else if address.contains(':') {
            format!("redis://{address}")
        } else {
            format!("redis://{address}:6379")
        };
        info!(url = %url, "connecting pub/sub bus");
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            publisher,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PubSub for RedisBus {
    async fn publish(&self, channel: Channel, payload: String) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(channel.as_str(), payload).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[Channel]) -> Result<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        debug!(channels = ?channels, "subscribed to bus channels");

        let (tx, rx) = mpsc::channel(256);
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let name = msg.get_channel_name().to_string();
                let Ok(channel) = name.parse::<Channel>() else {
                    warn!(channel = %name, "message on unexpected channel");
                    continue;
                };
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "non-text bus payload");
                        continue;
                    },
                };
                if tx.send(RawMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
            debug!("bus subscription ended");
        });
        Ok(Subscription::new(rx, vec![task]))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
