use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    message::BusMessage,
    pubsub::PubSub,
};

/// Publishes typed messages and turns "nobody listened" into an error.
#[derive(Clone)]
pub struct BusPublisher {
    bus: Arc<dyn PubSub>,
}

impl BusPublisher {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, session_id: &str, message: &BusMessage) -> Result<usize> {
        let channel = message.channel();
        let payload = message.encode(session_id)?;
        let receivers = self.bus.publish(channel, payload).await?;
        if receivers == 0 {
            warn!(
                channel = %channel,
                session = %session_id,
                tool_call_id = %message.tool_call_id(),
                "published to no subscriber"
            );
            return Err(Error::NoSubscribers { channel });
        }
        debug!(
            channel = %channel,
            session = %session_id,
            tool_call_id = %message.tool_call_id(),
            receivers,
            "published bus message"
        );
        Ok(receivers)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{channel::Channel, memory::MemoryBus, message::WithToolCall},
        mcphub_mcp::types::Progress,
    };

    fn progress() -> BusMessage {
        BusMessage::Progress(WithToolCall::new("c1", Progress {
            progress: 1.0,
            total: None,
            message: None,
        }))
    }

    #[tokio::test]
    async fn zero_subscribers_is_a_delivery_error() {
        let publisher = BusPublisher::new(Arc::new(MemoryBus::new()));
        let err = publisher.publish("s1", &progress()).await.unwrap_err();
        assert!(matches!(err, Error::NoSubscribers {
            channel: Channel::Progress
        }));
    }

    #[tokio::test]
    async fn delivered_messages_decode_on_the_other_side() {
        let bus = Arc::new(MemoryBus::new());
        let mut sub = bus.subscribe(&[Channel::Progress]).await.unwrap();
        let publisher = BusPublisher::new(bus);

        assert_eq!(publisher.publish("s1", &progress()).await.unwrap(), 1);
        let inbound = sub.recv().await.unwrap();
        assert_eq!(inbound.session_id, "s1");
        assert_eq!(inbound.message, progress());
    }
}
