//! Hub side of the bus: publishes what a hub announces and feeds the
//! driver's answers back into it.

use std::sync::{Arc, Weak};

use {
    async_trait::async_trait,
    mcphub_bus::{
        BusMessage, BusPublisher, Channel, ElicitationRequest, ProgressEvent, PubSub,
        SamplingRequest, ToolCallResultEvent,
    },
    tracing::{debug, info, warn},
};

use crate::{error::Result, events::HubEventSink, hub::HubService};

/// [`HubEventSink`] that publishes on the bus.
#[derive(Clone)]
pub struct BusEventSink {
    publisher: BusPublisher,
}

impl BusEventSink {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self {
            publisher: BusPublisher::new(bus),
        }
    }

    async fn publish(&self, session_id: &str, message: BusMessage) -> Result<()> {
        self.publisher.publish(session_id, &message).await?;
        Ok(())
    }
}

#[async_trait]
impl HubEventSink for BusEventSink {
    async fn sampling_request(&self, session_id: &str, request: SamplingRequest) -> Result<()> {
        self.publish(session_id, BusMessage::SamplingRequest(request))
            .await
    }

    async fn elicitation_request(
        &self,
        session_id: &str,
        request: ElicitationRequest,
    ) -> Result<()> {
        self.publish(session_id, BusMessage::ElicitationRequest(request))
            .await
    }

    async fn tool_call_result(&self, session_id: &str, event: ToolCallResultEvent) -> Result<()> {
        self.publish(session_id, BusMessage::ToolCallResult(event))
            .await
    }

    async fn progress(&self, session_id: &str, event: ProgressEvent) -> Result<()> {
        self.publish(session_id, BusMessage::Progress(event)).await
    }
}

/// Subscribe to the result channels on behalf of `hub`. The subscription is
/// live when this returns; the listener stops when the hub is disposed or
/// dropped.
pub async fn attach(hub: &Arc<HubService>, bus: &Arc<dyn PubSub>) -> Result<()> {
    let mut subscription = bus.subscribe(&Channel::HUB_INBOUND).await?;
    let session_id = hub.session_id().to_string();
    let weak: Weak<HubService> = Arc::downgrade(hub);
    info!(session = %session_id, "hub listening for results");

    let listener = tokio::spawn(async move {
        while let Some(inbound) = subscription.recv().await {
            if inbound.session_id != session_id {
                continue;
            }
            let Some(hub) = weak.upgrade() else {
                break;
            };
            let channel = inbound.message.channel();
            let tool_call_id = inbound.message.tool_call_id().to_string();
            let delivered = match inbound.message {
                BusMessage::SamplingResult(result) => {
                    hub.on_sampling_result(&inbound.session_id, result)
                },
                BusMessage::ElicitationResult(result) => {
                    hub.on_elicitation_result(&inbound.session_id, result)
                },
                other => {
                    debug!(channel = %other.channel(), "hub ignores channel");
                    continue;
                },
            };
            if let Err(e) = delivered {
                warn!(session = %session_id, channel = %channel, tool_call_id, error = %e, "dropped result");
            }
        }
        debug!(session = %session_id, "hub result listener ended");
    });
    hub.attach_listener(listener);
    Ok(())
}
