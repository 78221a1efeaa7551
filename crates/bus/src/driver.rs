//! Conversation-driver side of the bridge: answers the hub's sampling and
//! elicitation requests and observes results and progress.

use std::sync::Arc;

use {
    async_trait::async_trait,
    mcphub_mcp::types::{CreateMessageResult, ElicitResult},
    tokio::task::JoinHandle,
    tracing::{debug, info, warn},
};

use crate::{
    channel::Channel,
    error::Result,
    message::{
        BusMessage, ElicitationRequest, ProgressEvent, SamplingRequest, ToolCallResultEvent,
        WithToolCall,
    },
    publisher::BusPublisher,
    pubsub::{PubSub, RejectCounter},
};

/// Whatever drives the conversation: a model for sampling, a person for
/// elicitation.
#[async_trait]
pub trait ConversationDriver: Send + Sync {
    /// Produce a completion. An error leaves the request unanswered.
    async fn sample(&self, session_id: &str, request: &SamplingRequest)
    -> Result<CreateMessageResult>;

    async fn elicit(&self, session_id: &str, request: &ElicitationRequest) -> Result<ElicitResult>;

    async fn on_progress(&self, _session_id: &str, _event: &ProgressEvent) {}

    async fn on_tool_call_result(&self, _session_id: &str, _event: &ToolCallResultEvent) {}
}

/// Which sessions a driver answers for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    Any,
    Only(String),
}

impl SessionFilter {
    fn admits(&self, session_id: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Only(id) => id == session_id,
        }
    }
}

/// A running driver bridge. Dropping it stops the listener.
pub struct DriverBridge {
    task: JoinHandle<()>,
    rejected: Arc<RejectCounter>,
}

impl DriverBridge {
    pub async fn start(
        bus: Arc<dyn PubSub>,
        filter: SessionFilter,
        driver: Arc<dyn ConversationDriver>,
    ) -> Result<Self> {
        let mut subscription = bus.subscribe(&Channel::DRIVER_INBOUND).await?;
        let rejected = subscription.rejected();
        let publisher = BusPublisher::new(bus);
        info!(filter = ?filter, "conversation driver bridge listening");

        let task = tokio::spawn(async move {
            while let Some(inbound) = subscription.recv().await {
                if !filter.admits(&inbound.session_id) {
                    debug!(session = %inbound.session_id, "ignoring message for other session");
                    continue;
                }
                let session_id = inbound.session_id;
                match inbound.message {
                    BusMessage::SamplingRequest(request) => {
                        let driver = Arc::clone(&driver);
                        let publisher = publisher.clone();
                        tokio::spawn(async move {
                            let answer = driver.sample(&session_id, &request).await.map(|result| {
                                BusMessage::SamplingResult(WithToolCall::new(
                                    request.tool_call_id.clone(),
                                    result,
                                ))
                            });
                            reply(&publisher, &session_id, &request.tool_call_id, answer).await;
                        });
                    },
                    BusMessage::ElicitationRequest(request) => {
                        let driver = Arc::clone(&driver);
                        let publisher = publisher.clone();
                        tokio::spawn(async move {
                            let answer = driver.elicit(&session_id, &request).await.map(|result| {
                                BusMessage::ElicitationResult(WithToolCall::new(
                                    request.tool_call_id.clone(),
                                    result,
                                ))
                            });
                            reply(&publisher, &session_id, &request.tool_call_id, answer).await;
                        });
                    },
                    BusMessage::Progress(event) => driver.on_progress(&session_id, &event).await,
                    BusMessage::ToolCallResult(event) => {
                        driver.on_tool_call_result(&session_id, &event).await;
                    },
                    other => {
                        debug!(channel = %other.channel(), "driver ignores channel");
                    },
                }
            }
            debug!("driver bridge subscription ended");
        });

        Ok(Self { task, rejected })
    }

    /// Bus messages discarded as malformed so far.
    pub fn rejected(&self) -> u64 {
        self.rejected.count()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for DriverBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reply(
    publisher: &BusPublisher,
    session_id: &str,
    tool_call_id: &str,
    answer: Result<BusMessage>,
) {
    match answer {
        Ok(message) => {
            if let Err(e) = publisher.publish(session_id, &message).await {
                warn!(session = %session_id, tool_call_id = %tool_call_id, error = %e, "could not deliver answer");
            }
        },
        Err(e) => {
            warn!(session = %session_id, tool_call_id = %tool_call_id, error = %e, "driver did not answer");
        },
    }
}
