use {
    async_trait::async_trait,
    mcphub_bus::{ElicitationRequest, ProgressEvent, SamplingRequest, ToolCallResultEvent},
};

use crate::error::Result;

/// Where a hub announces what the conversation driver must see. The bus
/// implementation lives in `bridge`; tests record instead.
#[async_trait]
pub trait HubEventSink: Send + Sync {
    async fn sampling_request(&self, session_id: &str, request: SamplingRequest) -> Result<()>;

    async fn elicitation_request(&self, session_id: &str, request: ElicitationRequest)
    -> Result<()>;

    async fn tool_call_result(&self, session_id: &str, event: ToolCallResultEvent) -> Result<()>;

    async fn progress(&self, session_id: &str, event: ProgressEvent) -> Result<()>;
}
