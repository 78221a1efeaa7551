//! Trait seams of the MCP layer.
//!
//! Transports move JSON-RPC frames, the client router answers what servers
//! send unprompted, and the hub plugs its relay logic in through the handler
//! traits. `McpClientTrait` + `ClientFactory` let the hub run against fakes.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value};

use crate::{
    error::Result,
    server_config::ServerConfig,
    types::{
        CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult, JsonRpcError,
        JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef, Progress,
        ToolsCallResult,
    },
};

/// Transport layer for MCP communication (JSON-RPC).
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the matching response. Remote
    /// JSON-RPC errors come back inside the response, not as `Err`.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Whether the connection can still carry requests.
    async fn is_alive(&self) -> bool;

    /// Close the connection and fail every outstanding request.
    async fn kill(&self);
}

/// Receives what a server sends without being asked: requests it expects an
/// answer to and notifications.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse;

    async fn handle_notification(&self, notification: JsonRpcNotification);
}

/// The tool call a server-initiated request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub tool_call_id: String,
    pub server_name: String,
}

/// Outcome of a relayed request. The error is sent back to the server verbatim.
pub type HandlerResult<T> = std::result::Result<T, JsonRpcError>;

#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(
        &self,
        ctx: &CallContext,
        params: CreateMessageParams,
    ) -> HandlerResult<CreateMessageResult>;
}

#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, ctx: &CallContext, params: ElicitParams) -> HandlerResult<ElicitResult>;
}

#[async_trait]
pub trait ProgressHandler: Send + Sync {
    async fn on_progress(&self, ctx: &CallContext, progress: Progress);
}

/// Client-level abstraction for one MCP server connection.
#[async_trait]
pub trait McpClientTrait: Send + Sync {
    fn server_name(&self) -> &str;

    /// Connect and handshake. Idempotent; reconnects a closed transport.
    async fn connect(&self) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Every tool the server exposes, connecting first if needed.
    async fn list_tools(&self) -> Result<Vec<McpToolDef>>;

    /// Call a tool, attributing server requests made meanwhile to `ctx`.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: CallContext,
    ) -> Result<ToolsCallResult>;

    fn current_call(&self) -> Option<CallContext>;

    fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>);

    fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>);

    fn set_progress_handler(&self, handler: Arc<dyn ProgressHandler>);

    /// Close the connection. The client may be connected again afterwards.
    async fn dispose(&self);
}

/// Builds unconnected clients for server configs.
pub trait ClientFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Arc<dyn McpClientTrait>;
}
