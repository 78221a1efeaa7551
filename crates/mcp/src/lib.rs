//! MCP (Model Context Protocol) client support for mcphub.
//!
//! This crate provides:
//! - JSON-RPC 2.0 and MCP payload types (`types`)
//! - stdio, streamable HTTP and legacy HTTP+SSE transports
//! - a lazily connecting client that relays server-initiated sampling and
//!   elicitation requests to pluggable handlers (`client`)
//! - validated server configs (`server_config`)

pub mod client;
pub mod error;
mod event_stream;
pub mod http_transport;
mod inbound;
pub mod server_config;
pub mod sse_transport;
pub mod traits;
pub mod transport;
pub mod types;

pub use {
    client::{ClientOptions, DefaultClientFactory, McpClient, McpClientState},
    error::{Error, McpTransportError, Result},
    server_config::{ServerConfig, TransportConfig},
    traits::{
        CallContext, ClientFactory, ElicitationHandler, HandlerResult, InboundHandler,
        McpClientTrait, McpTransport, ProgressHandler, SamplingHandler,
    },
};
