//! Per-session MCP hub.
//!
//! A [`HubService`] owns one client per configured server, lists their tools
//! as `<server>_<tool>`, runs calls through the [`ToolCallAggregate`] state
//! machine and relays sampling and elicitation requests over the bus.
//! [`HubProvider`] caches hubs per session and rebuilds them when a scope's
//! server configs change.

pub mod bridge;
pub mod cache;
pub mod config_service;
pub mod error;
pub mod events;
pub mod hub;
pub mod provider;
pub mod qualified;
pub mod registry;
pub mod tool_call;
pub mod trust;

#[cfg(test)]
mod testing;

pub use {
    bridge::BusEventSink,
    cache::{HubCache, SessionCache},
    config_service::{
        MemoryConfigStore, ServerConfigService, ServerConfigStore, StoredServerConfig,
    },
    error::{ErrorKind, HubError, Result},
    events::HubEventSink,
    hub::{CallToolParams, HubOptions, HubService},
    provider::HubProvider,
    registry::{CacheKeyRegistry, ScopeKey},
    tool_call::{StateError, ToolCall, ToolCallAggregate, ToolCallState},
    trust::TrustPolicy,
};
