use std::time::Duration;

use crate::tool_call::StateError;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    State,
    Connection,
    Delivery,
    Timeout,
    Cancelled,
    Protocol,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    #[error(transparent)]
    State(#[from] StateError),
    #[error("MCP server '{server}' is unreachable: {source}")]
    Connection {
        server: String,
        #[source]
        source: mcphub_mcp::Error,
    },
    #[error("delivery failed: {source}")]
    Delivery {
        #[from]
        source: mcphub_bus::Error,
    },
    #[error("{what} timed out after {}ms", timeout.as_millis())]
    Timeout { what: String, timeout: Duration },
    #[error("{what} was cancelled")]
    Cancelled { what: String },
    #[error("MCP server '{server}' failed the request: {source}")]
    Protocol {
        server: String,
        #[source]
        source: mcphub_mcp::Error,
    },
    #[error("hub for session '{session_id}' is disposed")]
    Disposed { session_id: String },
}

impl HubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidInput { .. } | Self::State(StateError::EmptyId) => ErrorKind::InvalidInput,
            Self::State(_) | Self::Disposed { .. } => ErrorKind::State,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Delivery { .. } => ErrorKind::Delivery,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Protocol { .. } => ErrorKind::Protocol,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Classify a client failure against `server`.
    pub fn from_mcp(server: &str, source: mcphub_mcp::Error) -> Self {
        if let mcphub_mcp::Error::Timeout { method, timeout } = &source {
            return Self::Timeout {
                what: format!("'{method}' on MCP server '{server}'"),
                timeout: *timeout,
            };
        }
        if source.is_connection() {
            Self::Connection {
                server: server.to_string(),
                source,
            }
        } else {
            Self::Protocol {
                server: server.to_string(),
                source,
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, mcphub_mcp::McpTransportError};

    #[test]
    fn mcp_failures_are_classified() {
        let closed = HubError::from_mcp("fixture", McpTransportError::Closed.into());
        assert_eq!(closed.kind(), ErrorKind::Connection);

        let status = |status| {
            HubError::from_mcp(
                "fixture",
                McpTransportError::HttpStatus {
                    method: "tools/call".into(),
                    status,
                    body: "boom".into(),
                }
                .into(),
            )
        };
        assert_eq!(status(500).kind(), ErrorKind::Protocol);
        assert_eq!(status(404).kind(), ErrorKind::Connection);

        let rpc = HubError::from_mcp("fixture", mcphub_mcp::Error::Rpc {
            method: "tools/call".into(),
            code: -32602,
            message: "unknown tool".into(),
        });
        assert_eq!(rpc.kind(), ErrorKind::Protocol);
        assert!(rpc.to_string().contains("unknown tool"));

        let slow = HubError::from_mcp("fixture", mcphub_mcp::Error::Timeout {
            method: "tools/call".into(),
            timeout: Duration::from_secs(300),
        });
        assert_eq!(slow.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn unknown_calls_are_state_errors() {
        let unknown = HubError::from(StateError::UnknownCall("c1".into()));
        let dup = HubError::from(StateError::DuplicateId("c1".into()));
        assert_eq!(unknown.kind(), ErrorKind::State);
        assert_eq!(dup.kind(), ErrorKind::State);
        assert!(matches!(unknown, HubError::State(StateError::UnknownCall(_))));
        assert_eq!(unknown.to_string(), "unknown tool call 'c1'");

        let empty = HubError::from(StateError::EmptyId);
        assert_eq!(empty.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn bus_failures_are_delivery_errors() {
        let err = HubError::from(mcphub_bus::Error::NoSubscribers {
            channel: mcphub_bus::Channel::ElicitationRequest,
        });
        assert_eq!(err.kind(), ErrorKind::Delivery);
        assert_eq!(
            err.to_string(),
            "delivery failed: no subscriber on mcp:elicitation:request"
        );
    }
}
