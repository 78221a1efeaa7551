use std::{error::Error as StdError, time::Duration};

use mcphub_common::FromMessage;

/// Failures of the underlying connection, as opposed to protocol-level errors.
#[derive(Debug, thiserror::Error)]
pub enum McpTransportError {
    #[error("failed to spawn MCP server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MCP transport closed")]
    Closed,
    #[error("MCP server returned HTTP {status} for '{method}': {body}")]
    HttpStatus {
        method: String,
        status: u16,
        body: String,
    },
    #[error("MCP server at {url} sent no endpoint event")]
    MissingEndpoint { url: String },
}

impl McpTransportError {
    /// A 404 means the server dropped our MCP session; gateway statuses mean
    /// the server is not reachable. Any other status is the server refusing
    /// this one request.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => matches!(status, 404 | 502 | 503 | 504),
            _ => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    #[error(transparent)]
    Transport(#[from] McpTransportError),
    #[error("MCP error on '{method}': code={code} message={message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("MCP request '{method}' timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },
    #[error("connecting to MCP server '{server}' timed out after {}ms", timeout.as_millis())]
    ConnectTimeout { server: String, timeout: Duration },
    #[error("invalid server config '{name}': {}", problems.join("; "))]
    InvalidConfig { name: String, problems: Vec<String> },
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True when the connection itself is unusable and the client should be
    /// discarded rather than retried on the same transport.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Io(_) | Self::Reqwest(_) | Self::ConnectTimeout { .. } => true,
            Self::Transport(e) => e.is_connection(),
            Self::External { source, .. } => {
                source.is::<reqwest::Error>() || source.is::<std::io::Error>()
            },
            _ => false,
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

mcphub_common::impl_context!();
