//! Validated description of one downstream MCP server.

use std::collections::BTreeMap;

use {
    serde::{Deserialize, Serialize},
    url::Url,
};

use crate::error::{Error, Result};

/// How the hub reaches a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Child process speaking newline-delimited JSON-RPC. The first element of
    /// `command` is the program, the rest its arguments.
    Stdio {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Legacy HTTP+SSE: GET an event stream, POST to the announced endpoint.
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// Streamable HTTP: every message is a POST to one endpoint.
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable_http",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl ServerConfig {
    pub fn stdio(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Stdio {
                command,
                env: BTreeMap::new(),
            },
        }
    }

    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::StreamableHttp {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportConfig::Sse {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.transport {
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                Some(url)
            },
            TransportConfig::Stdio { .. } => None,
        }
    }

    pub fn command(&self) -> Option<&[String]> {
        match &self.transport {
            TransportConfig::Stdio { command, .. } => Some(command),
            _ => None,
        }
    }

    /// `scheme://host[:port]` of a remote server; `None` for stdio or an
    /// unparsable url.
    pub fn origin(&self) -> Option<String> {
        let url = Url::parse(self.url()?).ok()?;
        let origin = url.origin();
        origin.is_tuple().then(|| origin.ascii_serialization())
    }

    /// Every problem with this config. Empty means valid.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.name.is_empty() {
            problems.push("name must not be empty".to_string());
        } else if self.name.contains('_') {
            // '_' separates server and tool in qualified names.
            problems.push(format!(
                "name '{}' must not contain '_'",
                self.name
            ));
        } else if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            problems.push(format!(
                "name '{}' may only contain ASCII letters, digits and '-'",
                self.name
            ));
        }

        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.first().is_none_or(|program| program.trim().is_empty()) {
                    problems.push("stdio command must name a program".to_string());
                }
            },
            TransportConfig::Sse { url, headers } | TransportConfig::StreamableHttp { url, headers } => {
                match Url::parse(url) {
                    Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {},
                    Ok(parsed) => problems.push(format!(
                        "url scheme '{}' is not http or https",
                        parsed.scheme()
                    )),
                    Err(e) => problems.push(format!("url '{url}' is invalid: {e}")),
                }
                for name in headers.keys() {
                    if reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err() {
                        problems.push(format!("header name '{name}' is invalid"));
                    }
                }
            },
        }

        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidConfig {
                name: self.name.clone(),
                problems,
            })
        }
    }
}
