//! Streamable HTTP transport for remote MCP servers.
//!
//! Every client message is a POST to one endpoint. The server answers with
//! either a JSON body or an event stream that may interleave its own requests
//! (sampling, elicitation) and notifications before the response.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::StreamExt,
    reqwest::{
        Client, StatusCode,
        header::{HeaderMap, HeaderName, HeaderValue},
    },
    serde::Serialize,
    tokio::sync::RwLock,
    tracing::{debug, warn},
};

use crate::{
    error::{Error, McpTransportError, Result},
    event_stream::EventStreamParser,
    inbound::{PendingRequests, dispatch},
    traits::{InboundHandler, McpTransport},
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION},
};

const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const STREAMABLE_ACCEPT_HEADER: &str = "application/json, text/event-stream";

/// Convert configured header pairs, rejecting names or values HTTP cannot carry.
pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::external(format!("invalid header name '{name}'"), e))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::external(format!("invalid value for header '{name}'"), e))?;
        map.insert(name, value);
    }
    Ok(map)
}

pub(crate) fn response_is_event_stream(resp: &reqwest::Response) -> bool {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| {
            ct.split(';')
                .next()
                .is_some_and(|base| base.trim() == "text/event-stream")
        })
}

pub(crate) async fn status_error(method: &str, resp: reqwest::Response) -> Error {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    McpTransportError::HttpStatus {
        method: method.to_string(),
        status,
        body,
    }
    .into()
}

/// The POST side of the transport, cloned into reply tasks.
#[derive(Clone)]
struct Poster {
    client: Client,
    url: String,
    headers: HeaderMap,
    session_id: Arc<RwLock<Option<String>>>,
}

impl Poster {
    async fn post(&self, method: &str, body: &impl Serialize) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header("Content-Type", "application/json")
            .header("Accept", STREAMABLE_ACCEPT_HEADER)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);

        if let Some(session_id) = self.session_id.read().await.clone() {
            req = req.header(MCP_SESSION_ID_HEADER, session_id);
        }

        let resp = req.json(body).send().await.map_err(|e| {
            Error::external(format!("POST to '{}' for '{method}' failed", self.url), e)
        })?;
        self.store_session_id_from_response(&resp).await;
        Ok(resp)
    }

    async fn store_session_id_from_response(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|raw| raw.to_str().ok())
            .filter(|id| !id.trim().is_empty())
        else {
            return;
        };

        let mut slot = self.session_id.write().await;
        if slot.as_deref() != Some(session_id) {
            debug!(
                url = %self.url,
                session_id = %session_id,
                "updated MCP streamable HTTP session id"
            );
            *slot = Some(session_id.to_string());
        }
    }
}

/// Streamable HTTP transport for a remote MCP server.
pub struct StreamableHttpTransport {
    poster: Poster,
    next_id: AtomicU64,
    handler: Arc<dyn InboundHandler>,
    /// Correlates responses carried on event streams.
    pending: Arc<PendingRequests>,
    closed: AtomicBool,
    request_timeout: Duration,
}

impl StreamableHttpTransport {
    pub fn new(
        url: &str,
        headers: &BTreeMap<String, String>,
        handler: Arc<dyn InboundHandler>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::external("failed to build HTTP client", e))?;

        Ok(Arc::new(Self {
            poster: Poster {
                client,
                url: url.to_string(),
                headers: header_map(headers)?,
                session_id: Arc::new(RwLock::new(None)),
            },
            next_id: AtomicU64::new(1),
            handler,
            pending: Arc::new(PendingRequests::default()),
            closed: AtomicBool::new(false),
            request_timeout,
        }))
    }

    pub async fn session_id(&self) -> Option<String> {
        self.poster.session_id.read().await.clone()
    }

    async fn exchange(&self, method: &str, req: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let mut waiter = self.pending.register(&req.id);
        let http_resp = self.poster.post(method, req).await?;

        if http_resp.status() == StatusCode::NOT_FOUND && self.session_id().await.is_some() {
            // The server forgot our session; only a fresh handshake helps.
            warn!(url = %self.poster.url, method = %method, "MCP session expired");
            self.closed.store(true, Ordering::SeqCst);
            return Err(McpTransportError::Closed.into());
        }
        if !http_resp.status().is_success() {
            return Err(status_error(method, http_resp).await);
        }

        if !response_is_event_stream(&http_resp) {
            return http_resp.json().await.map_err(|e| {
                Error::external(format!("failed to parse JSON-RPC response for '{method}'"), e)
            });
        }

        let mut stream = Box::pin(http_resp.bytes_stream());
        let mut parser = EventStreamParser::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                Error::external(format!("event stream for '{method}' broke off"), e)
            })?;
            for event in parser.push(&chunk) {
                self.route(&event.data, event.name()).await;
            }
            if let Some(resp) = waiter.try_take() {
                return Ok(resp);
            }
        }
        if let Some(event) = parser.finish() {
            self.route(&event.data, event.name()).await;
        }
        waiter.try_take().ok_or_else(|| {
            debug!(method = %method, "event stream ended without a response");
            McpTransportError::Closed.into()
        })
    }

    async fn route(&self, data: &str, event: &str) {
        if event != "message" {
            debug!(event = %event, "ignoring non-message SSE event");
            return;
        }
        let poster = self.poster.clone();
        dispatch(data, &self.pending, &self.handler, move |response| async move {
            let resp = poster.post("response", &response).await?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(status_error("response", resp).await)
            }
        })
        .await;
    }
}

#[async_trait::async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpTransportError::Closed.into());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);

        debug!(method = %method, id = %id, url = %self.poster.url, "HTTP client -> server");

        tokio::time::timeout(self.request_timeout, self.exchange(method, &req))
            .await
            .map_err(|_| Error::Timeout {
                method: method.to_string(),
                timeout: self.request_timeout,
            })?
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        debug!(method = %method, url = %self.poster.url, "HTTP client -> server (notification)");

        let http_resp = self
            .poster
            .post(method, &JsonRpcNotification::new(method, params))
            .await?;

        if !http_resp.status().is_success() {
            let status = http_resp.status();
            warn!(method = %method, %status, "notification returned non-success");
        }

        Ok(())
    }

    async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.fail_all();

        let Some(session_id) = self.poster.session_id.write().await.take() else {
            return;
        };

        let req = self
            .poster
            .client
            .delete(&self.poster.url)
            .timeout(Duration::from_secs(5))
            .headers(self.poster.headers.clone())
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .header(MCP_SESSION_ID_HEADER, session_id);

        if let Err(e) = req.send().await {
            warn!(url = %self.poster.url, error = %e, "failed to close MCP streamable HTTP session");
        }
    }
}
