//! Legacy HTTP+SSE transport.
//!
//! The client holds a GET event stream open. The server's first event,
//! `endpoint`, names the URL that client messages are POSTed to. Responses
//! and server requests all arrive on the stream.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures::{Stream, StreamExt},
    reqwest::{Client, header::HeaderMap},
    serde::Serialize,
    tokio::{sync::Mutex, task::JoinHandle},
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::{Error, McpTransportError, Result},
    event_stream::{EventStreamParser, SseEvent},
    http_transport::{header_map, status_error},
    inbound::{PendingRequests, dispatch},
    traits::{InboundHandler, McpTransport},
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

#[derive(Clone)]
struct EndpointPoster {
    client: Client,
    endpoint: Url,
    headers: HeaderMap,
    timeout: Duration,
}

impl EndpointPoster {
    async fn send(&self, method: &str, body: &impl Serialize) -> Result<()> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| {
                Error::external(format!("POST to '{}' for '{method}' failed", self.endpoint), e)
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(status_error(method, resp).await)
        }
    }
}

/// HTTP+SSE transport for servers predating streamable HTTP.
pub struct SseTransport {
    poster: EndpointPoster,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(
        url: &str,
        headers: &BTreeMap<String, String>,
        handler: Arc<dyn InboundHandler>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let base = Url::parse(url)?;
        let headers = header_map(headers)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::external("failed to build HTTP client", e))?;

        info!(url = %url, "opening MCP SSE stream");
        let resp = client
            .get(base.clone())
            .headers(headers.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::external(format!("GET '{url}' failed"), e))?;
        if !resp.status().is_success() {
            return Err(status_error("GET", resp).await);
        }

        let mut stream = Box::pin(resp.bytes_stream());
        let mut parser = EventStreamParser::default();
        let (endpoint, backlog) = Self::await_endpoint(&base, &mut stream, &mut parser).await?;
        debug!(endpoint = %endpoint, "MCP SSE endpoint announced");

        let poster = EndpointPoster {
            client,
            endpoint,
            headers,
            timeout: request_timeout,
        };
        let pending = Arc::new(PendingRequests::default());
        let closed = Arc::new(AtomicBool::new(false));

        let reader = {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let poster = poster.clone();
            tokio::spawn(async move {
                let route = |event: SseEvent| {
                    let poster = poster.clone();
                    let pending = Arc::clone(&pending);
                    let handler = Arc::clone(&handler);
                    async move {
                        if event.name() != "message" {
                            return;
                        }
                        dispatch(&event.data, &pending, &handler, move |response| async move {
                            poster.send("response", &response).await
                        })
                        .await;
                    }
                };

                for event in backlog {
                    route(event).await;
                }
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => {
                            for event in parser.push(&chunk) {
                                route(event).await;
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "MCP SSE stream broke off");
                            break;
                        },
                    }
                }
                debug!("MCP SSE stream ended");
                closed.store(true, Ordering::SeqCst);
                pending.fail_all();
            })
        };

        Ok(Arc::new(Self {
            poster,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            request_timeout,
            reader_handle: Mutex::new(Some(reader)),
        }))
    }

    /// Read until the `endpoint` event; events already parsed after it are
    /// returned so the reader can route them.
    async fn await_endpoint<S, B>(
        base: &Url,
        stream: &mut S,
        parser: &mut EventStreamParser,
    ) -> Result<(Url, Vec<SseEvent>)>
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::external("SSE stream broke off", e))?;
            let mut events = parser.push(chunk.as_ref()).into_iter();
            while let Some(event) = events.next() {
                if event.name() == "endpoint" {
                    let endpoint = base.join(event.data.trim())?;
                    return Ok((endpoint, events.collect()));
                }
            }
        }
        Err(McpTransportError::MissingEndpoint {
            url: base.to_string(),
        }
        .into())
    }

    pub fn endpoint(&self) -> &Url {
        &self.poster.endpoint
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
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
        let waiter = self.pending.register(&req.id);

        debug!(method = %method, id = %id, endpoint = %self.poster.endpoint, "SSE client -> server");
        self.poster.send(method, &req).await?;

        waiter.wait(method, self.request_timeout).await
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        debug!(method = %method, "SSE client -> server (notification)");
        self.poster
            .send(method, &JsonRpcNotification::new(method, params))
            .await
    }

    async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        self.pending.fail_all();
    }
}
