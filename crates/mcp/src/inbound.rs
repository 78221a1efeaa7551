//! Response correlation and inbound routing shared by every transport.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use {
    serde_json::Value,
    tokio::sync::oneshot,
    tracing::{debug, error, warn},
};

use crate::{
    error::{Error, McpTransportError, Result},
    traits::InboundHandler,
    types::{IncomingMessage, JsonRpcResponse},
};

/// Outstanding requests of one transport, keyed by JSON-RPC id.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<JsonRpcResponse>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter. It unregisters itself when dropped, so an abandoned
    /// request leaves nothing behind.
    pub(crate) fn register(self: &Arc<Self>, id: &Value) -> PendingRequest {
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key.clone(), tx);
        PendingRequest {
            key,
            owner: Arc::clone(self),
            rx: Some(rx),
        }
    }

    /// Hand a response to its waiter. Returns false for unknown ids.
    pub(crate) fn resolve(&self, response: JsonRpcResponse) -> bool {
        let key = response.id.to_string();
        match self.lock().remove(&key) {
            Some(tx) => {
                let _ = tx.send(response);
                true
            },
            None => false,
        }
    }

    /// Drop every waiter; each sees the transport as closed.
    pub(crate) fn fail_all(&self) {
        self.lock().clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

pub(crate) struct PendingRequest {
    key: String,
    owner: Arc<PendingRequests>,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
}

impl PendingRequest {
    /// The response, if it has already arrived.
    pub(crate) fn try_take(&mut self) -> Option<JsonRpcResponse> {
        self.rx.as_mut()?.try_recv().ok()
    }

    pub(crate) async fn wait(mut self, method: &str, timeout: Duration) -> Result<JsonRpcResponse> {
        let Some(rx) = self.rx.take() else {
            return Err(McpTransportError::Closed.into());
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpTransportError::Closed.into()),
            Err(_) => Err(Error::Timeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.key);
    }
}

/// Route one raw frame read from a server.
///
/// Responses go to their waiter, notifications are handled inline so their
/// order is kept, and requests are answered from a spawned task through
/// `reply` so a slow relay never stalls the reader.
pub(crate) async fn dispatch<R, Fut>(
    raw: &str,
    pending: &PendingRequests,
    handler: &Arc<dyn InboundHandler>,
    reply: R,
) where
    R: FnOnce(JsonRpcResponse) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let message = match IncomingMessage::parse(raw) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, frame = %raw, "unparsable frame from MCP server");
            return;
        },
    };

    match message {
        IncomingMessage::Response(response) => {
            let id = response.id.clone();
            if !pending.resolve(response) {
                warn!(id = %id, "received response for unknown request id");
            }
        },
        IncomingMessage::Notification(notification) => {
            debug!(method = %notification.method, "MCP server notification");
            handler.handle_notification(notification).await;
        },
        IncomingMessage::Request(request) => {
            debug!(method = %request.method, id = %request.id, "MCP server request");
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                let method = request.method.clone();
                let response = handler.handle_request(request).await;
                if let Err(e) = reply(response).await {
                    warn!(method = %method, error = %e, "failed to answer MCP server request");
                }
            });
        },
    }
}
