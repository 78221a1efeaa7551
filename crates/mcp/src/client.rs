//! MCP client: manages the protocol handshake and tool interactions with a single MCP server.

use std::{
    sync::{Arc, Mutex as SyncMutex, PoisonError},
    time::Duration,
};

use {
    async_trait::async_trait,
    serde::{Serialize, de::DeserializeOwned},
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::{debug, error, info, trace, warn},
};

use crate::{
    error::{Context, Error, Result},
    http_transport::StreamableHttpTransport,
    server_config::{ServerConfig, TransportConfig},
    sse_transport::SseTransport,
    traits::{
        CallContext, ClientFactory, ElicitationHandler, HandlerResult, InboundHandler,
        McpClientTrait, McpTransport, ProgressHandler, SamplingHandler,
    },
    transport::StdioTransport,
    types::{
        ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcError,
        JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef, PROTOCOL_VERSION,
        ProgressNotificationParams, ToolsCallParams, ToolsCallResult, ToolsListResult, methods,
    },
};

/// State of an MCP client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpClientState {
    /// Never connected, or disposed.
    Disconnected,
    /// `initialize` completed, `initialized` notification sent.
    Ready,
    /// The server went away; the next use reconnects.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub client_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            client_name: "mcphub".into(),
        }
    }
}

fn read_slot<T: Clone>(slot: &SyncMutex<T>) -> T {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write_slot<T>(slot: &SyncMutex<T>, value: T) -> T {
    std::mem::replace(
        &mut *slot.lock().unwrap_or_else(PoisonError::into_inner),
        value,
    )
}

/// Answers what the server sends unprompted, attributing it to the tool call
/// in flight.
struct ClientRouter {
    server_name: String,
    current_call: SyncMutex<Option<CallContext>>,
    sampling: SyncMutex<Option<Arc<dyn SamplingHandler>>>,
    elicitation: SyncMutex<Option<Arc<dyn ElicitationHandler>>>,
    progress: SyncMutex<Option<Arc<dyn ProgressHandler>>>,
}

/// Restores the previous call context when dropped, including when the call
/// future is cancelled.
struct CallScope<'a> {
    router: &'a ClientRouter,
    previous: Option<CallContext>,
}

impl Drop for CallScope<'_> {
    fn drop(&mut self) {
        write_slot(&self.router.current_call, self.previous.take());
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> HandlerResult<T> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| {
        JsonRpcError::new(JsonRpcError::INVALID_PARAMS, format!("invalid params: {e}"))
    })
}

fn answer<T: Serialize>(id: Value, outcome: HandlerResult<T>) -> JsonRpcResponse {
    match outcome.and_then(|result| {
        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
    }) {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => JsonRpcResponse::failure(id, error),
    }
}

impl ClientRouter {
    fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            current_call: SyncMutex::new(None),
            sampling: SyncMutex::new(None),
            elicitation: SyncMutex::new(None),
            progress: SyncMutex::new(None),
        }
    }

    fn enter(&self, ctx: CallContext) -> CallScope<'_> {
        CallScope {
            router: self,
            previous: write_slot(&self.current_call, Some(ctx)),
        }
    }

    fn attribution(&self, method: &str) -> HandlerResult<CallContext> {
        read_slot(&self.current_call).ok_or_else(|| {
            error!(
                server = %self.server_name,
                method = %method,
                "server request arrived outside of any tool call"
            );
            JsonRpcError::new(JsonRpcError::INVALID_REQUEST, "no tool call in progress")
        })
    }

    fn unsupported(method: &str) -> JsonRpcError {
        JsonRpcError::new(
            JsonRpcError::METHOD_NOT_FOUND,
            format!("'{method}' is not supported by this client"),
        )
    }

    async fn create_message(&self, params: Option<Value>) -> HandlerResult<Value> {
        let method = methods::SAMPLING_CREATE_MESSAGE;
        let handler = read_slot(&self.sampling).ok_or_else(|| Self::unsupported(method))?;
        let ctx = self.attribution(method)?;
        let result = handler.create_message(&ctx, parse_params(params)?).await?;
        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
    }

    async fn elicit(&self, params: Option<Value>) -> HandlerResult<Value> {
        let method = methods::ELICITATION_CREATE;
        let handler = read_slot(&self.elicitation).ok_or_else(|| Self::unsupported(method))?;
        let ctx = self.attribution(method)?;
        let result = handler.elicit(&ctx, parse_params(params)?).await?;
        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
    }
}

#[async_trait]
impl InboundHandler for ClientRouter {
    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let outcome = match method.as_str() {
            methods::PING => Ok(json!({})),
            methods::SAMPLING_CREATE_MESSAGE => self.create_message(params).await,
            methods::ELICITATION_CREATE => self.elicit(params).await,
            other => {
                debug!(server = %self.server_name, method = %other, "unsupported server request");
                Err(Self::unsupported(other))
            },
        };
        answer(id, outcome)
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            methods::PROGRESS => {
                let params: ProgressNotificationParams = match parse_params(notification.params)
                {
                    Ok(params) => params,
                    Err(e) => {
                        warn!(server = %self.server_name, error = %e.message, "malformed progress notification");
                        return;
                    },
                };
                let Some(handler) = read_slot(&self.progress) else {
                    return;
                };
                let tool_call_id = match params.progress_token {
                    Value::String(token) => token,
                    other => other.to_string(),
                };
                let ctx = CallContext {
                    tool_call_id,
                    server_name: self.server_name.clone(),
                };
                handler.on_progress(&ctx, params.progress).await;
            },
            methods::LOG_MESSAGE => {
                debug!(server = %self.server_name, params = ?notification.params, "MCP server log");
            },
            other => {
                trace!(server = %self.server_name, method = %other, "ignored MCP notification");
            },
        }
    }
}

fn rpc_result(method: &str, resp: JsonRpcResponse) -> Result<Value> {
    if let Some(err) = resp.error {
        return Err(Error::Rpc {
            method: method.to_string(),
            code: err.code,
            message: err.message,
        });
    }
    resp.result
        .with_context(|| format!("MCP '{method}' returned no result"))
}

struct Session {
    transport: Arc<dyn McpTransport>,
    info: InitializeResult,
}

/// A lazily connecting MCP client for one server.
pub struct McpClient {
    config: ServerConfig,
    options: ClientOptions,
    router: Arc<ClientRouter>,
    /// Doubles as the connect lock: concurrent connects wait on it.
    session: Mutex<Option<Session>>,
    /// Serializes tool calls so server requests have one call to belong to.
    call_gate: Mutex<()>,
}

impl McpClient {
    pub fn new(config: ServerConfig, options: ClientOptions) -> Self {
        Self {
            router: Arc::new(ClientRouter::new(&config.name)),
            config,
            options,
            session: Mutex::new(None),
            call_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn state(&self) -> McpClientState {
        match self.session.lock().await.as_ref() {
            None => McpClientState::Disconnected,
            Some(session) if session.transport.is_alive().await => McpClientState::Ready,
            Some(_) => McpClientState::Closed,
        }
    }

    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.info.clone())
    }

    async fn open_transport(&self) -> Result<Arc<dyn McpTransport>> {
        let handler: Arc<dyn InboundHandler> = self.router.clone();
        let timeout = self.options.request_timeout;
        let transport: Arc<dyn McpTransport> = match &self.config.transport {
            TransportConfig::Stdio { command, env } => {
                StdioTransport::spawn(command, env, handler, timeout).await?
            },
            TransportConfig::Sse { url, headers } => {
                SseTransport::connect(url, headers, handler, timeout).await?
            },
            TransportConfig::StreamableHttp { url, headers } => {
                StreamableHttpTransport::new(url, headers, handler, timeout)?
            },
        };
        Ok(transport)
    }

    async fn initialize(&self, transport: &Arc<dyn McpTransport>) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::relaying(),
            client_info: ClientInfo {
                name: self.options.client_name.clone(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let resp = transport
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult =
            serde_json::from_value(rpc_result(methods::INITIALIZE, resp)?)?;

        info!(
            server = %self.config.name,
            protocol = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );

        transport.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    async fn open(&self) -> Result<Session> {
        info!(
            server = %self.config.name,
            transport = self.config.transport.kind(),
            "connecting to MCP server"
        );
        let transport = self.open_transport().await?;
        match self.initialize(&transport).await {
            Ok(info) => Ok(Session { transport, info }),
            Err(e) => {
                warn!(server = %self.config.name, error = %e, "MCP initialize handshake failed");
                transport.kill().await;
                Err(e)
            },
        }
    }

    /// The live transport, connecting (or reconnecting) first if needed.
    async fn ready_transport(&self) -> Result<Arc<dyn McpTransport>> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            if current.transport.is_alive().await {
                return Ok(Arc::clone(&current.transport));
            }
            info!(server = %self.config.name, "MCP transport closed, reconnecting");
            current.transport.kill().await;
        }
        *session = None;

        let timeout = self.options.connect_timeout;
        let fresh = tokio::time::timeout(timeout, self.open())
            .await
            .map_err(|_| Error::ConnectTimeout {
                server: self.config.name.clone(),
                timeout,
            })??;
        let transport = Arc::clone(&fresh.transport);
        *session = Some(fresh);
        Ok(transport)
    }
}

#[async_trait]
impl McpClientTrait for McpClient {
    fn server_name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self) -> Result<()> {
        self.ready_transport().await.map(|_| ())
    }

    async fn is_connected(&self) -> bool {
        self.state().await == McpClientState::Ready
    }

    async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        let transport = self.ready_transport().await?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let resp = transport.request(methods::TOOLS_LIST, params).await?;
            let page: ToolsListResult =
                serde_json::from_value(rpc_result(methods::TOOLS_LIST, resp)?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(
            server = %self.config.name,
            count = tools.len(),
            "fetched MCP tools"
        );
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        ctx: CallContext,
    ) -> Result<ToolsCallResult> {
        let _gate = self.call_gate.lock().await;
        let transport = self.ready_transport().await?;

        let params = ToolsCallParams {
            name: name.into(),
            arguments,
            meta: Some(json!({ "progressToken": ctx.tool_call_id })),
        };
        debug!(
            server = %self.config.name,
            tool = %name,
            tool_call_id = %ctx.tool_call_id,
            "calling MCP tool"
        );

        let _scope = self.router.enter(ctx);
        let resp = transport
            .request(methods::TOOLS_CALL, Some(serde_json::to_value(&params)?))
            .await?;
        Ok(serde_json::from_value(rpc_result(methods::TOOLS_CALL, resp)?)?)
    }

    fn current_call(&self) -> Option<CallContext> {
        read_slot(&self.router.current_call)
    }

    fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        write_slot(&self.router.sampling, Some(handler));
    }

    fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        write_slot(&self.router.elicitation, Some(handler));
    }

    fn set_progress_handler(&self, handler: Arc<dyn ProgressHandler>) {
        write_slot(&self.router.progress, Some(handler));
    }

    async fn dispose(&self) {
        if let Some(session) = self.session.lock().await.take() {
            debug!(server = %self.config.name, "closing MCP connection");
            session.transport.kill().await;
        }
    }
}

/// Builds [`McpClient`]s sharing one set of options.
#[derive(Debug, Clone, Default)]
pub struct DefaultClientFactory {
    options: ClientOptions,
}

impl DefaultClientFactory {
    pub fn new(options: ClientOptions) -> Self {
        Self { options }
    }
}

impl ClientFactory for DefaultClientFactory {
    fn create(&self, config: &ServerConfig) -> Arc<dyn McpClientTrait> {
        Arc::new(McpClient::new(config.clone(), self.options.clone()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{ElicitAction, ElicitParams, ElicitResult, Progress},
        tokio::sync::mpsc,
    };

    const INIT_REPLY: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"sh-fixture"}}}"#;

    fn ctx(id: &str) -> CallContext {
        CallContext {
            tool_call_id: id.into(),
            server_name: "fixture".into(),
        }
    }

    /// A stdio "server" scripted in sh: answers initialize, swallows the
    /// initialized notification, then runs `rest`.
    fn scripted(rest: &str) -> ServerConfig {
        let script = format!("read l; echo '{INIT_REPLY}'; read l; {rest}");
        ServerConfig::stdio("fixture", vec!["sh".into(), "-c".into(), script])
    }

    struct Decline {
        seen: mpsc::UnboundedSender<CallContext>,
    }

    #[async_trait]
    impl ElicitationHandler for Decline {
        async fn elicit(&self, ctx: &CallContext, params: ElicitParams) -> HandlerResult<ElicitResult> {
            assert_eq!(params.message, "proceed?");
            let _ = self.seen.send(ctx.clone());
            Ok(ElicitResult::decline())
        }
    }

    struct Progressed {
        seen: mpsc::UnboundedSender<(CallContext, Progress)>,
    }

    #[async_trait]
    impl ProgressHandler for Progressed {
        async fn on_progress(&self, ctx: &CallContext, progress: Progress) {
            let _ = self.seen.send((ctx.clone(), progress));
        }
    }

    #[test]
    fn test_client_state_debug() {
        assert_eq!(format!("{:?}", McpClientState::Disconnected), "Disconnected");
        assert_eq!(format!("{:?}", McpClientState::Ready), "Ready");
        assert_eq!(format!("{:?}", McpClientState::Closed), "Closed");
    }

    #[test]
    fn call_scope_restores_previous_context() {
        let router = ClientRouter::new("fixture");
        {
            let _outer = router.enter(ctx("outer"));
            {
                let _inner = router.enter(ctx("inner"));
                assert_eq!(read_slot(&router.current_call), Some(ctx("inner")));
            }
            assert_eq!(read_slot(&router.current_call), Some(ctx("outer")));
        }
        assert_eq!(read_slot(&router.current_call), None);
    }

    #[tokio::test]
    async fn request_outside_a_call_is_refused() {
        let router = ClientRouter::new("fixture");
        let (tx, _rx) = mpsc::unbounded_channel();
        *router.elicitation.lock().unwrap() = Some(Arc::new(Decline { seen: tx }));

        let resp = router
            .handle_request(JsonRpcRequest::new(
                9,
                methods::ELICITATION_CREATE,
                Some(json!({"message": "proceed?", "requestedSchema": {}})),
            ))
            .await;
        assert_eq!(resp.error.unwrap().code, JsonRpcError::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn ping_and_unknown_methods() {
        let router = ClientRouter::new("fixture");
        let pong = router
            .handle_request(JsonRpcRequest::new(1, methods::PING, None))
            .await;
        assert_eq!(pong.result, Some(json!({})));

        let unknown = router
            .handle_request(JsonRpcRequest::new(2, "roots/list", None))
            .await;
        assert_eq!(unknown.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);

        // No sampling handler registered.
        let _scope = router.enter(ctx("c1"));
        let sampling = router
            .handle_request(JsonRpcRequest::new(3, methods::SAMPLING_CREATE_MESSAGE, None))
            .await;
        assert_eq!(sampling.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn progress_is_routed_by_token() {
        let router = ClientRouter::new("fixture");
        let (tx, mut rx) = mpsc::unbounded_channel();
        *router.progress.lock().unwrap() = Some(Arc::new(Progressed { seen: tx }));

        router
            .handle_notification(JsonRpcNotification::new(
                methods::PROGRESS,
                Some(json!({"progressToken": "call-7", "progress": 2, "total": 4})),
            ))
            .await;

        let (ctx, progress) = rx.recv().await.unwrap();
        assert_eq!(ctx.tool_call_id, "call-7");
        assert_eq!(progress.total, Some(4.0));
    }

    #[tokio::test]
    async fn connect_and_list_tools() {
        let client = McpClient::new(
            scripted(
                r#"read l; echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}'; sleep 5"#,
            ),
            ClientOptions::default(),
        );
        assert_eq!(client.state().await, McpClientState::Disconnected);

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert!(client.is_connected().await);
        assert_eq!(client.server_info().await.unwrap().server_info.name, "sh-fixture");

        client.dispose().await;
        assert_eq!(client.state().await, McpClientState::Disconnected);
    }

    #[tokio::test]
    async fn concurrent_connects_spawn_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let mut config = scripted("sleep 5");
        if let TransportConfig::Stdio { command, env } = &mut config.transport {
            command[2] = format!("echo x >> \"$MARKER\"; {}", command[2]);
            env.insert("MARKER".into(), marker.display().to_string());
        }
        let client = McpClient::new(config, ClientOptions::default());

        let (a, b) = tokio::join!(client.connect(), client.connect());
        a.unwrap();
        b.unwrap();
        client.connect().await.unwrap();

        let spawns = std::fs::read_to_string(&marker).unwrap();
        assert_eq!(spawns.lines().count(), 1);
        client.dispose().await;
    }

    #[tokio::test]
    async fn elicitation_during_call_is_attributed() {
        // Issues an elicitation mid-call and reports what the client answered.
        let rest = r#"read l
echo '{"jsonrpc":"2.0","id":"srv-1","method":"elicitation/create","params":{"message":"proceed?","requestedSchema":{}}}'
read reply
case "$reply" in
  *decline*) text=declined ;;
  *) text=other ;;
esac
echo "{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"$text\"}]}}"
sleep 5"#;
        let client = McpClient::new(scripted(rest), ClientOptions::default());
        let (tx, mut seen) = mpsc::unbounded_channel();
        client.set_elicitation_handler(Arc::new(Decline { seen: tx }));

        let result = client
            .call_tool("confirm", json!({}), ctx("call-1"))
            .await
            .unwrap();
        assert_eq!(result.text(), "declined");
        assert_eq!(seen.recv().await.unwrap(), ctx("call-1"));
        assert_eq!(client.current_call(), None);
        assert_eq!(ElicitResult::decline().action, ElicitAction::Decline);
        client.dispose().await;
    }

    #[tokio::test]
    async fn remote_error_is_typed() {
        let client = McpClient::new(
            scripted(
                r#"read l; echo '{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"unknown tool"}}'; sleep 5"#,
            ),
            ClientOptions::default(),
        );
        let err = client
            .call_tool("nope", json!({}), ctx("call-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc { code: -32602, .. }));
        assert!(!err.is_connection());
        client.dispose().await;
    }

    #[tokio::test]
    async fn silent_server_times_out_connecting() {
        let client = McpClient::new(
            ServerConfig::stdio("mute", vec!["sh".into(), "-c".into(), "sleep 5".into()]),
            ClientOptions {
                connect_timeout: Duration::from_millis(100),
                ..ClientOptions::default()
            },
        );
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, Error::ConnectTimeout { .. }));
        assert_eq!(client.state().await, McpClientState::Disconnected);
    }

    #[test]
    fn factory_builds_named_clients() {
        let factory = DefaultClientFactory::default();
        let client = factory.create(&ServerConfig::stdio("local", vec!["cat".into()]));
        assert_eq!(client.server_name(), "local");
    }
}
