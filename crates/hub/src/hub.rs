//! The per-session hub: owns one MCP client per configured server, exposes
//! their tools under qualified names and relays what servers ask for during a
//! call to the conversation driver.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::future::{join_all, try_join_all},
    mcphub_bus::{ElicitationResult, SamplingResult, WithToolCall},
    mcphub_common::Dispose,
    mcphub_mcp::{
        CallContext, ClientFactory, ElicitationHandler, HandlerResult, McpClientTrait,
        ProgressHandler, SamplingHandler, ServerConfig,
        types::{
            CreateMessageParams, CreateMessageResult, ElicitParams, ElicitResult, JsonRpcError,
            McpToolDef, Progress, ToolsCallResult,
        },
    },
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tokio::{
        sync::{RwLock, oneshot},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{ErrorKind, HubError, Result},
    events::HubEventSink,
    qualified,
    tool_call::{DEFAULT_RETENTION, StateError, ToolCall, ToolCallAggregate, ToolCallState},
    trust::TrustPolicy,
};

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// How long a sampling or elicitation round trip may take.
    pub round_trip_timeout: Duration,
    /// Finished tool calls kept for inspection.
    pub retention: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            round_trip_timeout: Duration::from_secs(60),
            retention: DEFAULT_RETENTION,
        }
    }
}

/// A tool invocation addressed by qualified name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl CallToolParams {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lets a relay fail the tool call it belongs to.
#[derive(Default)]
struct CallGuard {
    abort: CancellationToken,
    failure: Mutex<Option<HubError>>,
}

impl CallGuard {
    /// The first reason wins.
    fn abort(&self, reason: HubError) {
        lock(&self.failure).get_or_insert(reason);
        self.abort.cancel();
    }

    fn take_failure(&self) -> Option<HubError> {
        lock(&self.failure).take()
    }
}

#[derive(Debug, Clone, Copy)]
enum RelayKind {
    Sampling,
    Elicitation,
}

impl RelayKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sampling => "sampling",
            Self::Elicitation => "elicitation",
        }
    }
}

type Waiters<T> = Mutex<HashMap<String, oneshot::Sender<T>>>;

fn rpc_error(error: &HubError) -> JsonRpcError {
    JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, error.to_string())
}

pub struct HubService {
    session_id: String,
    servers: BTreeMap<String, ServerConfig>,
    factory: Arc<dyn ClientFactory>,
    clients: RwLock<HashMap<String, Arc<dyn McpClientTrait>>>,
    calls: Mutex<ToolCallAggregate>,
    in_flight: Mutex<HashMap<String, Arc<CallGuard>>>,
    sampling_waiters: Waiters<CreateMessageResult>,
    elicitation_waiters: Waiters<ElicitResult>,
    sink: Arc<dyn HubEventSink>,
    trust: TrustPolicy,
    options: HubOptions,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    this: Weak<HubService>,
}

impl HubService {
    pub fn new(
        session_id: impl Into<String>,
        servers: impl IntoIterator<Item = ServerConfig>,
        factory: Arc<dyn ClientFactory>,
        sink: Arc<dyn HubEventSink>,
        trust: TrustPolicy,
        options: HubOptions,
    ) -> Arc<Self> {
        let servers = servers
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();
        let calls = ToolCallAggregate::new(options.retention);
        Arc::new_cyclic(|this| Self {
            session_id: session_id.into(),
            servers,
            factory,
            clients: RwLock::new(HashMap::new()),
            calls: Mutex::new(calls),
            in_flight: Mutex::new(HashMap::new()),
            sampling_waiters: Mutex::new(HashMap::new()),
            elicitation_waiters: Mutex::new(HashMap::new()),
            sink,
            trust,
            options,
            listener: Mutex::new(None),
            disposed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    pub fn tool_call(&self, id: &str) -> Option<ToolCall> {
        lock(&self.calls).get(id).cloned()
    }

    pub fn tool_call_state(&self, id: &str) -> Option<ToolCallState> {
        lock(&self.calls).state(id)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Hand over the task that feeds inbound results into this hub. It is
    /// aborted on dispose.
    pub fn attach_listener(&self, listener: JoinHandle<()>) {
        if self.is_disposed() {
            listener.abort();
            return;
        }
        if let Some(previous) = lock(&self.listener).replace(listener) {
            previous.abort();
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(HubError::Disposed {
                session_id: self.session_id.clone(),
            });
        }
        Ok(())
    }

    // ── Clients ─────────────────────────────────────────────────────

    fn create_client(&self, config: &ServerConfig) -> Arc<dyn McpClientTrait> {
        debug!(session = %self.session_id, server = %config.name, transport = config.transport.kind(), "creating MCP client");
        let client = self.factory.create(config);
        let relay = Arc::new(Relay {
            hub: self.this.clone(),
        });
        client.set_sampling_handler(relay.clone());
        client.set_elicitation_handler(relay.clone());
        client.set_progress_handler(relay);
        client
    }

    async fn client_for(&self, server: &str) -> Result<(Arc<dyn McpClientTrait>, &ServerConfig)> {
        self.ensure_live()?;
        let config = self
            .servers
            .get(server)
            .ok_or_else(|| HubError::not_found(format!("MCP server '{server}'")))?;

        let existing = self.clients.read().await.get(server).cloned();
        let client = match existing {
            Some(client) => client,
            None => {
                let mut clients = self.clients.write().await;
                Arc::clone(
                    clients
                        .entry(server.to_string())
                        .or_insert_with(|| self.create_client(config)),
                )
            },
        };

        if let Err(e) = client.connect().await {
            return Err(self.client_failed(server, &client, e).await);
        }
        Ok((client, config))
    }

    /// Classify a client failure and evict the client when its connection is
    /// gone, so the next use starts over.
    async fn client_failed(
        &self,
        server: &str,
        client: &Arc<dyn McpClientTrait>,
        error: mcphub_mcp::Error,
    ) -> HubError {
        let error = HubError::from_mcp(server, error);
        if error.kind() != ErrorKind::Connection {
            return error;
        }
        let evicted = {
            let mut clients = self.clients.write().await;
            match clients.get(server) {
                Some(current) if Arc::ptr_eq(current, client) => clients.remove(server),
                _ => None,
            }
        };
        if let Some(evicted) = evicted {
            warn!(session = %self.session_id, server, error = %error, "evicting failed MCP client");
            evicted.dispose().await;
        }
        error
    }

    // ── Tools ───────────────────────────────────────────────────────

    /// Tools of one server, renamed to `<server>_<tool>`.
    pub async fn list_tools_of_server(&self, server: &str) -> Result<Vec<McpToolDef>> {
        let (client, config) = self.client_for(server).await?;
        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => return Err(self.client_failed(server, &client, e).await),
        };
        debug!(session = %self.session_id, server, tools = tools.len(), "listed server tools");
        Ok(tools
            .into_iter()
            .map(|mut tool| {
                tool.name = qualified::encode(server, &tool.name);
                self.trust.apply(config, &mut tool);
                tool
            })
            .collect())
    }

    /// Tools of every server, in server-name order. One failing server fails
    /// the whole listing.
    pub async fn list_all_tools(&self, cancel: &CancellationToken) -> Result<Vec<McpToolDef>> {
        self.ensure_live()?;
        let listing = try_join_all(
            self.servers
                .keys()
                .map(|server| self.list_tools_of_server(server)),
        );
        let per_server = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(HubError::Cancelled {
                    what: "tool listing".into(),
                });
            },
            listed = listing => listed?,
        };
        let tools: Vec<McpToolDef> = per_server.into_iter().flatten().collect();
        info!(session = %self.session_id, servers = self.servers.len(), tools = tools.len(), "listed MCP tools");
        Ok(tools)
    }

    /// Like [`Self::list_all_tools`] but keeps going past failing servers.
    pub async fn list_tools_by_server(&self) -> BTreeMap<String, Result<Vec<McpToolDef>>> {
        join_all(self.servers.keys().map(|server| async move {
            (server.clone(), self.list_tools_of_server(server).await)
        }))
        .await
        .into_iter()
        .collect()
    }

    // ── Calls ───────────────────────────────────────────────────────

    pub async fn call_tool(
        &self,
        tool_call_id: &str,
        params: CallToolParams,
        cancel: &CancellationToken,
    ) -> Result<ToolsCallResult> {
        self.ensure_live()?;
        lock(&self.calls).start_tool_call(tool_call_id, &params.name)?;
        let guard = Arc::new(CallGuard::default());
        lock(&self.in_flight).insert(tool_call_id.to_string(), Arc::clone(&guard));
        info!(session = %self.session_id, tool_call_id, tool = %params.name, "tool call started");

        let outcome = self.run_call(tool_call_id, params, &guard, cancel).await;
        lock(&self.in_flight).remove(tool_call_id);

        match outcome {
            Ok(result) => Ok(self.complete_call(tool_call_id, result).await),
            Err(e) => {
                lock(&self.calls).finish(tool_call_id);
                lock(&self.sampling_waiters).remove(tool_call_id);
                lock(&self.elicitation_waiters).remove(tool_call_id);
                warn!(session = %self.session_id, tool_call_id, kind = ?e.kind(), error = %e, "tool call failed");
                Err(e)
            },
        }
    }

    async fn run_call(
        &self,
        tool_call_id: &str,
        params: CallToolParams,
        guard: &CallGuard,
        cancel: &CancellationToken,
    ) -> Result<ToolsCallResult> {
        let CallToolParams { name, arguments } = params;
        let (server, tool) = qualified::decode(&name)?;
        let work = async {
            let (client, _) = self.client_for(server).await?;
            let ctx = CallContext {
                tool_call_id: tool_call_id.to_string(),
                server_name: server.to_string(),
            };
            match client.call_tool(tool, arguments, ctx).await {
                Ok(result) => Ok(result),
                Err(e) => Err(self.client_failed(server, &client, e).await),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HubError::Cancelled {
                what: format!("tool call '{tool_call_id}'"),
            }),
            _ = guard.abort.cancelled() => Err(guard.take_failure().unwrap_or_else(|| {
                HubError::Cancelled {
                    what: format!("tool call '{tool_call_id}'"),
                }
            })),
            // A relay may abort in the same poll the server answers.
            outcome = work => match guard.take_failure() {
                Some(failure) => Err(failure),
                None => outcome,
            },
        }
    }

    /// Move the call to `result` and announce it. Neither step can fail the
    /// call any more: the caller already holds the result.
    async fn complete_call(&self, tool_call_id: &str, result: ToolsCallResult) -> ToolsCallResult {
        let moved = lock(&self.calls).tool_call_result(tool_call_id);
        if let Err(e) = moved {
            lock(&self.calls).finish(tool_call_id);
            warn!(session = %self.session_id, tool_call_id, error = %e, "tool call result not announced");
            return result;
        }

        let event = WithToolCall::new(tool_call_id, result.clone());
        if let Err(e) = self.sink.tool_call_result(&self.session_id, event).await {
            warn!(session = %self.session_id, tool_call_id, error = %e, "tool call result not delivered");
        }
        info!(session = %self.session_id, tool_call_id, is_error = result.is_error, "tool call finished");
        result
    }

    // ── Relays ──────────────────────────────────────────────────────

    /// Park the call in its pending state, announce the request and wait for
    /// the driver's answer. Failures that doom the call abort it; a request
    /// arriving in the wrong state only fails the request.
    async fn relay<T, A>(
        &self,
        kind: RelayKind,
        ctx: &CallContext,
        waiters: &Waiters<T>,
        announce: A,
    ) -> HandlerResult<T>
    where
        A: Future<Output = Result<()>>,
    {
        let id = ctx.tool_call_id.as_str();
        let guard = lock(&self.in_flight).get(id).cloned().ok_or_else(|| {
            rpc_error(&HubError::from(StateError::UnknownCall(id.to_string())))
        })?;

        let moved = {
            let mut calls = lock(&self.calls);
            match kind {
                RelayKind::Sampling => calls.sampling_request(id),
                RelayKind::Elicitation => calls.elicitation_request(id),
            }
        };
        if let Err(e) = moved {
            warn!(session = %self.session_id, tool_call_id = id, kind = kind.as_str(), error = %e, "rejected server request");
            return Err(rpc_error(&e.into()));
        }

        let (tx, rx) = oneshot::channel();
        lock(waiters).insert(id.to_string(), tx);
        info!(session = %self.session_id, server = %ctx.server_name, tool_call_id = id, kind = kind.as_str(), "relaying server request");

        if let Err(e) = announce.await {
            lock(waiters).remove(id);
            warn!(session = %self.session_id, tool_call_id = id, kind = kind.as_str(), error = %e, "server request not delivered");
            let reply = rpc_error(&e);
            guard.abort(e);
            return Err(reply);
        }

        let timeout = self.options.round_trip_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => {
                let e = HubError::Cancelled {
                    what: format!("{} round trip for tool call '{id}'", kind.as_str()),
                };
                Err(rpc_error(&e))
            },
            Err(_) => {
                lock(waiters).remove(id);
                let e = HubError::Timeout {
                    what: format!("{} round trip for tool call '{id}'", kind.as_str()),
                    timeout,
                };
                warn!(session = %self.session_id, tool_call_id = id, error = %e, "round trip timed out");
                let reply = rpc_error(&e);
                guard.abort(e);
                Err(reply)
            },
        }
    }

    fn check_session(&self, session_id: &str) -> Result<()> {
        if session_id != self.session_id {
            return Err(HubError::invalid_input(format!(
                "result for session '{session_id}' delivered to hub of session '{}'",
                self.session_id
            )));
        }
        Ok(())
    }

    fn deliver<T>(
        &self,
        kind: RelayKind,
        tool_call_id: &str,
        waiters: &Waiters<T>,
        answer: T,
    ) -> Result<()> {
        let waiter = lock(waiters)
            .remove(tool_call_id)
            .ok_or_else(|| HubError::not_found(format!("{} waiter for tool call '{tool_call_id}'", kind.as_str())))?;
        waiter.send(answer).map_err(|_| HubError::Cancelled {
            what: format!("{} round trip for tool call '{tool_call_id}'", kind.as_str()),
        })?;
        debug!(session = %self.session_id, tool_call_id, kind = kind.as_str(), "round trip resolved");
        Ok(())
    }

    /// Resume a call parked on a sampling request.
    pub fn on_sampling_result(&self, session_id: &str, result: SamplingResult) -> Result<()> {
        self.check_session(session_id)?;
        let WithToolCall {
            tool_call_id,
            inner,
        } = result;
        lock(&self.calls).sampling_result(&tool_call_id)?;
        self.deliver(
            RelayKind::Sampling,
            &tool_call_id,
            &self.sampling_waiters,
            inner,
        )
    }

    /// Resume a call parked on an elicitation request.
    pub fn on_elicitation_result(&self, session_id: &str, result: ElicitationResult) -> Result<()> {
        self.check_session(session_id)?;
        let WithToolCall {
            tool_call_id,
            inner,
        } = result;
        lock(&self.calls).elicitation_result(&tool_call_id)?;
        self.deliver(
            RelayKind::Elicitation,
            &tool_call_id,
            &self.elicitation_waiters,
            inner,
        )
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Stop listening, fail running calls and close every client. Safe to
    /// call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        let running: Vec<Arc<CallGuard>> = lock(&self.in_flight).values().cloned().collect();
        for guard in running {
            guard.abort(HubError::Disposed {
                session_id: self.session_id.clone(),
            });
        }
        lock(&self.sampling_waiters).clear();
        lock(&self.elicitation_waiters).clear();

        let clients: Vec<Arc<dyn McpClientTrait>> = self
            .clients
            .write()
            .await
            .drain()
            .map(|(_, client)| client)
            .collect();
        join_all(clients.iter().map(|client| client.dispose())).await;
        info!(session = %self.session_id, clients = clients.len(), "disposed MCP hub");
    }
}

#[async_trait]
impl Dispose for HubService {
    fn owner_name(&self) -> &str {
        &self.session_id
    }

    async fn dispose(&self) {
        HubService::dispose(self).await;
    }
}

impl Drop for HubService {
    fn drop(&mut self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
    }
}

/// Handler registered on every client; forwards into the owning hub.
struct Relay {
    hub: Weak<HubService>,
}

impl Relay {
    fn hub(&self) -> HandlerResult<Arc<HubService>> {
        self.hub
            .upgrade()
            .ok_or_else(|| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, "hub is gone"))
    }
}

#[async_trait]
impl SamplingHandler for Relay {
    async fn create_message(
        &self,
        ctx: &CallContext,
        params: CreateMessageParams,
    ) -> HandlerResult<CreateMessageResult> {
        let hub = self.hub()?;
        let request = WithToolCall::new(ctx.tool_call_id.clone(), params);
        let announce = hub.sink.sampling_request(&hub.session_id, request);
        hub.relay(RelayKind::Sampling, ctx, &hub.sampling_waiters, announce)
            .await
    }
}

#[async_trait]
impl ElicitationHandler for Relay {
    async fn elicit(&self, ctx: &CallContext, params: ElicitParams) -> HandlerResult<ElicitResult> {
        let hub = self.hub()?;
        let request = WithToolCall::new(ctx.tool_call_id.clone(), params);
        let announce = hub.sink.elicitation_request(&hub.session_id, request);
        hub.relay(
            RelayKind::Elicitation,
            ctx,
            &hub.elicitation_waiters,
            announce,
        )
        .await
    }
}

#[async_trait]
impl ProgressHandler for Relay {
    async fn on_progress(&self, ctx: &CallContext, progress: Progress) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let event = WithToolCall::new(ctx.tool_call_id.clone(), progress);
        if let Err(e) = hub.sink.progress(&hub.session_id, event).await {
            warn!(session = %hub.session_id, tool_call_id = %ctx.tool_call_id, error = %e, "progress not delivered");
        }
    }
}
