//! Test doubles: scripted MCP clients and a recording event sink.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    mcphub_bus::{
        Channel, ElicitationRequest, ProgressEvent, SamplingRequest, ToolCallResultEvent,
    },
    mcphub_mcp::{
        CallContext, ClientFactory, ElicitationHandler, McpClientTrait, McpTransportError,
        ProgressHandler, SamplingHandler, ServerConfig,
        types::{
            CreateMessageParams, ElicitParams, McpToolDef, Progress, Role, SamplingMessage,
            ToolContent, ToolsCallResult,
        },
    },
    serde_json::{Value, json},
    tokio::sync::mpsc,
};

use crate::{
    error::{HubError, Result},
    events::HubEventSink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Returns `arguments.text`.
    Echo,
    /// Asks for confirmation and returns the chosen action.
    Elicit,
    /// Asks for a completion and returns its text.
    Sample,
    /// Reports progress twice, then echoes.
    Progress,
    /// Never answers.
    Hang,
    /// Cannot be reached.
    Unreachable,
}

pub fn text_result(text: impl Into<String>) -> ToolsCallResult {
    ToolsCallResult {
        content: vec![ToolContent::text(text)],
        is_error: false,
        structured_content: None,
        meta: None,
    }
}

pub fn tool(name: &str) -> McpToolDef {
    McpToolDef {
        name: name.into(),
        title: None,
        description: Some(format!("{name} tool")),
        input_schema: json!({"type": "object"}),
        output_schema: None,
        annotations: Some(json!({"readOnlyHint": true})),
        meta: Some(json!({"origin": "fake"})),
    }
}

pub struct FakeClient {
    name: String,
    behavior: Behavior,
    connected: AtomicBool,
    pub disposed: AtomicBool,
    current: Mutex<Option<CallContext>>,
    sampling: Mutex<Option<Arc<dyn SamplingHandler>>>,
    elicitation: Mutex<Option<Arc<dyn ElicitationHandler>>>,
    progress: Mutex<Option<Arc<dyn ProgressHandler>>>,
}

fn get<T: Clone>(slot: &Mutex<T>) -> T {
    slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

fn set<T>(slot: &Mutex<T>, value: T) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

impl FakeClient {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            current: Mutex::new(None),
            sampling: Mutex::new(None),
            elicitation: Mutex::new(None),
            progress: Mutex::new(None),
        }
    }

    async fn run(&self, arguments: &Value, ctx: &CallContext) -> mcphub_mcp::Result<ToolsCallResult> {
        let echo = || text_result(arguments["text"].as_str().unwrap_or_default());
        match self.behavior {
            Behavior::Echo => Ok(echo()),
            Behavior::Elicit => {
                let handler = get(&self.elicitation)
                    .ok_or_else(|| mcphub_mcp::Error::message("no elicitation handler"))?;
                let params = ElicitParams {
                    message: "Proceed?".into(),
                    requested_schema: json!({"type": "object", "properties": {}}),
                };
                Ok(match handler.elicit(ctx, params).await {
                    Ok(answer) => text_result(format!("user chose {}", answer.action.as_str())),
                    Err(e) => ToolsCallResult {
                        is_error: true,
                        ..text_result(e.message)
                    },
                })
            },
            Behavior::Sample => {
                let handler = get(&self.sampling)
                    .ok_or_else(|| mcphub_mcp::Error::message("no sampling handler"))?;
                let params = CreateMessageParams {
                    messages: vec![SamplingMessage {
                        role: Role::User,
                        content: ToolContent::text("Summarize"),
                    }],
                    max_tokens: 32,
                    system_prompt: None,
                    temperature: None,
                    stop_sequences: None,
                    include_context: None,
                    model_preferences: None,
                    metadata: None,
                };
                Ok(match handler.create_message(ctx, params).await {
                    Ok(answer) => text_result(answer.content.as_text().unwrap_or_default()),
                    Err(e) => ToolsCallResult {
                        is_error: true,
                        ..text_result(e.message)
                    },
                })
            },
            Behavior::Progress => {
                if let Some(handler) = get(&self.progress) {
                    for step in 1..=2 {
                        handler
                            .on_progress(ctx, Progress {
                                progress: f64::from(step),
                                total: Some(2.0),
                                message: None,
                            })
                            .await;
                    }
                }
                Ok(echo())
            },
            Behavior::Hang => futures::future::pending().await,
            Behavior::Unreachable => Err(McpTransportError::Closed.into()),
        }
    }
}

#[async_trait]
impl McpClientTrait for FakeClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> mcphub_mcp::Result<()> {
        if self.behavior == Behavior::Unreachable {
            return Err(McpTransportError::Closed.into());
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_tools(&self) -> mcphub_mcp::Result<Vec<McpToolDef>> {
        self.connect().await?;
        Ok(vec![tool("echo"), tool("read_file")])
    }

    async fn call_tool(
        &self,
        _name: &str,
        arguments: Value,
        ctx: CallContext,
    ) -> mcphub_mcp::Result<ToolsCallResult> {
        self.connect().await?;
        set(&self.current, Some(ctx.clone()));
        let outcome = self.run(&arguments, &ctx).await;
        set(&self.current, None);
        outcome
    }

    fn current_call(&self) -> Option<CallContext> {
        get(&self.current)
    }

    fn set_sampling_handler(&self, handler: Arc<dyn SamplingHandler>) {
        set(&self.sampling, Some(handler));
    }

    fn set_elicitation_handler(&self, handler: Arc<dyn ElicitationHandler>) {
        set(&self.elicitation, Some(handler));
    }

    fn set_progress_handler(&self, handler: Arc<dyn ProgressHandler>) {
        set(&self.progress, Some(handler));
    }

    async fn dispose(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`FakeClient`]s by server name and remembers them.
#[derive(Default)]
pub struct FakeFactory {
    behaviors: HashMap<String, Behavior>,
    pub created: Mutex<Vec<Arc<FakeClient>>>,
    pub creations: AtomicUsize,
}

impl FakeFactory {
    pub fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: behaviors
                .iter()
                .map(|(name, behavior)| ((*name).to_string(), *behavior))
                .collect(),
            ..Self::default()
        })
    }

    pub fn configs(&self) -> Vec<ServerConfig> {
        let mut names: Vec<_> = self.behaviors.keys().cloned().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let url = format!("http://{name}.invalid/mcp");
                ServerConfig::streamable_http(name, url)
            })
            .collect()
    }

    pub fn client(&self, index: usize) -> Arc<FakeClient> {
        Arc::clone(&self.created.lock().unwrap_or_else(|e| e.into_inner())[index])
    }
}

impl ClientFactory for FakeFactory {
    fn create(&self, config: &ServerConfig) -> Arc<dyn McpClientTrait> {
        let behavior = self
            .behaviors
            .get(&config.name)
            .copied()
            .unwrap_or(Behavior::Echo);
        let client = Arc::new(FakeClient::new(&config.name, behavior));
        self.creations.fetch_add(1, Ordering::SeqCst);
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&client));
        client
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Sampling(String, SamplingRequest),
    Elicitation(String, ElicitationRequest),
    ToolCallResult(String, ToolCallResultEvent),
    Progress(String, ProgressEvent),
}

/// Records every event; with `deliver == false` every publish fails as if
/// nobody were subscribed.
pub struct RecordingSink {
    deliver: bool,
    tx: mpsc::UnboundedSender<Event>,
}

impl RecordingSink {
    pub fn new(deliver: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { deliver, tx }), rx)
    }

    fn record(&self, channel: Channel, event: Event) -> Result<()> {
        if !self.deliver {
            return Err(HubError::from(mcphub_bus::Error::NoSubscribers { channel }));
        }
        let _ = self.tx.send(event);
        Ok(())
    }
}

#[async_trait]
impl HubEventSink for RecordingSink {
    async fn sampling_request(&self, session_id: &str, request: SamplingRequest) -> Result<()> {
        self.record(
            Channel::SamplingRequest,
            Event::Sampling(session_id.into(), request),
        )
    }

    async fn elicitation_request(
        &self,
        session_id: &str,
        request: ElicitationRequest,
    ) -> Result<()> {
        self.record(
            Channel::ElicitationRequest,
            Event::Elicitation(session_id.into(), request),
        )
    }

    async fn tool_call_result(&self, session_id: &str, event: ToolCallResultEvent) -> Result<()> {
        self.record(
            Channel::ToolCallResult,
            Event::ToolCallResult(session_id.into(), event),
        )
    }

    async fn progress(&self, session_id: &str, event: ProgressEvent) -> Result<()> {
        self.record(Channel::Progress, Event::Progress(session_id.into(), event))
    }
}
