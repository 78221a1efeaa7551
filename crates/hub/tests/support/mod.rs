//! A streamable-HTTP MCP server on an ephemeral port.
//!
//! Tools:
//! - `echo` returns `arguments.text`.
//! - `confirm` asks for an elicitation and reports the chosen action.
//! - `summarize` asks for a sampling completion and returns its text.
//!
//! `confirm` and `summarize` answer with an event stream: a progress
//! notification, the server request, then the result once the client has
//! posted its reply.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use {
    axum::{
        Json, Router,
        extract::State,
        http::StatusCode,
        response::{
            IntoResponse, Response,
            sse::{Event, Sse},
        },
        routing::post,
    },
    serde_json::{Value, json},
    tokio::{net::TcpListener, sync::oneshot},
};

pub const SESSION_ID: &str = "fixture-session";

#[derive(Default)]
pub struct Fixture {
    tools: Vec<String>,
    next_request: AtomicU64,
    replies: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    progress_tokens: Mutex<Vec<Value>>,
    deletes: AtomicUsize,
}

impl Fixture {
    /// Start a server exposing `tools`. Returns its MCP endpoint.
    pub async fn start(tools: &[&str]) -> (String, Arc<Self>) {
        let fixture = Arc::new(Self {
            tools: tools.iter().map(|t| (*t).to_string()).collect(),
            ..Self::default()
        });
        let app = Router::new()
            .route("/mcp", post(handle).delete(close))
            .with_state(Arc::clone(&fixture));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/mcp"), fixture)
    }

    /// `_meta.progressToken` of every `tools/call` seen so far.
    pub fn progress_tokens(&self) -> Vec<Value> {
        self.progress_tokens.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn resolve(&self, id: &Value, reply: Value) {
        if let Some(tx) = self.replies.lock().unwrap().remove(&id.to_string()) {
            let _ = tx.send(reply);
        }
    }
}

fn result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn error(id: Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn text(text: &str) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": false})
}

fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("fixture {name}"),
        "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}},
        "annotations": {"readOnlyHint": name == "echo"}
    })
}

async fn handle(State(fixture): State<Arc<Fixture>>, Json(body): Json<Value>) -> Response {
    let id = body.get("id").cloned();
    let method = body.get("method").and_then(Value::as_str);
    match (method, id) {
        // The client answering one of our requests.
        (None, Some(id)) => {
            fixture.resolve(&id, body.clone());
            StatusCode::ACCEPTED.into_response()
        },
        (Some(_), None) => StatusCode::ACCEPTED.into_response(),
        (Some("initialize"), Some(id)) => (
            [("mcp-session-id", SESSION_ID)],
            Json(result(
                id,
                json!({
                    "protocolVersion": "2025-06-18",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fixture", "version": "1.0.0"}
                }),
            )),
        )
            .into_response(),
        (Some("tools/list"), Some(id)) => {
            let tools: Vec<Value> = fixture.tools.iter().map(|name| tool(name)).collect();
            Json(result(id, json!({"tools": tools}))).into_response()
        },
        (Some("tools/call"), Some(id)) => call(&fixture, id, &body["params"]),
        (Some(_), Some(id)) => Json(error(id, -32601, "method not found")).into_response(),
        (None, None) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn close(State(fixture): State<Arc<Fixture>>) -> StatusCode {
    fixture.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

fn call(fixture: &Arc<Fixture>, id: Value, params: &Value) -> Response {
    let token = params["_meta"]["progressToken"].clone();
    fixture.progress_tokens.lock().unwrap().push(token.clone());

    match params["name"].as_str().unwrap_or_default() {
        "echo" => {
            let said = params["arguments"]["text"].as_str().unwrap_or_default();
            Json(result(id, text(said))).into_response()
        },
        "confirm" => relay(
            fixture,
            id,
            token,
            "elicitation/create",
            json!({
                "message": "Proceed?",
                "requestedSchema": {"type": "object", "properties": {}}
            }),
            |reply| {
                let action = reply["result"]["action"].as_str().unwrap_or("error");
                format!("user chose {action}")
            },
        ),
        "summarize" => relay(
            fixture,
            id,
            token,
            "sampling/createMessage",
            json!({
                "messages": [{"role": "user", "content": {"type": "text", "text": "Summarize"}}],
                "maxTokens": 32
            }),
            |reply| {
                reply["result"]["content"]["text"]
                    .as_str()
                    .unwrap_or("error")
                    .to_string()
            },
        ),
        _ => Json(error(id, -32602, "unknown tool")).into_response(),
    }
}

fn relay(
    fixture: &Arc<Fixture>,
    id: Value,
    token: Value,
    method: &'static str,
    params: Value,
    finish: fn(&Value) -> String,
) -> Response {
    let request_id = json!(format!(
        "fixture-{}",
        fixture.next_request.fetch_add(1, Ordering::SeqCst)
    ));
    let (tx, rx) = oneshot::channel();
    fixture
        .replies
        .lock()
        .unwrap()
        .insert(request_id.to_string(), tx);

    let stream = async_stream::stream! {
        let progress = json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"progressToken": token, "progress": 1, "total": 2}
        });
        yield Ok::<_, Infallible>(Event::default().data(progress.to_string()));

        let request = json!({"jsonrpc": "2.0", "id": request_id, "method": method, "params": params});
        yield Ok(Event::default().data(request.to_string()));

        let reply = rx.await.unwrap_or(Value::Null);
        yield Ok(Event::default().data(result(id, text(&finish(&reply))).to_string()));
    };
    Sse::new(stream).into_response()
}
