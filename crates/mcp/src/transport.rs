//! Stdio transport: spawn a child process and communicate via JSON-RPC over stdin/stdout.

use std::{
    collections::BTreeMap,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    serde::Serialize,
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::Mutex,
        task::JoinHandle,
    },
    tracing::{debug, info, trace, warn},
};

use crate::{
    error::{Context, McpTransportError, Result},
    inbound::{PendingRequests, dispatch},
    traits::{InboundHandler, McpTransport},
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse},
};

/// Stdio-based transport for an MCP server process.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Arc<Mutex<ChildStdin>>,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

async fn write_line(stdin: &Mutex<ChildStdin>, message: &impl Serialize) -> Result<()> {
    let mut payload = serde_json::to_string(message)?;
    payload.push('\n');
    let mut stdin = stdin.lock().await;
    stdin.write_all(payload.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

impl StdioTransport {
    /// Spawn the server process and start the reader loop. `command[0]` is
    /// the program.
    pub async fn spawn(
        command: &[String],
        env: &BTreeMap<String, String>,
        handler: Arc<dyn InboundHandler>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (program, args) = command
            .split_first()
            .context("stdio transport needs a command")?;
        info!(command = %program, args = ?args, "spawning MCP server process");

        let mut child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| McpTransportError::Spawn {
                command: program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().context("failed to capture stdin")?;
        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take();

        let transport = Arc::new(Self {
            child: Mutex::new(child),
            stdin: Arc::new(Mutex::new(stdin)),
            pending: Arc::new(PendingRequests::default()),
            next_id: AtomicU64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
            request_timeout,
            reader_handle: Mutex::new(None),
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        warn!(stderr = %trimmed, "MCP server stderr");
                    }
                }
            });
        }

        let pending = Arc::clone(&transport.pending);
        let closed = Arc::clone(&transport.closed);
        let stdin = Arc::clone(&transport.stdin);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!(raw = %trimmed, "MCP server -> client");
                        let stdin = Arc::clone(&stdin);
                        dispatch(trimmed, &pending, &handler, move |response| async move {
                            write_line(&stdin, &response).await
                        })
                        .await;
                    },
                    Ok(None) => {
                        debug!("MCP server stdout closed");
                        break;
                    },
                    Err(e) => {
                        warn!(error = %e, "error reading from MCP server stdout");
                        break;
                    },
                }
            }
            closed.store(true, Ordering::SeqCst);
            pending.fail_all();
        });

        *transport.reader_handle.lock().await = Some(handle);
        Ok(transport)
    }
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
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

        debug!(method = %method, id = %id, "client -> MCP server");
        write_line(&self.stdin, &req).await?;

        waiter.wait(method, self.request_timeout).await
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        trace!(method = %method, "client -> MCP server (notification)");
        write_line(&self.stdin, &JsonRpcNotification::new(method, params)).await
    }

    async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader_handle.lock().await.take() {
            handle.abort();
        }
        self.pending.fail_all();
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}
