//! `servers`, `tools` and `call`: the hub as seen from one (user, scope).

use std::sync::Arc;

use {
    anyhow::{Context, Result, bail},
    clap::Args,
    mcphub_bus::{DriverBridge, SessionFilter},
    mcphub_hub::{CallToolParams, ScopeKey, StoredServerConfig},
    mcphub_mcp::{ServerConfig, TransportConfig, types::ToolsCallResult},
    serde_json::{Value, json},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info},
    uuid::Uuid,
};

use crate::{console::ConsoleDriver, runtime::Runtime};

#[derive(Args, Debug, Clone)]
pub struct ScopeArgs {
    /// User whose server configs are used.
    #[arg(long, env = "MCPHUB_USER", default_value = "local")]
    pub user: String,
    /// Config scope within the user.
    #[arg(long, env = "MCPHUB_SCOPE", default_value = "default")]
    pub scope: String,
}

impl ScopeArgs {
    pub fn key(&self) -> ScopeKey {
        ScopeKey::new(&self.user, &self.scope)
    }
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Qualified tool name, `<server>_<tool>`.
    pub tool: String,
    /// Tool arguments as a JSON object.
    #[arg(long, default_value = "{}")]
    pub args: String,
    /// Hub session id; a fresh one by default.
    #[arg(long)]
    pub session: Option<String>,
    /// Do not answer sampling or elicitation requests from this terminal.
    #[arg(long)]
    pub no_driver: bool,
    /// Print the full result as JSON.
    #[arg(long)]
    pub json: bool,
}

fn target(config: &ServerConfig) -> String {
    match &config.transport {
        TransportConfig::Stdio { command, .. } => command.join(" "),
        TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
            url.clone()
        },
    }
}

fn server_table(rows: &[StoredServerConfig]) -> String {
    let width = rows.iter().map(|r| r.config.name.len()).max().unwrap_or(0);
    rows.iter()
        .map(|r| {
            format!(
                "  {:width$}  {:15}  {}\n",
                r.config.name,
                r.config.transport.kind(),
                target(&r.config)
            )
        })
        .collect()
}

pub async fn servers(runtime: &Runtime, scope: &ScopeArgs, json: bool) -> Result<()> {
    let rows = runtime.configs.list(&scope.key()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("No MCP servers configured for {}.", scope.key());
    } else {
        print!("{}", server_table(&rows));
    }
    Ok(())
}

pub async fn tools(runtime: &Runtime, scope: &ScopeArgs, json: bool) -> Result<()> {
    let session_id = Uuid::new_v4().to_string();
    let hub = runtime.provider.get_hub(&scope.key(), &session_id).await?;
    let by_server = hub.list_tools_by_server().await;

    if json {
        let report: serde_json::Map<String, Value> = by_server
            .into_iter()
            .map(|(server, listed)| {
                let value = match listed {
                    Ok(tools) => json!({ "tools": tools }),
                    Err(e) => json!({ "error": e.to_string() }),
                };
                (server, value)
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for (server, listed) in by_server {
        match listed {
            Ok(tools) => {
                println!("{server} ({} tools)", tools.len());
                for tool in tools {
                    match tool.description {
                        Some(description) => println!("  {}  {description}", tool.name),
                        None => println!("  {}", tool.name),
                    }
                }
            },
            Err(e) => println!("{server} (unavailable: {e})"),
        }
    }
    Ok(())
}

fn render(result: &ToolsCallResult) -> String {
    let text = result.text();
    if !text.is_empty() {
        return text;
    }
    match &result.structured_content {
        Some(structured) => structured.to_string(),
        None => format!("({} non-text content items)", result.content.len()),
    }
}

pub async fn call(runtime: &Runtime, scope: &ScopeArgs, args: CallArgs) -> Result<()> {
    let arguments: Value = serde_json::from_str(&args.args).context("--args must be JSON")?;
    if !arguments.is_object() {
        bail!("--args must be a JSON object");
    }
    let session_id = args
        .session
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let hub = runtime.provider.get_hub(&scope.key(), &session_id).await?;

    let driver = if args.no_driver {
        None
    } else {
        Some(
            DriverBridge::start(
                Arc::clone(&runtime.bus),
                SessionFilter::Only(session_id.clone()),
                Arc::new(ConsoleDriver::stdio()),
            )
            .await?,
        )
    };

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, cancelling tool call");
                cancel.cancel();
            }
        })
    };

    let tool_call_id = Uuid::new_v4().to_string();
    debug!(session = %session_id, tool_call_id = %tool_call_id, tool = %args.tool, "calling tool");
    let outcome = hub
        .call_tool(&tool_call_id, CallToolParams::new(args.tool, arguments), &cancel)
        .await;
    interrupt.abort();
    if let Some(driver) = driver {
        driver.stop();
    }

    let result = outcome?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", render(&result));
    }
    if result.is_error {
        bail!("the tool reported an error");
    }
    Ok(())
}
