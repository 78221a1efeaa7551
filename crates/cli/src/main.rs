mod config_commands;
mod console;
mod hub_commands;
mod runtime;

use std::path::{Path, PathBuf};

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::hub_commands::{CallArgs, ScopeArgs};

#[derive(Parser)]
#[command(name = "mcphub", about = "mcphub: one hub over many MCP servers", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of mcphub.toml / mcphub.json).
    #[arg(long, global = true, env = "MCPHUB_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the MCP servers configured for a scope.
    Servers {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List every server's tools under their qualified names.
    Tools {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Call a tool, answering elicitation and sampling at this terminal.
    Call {
        #[command(flatten)]
        scope: ScopeArgs,
        #[command(flatten)]
        call: CallArgs,
    },
    /// Configuration checks.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries command output.
    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(explicit: Option<&Path>) -> anyhow::Result<mcphub_config::McphubConfig> {
    Ok(match explicit {
        Some(path) => mcphub_config::load_config(path)?,
        None => mcphub_config::discover_and_load()?,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);
    info!(version = env!("CARGO_PKG_VERSION"), "mcphub starting");

    let command = match cli.command {
        Commands::Config { action } => {
            return config_commands::handle_config(action, cli.config.as_deref());
        },
        command => command,
    };

    let config = load_config(cli.config.as_deref())?;
    let runtime = runtime::Runtime::start(&config).await?;

    let outcome = match command {
        Commands::Servers { scope, json } => hub_commands::servers(&runtime, &scope, json).await,
        Commands::Tools { scope, json } => hub_commands::tools(&runtime, &scope, json).await,
        Commands::Call { scope, call } => hub_commands::call(&runtime, &scope, call).await,
        Commands::Config { .. } => Ok(()),
    };

    runtime.shutdown().await;
    outcome
}
