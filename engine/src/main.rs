use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use bridge_core::{
    AgentBridge, BackendMode, BridgeConfig, ResolvedConfig, DEFAULT_BRIDGE_HOST,
    DEFAULT_BRIDGE_PORT,
};
use bridge_observability::{
    default_logs_dir, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use bridge_server::{serve, AppState};
use bridge_types::{ChatMessage, ChatTurnRequest};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::info;

const SUPPORTED_MODES: [&str; 2] = ["session", "stateless"];
const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "agent-bridge")]
#[command(about = "Bridge between a chat runtime and a hosted agent backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the chat endpoint until Ctrl-C.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_BRIDGE_HOST)]
        hostname: String,
        #[arg(long, env = "PORT", default_value_t = DEFAULT_BRIDGE_PORT)]
        port: u16,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        logs_dir: Option<String>,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        agent_name: Option<String>,
        #[arg(long)]
        api_token: Option<String>,
    },
    /// Send one prompt through the bridge and print the reply.
    Ask {
        prompt: String,
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        mode: Option<String>,
    },
    /// Resolve configuration and print a redacted summary.
    CheckConfig {
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            config,
            logs_dir,
            mode,
            agent_name,
            api_token,
        } => {
            let overrides = build_cli_overrides(mode, agent_name, api_token)?;
            let logs_dir = logs_dir.map(PathBuf::from).unwrap_or_else(default_logs_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Server, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("bridge jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("bridge logging initialized: {:?}", log_info);

            let resolved = load_resolved(config.as_deref(), overrides).await?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let summary = resolved.summary().to_string();
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Server,
                ObservabilityEvent {
                    event: "config.resolved",
                    component: "engine.main",
                    agent: Some(resolved.agent_name.as_str()),
                    status: Some(resolved.mode.as_str()),
                    detail: Some(summary.as_str()),
                    ..ObservabilityEvent::default()
                },
            );

            let bridge = AgentBridge::from_resolved(&resolved)
                .context("failed to initialise agent bridge")?
                .with_process(ProcessKind::Server);
            let state = AppState::from_resolved(Arc::new(bridge), &resolved);
            info!("agent bridge listening on http://{addr}");
            serve(addr, state).await?;
        }
        Command::Ask {
            prompt,
            thread_id,
            config,
            mode,
        } => {
            let overrides = build_cli_overrides(mode, None, None)?;
            let logs_dir = default_logs_dir();
            let (_log_guard, _) =
                init_process_logging(ProcessKind::Cli, &logs_dir, LOG_RETENTION_DAYS)?;
            let resolved = load_resolved(config.as_deref(), overrides).await?;
            let bridge = AgentBridge::from_resolved(&resolved)
                .context("failed to initialise agent bridge")?
                .with_process(ProcessKind::Cli);

            let reply = bridge
                .handle_turn(ChatTurnRequest {
                    thread_id,
                    messages: vec![ChatMessage::user(prompt)],
                    state: None,
                    agent: None,
                })
                .await?;
            println!("{}", reply.message.content);
            if let Some(code) = reply.error {
                anyhow::bail!("agent turn failed ({code})");
            }
        }
        Command::CheckConfig { config } => {
            let resolved = load_resolved(config.as_deref(), None).await?;
            println!("{}", serde_json::to_string_pretty(&resolved.summary())?);
        }
    }

    Ok(())
}

async fn load_resolved(
    config_path: Option<&str>,
    overrides: Option<Value>,
) -> anyhow::Result<ResolvedConfig> {
    let path = config_path.map(Path::new);
    let config = BridgeConfig::load(path, overrides).await?;
    config
        .resolve()
        .context("bridge configuration is incomplete")
}

fn build_cli_overrides(
    mode: Option<String>,
    agent_name: Option<String>,
    api_token: Option<String>,
) -> anyhow::Result<Option<Value>> {
    let mode = normalize_and_validate_mode(mode)?;

    if mode.is_none() && agent_name.is_none() && api_token.is_none() {
        return Ok(None);
    }
    let mut root = Map::new();
    if let Some(mode) = mode {
        root.insert("backend_mode".to_string(), Value::String(mode));
    }
    if let Some(name) = agent_name.filter(|n| !n.trim().is_empty()) {
        root.insert("agent_name".to_string(), Value::String(name.trim().to_string()));
    }
    if let Some(token) = api_token.filter(|t| !t.trim().is_empty()) {
        root.insert("api_token".to_string(), Value::String(token.trim().to_string()));
    }
    Ok(Some(Value::Object(root)))
}

fn normalize_and_validate_mode(mode: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(mode) = mode else {
        return Ok(None);
    };
    let normalized = mode.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "mode cannot be empty. supported modes: {}",
            SUPPORTED_MODES.join(", ")
        );
    }
    BackendMode::from_str(&normalized)?;
    Ok(Some(normalized))
}
