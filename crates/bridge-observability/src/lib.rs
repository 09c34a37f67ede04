use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_PREFIX: &str = "agent-bridge";

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Cli,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Cli => "cli",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggingInitInfo {
    pub process: String,
    pub logs_dir: String,
    pub prefix: String,
    pub retention_days: u64,
    pub expired_files_removed: usize,
    pub initialized_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ObservabilityEvent<'a> {
    pub event: &'a str,
    pub component: &'a str,
    pub thread_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub agent: Option<&'a str>,
    pub status: Option<&'a str>,
    pub error_code: Option<&'a str>,
    pub detail: Option<&'a str>,
}

/// Replaces user content with its length and a short digest so log lines
/// can be correlated without carrying the text.
pub fn redact_text(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    format!(
        "[redacted len={} sha256={}]",
        trimmed.len(),
        short_hash(trimmed)
    )
}

pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
}

pub fn emit_event(level: Level, process: ProcessKind, event: ObservabilityEvent<'_>) {
    match level {
        Level::ERROR => tracing::error!(
            target: "bridge.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            thread_id = event.thread_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            agent = event.agent.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        Level::WARN => tracing::warn!(
            target: "bridge.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            thread_id = event.thread_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            agent = event.agent.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
        _ => tracing::info!(
            target: "bridge.obs",
            process = process.as_str(),
            component = event.component,
            event = event.event,
            thread_id = event.thread_id.unwrap_or(""),
            session_id = event.session_id.unwrap_or(""),
            agent = event.agent.unwrap_or(""),
            status = event.status.unwrap_or(""),
            error_code = event.error_code.unwrap_or(""),
            detail = event.detail.unwrap_or(""),
            "observability_event"
        ),
    }
}

pub fn init_process_logging(
    process: ProcessKind,
    logs_dir: &Path,
    retention_days: u64,
) -> anyhow::Result<(WorkerGuard, LoggingInitInfo)> {
    fs::create_dir_all(logs_dir)?;
    let removed = cleanup_old_jsonl(logs_dir, process.as_str(), retention_days)?;

    let prefix = log_file_prefix(process);
    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&prefix)
        .filename_suffix("jsonl")
        .build(logs_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_current_span(false)
        .with_span_list(false);

    // stderr keeps stdout free for CLI output.
    let console_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    let info = LoggingInitInfo {
        process: process.as_str().to_string(),
        logs_dir: logs_dir.display().to_string(),
        prefix,
        retention_days,
        expired_files_removed: removed,
        initialized_at: Utc::now(),
    };

    Ok((guard, info))
}

fn log_file_prefix(process: ProcessKind) -> String {
    format!("{}.{}", LOG_PREFIX, process.as_str())
}

/// Removes this process's daily log files dated before the retention window.
/// Files that do not follow `<prefix>.<YYYY-MM-DD>.jsonl` are left alone.
fn cleanup_old_jsonl(logs_dir: &Path, process: &str, retention_days: u64) -> anyhow::Result<usize> {
    let oldest_kept = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let prefix = format!("{LOG_PREFIX}.{process}.");

    let mut removed = 0;
    for path in fs::read_dir(logs_dir)?.flatten().map(|entry| entry.path()) {
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|name| log_file_date(name, &prefix))
        else {
            continue;
        };
        if date < oldest_kept && path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn log_file_date(name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(prefix)?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

pub fn default_logs_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BRIDGE_LOGS_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("agent-bridge").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".agent-bridge").join("logs"))
}
