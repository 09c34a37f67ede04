use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use bridge_auth::ServiceAccountKey;
use bridge_backend::RetryPolicy;
use bridge_types::{BridgeError, Result};

pub const DEFAULT_AGENT_NAME: &str = "locus";
pub const DEFAULT_AGENT_USER_ID: &str = "bridge_user";
pub const DEFAULT_LOCATION: &str = "us-central1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;

/// Raw, layered configuration. Every field is optional here; `resolve`
/// decides what is required.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub agent_name: Option<String>,
    pub agent_user_id: Option<String>,
    pub backend_mode: Option<String>,
    pub agent_endpoint: Option<String>,
    pub session_url: Option<String>,
    pub query_url: Option<String>,
    pub stream_query_url: Option<String>,
    pub project: Option<String>,
    pub location: Option<String>,
    pub reasoning_engine_id: Option<String>,
    pub service_account_key_base64: Option<String>,
    pub access_token: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub api_token: Option<String>,
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Backend keeps conversation state in its own session resource; only the
    /// latest user utterance is forwarded.
    #[default]
    Session,
    /// Full history is forwarded on every call; no backend session exists.
    Stateless,
}

impl BackendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendMode::Session => "session",
            BackendMode::Stateless => "stateless",
        }
    }
}

impl FromStr for BackendMode {
    type Err = BridgeError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "session" => Ok(BackendMode::Session),
            "stateless" => Ok(BackendMode::Stateless),
            other => Err(BridgeError::Configuration(format!(
                "unsupported backend mode `{other}`. supported modes: session, stateless"
            ))),
        }
    }
}

/// Backend operation URLs. Session management, feedback and stateless turns
/// go through `query_url`; session-mode turns are streamed operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoints {
    pub base: Option<String>,
    pub session_url: String,
    pub query_url: String,
    pub stream_query_url: String,
}

#[derive(Clone)]
pub enum CredentialSource {
    ServiceAccount(ServiceAccountKey),
    Static(String),
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::ServiceAccount(key) => {
                f.debug_tuple("ServiceAccount").field(key).finish()
            }
            CredentialSource::Static(_) => f.debug_tuple("Static").field(&"[redacted]").finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub agent_name: String,
    pub agent_user_id: String,
    pub mode: BackendMode,
    pub endpoints: AgentEndpoints,
    pub credential: CredentialSource,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub api_token: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl BridgeConfig {
    /// Layers, later wins: config file, environment, CLI overrides. Without
    /// an explicit path the per-user config file is used when present.
    pub async fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        Self::load_with_env(path.as_deref(), cli_overrides, |key| {
            std::env::var(key).ok()
        })
        .await
    }

    pub async fn load_with_env<F>(
        path: Option<&Path>,
        cli_overrides: Option<Value>,
        lookup: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut merged = empty_object();
        if let Some(path) = path {
            let file = read_json_file(path)
                .await
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            deep_merge(&mut merged, &file);
        }
        deep_merge(&mut merged, &env_layer(&lookup));
        if let Some(cli) = cli_overrides {
            deep_merge(&mut merged, &cli);
        }
        serde_json::from_value(merged).context("invalid bridge configuration")
    }

    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mode = self
            .backend_mode
            .as_deref()
            .map(BackendMode::from_str)
            .transpose()?
            .unwrap_or_default();
        let endpoints = self.resolve_endpoints()?;
        let credential = self.resolve_credential()?;
        let retry_defaults = RetryPolicy::default();
        let timeout_secs = self
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(BridgeError::Configuration(
                "request_timeout_secs must be greater than zero".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            agent_name: non_blank(self.agent_name.as_deref())
                .unwrap_or(DEFAULT_AGENT_NAME)
                .to_string(),
            agent_user_id: non_blank(self.agent_user_id.as_deref())
                .unwrap_or(DEFAULT_AGENT_USER_ID)
                .to_string(),
            mode,
            endpoints,
            credential,
            request_timeout: Duration::from_secs(timeout_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries.unwrap_or(retry_defaults.max_retries),
                base_delay_ms: self
                    .retry_base_delay_ms
                    .unwrap_or(retry_defaults.base_delay_ms),
                max_delay_ms: retry_defaults.max_delay_ms,
            },
            api_token: non_blank(self.api_token.as_deref()).map(str::to_string),
            allowed_origins: self
                .allowed_origins
                .clone()
                .filter(|origins| !origins.is_empty())
                .unwrap_or_else(|| vec!["*".to_string()]),
        })
    }

    fn resolve_endpoints(&self) -> Result<AgentEndpoints> {
        let base = match non_blank(self.agent_endpoint.as_deref()) {
            Some(endpoint) => Some(normalize_agent_endpoint(endpoint)),
            None => self.derived_endpoint(),
        };
        let session_url = non_blank(self.session_url.as_deref())
            .map(str::to_string)
            .or_else(|| base.as_ref().map(|b| format!("{b}:query")));
        let query_url = non_blank(self.query_url.as_deref())
            .map(str::to_string)
            .or_else(|| base.as_ref().map(|b| format!("{b}:query")));
        let stream_query_url = non_blank(self.stream_query_url.as_deref())
            .map(str::to_string)
            .or_else(|| base.as_ref().map(|b| format!("{b}:streamQuery")));

        let (Some(session_url), Some(query_url), Some(stream_query_url)) =
            (session_url, query_url, stream_query_url)
        else {
            return Err(BridgeError::Configuration(
                "no backend agent endpoint configured: set BRIDGE_AGENT_ENDPOINT, or \
                 GOOGLE_CLOUD_PROJECT together with BRIDGE_REASONING_ENGINE_ID"
                    .to_string(),
            ));
        };
        for url in [&session_url, &query_url, &stream_query_url] {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(BridgeError::Configuration(format!(
                    "backend URL `{url}` must be absolute http(s)"
                )));
            }
        }
        Ok(AgentEndpoints {
            base,
            session_url,
            query_url,
            stream_query_url,
        })
    }

    fn derived_endpoint(&self) -> Option<String> {
        let project = non_blank(self.project.as_deref())?;
        let engine_id = non_blank(self.reasoning_engine_id.as_deref())?;
        let location = non_blank(self.location.as_deref()).unwrap_or(DEFAULT_LOCATION);
        Some(format!(
            "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/reasoningEngines/{engine_id}"
        ))
    }

    fn resolve_credential(&self) -> Result<CredentialSource> {
        if let Some(encoded) = non_blank(self.service_account_key_base64.as_deref()) {
            return Ok(CredentialSource::ServiceAccount(
                ServiceAccountKey::from_base64(encoded)?,
            ));
        }
        if let Some(token) = non_blank(self.access_token.as_deref()) {
            return Ok(CredentialSource::Static(token.to_string()));
        }
        Err(BridgeError::Configuration(
            "no backend credential configured: set GOOGLE_SERVICE_ACCOUNT_KEY_BASE64 \
             (or BRIDGE_ACCESS_TOKEN for local development)"
                .to_string(),
        ))
    }
}

impl ResolvedConfig {
    /// Secret-free view for startup logs and `check-config`.
    pub fn summary(&self) -> Value {
        let credential = match &self.credential {
            CredentialSource::ServiceAccount(key) => json!({
                "kind": "service_account",
                "client_email": key.client_email,
                "project_id": key.project_id,
            }),
            CredentialSource::Static(_) => json!({ "kind": "static" }),
        };
        json!({
            "agent": self.agent_name,
            "user_id": self.agent_user_id,
            "mode": self.mode.as_str(),
            "session_url": self.endpoints.session_url,
            "query_url": self.endpoints.query_url,
            "stream_query_url": self.endpoints.stream_query_url,
            "credential": credential,
            "request_timeout_secs": self.request_timeout.as_secs(),
            "max_retries": self.retry.max_retries,
            "api_token_required": self.api_token.is_some(),
            "allowed_origins": self.allowed_origins,
        })
    }
}

/// Strips a trailing method suffix so the value can be used as a resource
/// base for both session and query calls.
pub fn normalize_agent_endpoint(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    for suffix in [":streamQuery", ":query"] {
        if let Some(base) = trimmed.strip_suffix(suffix) {
            return base.trim_end_matches('/').to_string();
        }
    }
    trimmed.to_string()
}

/// `BRIDGE_CONFIG`, else `<config dir>/agent-bridge/config.json` if it exists.
pub fn default_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("BRIDGE_CONFIG") {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("agent-bridge").join("config.json"))
        .filter(|path| path.is_file())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn env_layer<F>(lookup: &F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    let mut root = Map::new();
    let string_vars: [(&str, &[&str]); 12] = [
        ("agent_endpoint", &["BRIDGE_AGENT_ENDPOINT", "AGENT_ENGINE_ENDPOINT"]),
        ("session_url", &["BRIDGE_SESSION_URL"]),
        ("query_url", &["BRIDGE_QUERY_URL"]),
        ("stream_query_url", &["BRIDGE_STREAM_QUERY_URL"]),
        ("project", &["GOOGLE_CLOUD_PROJECT"]),
        ("location", &["GOOGLE_CLOUD_LOCATION"]),
        ("reasoning_engine_id", &["BRIDGE_REASONING_ENGINE_ID"]),
        (
            "service_account_key_base64",
            &["GOOGLE_SERVICE_ACCOUNT_KEY_BASE64"],
        ),
        ("access_token", &["BRIDGE_ACCESS_TOKEN"]),
        ("backend_mode", &["BRIDGE_BACKEND_MODE"]),
        ("agent_name", &["BRIDGE_AGENT_NAME"]),
        ("agent_user_id", &["BRIDGE_AGENT_USER_ID"]),
    ];
    for (field, names) in string_vars {
        let value = names
            .iter()
            .filter_map(|name| lookup(name))
            .find(|v| !v.trim().is_empty());
        if let Some(value) = value {
            root.insert(field.to_string(), Value::String(value.trim().to_string()));
        }
    }
    if let Some(token) = lookup("BRIDGE_API_TOKEN").filter(|v| !v.trim().is_empty()) {
        root.insert("api_token".to_string(), Value::String(token.trim().to_string()));
    }
    if let Some(origins) = lookup("BRIDGE_ALLOWED_ORIGINS").filter(|v| !v.trim().is_empty()) {
        root.insert("allowed_origins".to_string(), json!(parse_csv(&origins)));
    }

    insert_numeric::<u64, _>(
        &mut root,
        lookup,
        "request_timeout_secs",
        "BRIDGE_REQUEST_TIMEOUT_SECS",
    );
    insert_numeric::<u32, _>(&mut root, lookup, "max_retries", "BRIDGE_MAX_RETRIES");
    insert_numeric::<u64, _>(
        &mut root,
        lookup,
        "retry_base_delay_ms",
        "BRIDGE_RETRY_BASE_DELAY_MS",
    );
    Value::Object(root)
}

/// Parses at the field's own width so out-of-range values are ignored here
/// instead of failing deserialization of the merged config.
fn insert_numeric<N, F>(root: &mut Map<String, Value>, lookup: &F, field: &str, name: &str)
where
    N: FromStr + Serialize,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else { return };
    match raw.trim().parse::<N>() {
        Ok(n) => {
            root.insert(field.to_string(), json!(n));
        }
        Err(_) => tracing::warn!(
            "ignoring {name}={raw:?}: not a non-negative integer within range"
        ),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    if raw.trim() == "*" {
        return vec!["*".to_string()];
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw)?)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
