use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bridge_core::{AgentBridge, ResolvedConfig};

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<AgentBridge>,
    /// When set, every route except health requires this token.
    pub api_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(bridge: Arc<AgentBridge>) -> Self {
        Self {
            bridge,
            api_token: None,
            allowed_origins: vec!["*".to_string()],
            started_at_ms: now_ms(),
        }
    }

    pub fn from_resolved(bridge: Arc<AgentBridge>, resolved: &ResolvedConfig) -> Self {
        Self {
            api_token: resolved.api_token.clone(),
            allowed_origins: resolved.allowed_origins.clone(),
            ..Self::new(bridge)
        }
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn build_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
