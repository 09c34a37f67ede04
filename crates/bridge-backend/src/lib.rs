use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use bridge_types::{BridgeError, Result};

mod retry;

pub use retry::RetryPolicy;

#[async_trait]
pub trait AgentInvoker: Send + Sync {
    /// POSTs `body` as JSON to `url` with `token` as bearer credential and
    /// returns the parsed JSON reply.
    async fn invoke(&self, url: &str, token: &str, body: &Value) -> Result<Value>;

    /// Like `invoke`, for operations that answer with a stream of JSON
    /// events. The stream is buffered and returned in arrival order.
    async fn invoke_stream(&self, url: &str, token: &str, body: &Value) -> Result<Vec<Value>> {
        Ok(match self.invoke(url, token, body).await? {
            Value::Array(events) => events,
            event => vec![event],
        })
    }
}

#[derive(Clone)]
pub struct HttpAgentInvoker {
    client: Client,
    retry: RetryPolicy,
}

impl HttpAgentInvoker {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Configuration(format!("could not build HTTP client: {e}")))?;
        Ok(Self { client, retry })
    }

    pub fn with_client(client: Client, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn post_once(&self, url: &str, token: &str, body: &Value) -> Result<String> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;

        if !status.is_success() {
            return Err(BridgeError::BackendHttp {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    /// Raw 2xx body, retrying server-side and transport failures per policy.
    async fn post_with_retry(&self, url: &str, token: &str, body: &Value) -> Result<String> {
        let attempts = self.retry.total_attempts();
        let mut attempt = 0;
        loop {
            match self.post_once(url, token, body).await {
                Ok(text) => return Ok(text),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        url,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error_code = err.code(),
                        "backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, url: &str, token: &str, body: &Value) -> Result<Value> {
        parse_reply(self.post_with_retry(url, token, body).await?)
    }

    async fn invoke_stream(&self, url: &str, token: &str, body: &Value) -> Result<Vec<Value>> {
        parse_event_stream(self.post_with_retry(url, token, body).await?)
    }
}

fn map_transport_error(err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::BackendTransport(format!("request timed out: {err}"))
    } else if err.is_connect() {
        BridgeError::BackendTransport(format!("connection failed: {err}"))
    } else {
        BridgeError::BackendTransport(err.to_string())
    }
}

/// Newline-delimited JSON events. A body that is one JSON array is taken as
/// the event list itself.
fn parse_event_stream(text: String) -> Result<Vec<Value>> {
    if let Ok(value) = serde_json::from_str::<Value>(&text) {
        return Ok(match value {
            Value::Array(events) => events,
            event => vec![event],
        });
    }
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(event) => events.push(event),
            Err(e) => {
                return Err(BridgeError::BackendProtocol {
                    detail: format!("event line {} is not JSON: {e}", index + 1),
                    body: text,
                })
            }
        }
    }
    Ok(events)
}

fn parse_reply(text: String) -> Result<Value> {
    if text.trim().is_empty() {
        return Err(BridgeError::BackendProtocol {
            detail: "empty response body".to_string(),
            body: text,
        });
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(value),
        Err(e) => Err(BridgeError::BackendProtocol {
            detail: format!("response body is not JSON: {e}"),
            body: text,
        }),
    }
}
