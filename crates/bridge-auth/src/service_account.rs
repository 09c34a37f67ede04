use std::fmt;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use bridge_types::{truncate_for_error, BridgeError, Result};

use crate::{AccessToken, TokenProvider, CLOUD_PLATFORM_SCOPE};

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type", default)]
    pub key_type: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("key_type", &self.key_type)
            .field("project_id", &self.project_id)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"[redacted]")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    /// Accepts standard or URL-safe base64, with or without padding and
    /// embedded line breaks.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Err(BridgeError::Configuration(
                "service account key is empty".to_string(),
            ));
        }
        let padded = pad_base64(&compact);
        let bytes = STANDARD
            .decode(&padded)
            .or_else(|_| URL_SAFE.decode(&padded))
            .map_err(|e| {
                BridgeError::Configuration(format!("service account key is not base64: {e}"))
            })?;
        let raw = String::from_utf8(bytes).map_err(|_| {
            BridgeError::Configuration("service account key is not UTF-8 JSON".to_string())
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(raw).map_err(|e| {
            BridgeError::Configuration(format!("service account key is malformed: {e}"))
        })?;
        if key.client_email.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "service account key has no client_email".to_string(),
            ));
        }
        if !key.private_key.contains("PRIVATE KEY") {
            return Err(BridgeError::Configuration(
                "service account key has no PEM private_key".to_string(),
            ));
        }
        Ok(key)
    }
}

fn pad_base64(input: &str) -> String {
    let trimmed = input.trim_end_matches('=');
    let rem = trimmed.len() % 4;
    if rem == 0 {
        trimmed.to_string()
    } else {
        format!("{}{}", trimmed, "=".repeat(4 - rem))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchanges a signed JWT assertion for an OAuth2 access token.
pub struct ServiceAccountTokenProvider {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    client: Client,
}

impl ServiceAccountTokenProvider {
    pub fn new(key: ServiceAccountKey, client: Client) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
            BridgeError::Configuration(format!("service account private key is invalid: {e}"))
        })?;
        Ok(Self {
            key,
            encoding_key,
            client,
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    pub fn build_assertion(&self, issued_at: u64) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.key.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &self.encoding_key)
            .map_err(|e| BridgeError::Configuration(format!("could not sign assertion: {e}")))
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    fn name(&self) -> &'static str {
        "service_account"
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        let assertion = self.build_assertion(unix_now())?;
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| BridgeError::Auth(format!("identity provider unreachable: {e}")))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<TokenResponse>(&body).ok();

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|r| r.error_description.clone().or_else(|| r.error.clone()))
                .unwrap_or_else(|| truncate_for_error(&body, 300));
            return Err(BridgeError::Auth(format!(
                "identity provider rejected credential ({status}): {detail}"
            )));
        }

        let Some(parsed) = parsed else {
            return Err(BridgeError::Auth(
                "identity provider returned a non-JSON token response".to_string(),
            ));
        };
        let token = parsed
            .access_token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                BridgeError::Auth("identity provider response has no access_token".to_string())
            })?;
        tracing::debug!(
            client_email = %self.key.client_email,
            expires_in = parsed.expires_in.unwrap_or(0),
            "service account token issued"
        );
        Ok(AccessToken {
            token,
            expires_at: parsed
                .expires_in
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
