use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use bridge_types::{BridgeError, Result};

mod service_account;

pub use service_account::*;

/// Single scope requested for every backend token.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn is_fresh(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(expires_at) => now + EXPIRY_MARGIN < expires_at,
            None => true,
        }
    }
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_token(&self) -> Result<AccessToken>;

    async fn access_token(&self) -> Result<String> {
        Ok(self.fetch_token().await?.token)
    }

    /// Forgets any cached token so the next call goes back to the source.
    async fn invalidate(&self) {}
}

/// A pre-issued token, typically from `gcloud auth print-access-token`.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(BridgeError::Configuration(
                "static access token is empty".to_string(),
            ));
        }
        Ok(Self { token })
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        Ok(AccessToken {
            token: self.token.clone(),
            expires_at: None,
        })
    }
}

/// Reuses a fetched token until it is within a minute of expiring.
pub struct CachedTokenProvider {
    inner: Arc<dyn TokenProvider>,
    cached: Mutex<Option<AccessToken>>,
}

impl CachedTokenProvider {
    pub fn new(inner: Arc<dyn TokenProvider>) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for CachedTokenProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        // Held across the fetch so concurrent callers share one round trip.
        let mut guard = self.cached.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.clone());
            }
        }
        let fresh = self.inner.fetch_token().await?;
        tracing::debug!(provider = self.inner.name(), "refreshed backend access token");
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        lifetime: Option<Duration>,
    }

    #[async_trait]
    impl TokenProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn fetch_token(&self) -> Result<AccessToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("tok-{n}"),
                expires_at: self.lifetime.map(|d| Instant::now() + d),
            })
        }
    }

    #[tokio::test]
    async fn static_provider_returns_trimmed_token() {
        let provider = StaticTokenProvider::new("  ya29.abc \n").expect("provider");
        assert_eq!(provider.access_token().await.expect("token"), "ya29.abc");
    }

    #[test]
    fn static_provider_rejects_blank_token() {
        let err = StaticTokenProvider::new("   ").err().expect("error");
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[tokio::test]
    async fn cache_reuses_token_until_near_expiry() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            lifetime: Some(Duration::from_secs(3600)),
        });
        let cached = CachedTokenProvider::new(inner.clone());
        assert_eq!(cached.access_token().await.expect("token"), "tok-0");
        assert_eq!(cached.access_token().await.expect("token"), "tok-0");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        cached.invalidate().await;
        assert_eq!(cached.access_token().await.expect("token"), "tok-1");
    }

    #[tokio::test]
    async fn cache_refetches_tokens_inside_expiry_margin() {
        let inner = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            lifetime: Some(Duration::from_secs(30)),
        });
        let cached = CachedTokenProvider::new(inner.clone());
        cached.access_token().await.expect("token");
        cached.access_token().await.expect("token");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
