use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Missing or malformed endpoint or credential configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The identity provider rejected the credential or the scope request.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The history carried no user-authored message.
    #[error("no user message to process")]
    EmptyInput,

    #[error("backend returned HTTP {status}: {body}")]
    BackendHttp { status: u16, body: String },

    #[error("backend protocol error: {detail}")]
    BackendProtocol { detail: String, body: String },

    /// Timeout or connection failure before any HTTP status was received.
    #[error("backend transport error: {0}")]
    BackendTransport(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Configuration(_) => "CONFIGURATION_ERROR",
            BridgeError::Auth(_) => "AUTH_ERROR",
            BridgeError::EmptyInput => "EMPTY_INPUT",
            BridgeError::BackendHttp { .. } => "BACKEND_HTTP_ERROR",
            BridgeError::BackendProtocol { .. } => "BACKEND_PROTOCOL_ERROR",
            BridgeError::BackendTransport(_) => "BACKEND_TRANSPORT_ERROR",
        }
    }

    /// 4xx responses never change status on replay, so only server-side and
    /// transport failures qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::BackendHttp { status, .. } => *status >= 500,
            BridgeError::BackendTransport(_) => true,
            _ => false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Configuration(_))
    }
}

/// Cuts `input` to at most `max_len` bytes on a char boundary, marking the cut.
pub fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_server_and_transport_failures_are_retryable() {
        assert!(BridgeError::BackendHttp {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(BridgeError::BackendTransport("timed out".to_string()).is_retryable());
        assert!(!BridgeError::BackendHttp {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!BridgeError::BackendHttp {
            status: 400,
            body: String::new()
        }
        .is_retryable());
        assert!(!BridgeError::BackendProtocol {
            detail: "x".to_string(),
            body: "x".to_string()
        }
        .is_retryable());
        assert!(!BridgeError::Auth("denied".to_string()).is_retryable());
    }

    #[test]
    fn configuration_is_the_only_fatal_category() {
        assert!(BridgeError::Configuration("missing".to_string()).is_fatal());
        assert!(!BridgeError::EmptyInput.is_fatal());
        assert_eq!(BridgeError::EmptyInput.code(), "EMPTY_INPUT");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_for_error("short", 10), "short");
        assert_eq!(truncate_for_error("ééé", 3), "é...");
    }
}
