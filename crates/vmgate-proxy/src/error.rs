//! Error types for the vmgate-proxy crate.

use thiserror::Error;

/// Message returned to the VM for every credential failure. The detailed
/// error (which may quote parts of a credential) only goes to the local log.
pub const AUTH_FAILED_MESSAGE: &str = "Authentication failed. Check proxy logs.";

/// Errors that can occur in the proxy daemons.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    CredentialsNotFound(String),

    #[error("Failed to read credentials: {0}")]
    CredentialsCorrupt(String),

    #[error("{0}")]
    Auth(String),

    #[error("OAuth token expired, refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Token refresh response malformed: {0}")]
    MalformedResponse(String),

    #[error("Repo scope violation: {0}")]
    ScopeViolation(String),

    #[error("{service} unavailable after {attempts} attempts: {last_error}")]
    UpstreamUnavailable {
        service: String,
        attempts: usize,
        last_error: String,
    },

    #[error("Stream interrupted after {bytes} bytes: {reason}")]
    StreamInterrupted { bytes: u64, reason: String },

    #[error("HTTP parse error: {0}")]
    HttpParse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Whether this error means no usable credential could be produced.
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            ProxyError::CredentialsNotFound(_)
                | ProxyError::CredentialsCorrupt(_)
                | ProxyError::Auth(_)
                | ProxyError::RefreshFailed(_)
                | ProxyError::MalformedResponse(_)
        )
    }

    /// HTTP status surfaced to the VM for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            e if e.is_auth() => 401,
            ProxyError::ScopeViolation(_) => 403,
            ProxyError::UpstreamUnavailable { .. } => 502,
            ProxyError::HttpParse(_) => 400,
            _ => 500,
        }
    }

    /// Message that is safe to send to the VM.
    ///
    /// Auth failures collapse to [`AUTH_FAILED_MESSAGE`]. Scope violations
    /// and upstream failures only describe policy state and are passed on.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            e if e.is_auth() => AUTH_FAILED_MESSAGE.to_string(),
            ProxyError::ScopeViolation(_)
            | ProxyError::UpstreamUnavailable { .. }
            | ProxyError::HttpParse(_) => self.to_string(),
            _ => "Internal proxy error".to_string(),
        }
    }
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_not_leaked() {
        let err = ProxyError::RefreshFailed("refresh_token=sk-ant-ort01-abcdef rejected".to_string());
        assert_eq!(err.status(), 401);
        assert_eq!(err.client_message(), AUTH_FAILED_MESSAGE);
        assert!(!err.client_message().contains("sk-ant"));
    }

    #[test]
    fn test_scope_violation_is_descriptive() {
        let err = ProxyError::ScopeViolation("create_branch called with repo=\"x\"".to_string());
        assert_eq!(err.status(), 403);
        assert!(err.client_message().starts_with("Repo scope violation: create_branch"));
    }

    #[test]
    fn test_upstream_unavailable_carries_attempts() {
        let err = ProxyError::UpstreamUnavailable {
            service: "GitHub MCP".to_string(),
            attempts: 4,
            last_error: "GitHub returned HTTP 503".to_string(),
        };
        assert_eq!(err.status(), 502);
        assert_eq!(
            err.client_message(),
            "GitHub MCP unavailable after 4 attempts: GitHub returned HTTP 503"
        );
    }
}
