//! Error types for provider operations.

use thiserror::Error;

/// Error returned by provider operations.
///
/// Non-success HTTP statuses are split by how the caller should react:
/// retryable outages, credential problems, and everything else.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network or transport-level HTTP error from reqwest.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider is temporarily unavailable (5xx or 429).
    #[error("Provider unavailable: {status} - {message}")]
    Unavailable { status: u16, message: String },

    /// Credential missing, expired, or lacking permission (401/403).
    #[error("Unauthorized: {status} - {message}")]
    Unauthorized { status: u16, message: String },

    /// Provider refused the request for any other reason.
    #[error("Provider rejected request: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Response body did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid client configuration (bad base URL, etc.).
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Returns true if the failure is transient and the request may succeed later.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Unavailable { .. } => true,
            ProviderError::Http(e) => {
                if e.is_connect() || e.is_timeout() || e.is_body() || e.is_decode() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                e.is_request()
            }
            _ => false,
        }
    }

    /// Returns true if the credential must be reconfigured.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ProviderError::Unauthorized { .. })
    }

    /// HTTP status attached to the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Unavailable { status, .. }
            | ProviderError::Unauthorized { status, .. }
            | ProviderError::Rejected { status, .. } => Some(*status),
            ProviderError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;
