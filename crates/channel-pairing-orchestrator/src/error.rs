//! Error types for the pairing orchestrator.

use evolution_provider_client::ProviderError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by orchestrator operations.
///
/// Session failures are never reported through this type; they are delivered
/// as [`PairingEvent`](crate::PairingEvent)s. These errors cover caller
/// mistakes and collaborator failures outside a running session.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Invalid channel id: {0:?}")]
    InvalidChannelId(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(i64),

    #[error("Record store error: {0}")]
    Store(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

/// Result type for orchestrator operations.
pub type PairingResult<T> = Result<T, PairingError>;

/// Failure taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network trouble or a 5xx/429 answer.
    TransientProviderError,
    /// Credential problem; the caller must reconfigure.
    Unauthorized,
    /// Malformed or unexpected provider response.
    ProtocolError,
    /// Polling ceiling reached.
    Timeout,
    /// The channel is linked but post-link verification failed.
    DegradedSuccess,
    /// The caller cancelled the session.
    Cancelled,
}

impl FailureKind {
    /// Whether retrying later may succeed without caller action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::TransientProviderError | FailureKind::Timeout
        )
    }
}

impl From<&ProviderError> for FailureKind {
    fn from(err: &ProviderError) -> Self {
        if err.is_unauthorized() {
            FailureKind::Unauthorized
        } else if err.is_transient() {
            FailureKind::TransientProviderError
        } else {
            FailureKind::ProtocolError
        }
    }
}
