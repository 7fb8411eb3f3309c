//! Status reporter: provider tokens and session states to user-facing labels.

use crate::pairing_fsm::PairingState;

/// How the state machine reads a provider status token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// The channel is usable.
    Linked,
    /// The provider is still waiting for the device to pair.
    Pairing,
    /// Anything the provider may invent later.
    Unknown,
}

impl LinkStatus {
    pub fn from_token(token: &str) -> Self {
        match normalize(token).as_str() {
            "open" | "connected" => LinkStatus::Linked,
            "connecting" | "pairing" | "close" | "closed" => LinkStatus::Pairing,
            _ => LinkStatus::Unknown,
        }
    }
}

/// Map a provider status token onto its display label.
///
/// Total and deterministic: unrecognized tokens render as `status: <token>`.
pub fn status_label(token: &str) -> String {
    match normalize(token).as_str() {
        "close" | "closed" => "disconnected".to_string(),
        "connecting" => "connecting".to_string(),
        "open" | "connected" => "connected".to_string(),
        "pairing" => "pairing".to_string(),
        "timeout" => "timed out".to_string(),
        _ => format!("status: {token}"),
    }
}

/// Display label for an orchestrator state.
pub fn state_label(state: &PairingState) -> String {
    match state {
        PairingState::Idle => "disconnected".to_string(),
        PairingState::CreatingSession | PairingState::LinkPolling => "connecting".to_string(),
        PairingState::AwaitingPairing => "pairing".to_string(),
        PairingState::Verifying => "verifying".to_string(),
        PairingState::Connected => "connected".to_string(),
        PairingState::Expired(reason) => status_label(reason.as_str()),
        PairingState::Failed(reason) => format!("failed: {reason}"),
    }
}

fn normalize(token: &str) -> String {
    token.trim().to_ascii_lowercase()
}
