//! Pairing state machine using rust-fsm.
//!
//! The machine only tracks which transitions are legal. Failure and expiry
//! reasons travel alongside it in [`PairingState`].
//!
//! ## State Diagram
//!
//! ```text
//! ┌─────────────────┐
//! │      Idle       │ (initial)
//! └────────┬────────┘
//!          │ ConnectRequested
//!          ▼
//! ┌─────────────────┐  CreateFailed / PairingCodeMissing
//! │ CreatingSession │ ─────────────────────────────────► Failed
//! └────────┬────────┘
//!          │ PairingCodeIssued
//!          ▼
//! ┌─────────────────┐
//! │ AwaitingPairing │
//! └────────┬────────┘
//!          │ PollScheduled
//!          ▼
//! ┌─────────────────┐  StillPairing (self)
//! │   LinkPolling   │ ─────────────────────────────────► Expired
//! └────────┬────────┘  PollCeilingReached
//!          │ Linked
//!          ▼
//! ┌─────────────────┐  CallbackRegistrationFailed / VerificationFailed
//! │    Verifying    │ ─────────────────────────────────► Failed
//! └────────┬────────┘
//!          │ Verified
//!          ▼
//!      Connected
//! ```
//!
//! `ProviderFailed` and `Cancelled` lead to `Failed` from every non-terminal
//! state that can observe them.

use crate::error::FailureKind;
use pairing_config_and_utils::PairingSettings;
use rust_fsm::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

state_machine! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub pairing_machine(Idle)

    Idle => {
        ConnectRequested => CreatingSession,
        Cancelled => Failed
    },
    CreatingSession => {
        PairingCodeIssued => AwaitingPairing,
        PairingCodeMissing => Failed,
        CreateFailed => Failed,
        ProviderFailed => Failed,
        Cancelled => Failed
    },
    AwaitingPairing => {
        PollScheduled => LinkPolling,
        PollCeilingReached => Expired,
        ProviderFailed => Failed,
        Cancelled => Failed
    },
    LinkPolling => {
        StillPairing => LinkPolling,
        Linked => Verifying,
        PollCeilingReached => Expired,
        ProviderFailed => Failed,
        Cancelled => Failed
    },
    Verifying => {
        Verified => Connected,
        CallbackRegistrationFailed => Failed,
        VerificationFailed => Failed,
        ProviderFailed => Failed,
        Cancelled => Failed
    }
}

pub use pairing_machine::Impl as PairingMachineImpl;
pub use pairing_machine::Input as PairingMachineInput;
pub use pairing_machine::State as PairingMachineState;
pub use pairing_machine::StateMachine as PairingMachine;

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CreateSessionExhausted,
    NoPairingCode,
    CallbackRegistrationFailed,
    PostLinkVerificationFailed,
    Unauthorized,
    ProviderUnavailable,
    ProviderRejected,
    ProtocolViolation,
    Cancelled,
    /// Replaced by a newer session for the same channel.
    Superseded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::CreateSessionExhausted => "create_session_exhausted",
            FailureReason::NoPairingCode => "no_pairing_code",
            FailureReason::CallbackRegistrationFailed => "callback_registration_failed",
            FailureReason::PostLinkVerificationFailed => "post_link_verification_failed",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::ProviderUnavailable => "provider_unavailable",
            FailureReason::ProviderRejected => "provider_rejected",
            FailureReason::ProtocolViolation => "protocol_violation",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Superseded => "superseded",
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FailureReason::CreateSessionExhausted | FailureReason::ProviderUnavailable => {
                FailureKind::TransientProviderError
            }
            FailureReason::NoPairingCode
            | FailureReason::CallbackRegistrationFailed
            | FailureReason::ProviderRejected
            | FailureReason::ProtocolViolation => FailureKind::ProtocolError,
            FailureReason::PostLinkVerificationFailed => FailureKind::DegradedSuccess,
            FailureReason::Unauthorized => FailureKind::Unauthorized,
            FailureReason::Cancelled | FailureReason::Superseded => FailureKind::Cancelled,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended in `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    Timeout,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryReason::Timeout => "timeout",
        }
    }
}

/// Session state for external consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum PairingState {
    Idle,
    CreatingSession,
    AwaitingPairing,
    LinkPolling,
    Verifying,
    Connected,
    Failed(FailureReason),
    Expired(ExpiryReason),
}

impl PairingState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingState::Connected | PairingState::Failed(_) | PairingState::Expired(_)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, PairingState::Connected)
    }

    /// Taxonomy entry for unsuccessful terminal states.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            PairingState::Failed(reason) => Some(reason.kind()),
            PairingState::Expired(_) => Some(FailureKind::Timeout),
            _ => None,
        }
    }

    /// Combine a machine state with the reason recorded for it.
    ///
    /// Returns `None` when a `Failed` machine state has no reason attached.
    pub(crate) fn from_machine(
        state: PairingMachineState,
        failure: Option<FailureReason>,
    ) -> Option<Self> {
        Some(match state {
            PairingMachineState::Idle => PairingState::Idle,
            PairingMachineState::CreatingSession => PairingState::CreatingSession,
            PairingMachineState::AwaitingPairing => PairingState::AwaitingPairing,
            PairingMachineState::LinkPolling => PairingState::LinkPolling,
            PairingMachineState::Verifying => PairingState::Verifying,
            PairingMachineState::Connected => PairingState::Connected,
            PairingMachineState::Failed => PairingState::Failed(failure?),
            PairingMachineState::Expired => PairingState::Expired(ExpiryReason::Timeout),
        })
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingState::Idle => f.write_str("idle"),
            PairingState::CreatingSession => f.write_str("creating_session"),
            PairingState::AwaitingPairing => f.write_str("awaiting_pairing"),
            PairingState::LinkPolling => f.write_str("link_polling"),
            PairingState::Verifying => f.write_str("verifying"),
            PairingState::Connected => f.write_str("connected"),
            PairingState::Failed(reason) => write!(f, "failed({reason})"),
            PairingState::Expired(reason) => write!(f, "expired({})", reason.as_str()),
        }
    }
}

/// Retry and timing policy for pairing sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingConfig {
    /// Total session-creation attempts before giving up.
    pub max_create_attempts: u32,
    /// Delay before the first link-status poll.
    pub initial_poll_delay: Duration,
    /// Delay between subsequent polls.
    pub poll_interval: Duration,
    /// Poll ceiling; reaching it expires the session.
    pub max_poll_attempts: u32,
    /// An active session without progress for this long may be superseded.
    pub stale_after: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self::from(&PairingSettings::default())
    }
}

impl From<&PairingSettings> for PairingConfig {
    fn from(settings: &PairingSettings) -> Self {
        Self {
            max_create_attempts: settings.max_create_attempts.max(1),
            initial_poll_delay: settings.units(settings.initial_poll_delay_units),
            poll_interval: settings.units(settings.poll_interval_units),
            max_poll_attempts: settings.max_poll_attempts.max(1),
            stale_after: settings.units(settings.stale_after_units),
        }
    }
}

impl PairingConfig {
    /// Longest time a session can spend polling before it expires.
    pub fn exposure_window(&self) -> Duration {
        let polls = self.max_poll_attempts.saturating_sub(1);
        self.initial_poll_delay + self.poll_interval * polls
    }
}
