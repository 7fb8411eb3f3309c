//! Events emitted by the orchestrator and the notification sink boundary.

use crate::pairing_fsm::PairingState;
use chrono::{DateTime, Utc};
use evolution_provider_client::PairingCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Event delivered to connect subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PairingEvent {
    /// The session moved to a new state.
    StateChanged {
        channel_id: String,
        epoch: u64,
        from: PairingState,
        to: PairingState,
        attempt: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        pairing_code: Option<PairingCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        callback_url: Option<String>,
        label: String,
        at: DateTime<Utc>,
    },
    /// A link-status poll returned a provider token.
    PollObserved {
        channel_id: String,
        epoch: u64,
        attempt: u32,
        provider_status: String,
        label: String,
        at: DateTime<Utc>,
    },
}

impl PairingEvent {
    pub fn channel_id(&self) -> &str {
        match self {
            PairingEvent::StateChanged { channel_id, .. }
            | PairingEvent::PollObserved { channel_id, .. } => channel_id,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            PairingEvent::StateChanged { epoch, .. } | PairingEvent::PollObserved { epoch, .. } => {
                *epoch
            }
        }
    }

    /// The new state, for `StateChanged` events.
    pub fn new_state(&self) -> Option<PairingState> {
        match self {
            PairingEvent::StateChanged { to, .. } => Some(*to),
            PairingEvent::PollObserved { .. } => None,
        }
    }

    /// Whether this event ends its session.
    pub fn is_terminal(&self) -> bool {
        self.new_state().is_some_and(|state| state.is_terminal())
    }
}

/// Severity of a [`Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// Structured notification for the host's notification layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    /// Component tag, e.g. `provider` or `session`.
    pub source: String,
    pub message: String,
}

impl Notice {
    pub fn info(source: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, source, message)
    }

    pub fn warn(source: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warn, source, message)
    }

    pub fn error(source: &str, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, source, message)
    }

    fn new(level: NoticeLevel, source: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.to_string(),
            message: message.into(),
        }
    }
}

/// Receiver of orchestrator notices (toasts, log lines, files).
///
/// Called synchronously while session bookkeeping is locked, so
/// implementations must return quickly and must not call back into the
/// orchestrator.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Sink that forwards notices to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!(source = %notice.source, "{}", notice.message),
            NoticeLevel::Warn => warn!(source = %notice.source, "{}", notice.message),
            NoticeLevel::Error => error!(source = %notice.source, "{}", notice.message),
        }
    }
}
