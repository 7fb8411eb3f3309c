//! Channel pairing orchestrator.
//!
//! Provisions a messaging-channel session at the provider, walks it through
//! pairing-code linking and confirms the link before reporting `Connected`.
//!
//! - [`PairingOrchestrator`] owns one [`ConnectionSession`] per channel and
//!   drives it through the pairing machine in [`pairing_fsm`].
//! - [`PollScheduler`] runs the delayed link-status checks.
//! - [`status_label`] and [`state_label`] turn provider tokens and states
//!   into user-facing labels.
//! - Progress is delivered as [`PairingEvent`]s to subscribers and as
//!   [`Notice`]s to a [`NotificationSink`].

mod error;
mod events;
mod orchestrator;
pub mod pairing_fsm;
mod scheduler;
mod session;
mod status;
mod store;

#[cfg(test)]
mod tests;

pub use error::{FailureKind, PairingError, PairingResult};
pub use events::{Notice, NoticeLevel, NotificationSink, PairingEvent, TracingNotificationSink};
pub use orchestrator::{
    OrchestratorOptions, PairingOrchestrator, PairingOrchestratorBuilder, PairingSubscription,
};
pub use pairing_fsm::{ExpiryReason, FailureReason, PairingConfig, PairingState};
pub use scheduler::{PollScheduler, TokioPollScheduler};
pub use session::{channel_id_from_name, ConnectionSession, Transition};
pub use status::{state_label, status_label, LinkStatus};
pub use store::{AgentRecord, AgentStore, InMemoryAgentStore};
