//! The per-channel pairing session and its transition rules.

use crate::error::{PairingError, PairingResult};
use crate::pairing_fsm::{
    FailureReason, PairingMachineImpl, PairingMachineInput, PairingMachineState, PairingState,
};
use chrono::{DateTime, Utc};
use evolution_provider_client::PairingCode;
use rust_fsm::StateMachineImpl;
use tokio::time::Instant;
use tracing::debug;

/// Derive a channel id from an agent name.
///
/// Lowercases the name and collapses every run of non-alphanumeric
/// characters into a single `-`. Returns `None` when nothing is left.
pub fn channel_id_from_name(name: &str) -> Option<String> {
    let mut id = String::with_capacity(name.len());
    let mut pending_dash = false;

    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !id.is_empty() {
                id.push('-');
            }
            pending_dash = false;
            id.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// A state change applied to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PairingState,
    pub to: PairingState,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// One pairing attempt for one channel.
///
/// Only the orchestrator mutates sessions. Every mutation goes through the
/// pairing machine, which keeps these invariants:
/// - `pairing_code` is present only in `AwaitingPairing`
/// - `callback_url` is present only in `Verifying` and `Connected`
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    channel_id: String,
    agent_id: Option<i64>,
    epoch: u64,
    machine: PairingMachineState,
    state: PairingState,
    pairing_code: Option<PairingCode>,
    attempt: u32,
    create_attempt: u32,
    last_error: Option<String>,
    callback_url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_progress: Instant,
}

impl ConnectionSession {
    pub(crate) fn new(channel_id: impl Into<String>, agent_id: Option<i64>, epoch: u64) -> Self {
        let now = Utc::now();
        Self {
            channel_id: channel_id.into(),
            agent_id,
            epoch,
            machine: PairingMachineState::Idle,
            state: PairingState::Idle,
            pairing_code: None,
            attempt: 0,
            create_attempt: 0,
            last_error: None,
            callback_url: None,
            created_at: now,
            updated_at: now,
            last_progress: Instant::now(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn agent_id(&self) -> Option<i64> {
        self.agent_id
    }

    /// Identity of this session within its channel. Increases every time the
    /// channel gets a new session.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn pairing_code(&self) -> Option<&PairingCode> {
        self.pairing_code.as_ref()
    }

    /// Status polls performed in the current polling phase.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn create_attempt(&self) -> u32 {
        self.create_attempt
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn callback_url(&self) -> Option<&str> {
        self.callback_url.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Time since the session last made progress.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_progress.elapsed()
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && !self.is_terminal()
    }

    pub(crate) fn record_create_attempt(&mut self) -> u32 {
        self.create_attempt += 1;
        self.touch();
        self.create_attempt
    }

    pub(crate) fn record_poll(&mut self) -> u32 {
        self.attempt += 1;
        self.touch();
        self.attempt
    }

    pub(crate) fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
        self.updated_at = Utc::now();
    }

    pub(crate) fn begin(&mut self) -> PairingResult<Transition> {
        self.create_attempt = 0;
        self.apply(&PairingMachineInput::ConnectRequested, None)
    }

    pub(crate) fn issue_pairing_code(&mut self, code: PairingCode) -> PairingResult<Transition> {
        let transition = self.apply(&PairingMachineInput::PairingCodeIssued, None)?;
        self.pairing_code = Some(code);
        Ok(transition)
    }

    pub(crate) fn start_polling(&mut self) -> PairingResult<Transition> {
        let transition = self.apply(&PairingMachineInput::PollScheduled, None)?;
        self.attempt = 0;
        Ok(transition)
    }

    pub(crate) fn still_pairing(&mut self) -> PairingResult<Transition> {
        self.apply(&PairingMachineInput::StillPairing, None)
    }

    pub(crate) fn linked(&mut self, callback_url: impl Into<String>) -> PairingResult<Transition> {
        let transition = self.apply(&PairingMachineInput::Linked, None)?;
        self.callback_url = Some(callback_url.into());
        Ok(transition)
    }

    pub(crate) fn verified(&mut self) -> PairingResult<Transition> {
        self.apply(&PairingMachineInput::Verified, None)
    }

    pub(crate) fn expire(&mut self) -> PairingResult<Transition> {
        let transition = self.apply(&PairingMachineInput::PollCeilingReached, None)?;
        self.last_error = Some("timeout".to_string());
        Ok(transition)
    }

    /// Move to `Failed(reason)` using the machine input that matches the
    /// reason and the current state.
    pub(crate) fn fail(&mut self, reason: FailureReason) -> PairingResult<Transition> {
        let input = match reason {
            FailureReason::Cancelled | FailureReason::Superseded => PairingMachineInput::Cancelled,
            FailureReason::NoPairingCode => PairingMachineInput::PairingCodeMissing,
            FailureReason::CreateSessionExhausted => PairingMachineInput::CreateFailed,
            FailureReason::CallbackRegistrationFailed => {
                PairingMachineInput::CallbackRegistrationFailed
            }
            FailureReason::PostLinkVerificationFailed => PairingMachineInput::VerificationFailed,
            _ => PairingMachineInput::ProviderFailed,
        };

        let transition = self.apply(&input, Some(reason))?;
        if self.last_error.is_none() {
            self.last_error = Some(reason.as_str().to_string());
        }
        Ok(transition)
    }

    fn apply(
        &mut self,
        input: &PairingMachineInput,
        failure: Option<FailureReason>,
    ) -> PairingResult<Transition> {
        let next = PairingMachineImpl::transition(&self.machine, input).ok_or_else(|| {
            PairingError::InvalidTransition(format!(
                "Cannot apply {:?} in state {:?}",
                input, self.machine
            ))
        })?;
        let state = PairingState::from_machine(next, failure).ok_or_else(|| {
            PairingError::InvalidTransition(format!("{input:?} needs a failure reason"))
        })?;

        let from = self.state;
        self.machine = next;
        self.state = state;

        if next != PairingMachineState::AwaitingPairing {
            self.pairing_code = None;
        }
        if !matches!(
            next,
            PairingMachineState::Verifying | PairingMachineState::Connected
        ) {
            self.callback_url = None;
        }
        if !matches!(next, PairingMachineState::Failed) {
            self.last_error = None;
        }
        self.touch();

        if from != state {
            debug!(
                channel_id = %self.channel_id,
                epoch = self.epoch,
                old_state = %from,
                new_state = %state,
                "Pairing state transition"
            );
        }

        Ok(Transition { from, to: state })
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.last_progress = Instant::now();
    }
}
