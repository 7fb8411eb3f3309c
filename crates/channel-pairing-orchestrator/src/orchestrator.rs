//! Pairing orchestrator: drives one [`ConnectionSession`] per channel.
//!
//! Each channel runs a single cooperative chain of steps. A step holds the
//! session lock only to read or commit state, never across a provider call.
//! Every commit first checks that the session still has the epoch the step
//! started with and is not terminal; results for cancelled or superseded
//! sessions are dropped.

use crate::error::{PairingError, PairingResult};
use crate::events::{Notice, NoticeLevel, NotificationSink, PairingEvent, TracingNotificationSink};
use crate::pairing_fsm::{FailureReason, PairingConfig, PairingState};
use crate::scheduler::{PollScheduler, TokioPollScheduler};
use crate::session::{channel_id_from_name, ConnectionSession, Transition};
use crate::status::{state_label, status_label, LinkStatus};
use crate::store::AgentStore;
use chrono::Utc;
use evolution_provider_client::{CallbackRegistration, PairingCode, ProviderClient, ProviderError};
use futures_util::future::BoxFuture;
use pairing_config_and_utils::{Config, DEFAULT_CALLBACK_BASE_URL, DEFAULT_EVENT_TYPES};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Buffered events per channel before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 128;

/// Path under the callback base URL that receives provider events.
const CALLBACK_ROUTE: &str = "api/wpp/webhook";

/// Settings the orchestrator needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub pairing: PairingConfig,
    /// Public base URL the provider calls back into.
    pub callback_base_url: String,
    /// Provider event types to subscribe the callback to.
    pub event_types: Vec<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            pairing: PairingConfig::default(),
            callback_base_url: DEFAULT_CALLBACK_BASE_URL.to_string(),
            event_types: DEFAULT_EVENT_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pairing: PairingConfig::from(&config.pairing),
            callback_base_url: config.callback_base_url.clone(),
            event_types: config.event_types.clone(),
        }
    }

    /// Callback endpoint registered for a channel.
    pub fn callback_url_for(&self, channel_id: &str) -> String {
        format!(
            "{}/{}/{}",
            self.callback_base_url.trim_end_matches('/'),
            CALLBACK_ROUTE,
            channel_id
        )
    }
}

/// Stream of events for one connect request.
pub struct PairingSubscription {
    channel_id: String,
    epoch: u64,
    pairing_code: Option<PairingCode>,
    receiver: broadcast::Receiver<PairingEvent>,
}

impl PairingSubscription {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Epoch of the session this subscription was handed out for.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Pairing code already issued to the session when this subscription
    /// joined it.
    ///
    /// Set only when a connect reused a session that is past
    /// `AwaitingPairing`; fresh sessions deliver the code in their
    /// `AwaitingPairing` event instead.
    pub fn pairing_code(&self) -> Option<&PairingCode> {
        self.pairing_code.as_ref()
    }

    /// Next event for the channel, or `None` once the channel is dropped.
    ///
    /// Includes events of later sessions on the same channel.
    pub async fn next(&mut self) -> Option<PairingEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel_id = %self.channel_id,
                        skipped,
                        "Pairing subscriber lagged, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for this subscription's session to reach a terminal state.
    pub async fn wait_for_terminal(&mut self) -> Option<PairingState> {
        while let Some(event) = self.next().await {
            if event.epoch() != self.epoch {
                continue;
            }
            if let Some(state) = event.new_state().filter(PairingState::is_terminal) {
                return Some(state);
            }
        }
        None
    }
}

struct ChannelSlot {
    session: ConnectionSession,
    events: broadcast::Sender<PairingEvent>,
    /// Last code issued to the current session. The session itself drops the
    /// code once it leaves `AwaitingPairing`.
    issued_code: Option<PairingCode>,
}

impl ChannelSlot {
    /// Apply a session transition and publish it when the state changed.
    fn transition<F>(&mut self, sink: &dyn NotificationSink, apply: F) -> Option<PairingState>
    where
        F: FnOnce(&mut ConnectionSession) -> PairingResult<Transition>,
    {
        match apply(&mut self.session) {
            Ok(transition) => {
                if transition.changed() {
                    self.publish_transition(sink, transition);
                }
                Some(transition.to)
            }
            Err(e) => {
                warn!(
                    channel_id = %self.session.channel_id(),
                    error = %e,
                    "Rejected pairing transition"
                );
                None
            }
        }
    }

    fn publish_transition(&mut self, sink: &dyn NotificationSink, transition: Transition) {
        let to = transition.to;
        if let Some(code) = self.session.pairing_code() {
            self.issued_code = Some(code.clone());
        }
        let session = &self.session;

        let level = match to {
            PairingState::Failed(FailureReason::Cancelled | FailureReason::Superseded) => {
                NoticeLevel::Info
            }
            PairingState::Failed(FailureReason::PostLinkVerificationFailed)
            | PairingState::Expired(_) => NoticeLevel::Warn,
            PairingState::Failed(_) => NoticeLevel::Error,
            _ => NoticeLevel::Info,
        };
        let mut message = format!(
            "{}: {} -> {}",
            session.channel_id(),
            transition.from,
            to
        );
        if to.failure_kind().is_some() {
            if let Some(error) = session.last_error() {
                message.push_str(&format!(" ({error})"));
            }
        }
        sink.notify(Notice {
            level,
            source: "session".to_string(),
            message,
        });

        self.publish(PairingEvent::StateChanged {
            channel_id: session.channel_id().to_string(),
            epoch: session.epoch(),
            from: transition.from,
            to,
            attempt: session.attempt(),
            pairing_code: session.pairing_code().cloned(),
            callback_url: session.callback_url().map(str::to_string),
            label: state_label(&to),
            at: Utc::now(),
        });
    }

    fn publish(&self, event: PairingEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// What a poll tick decided.
enum PollOutcome {
    Continue,
    Verify,
    Stop,
}

struct Inner {
    provider: Arc<dyn ProviderClient>,
    store: Arc<dyn AgentStore>,
    sink: Arc<dyn NotificationSink>,
    scheduler: Arc<dyn PollScheduler>,
    options: OrchestratorOptions,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    next_epoch: AtomicU64,
}

/// Builder for [`PairingOrchestrator`].
pub struct PairingOrchestratorBuilder {
    provider: Arc<dyn ProviderClient>,
    store: Arc<dyn AgentStore>,
    options: OrchestratorOptions,
    sink: Arc<dyn NotificationSink>,
    scheduler: Arc<dyn PollScheduler>,
}

impl PairingOrchestratorBuilder {
    pub fn options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn PollScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn build(self) -> PairingOrchestrator {
        PairingOrchestrator {
            inner: Arc::new(Inner {
                provider: self.provider,
                store: self.store,
                sink: self.sink,
                scheduler: self.scheduler,
                options: self.options,
                channels: Mutex::new(HashMap::new()),
                next_epoch: AtomicU64::new(0),
            }),
        }
    }
}

/// Orchestrates channel pairing sessions.
///
/// Cheap to clone; clones share sessions.
#[derive(Clone)]
pub struct PairingOrchestrator {
    inner: Arc<Inner>,
}

impl PairingOrchestrator {
    /// Start building an orchestrator with default options, the tracing sink
    /// and the tokio scheduler.
    pub fn builder(
        provider: Arc<dyn ProviderClient>,
        store: Arc<dyn AgentStore>,
    ) -> PairingOrchestratorBuilder {
        PairingOrchestratorBuilder {
            provider,
            store,
            options: OrchestratorOptions::default(),
            sink: Arc::new(TracingNotificationSink),
            scheduler: Arc::new(TokioPollScheduler),
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.inner.options
    }

    /// Connect a channel.
    ///
    /// Reuses the active session for the channel when there is one, so a
    /// channel never runs two polling chains. A session that made no
    /// progress for `stale_after` is superseded by a fresh one.
    ///
    /// A reused session may already have published its pairing code; the
    /// returned subscription then carries it in
    /// [`PairingSubscription::pairing_code`].
    pub fn connect(&self, channel_id: &str) -> PairingResult<PairingSubscription> {
        let channel_id = channel_id.trim();
        if channel_id.is_empty() {
            return Err(PairingError::InvalidChannelId(channel_id.to_string()));
        }
        Ok(self.start(channel_id, None))
    }

    /// Connect the channel owned by an agent in the record store.
    pub async fn connect_agent(&self, agent_id: i64) -> PairingResult<PairingSubscription> {
        let agent = self
            .inner
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(PairingError::AgentNotFound(agent_id))?;
        let channel_id = channel_id_from_name(&agent.name)
            .ok_or_else(|| PairingError::InvalidChannelId(agent.name.clone()))?;

        Ok(self.start(&channel_id, Some(agent.id)))
    }

    /// Cancel the active session for a channel.
    ///
    /// Returns `false` when there is nothing to cancel.
    pub fn cancel(&self, channel_id: &str) -> bool {
        let inner = &self.inner;
        let mut channels = inner.lock_channels();
        let Some(slot) = channels.get_mut(channel_id) else {
            return false;
        };
        if slot.session.is_terminal() {
            return false;
        }

        info!(channel_id, epoch = slot.session.epoch(), "Cancelling pairing session");
        slot.transition(inner.sink.as_ref(), |s| s.fail(FailureReason::Cancelled))
            .is_some()
    }

    /// Cancel any active session, log the channel out at the provider and
    /// clear the agent's connected flag.
    pub async fn disconnect(&self, channel_id: &str) -> PairingResult<()> {
        let inner = &self.inner;
        self.cancel(channel_id);

        let (epoch, agent_id) = match self.snapshot(channel_id) {
            Some(session) => (Some(session.epoch()), session.agent_id()),
            None => (None, None),
        };

        if let Err(e) = inner.provider.logout_session(channel_id).await {
            inner.sink.notify(Notice::error(
                "provider",
                format!("{channel_id}: logout failed: {e}"),
            ));
            return Err(e.into());
        }

        if let Some(agent_id) = agent_id {
            inner.store.set_connected(agent_id, false).await?;
        }

        {
            let mut channels = inner.lock_channels();
            if channels
                .get(channel_id)
                .is_some_and(|slot| Some(slot.session.epoch()) == epoch)
            {
                channels.remove(channel_id);
            }
        }

        inner
            .sink
            .notify(Notice::info("session", format!("{channel_id}: disconnected")));
        Ok(())
    }

    /// Current session for a channel, terminal or not.
    pub fn snapshot(&self, channel_id: &str) -> Option<ConnectionSession> {
        self.inner
            .lock_channels()
            .get(channel_id)
            .map(|slot| slot.session.clone())
    }

    /// All known sessions, ordered by channel id.
    pub fn sessions(&self) -> Vec<ConnectionSession> {
        let mut sessions: Vec<_> = self
            .inner
            .lock_channels()
            .values()
            .map(|slot| slot.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.channel_id().cmp(b.channel_id()));
        sessions
    }

    fn start(&self, channel_id: &str, agent_id: Option<i64>) -> PairingSubscription {
        let inner = &self.inner;
        let sink = inner.sink.as_ref();
        let mut channels = inner.lock_channels();

        let mut previous_agent = None;
        if let Some(slot) = channels.get_mut(channel_id) {
            previous_agent = slot.session.agent_id();
            if !slot.session.is_terminal() {
                let idle_for = slot.session.idle_for();
                if idle_for < inner.options.pairing.stale_after {
                    debug!(
                        channel_id,
                        epoch = slot.session.epoch(),
                        "Reusing active pairing session"
                    );
                    return PairingSubscription {
                        channel_id: channel_id.to_string(),
                        epoch: slot.session.epoch(),
                        pairing_code: slot.issued_code.clone(),
                        receiver: slot.events.subscribe(),
                    };
                }

                sink.notify(Notice::warn(
                    "session",
                    format!(
                        "{channel_id}: superseding session without progress for {}s",
                        idle_for.as_secs()
                    ),
                ));
                slot.transition(sink, |s| s.fail(FailureReason::Superseded));
            }
        }

        let epoch = inner.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let events = channels
            .get(channel_id)
            .map(|slot| slot.events.clone())
            .unwrap_or_else(|| broadcast::channel(EVENT_CAPACITY).0);
        let receiver = events.subscribe();

        let mut slot = ChannelSlot {
            session: ConnectionSession::new(channel_id, agent_id.or(previous_agent), epoch),
            events,
            issued_code: None,
        };
        info!(
            channel_id,
            epoch,
            exposure_secs = inner.options.pairing.exposure_window().as_secs(),
            "Starting pairing session"
        );
        slot.transition(sink, ConnectionSession::begin);
        channels.insert(channel_id.to_string(), slot);
        drop(channels);

        inner
            .scheduler
            .schedule(Duration::ZERO, Inner::creation_task(inner, channel_id, epoch));

        PairingSubscription {
            channel_id: channel_id.to_string(),
            epoch,
            pairing_code: None,
            receiver,
        }
    }
}

impl Inner {
    fn lock_channels(&self) -> MutexGuard<'_, HashMap<String, ChannelSlot>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the channel's slot if it still holds the active
    /// session for `epoch`. Returns `None` for stale steps.
    fn update<R>(
        &self,
        channel_id: &str,
        epoch: u64,
        f: impl FnOnce(&mut ChannelSlot, &dyn NotificationSink) -> R,
    ) -> Option<R> {
        let mut channels = self.lock_channels();
        match channels.get_mut(channel_id) {
            Some(slot) if slot.session.is_current(epoch) => Some(f(slot, self.sink.as_ref())),
            _ => {
                debug!(channel_id, epoch, "Discarding stale pairing step");
                None
            }
        }
    }

    fn is_current(&self, channel_id: &str, epoch: u64) -> bool {
        self.update(channel_id, epoch, |_, _| ()).is_some()
    }

    fn creation_task(self: &Arc<Self>, channel_id: &str, epoch: u64) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        let channel_id = channel_id.to_string();
        Box::pin(async move { inner.run_creation(channel_id, epoch).await })
    }

    fn poll_task(self: &Arc<Self>, channel_id: &str, epoch: u64) -> BoxFuture<'static, ()> {
        let inner = Arc::clone(self);
        let channel_id = channel_id.to_string();
        Box::pin(async move { inner.run_poll(channel_id, epoch).await })
    }

    fn schedule_poll(self: &Arc<Self>, channel_id: &str, epoch: u64, delay: Duration) {
        debug!(
            channel_id,
            epoch,
            delay_ms = delay.as_millis() as u64,
            "Scheduling link-status poll"
        );
        self.scheduler
            .schedule(delay, self.poll_task(channel_id, epoch));
    }

    /// `CreatingSession`: create or recover the provider session, then fetch
    /// the pairing code.
    async fn run_creation(self: Arc<Self>, channel_id: String, epoch: u64) {
        let max_attempts = self.options.pairing.max_create_attempts;
        let callback_url = self.options.callback_url_for(&channel_id);

        loop {
            let Some(attempt) = self.update(&channel_id, epoch, |slot, _| {
                slot.session.record_create_attempt()
            }) else {
                return;
            };

            debug!(channel_id = %channel_id, attempt, "Creating provider session");
            let result = self
                .provider
                .create_or_recover_session(&channel_id, Some(&callback_url), &self.options.event_types)
                .await;

            let created = self.update(&channel_id, epoch, |slot, sink| match result {
                Ok(created) => {
                    let how = if created.recreated {
                        "recreated"
                    } else if created.recovered {
                        "recovered"
                    } else {
                        "created"
                    };
                    sink.notify(Notice::info(
                        "provider",
                        format!("{channel_id}: session {how} on attempt {attempt}"),
                    ));
                    Some(true)
                }
                Err(err) => {
                    slot.session.record_error(err.to_string());
                    let reason = if err.is_unauthorized() {
                        Some(FailureReason::Unauthorized)
                    } else if attempt >= max_attempts {
                        Some(FailureReason::CreateSessionExhausted)
                    } else {
                        None
                    };

                    match reason {
                        Some(reason) => {
                            sink.notify(Notice::error(
                                "provider",
                                format!("{channel_id}: create session failed: {err}"),
                            ));
                            slot.transition(sink, |s| s.fail(reason));
                            None
                        }
                        None => {
                            sink.notify(Notice::warn(
                                "provider",
                                format!(
                                    "{channel_id}: create session attempt {attempt}/{max_attempts} failed: {err}"
                                ),
                            ));
                            Some(false)
                        }
                    }
                }
            });

            match created.flatten() {
                Some(true) => break,
                Some(false) => continue,
                None => return,
            }
        }

        if !self.is_current(&channel_id, epoch) {
            return;
        }
        let result = self.provider.fetch_pairing_code(&channel_id).await;

        let state = self.update(&channel_id, epoch, |slot, sink| -> Option<PairingState> {
            match result {
                Ok(Some(code)) => {
                    sink.notify(Notice::info(
                        "provider",
                        format!("{channel_id}: pairing code issued"),
                    ));
                    slot.transition(sink, |s| s.issue_pairing_code(code))?;
                    slot.transition(sink, ConnectionSession::start_polling)
                }
                Ok(None) => {
                    sink.notify(Notice::error(
                        "provider",
                        format!("{channel_id}: provider returned no pairing code"),
                    ));
                    slot.transition(sink, |s| s.fail(FailureReason::NoPairingCode))
                }
                Err(err) => {
                    sink.notify(Notice::error(
                        "provider",
                        format!("{channel_id}: fetch pairing code failed: {err}"),
                    ));
                    slot.session.record_error(err.to_string());
                    slot.transition(sink, |s| s.fail(failure_reason(&err)))
                }
            }
        });

        if state.flatten() == Some(PairingState::LinkPolling) {
            self.schedule_poll(&channel_id, epoch, self.options.pairing.initial_poll_delay);
        }
    }

    /// One `LinkPolling` tick.
    async fn run_poll(self: Arc<Self>, channel_id: String, epoch: u64) {
        let Some(attempt) = self.update(&channel_id, epoch, |slot, _| slot.session.record_poll())
        else {
            return;
        };

        let result = self.provider.fetch_session_state(&channel_id).await;

        let outcome = self.update(&channel_id, epoch, |slot, sink| {
            self.observe_poll(slot, sink, attempt, result)
        });

        match outcome {
            Some(PollOutcome::Continue) => {
                self.schedule_poll(&channel_id, epoch, self.options.pairing.poll_interval)
            }
            Some(PollOutcome::Verify) => self.run_verification(&channel_id, epoch).await,
            Some(PollOutcome::Stop) | None => {}
        }
    }

    fn observe_poll(
        &self,
        slot: &mut ChannelSlot,
        sink: &dyn NotificationSink,
        attempt: u32,
        result: Result<String, ProviderError>,
    ) -> PollOutcome {
        let channel_id = slot.session.channel_id().to_string();
        let max_attempts = self.options.pairing.max_poll_attempts;

        let token = match result {
            Ok(token) => token,
            Err(err) if err.is_transient() && !err.is_unauthorized() => {
                slot.session.record_error(err.to_string());
                sink.notify(Notice::warn(
                    "provider",
                    format!("{channel_id}: status poll {attempt} failed: {err}"),
                ));
                return self.continue_or_expire(slot, sink, attempt, max_attempts);
            }
            Err(err) => {
                sink.notify(Notice::error(
                    "provider",
                    format!("{channel_id}: status poll {attempt} failed: {err}"),
                ));
                slot.session.record_error(err.to_string());
                slot.transition(sink, |s| s.fail(failure_reason(&err)));
                return PollOutcome::Stop;
            }
        };

        let label = status_label(&token);
        debug!(channel_id = %channel_id, attempt, status = %token, label = %label, "Link status observed");
        slot.publish(PairingEvent::PollObserved {
            channel_id: channel_id.clone(),
            epoch: slot.session.epoch(),
            attempt,
            provider_status: token.clone(),
            label,
            at: Utc::now(),
        });

        match LinkStatus::from_token(&token) {
            LinkStatus::Linked => {
                let callback_url = self.options.callback_url_for(&channel_id);
                match slot.transition(sink, |s| s.linked(callback_url)) {
                    Some(_) => PollOutcome::Verify,
                    None => PollOutcome::Stop,
                }
            }
            LinkStatus::Pairing => {
                slot.transition(sink, ConnectionSession::still_pairing);
                self.continue_or_expire(slot, sink, attempt, max_attempts)
            }
            LinkStatus::Unknown => {
                sink.notify(Notice::warn(
                    "provider",
                    format!("{channel_id}: unrecognized status token {token:?}"),
                ));
                self.continue_or_expire(slot, sink, attempt, max_attempts)
            }
        }
    }

    fn continue_or_expire(
        &self,
        slot: &mut ChannelSlot,
        sink: &dyn NotificationSink,
        attempt: u32,
        max_attempts: u32,
    ) -> PollOutcome {
        if attempt >= max_attempts {
            slot.transition(sink, ConnectionSession::expire);
            PollOutcome::Stop
        } else {
            PollOutcome::Continue
        }
    }

    /// `Verifying`: register the callback once, then independently re-read
    /// the session state and the registered callback.
    async fn run_verification(&self, channel_id: &str, epoch: u64) {
        let Some(Some(callback_url)) = self.update(channel_id, epoch, |slot, _| {
            slot.session.callback_url().map(str::to_string)
        }) else {
            return;
        };

        let registration = self
            .provider
            .register_callback(channel_id, &callback_url, &self.options.event_types)
            .await;

        let registered = self.update(channel_id, epoch, |slot, sink| match registration {
            Ok(CallbackRegistration::Registered) => {
                sink.notify(Notice::info(
                    "provider",
                    format!("{channel_id}: callback registered at {callback_url}"),
                ));
                true
            }
            Ok(CallbackRegistration::Rejected(message)) => {
                sink.notify(Notice::error(
                    "provider",
                    format!("{channel_id}: callback registration rejected: {message}"),
                ));
                slot.session.record_error(message);
                slot.transition(sink, |s| s.fail(FailureReason::CallbackRegistrationFailed));
                false
            }
            Err(err) => {
                sink.notify(Notice::error(
                    "provider",
                    format!("{channel_id}: callback registration failed: {err}"),
                ));
                slot.session.record_error(err.to_string());
                let reason = if err.is_unauthorized() {
                    FailureReason::Unauthorized
                } else {
                    FailureReason::CallbackRegistrationFailed
                };
                slot.transition(sink, |s| s.fail(reason));
                false
            }
        });
        if registered != Some(true) {
            return;
        }

        let mut problems = Vec::new();
        let mut unauthorized = false;

        if !self.is_current(channel_id, epoch) {
            return;
        }
        match self.provider.fetch_session_state(channel_id).await {
            Ok(token) if LinkStatus::from_token(&token) == LinkStatus::Linked => {}
            Ok(token) => problems.push(format!("status re-read reported {token:?}")),
            Err(err) => {
                unauthorized |= err.is_unauthorized();
                problems.push(format!("status re-read failed: {err}"));
            }
        }

        if !self.is_current(channel_id, epoch) {
            return;
        }
        match self.provider.fetch_callback(channel_id).await {
            Ok(Some(status)) if status.matches(&callback_url) => {}
            Ok(Some(status)) => problems.push(format!(
                "callback re-read reported {} (enabled: {})",
                status.url, status.enabled
            )),
            Ok(None) => problems.push("callback re-read found no callback".to_string()),
            Err(err) => {
                unauthorized |= err.is_unauthorized();
                problems.push(format!("callback re-read failed: {err}"));
            }
        }

        let connected_agent = self.update(channel_id, epoch, |slot, sink| -> Option<Option<i64>> {
            if problems.is_empty() {
                slot.transition(sink, ConnectionSession::verified)?;
                return Some(slot.session.agent_id());
            }

            let detail = problems.join("; ");
            slot.session.record_error(detail.clone());
            if unauthorized {
                slot.transition(sink, |s| s.fail(FailureReason::Unauthorized));
            } else {
                sink.notify(Notice::warn(
                    "session",
                    format!("{channel_id}: linked but verification failed: {detail}"),
                ));
                slot.transition(sink, |s| s.fail(FailureReason::PostLinkVerificationFailed));
            }
            None
        });

        if let Some(Some(Some(agent_id))) = connected_agent {
            if let Err(e) = self.store.set_connected(agent_id, true).await {
                warn!(channel_id, agent_id, error = %e, "Failed to persist connected flag");
                self.sink.notify(Notice::warn(
                    "store",
                    format!("{channel_id}: connected, but saving agent {agent_id} failed: {e}"),
                ));
            }
        }
    }
}

fn failure_reason(err: &ProviderError) -> FailureReason {
    match err {
        _ if err.is_unauthorized() => FailureReason::Unauthorized,
        _ if err.is_transient() => FailureReason::ProviderUnavailable,
        ProviderError::Rejected { .. } => FailureReason::ProviderRejected,
        _ => FailureReason::ProtocolViolation,
    }
}
