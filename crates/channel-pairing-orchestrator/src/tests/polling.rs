//! Link-status polling: tick timing, the poll ceiling and token handling.

use super::harness::{
    assert_offset, collect_until_terminal, options_with, poll_events, protocol, unauthorized,
    unavailable, Op, TestHarness,
};
use crate::{ExpiryReason, FailureReason, NoticeLevel, PairingEvent, PairingState};
use evolution_provider_client::ProviderError;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn ticks_follow_configured_delays() {
    let options = options_with(|pairing| {
        pairing.initial_poll_delay = Duration::from_secs(2);
        pairing.poll_interval = Duration::from_secs(3);
        pairing.max_poll_attempts = 4;
    });
    let harness = TestHarness::with_options("connecting", options);

    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Expired(ExpiryReason::Timeout))
    );

    let offsets = harness.provider.offsets(Op::State);
    assert_eq!(offsets.len(), 4);
    for (offset, expected) in offsets.iter().zip([2, 5, 8, 11]) {
        assert_offset(*offset, Duration::from_secs(expected));
    }
}

#[tokio::test(start_paused = true)]
async fn each_tick_is_scheduled_one_shot() {
    let options = options_with(|pairing| pairing.max_poll_attempts = 3);
    let harness = TestHarness::with_options("connecting", options);

    let mut sub = harness.connect("sales-bot");
    sub.wait_for_terminal().await;

    // Creation step, first poll, then one reschedule per non-final tick.
    assert_eq!(
        harness.scheduler.delays(),
        vec![
            Duration::ZERO,
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(10),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn ceiling_of_one_expires_after_first_poll() {
    let options = options_with(|pairing| pairing.max_poll_attempts = 1);
    let harness = TestHarness::with_options("closed", options);

    let mut sub = harness.connect("sales-bot");
    let events = collect_until_terminal(&mut sub).await;

    assert_eq!(poll_events(&events).len(), 1);
    assert_eq!(
        events.last().and_then(PairingEvent::new_state),
        Some(PairingState::Expired(ExpiryReason::Timeout))
    );
    assert_eq!(harness.orchestrator.snapshot("sales-bot").unwrap().attempt(), 1);
}

#[tokio::test(start_paused = true)]
async fn linked_on_last_allowed_poll_still_connects() {
    let options = options_with(|pairing| pairing.max_poll_attempts = 2);
    let harness = TestHarness::with_options("open", options);
    harness.provider.push_states(&["connecting", "open"]);

    let mut sub = harness.connect("sales-bot");
    assert_eq!(sub.wait_for_terminal().await, Some(PairingState::Connected));
}

#[tokio::test(start_paused = true)]
async fn unknown_token_keeps_polling_with_warning() {
    let harness = TestHarness::new("open");
    harness.provider.push_states(&["refused"]);

    let mut sub = harness.connect("sales-bot");
    let events = collect_until_terminal(&mut sub).await;

    assert_eq!(
        events.last().and_then(PairingEvent::new_state),
        Some(PairingState::Connected)
    );
    let first_poll = poll_events(&events)[0].clone();
    match first_poll {
        PairingEvent::PollObserved { label, .. } => assert_eq!(label, "status: refused"),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(harness
        .sink
        .has(NoticeLevel::Warn, "provider", "unrecognized status token"));
}

#[tokio::test(start_paused = true)]
async fn transient_poll_error_consumes_a_tick() {
    let harness = TestHarness::new("open");
    harness.provider.push_state_error(unavailable());

    let mut sub = harness.connect("sales-bot");
    let events = collect_until_terminal(&mut sub).await;

    assert_eq!(
        events.last().and_then(PairingEvent::new_state),
        Some(PairingState::Connected)
    );
    // The failed read emits no poll event but still counts as an attempt.
    assert_eq!(poll_events(&events).len(), 1);
    assert_eq!(harness.orchestrator.snapshot("sales-bot").unwrap().attempt(), 2);
    assert!(harness
        .sink
        .has(NoticeLevel::Warn, "provider", "status poll 1 failed"));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_up_to_the_ceiling_expire() {
    let options = options_with(|pairing| pairing.max_poll_attempts = 3);
    let harness = TestHarness::with_options("open", options);
    for _ in 0..3 {
        harness.provider.push_state_error(unavailable());
    }

    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Expired(ExpiryReason::Timeout))
    );
    assert_eq!(harness.provider.count(Op::State), 3);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_poll_fails_immediately() {
    let harness = TestHarness::new("connecting");
    harness.provider.push_states(&["connecting"]);
    harness.provider.push_state_error(unauthorized());

    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Failed(FailureReason::Unauthorized))
    );

    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(harness.provider.count(Op::State), 2);
}

#[tokio::test(start_paused = true)]
async fn protocol_and_rejection_errors_are_terminal() {
    let harness = TestHarness::new("connecting");
    harness.provider.push_state_error(protocol());

    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Failed(FailureReason::ProtocolViolation))
    );

    harness.provider.push_state_error(ProviderError::Rejected {
        status: 404,
        message: "instance does not exist".to_string(),
    });
    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Failed(FailureReason::ProviderRejected))
    );
    let session = harness.orchestrator.snapshot("sales-bot").unwrap();
    assert!(session.last_error().unwrap().contains("instance does not exist"));
}
