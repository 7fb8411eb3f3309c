//! Session creation and pairing-code fetch.

use super::harness::{
    assert_offset, protocol, unauthorized, unavailable, Op, TestHarness,
};
use crate::{FailureKind, FailureReason, NoticeLevel, PairingState};
use evolution_provider_client::SessionCreated;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn recreated_on_second_attempt_counts_as_success() {
    let harness = TestHarness::new("open");
    harness.provider.push_create(Err(unavailable()));
    harness.provider.push_create(Ok(SessionCreated {
        recreated: true,
        recovered: false,
    }));

    let mut sub = harness.connect("sales-bot");
    assert_eq!(sub.wait_for_terminal().await, Some(PairingState::Connected));

    assert_eq!(harness.provider.count(Op::Create), 2);
    let session = harness.orchestrator.snapshot("sales-bot").unwrap();
    assert_eq!(session.create_attempt(), 2);

    assert!(harness
        .sink
        .has(NoticeLevel::Warn, "provider", "attempt 1/2 failed"));
    assert!(harness
        .sink
        .has(NoticeLevel::Info, "provider", "session recreated on attempt 2"));
}

#[tokio::test(start_paused = true)]
async fn create_attempts_run_back_to_back() {
    let harness = TestHarness::new("open");
    harness.provider.push_create(Err(unavailable()));

    let mut sub = harness.connect("sales-bot");
    sub.wait_for_terminal().await;

    let offsets = harness.provider.offsets(Op::Create);
    assert_eq!(offsets.len(), 2);
    assert_offset(offsets[0], Duration::ZERO);
    assert_offset(offsets[1], Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn exhausting_create_attempts_fails() {
    let harness = TestHarness::new("open");
    harness.provider.push_create(Err(unavailable()));
    harness.provider.push_create(Err(unavailable()));
    // Would succeed on a third attempt, which must never happen.
    harness.provider.push_create(Ok(SessionCreated::default()));

    let mut sub = harness.connect("sales-bot");
    let final_state = sub.wait_for_terminal().await.unwrap();

    assert_eq!(
        final_state,
        PairingState::Failed(FailureReason::CreateSessionExhausted)
    );
    assert_eq!(
        final_state.failure_kind(),
        Some(FailureKind::TransientProviderError)
    );
    assert_eq!(harness.provider.count(Op::Create), 2);
    assert_eq!(harness.provider.count(Op::PairingCode), 0);

    let session = harness.orchestrator.snapshot("sales-bot").unwrap();
    assert_eq!(session.create_attempt(), 2);
    assert!(session.last_error().unwrap().contains("provider unavailable"));
}

#[tokio::test(start_paused = true)]
async fn create_attempt_ceiling_is_configurable() {
    let options = super::harness::options_with(|pairing| pairing.max_create_attempts = 3);
    let harness = TestHarness::with_options("open", options);
    harness.provider.push_create(Err(unavailable()));
    harness.provider.push_create(Err(protocol()));
    harness.provider.push_create(Err(unavailable()));

    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Failed(FailureReason::CreateSessionExhausted))
    );
    assert_eq!(harness.provider.count(Op::Create), 3);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_create_is_not_retried() {
    let harness = TestHarness::new("open");
    harness.provider.push_create(Err(unauthorized()));

    let mut sub = harness.connect("sales-bot");
    let final_state = sub.wait_for_terminal().await.unwrap();

    assert_eq!(final_state, PairingState::Failed(FailureReason::Unauthorized));
    assert_eq!(final_state.failure_kind(), Some(FailureKind::Unauthorized));
    assert_eq!(harness.provider.count(Op::Create), 1);
    assert!(harness
        .sink
        .has(NoticeLevel::Error, "provider", "invalid api key"));
}

#[tokio::test(start_paused = true)]
async fn missing_pairing_code_is_terminal() {
    let harness = TestHarness::new("open");
    harness.provider.push_pairing_code(Ok(None));

    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Failed(FailureReason::NoPairingCode))
    );

    // No retry within the phase and no polling afterwards.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(harness.provider.count(Op::PairingCode), 1);
    assert_eq!(harness.provider.count(Op::State), 0);

    let session = harness.orchestrator.snapshot("sales-bot").unwrap();
    assert_eq!(session.last_error(), Some("no_pairing_code"));
}

#[tokio::test(start_paused = true)]
async fn pairing_code_fetch_errors_are_classified() {
    let harness = TestHarness::new("open");
    harness.provider.push_pairing_code(Err(unauthorized()));

    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Failed(FailureReason::Unauthorized))
    );

    harness.provider.push_pairing_code(Err(unavailable()));
    let mut sub = harness.connect("sales-bot");
    assert_eq!(
        sub.wait_for_terminal().await,
        Some(PairingState::Failed(FailureReason::ProviderUnavailable))
    );
}
