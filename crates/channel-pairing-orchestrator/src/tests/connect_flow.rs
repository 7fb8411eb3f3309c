//! End-to-end connect scenarios.

use super::harness::{
    assert_offset, callback_url, collect_until_terminal, poll_events, settle, states, Op,
    TestHarness,
};
use crate::{ExpiryReason, FailureKind, PairingError, PairingEvent, PairingState};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn sales_bot_connects_after_two_polls() {
    let harness = TestHarness::new("open");
    harness.provider.push_states(&["connecting", "open"]);

    let mut sub = harness.connect("sales-bot");
    let events = collect_until_terminal(&mut sub).await;

    assert_eq!(
        states(&events),
        vec![
            PairingState::CreatingSession,
            PairingState::AwaitingPairing,
            PairingState::LinkPolling,
            PairingState::Verifying,
            PairingState::Connected,
        ]
    );

    // Exactly two polling ticks, 5 units in and then 10 more.
    let polls = poll_events(&events);
    assert_eq!(polls.len(), 2);
    let offsets = harness.provider.offsets(Op::State);
    assert_offset(offsets[0], Duration::from_secs(5));
    assert_offset(offsets[1], Duration::from_secs(15));

    assert_eq!(harness.provider.count(Op::Create), 1);
    assert_eq!(harness.provider.count(Op::RegisterCallback), 1);
    assert_eq!(harness.provider.count(Op::FetchCallback), 1);
    // Two polls plus the verification re-read.
    assert_eq!(harness.provider.count(Op::State), 3);

    let session = harness.orchestrator.snapshot("sales-bot").unwrap();
    assert_eq!(session.state(), PairingState::Connected);
    assert_eq!(session.attempt(), 2);
    assert_eq!(session.create_attempt(), 1);
    assert_eq!(session.callback_url(), Some(callback_url("sales-bot").as_str()));
    assert!(session.pairing_code().is_none());
    assert!(session.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn pairing_code_is_exposed_while_awaiting_pairing() {
    let harness = TestHarness::new("open");

    let mut sub = harness.connect("sales-bot");
    let events = collect_until_terminal(&mut sub).await;

    let awaiting = events
        .iter()
        .find(|event| event.new_state() == Some(PairingState::AwaitingPairing))
        .unwrap();
    match awaiting {
        PairingEvent::StateChanged { pairing_code, .. } => {
            assert_eq!(pairing_code.as_ref().unwrap().code, "2@sales-bot-code");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Only the AwaitingPairing transition carries the code.
    let with_code = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                PairingEvent::StateChanged {
                    pairing_code: Some(_),
                    ..
                }
            )
        })
        .count();
    assert_eq!(with_code, 1);
}

#[tokio::test(start_paused = true)]
async fn poll_events_carry_status_labels() {
    let harness = TestHarness::new("open");
    harness.provider.push_states(&["connecting", "pairing", "open"]);

    let mut sub = harness.connect("sales-bot");
    let events = collect_until_terminal(&mut sub).await;

    let labels: Vec<_> = poll_events(&events)
        .into_iter()
        .map(|event| match event {
            PairingEvent::PollObserved {
                attempt,
                provider_status,
                label,
                ..
            } => (*attempt, provider_status.clone(), label.clone()),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();

    assert_eq!(
        labels,
        vec![
            (1, "connecting".to_string(), "connecting".to_string()),
            (2, "pairing".to_string(), "pairing".to_string()),
            (3, "open".to_string(), "connected".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn stale_bot_expires_after_thirty_polls() {
    let harness = TestHarness::new("connecting");

    let mut sub = harness.connect("stale-bot");
    let events = collect_until_terminal(&mut sub).await;

    let final_state = events.last().and_then(PairingEvent::new_state).unwrap();
    assert_eq!(final_state, PairingState::Expired(ExpiryReason::Timeout));
    assert_eq!(final_state.failure_kind(), Some(FailureKind::Timeout));
    assert!(!states(&events).contains(&PairingState::Connected));

    let polls = poll_events(&events);
    assert_eq!(polls.len(), 30);
    assert_eq!(harness.provider.count(Op::State), 30);
    assert_eq!(harness.provider.count(Op::RegisterCallback), 0);

    let offsets = harness.provider.offsets(Op::State);
    assert_offset(offsets[0], Duration::from_secs(5));
    assert_offset(offsets[29], Duration::from_secs(5 + 29 * 10));

    let session = harness.orchestrator.snapshot("stale-bot").unwrap();
    assert_eq!(session.attempt(), 30);
    assert_eq!(session.last_error(), Some("timeout"));

    // Nothing else is scheduled once the session expired.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(harness.provider.count(Op::State), 30);
}

#[tokio::test(start_paused = true)]
async fn connect_agent_persists_connected_flag() {
    let harness = TestHarness::new("open");
    let agent_id = harness.store.insert("Sales Bot");

    let mut sub = harness.orchestrator.connect_agent(agent_id).await.unwrap();
    assert_eq!(sub.channel_id(), "sales-bot");

    let final_state = sub.wait_for_terminal().await;
    assert_eq!(final_state, Some(PairingState::Connected));
    settle().await;

    assert!(harness.store.get(agent_id).unwrap().connected);
    assert_eq!(
        harness.orchestrator.snapshot("sales-bot").unwrap().agent_id(),
        Some(agent_id)
    );
}

#[tokio::test(start_paused = true)]
async fn connect_rejects_unknown_agents_and_empty_ids() {
    let harness = TestHarness::new("open");

    assert!(matches!(
        harness.orchestrator.connect_agent(99).await,
        Err(PairingError::AgentNotFound(99))
    ));

    let agent_id = harness.store.insert("!!!");
    assert!(matches!(
        harness.orchestrator.connect_agent(agent_id).await,
        Err(PairingError::InvalidChannelId(_))
    ));

    assert!(matches!(
        harness.orchestrator.connect("   "),
        Err(PairingError::InvalidChannelId(_))
    ));
    assert_eq!(harness.provider.count(Op::Create), 0);
}

#[tokio::test(start_paused = true)]
async fn creation_request_carries_callback_hint() {
    let harness = TestHarness::new("open");

    let mut sub = harness.connect("sales-bot");
    sub.wait_for_terminal().await;

    let create = harness
        .provider
        .calls()
        .into_iter()
        .find(|call| call.op == Op::Create)
        .unwrap();
    assert_eq!(create.callback_url, Some(callback_url("sales-bot")));
    assert_eq!(
        create.event_types,
        vec!["CONNECTION_UPDATE".to_string(), "MESSAGES_UPSERT".to_string()]
    );
}
