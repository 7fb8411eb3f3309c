//! Scenario tests for the pairing orchestrator.
//!
//! All scenarios run on tokio's paused clock, so poll delays are exact and
//! free.
//!
//! - `harness.rs`      - Scripted provider, recording sink/scheduler, stores
//! - `connect_flow.rs` - End-to-end connects (sales-bot, stale-bot, agents)
//! - `creation.rs`     - Session creation retries and pairing-code fetch
//! - `polling.rs`      - Tick timing, ceiling, status token handling
//! - `verification.rs` - Callback registration and post-link read-backs
//! - `cancellation.rs` - Cancel, in-flight results, disconnect
//! - `idempotency.rs`  - One active session per channel, supersede

mod connect_flow;
mod creation;
mod polling;
