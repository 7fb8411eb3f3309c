//! Poll scheduler.
//!
//! Every tick is a one-shot delayed task. The next tick is only scheduled by
//! the previous one once it has finished, so ticks for a channel never
//! overlap and each delay is computed from the state at that moment.
//! Pending ticks are not aborted on cancellation; the orchestrator checks the
//! session epoch when a tick fires and drops stale ones.

use futures_util::future::BoxFuture;
use std::time::Duration;
use tracing::trace;

/// Runs a task once after a delay.
pub trait PollScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Scheduler backed by `tokio::spawn` and `tokio::time::sleep`.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPollScheduler;

impl PollScheduler for TokioPollScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        trace!(delay_ms = delay.as_millis() as u64, "Scheduling tick");
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
    }
}
