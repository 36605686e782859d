//! Cancellable fixed-interval background task.

use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Work run on every tick of a [`PeriodicTask`].
#[async_trait]
pub trait Periodic: Send + 'static {
    async fn tick(&mut self);
}

/// Runs a [`Periodic`] job every `period` until cancelled.
///
/// Ticks never overlap: a pass that outlives the period delays the next
/// tick instead of queueing a burst. Cancellation is observed between
/// passes, so a running pass always completes.
pub struct PeriodicTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<P: Periodic>(
        name: &'static str,
        period: Duration,
        cancel: CancellationToken,
        mut job: P,
    ) -> Self {
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tracing::info!(task = name, period_ms = period.as_millis() as u64, "periodic task started");
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => job.tick().await,
                }
            }
            tracing::info!(task = name, "periodic task stopped");
        });

        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task to stop and wait for the current pass to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(task = self.name, error = %e, "periodic task panicked");
        }
    }
}
