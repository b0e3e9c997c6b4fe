//! Owned periodic background tasks.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A periodic task with a cancellation handle.
///
/// Dropping the handle cancels the task without waiting for it; call
/// [`shutdown`](Self::shutdown) to cancel and join.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Run `step` every `period` until cancelled.
    ///
    /// The first step runs one full period after spawning. Late ticks are
    /// skipped rather than bursted.
    pub fn spawn_periodic<F>(name: &'static str, period: Duration, mut step: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await; // Skip first immediate tick

            debug!(task = name, period_ms = period.as_millis() as u64, "background task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => step(),
                }
            }

            debug!(task = name, "background task stopped");
        });

        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the task and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => info!(task = self.name, "background task shut down"),
                Err(e) if e.is_panic() => {
                    warn!(task = self.name, error = %e, "background task panicked")
                }
                Err(e) => warn!(task = self.name, error = %e, "background task aborted"),
            }
        }
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs_each_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = BackgroundTask::spawn_periodic("counter", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        task.shutdown().await;
        let after = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_drop_cancels_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = BackgroundTask::spawn_periodic("dropped", Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let token = task.cancel.clone();
        drop(task);
        assert!(token.is_cancelled());
    }
}
