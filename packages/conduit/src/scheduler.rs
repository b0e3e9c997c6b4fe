//! Timer-driven circulation.

use std::time::Duration;

use crate::queue::TickReport;
use crate::router::Router;
use crate::task::BackgroundTask;

/// Pumps every destination's queues into its delivery path once per tick.
#[derive(Debug, Clone)]
pub struct CirculationScheduler {
    router: Router,
    tick_interval: Duration,
}

impl CirculationScheduler {
    pub fn new(router: Router, tick_interval: Duration) -> Self {
        Self {
            router,
            tick_interval,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Run a single tick now, outside the timer.
    pub fn run_once(&self) -> TickReport {
        self.router.tick()
    }

    /// Start ticking in the background.
    pub fn start(self) -> BackgroundTask {
        let router = self.router;
        BackgroundTask::spawn_periodic("circulation", self.tick_interval, move || {
            router.tick();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterSettings;
    use crate::trigger::TriggerRegistry;
    use crate::unit::{DestinationId, Unit};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_delivers_without_manual_ticks() {
        let router = Router::new(RouterSettings::default(), Arc::new(TriggerRegistry::new()));
        let task = CirculationScheduler::new(router.clone(), Duration::from_millis(20)).start();

        let id = router.emit(Unit::standard("a", b"x".to_vec())).unwrap();
        let unit = tokio::time::timeout(Duration::from_secs(1), router.recv(&DestinationId::from("a")))
            .await
            .expect("scheduler never delivered");
        assert_eq!(unit.id(), id);
        assert!(router.metrics().snapshot().ticks >= 1);

        task.shutdown().await;
    }
}
