//! Router: emission, circulation, and consumption of units.
//!
//! ```text
//! emit ─► validate ─► unit.emitted ─► queue ─► tick ─► path ─► take / recv
//!                                        │        │
//!                                        │        ├─► unit.delivered
//!                                        │        ├─► unit.expired
//!                                        └────────┴─► unit.dropped
//! ```
//!
//! The router is cheap to clone; clones share queues, triggers, and metrics.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{ConduitError, Result};
use crate::metrics::RoutingMetrics;
use crate::queue::{DestinationSnapshot, PriorityQueueSet, TickReport, Transition};
use crate::trigger::{TriggerRegistry, UNIT_DROPPED, UNIT_EMITTED};
use crate::unit::{DestinationId, Unit, UnitId};

/// Tunables the router needs at runtime.
#[derive(Debug, Clone, Copy)]
pub struct RouterSettings {
    pub queue_capacity: usize,
    pub path_capacity: usize,
    pub max_recirculations: u32,
    pub default_unit_ttl: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            path_capacity: 64,
            max_recirculations: 3,
            default_unit_ttl: Duration::from_secs(30),
        }
    }
}

struct RouterInner {
    queues: PriorityQueueSet,
    triggers: Arc<TriggerRegistry>,
    metrics: RoutingMetrics,
    max_recirculations: u32,
    default_unit_ttl: Duration,
}

/// Routes units from emitters to per-destination delivery paths.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(settings: RouterSettings, triggers: Arc<TriggerRegistry>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                queues: PriorityQueueSet::new(settings.queue_capacity, settings.path_capacity),
                triggers,
                metrics: RoutingMetrics::new(),
                max_recirculations: settings.max_recirculations,
                default_unit_ttl: settings.default_unit_ttl,
            }),
        }
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.inner.triggers
    }

    pub fn metrics(&self) -> &RoutingMetrics {
        &self.inner.metrics
    }

    pub fn queues(&self) -> &PriorityQueueSet {
        &self.inner.queues
    }

    /// Accept a unit for routing.
    ///
    /// Fails only on validation. A unit that finds its priority queue full is
    /// dropped on the spot: counted, dispatched as `unit.dropped`, and still
    /// reported to the emitter as accepted.
    pub fn emit(&self, mut unit: Unit) -> Result<UnitId> {
        unit.apply_default_ttl(self.inner.default_unit_ttl);
        unit.validate()?;

        let id = unit.id();
        self.inner.metrics.record_emitted();
        self.notify(UNIT_EMITTED, &unit);
        if let Some(event_type) = unit.event_type() {
            self.notify(event_type, &unit);
        }

        trace!(
            unit = %id,
            destination = %unit.destination(),
            priority = %unit.priority(),
            "unit emitted"
        );

        if let Err(unit) = self.inner.queues.enqueue(unit) {
            let reason = ConduitError::QueueFull {
                destination: unit.destination().clone(),
                priority: unit.priority(),
            };
            debug!(unit = %id, error = %reason, "dropping unit");
            self.inner.metrics.record_dropped();
            self.notify(UNIT_DROPPED, &unit);
        }

        Ok(id)
    }

    /// Run one circulation pass over every destination.
    pub fn tick(&self) -> TickReport {
        let mut transitions = Vec::new();
        let report = self.inner.queues.circulate(
            Instant::now(),
            self.inner.max_recirculations,
            &mut transitions,
        );
        self.inner.metrics.record_tick(&report);

        if !report.is_idle() {
            debug!(
                delivered = report.delivered,
                expired = report.expired,
                dropped = report.dropped,
                recirculated = report.recirculated,
                "circulation tick"
            );
        }

        // No destination lock is held here; handlers may emit freely.
        for Transition { unit, outcome } in transitions {
            self.notify(outcome.event_type(), &unit);
        }

        report
    }

    /// Pop the oldest delivered unit for `destination`, if any.
    pub fn take(&self, destination: &DestinationId) -> Option<Unit> {
        self.inner.queues.take(destination)
    }

    /// Pop up to `max` delivered units for `destination`.
    pub fn take_batch(&self, destination: &DestinationId, max: usize) -> Vec<Unit> {
        self.inner.queues.take_batch(destination, max)
    }

    /// Wait for the next unit delivered to `destination`.
    ///
    /// Cancel-safe: dropping the future loses nothing.
    pub async fn recv(&self, destination: &DestinationId) -> Unit {
        let slot = self.inner.queues.slot(destination);
        loop {
            // Register before checking so a delivery in between is not missed.
            let notified = slot.delivered().notified();

            if let Some(unit) = slot.take() {
                return unit;
            }

            notified.await;
        }
    }

    /// Pause delivery to `destination`. Its queued units recirculate.
    pub fn close_path(&self, destination: &DestinationId) {
        self.inner.queues.close_path(destination);
    }

    /// Resume delivery to `destination`.
    pub fn open_path(&self, destination: &DestinationId) {
        self.inner.queues.open_path(destination);
    }

    pub fn snapshot(&self, destination: &DestinationId) -> Option<DestinationSnapshot> {
        self.inner.queues.snapshot(destination)
    }

    /// Dispatch a routing trigger. Handler failures are logged by the
    /// registry and never interrupt routing.
    fn notify(&self, event_type: &str, unit: &Unit) {
        let _ = self.inner.triggers.dispatch(event_type, unit);
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("queues", &self.inner.queues)
            .field("metrics", &self.inner.metrics.snapshot())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{UNIT_DELIVERED, UNIT_EXPIRED};
    use crate::unit::PriorityClass;
    use std::sync::Mutex;

    fn router(queue_capacity: usize, path_capacity: usize) -> Router {
        Router::new(
            RouterSettings {
                queue_capacity,
                path_capacity,
                max_recirculations: 3,
                default_unit_ttl: Duration::from_secs(60),
            },
            Arc::new(TriggerRegistry::new()),
        )
    }

    fn record(router: &Router, event_type: &'static str) -> Arc<Mutex<Vec<UnitId>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router
            .triggers()
            .register(event_type, move |unit: &Unit| {
                sink.lock().unwrap().push(unit.id());
                Ok(())
            })
            .unwrap();
        seen
    }

    #[test]
    fn test_emit_rejects_invalid_units() {
        let router = router(8, 8);
        assert!(matches!(
            router.emit(Unit::standard("", b"x".to_vec())),
            Err(ConduitError::Validation { .. })
        ));
        assert!(matches!(
            router.emit(Unit::standard("a", Vec::<u8>::new())),
            Err(ConduitError::Validation { .. })
        ));
        assert_eq!(router.metrics().snapshot().emitted, 0);
    }

    #[test]
    fn test_emit_applies_default_ttl() {
        let router = router(8, 8);
        let dest = DestinationId::from("a");
        router.emit(Unit::standard("a", b"x".to_vec())).unwrap();
        router.tick();
        let unit = router.take(&dest).unwrap();
        assert_eq!(unit.ttl(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_emit_dispatches_emitted_and_custom_event() {
        let router = router(8, 8);
        let emitted = record(&router, UNIT_EMITTED);
        let custom = record(&router, "billing.rebalance");

        let id = router
            .emit(Unit::control("billing", b"x".to_vec()).with_event_type("billing.rebalance"))
            .unwrap();

        assert_eq!(*emitted.lock().unwrap(), vec![id]);
        assert_eq!(*custom.lock().unwrap(), vec![id]);
    }

    #[test]
    fn test_full_queue_drops_without_error() {
        let router = router(1, 8);
        let dropped = record(&router, UNIT_DROPPED);

        router.emit(Unit::standard("a", b"1".to_vec())).unwrap();
        let second = router.emit(Unit::standard("a", b"2".to_vec())).unwrap();

        assert_eq!(*dropped.lock().unwrap(), vec![second]);
        assert_eq!(router.metrics().snapshot().dropped, 1);
    }

    #[test]
    fn test_tick_dispatches_delivered_outside_lock() {
        let router = router(8, 8);
        let dest = DestinationId::from("a");

        // Emitting from a delivery handler would deadlock if the lock were held.
        let reentrant = router.clone();
        router
            .triggers()
            .register(UNIT_DELIVERED, move |unit: &Unit| {
                if unit.destination().as_str() == "a" {
                    reentrant.emit(Unit::standard("b", unit.payload().clone()))?;
                }
                Ok(())
            })
            .unwrap();

        router.emit(Unit::standard("a", b"x".to_vec())).unwrap();
        let report = router.tick();
        assert_eq!(report.delivered, 1);
        assert!(router.take(&dest).is_some());

        let follow_up = router.snapshot(&DestinationId::from("b")).unwrap();
        assert_eq!(follow_up.queued(PriorityClass::Standard), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_units_dispatch_expired() {
        let router = router(8, 8);
        let expired = record(&router, UNIT_EXPIRED);

        let id = router
            .emit(Unit::standard("a", b"x".to_vec()).with_ttl(Duration::from_millis(100)))
            .unwrap();
        tokio::time::advance(Duration::from_millis(150)).await;

        let report = router.tick();
        assert_eq!(report.expired, 1);
        assert_eq!(*expired.lock().unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_delivery() {
        let router = router(8, 8);
        let dest = DestinationId::from("a");

        let consumer = {
            let router = router.clone();
            let dest = dest.clone();
            tokio::spawn(async move { router.recv(&dest).await })
        };
        tokio::task::yield_now().await;

        let id = router.emit(Unit::standard("a", b"x".to_vec())).unwrap();
        router.tick();

        let unit = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("recv timed out")
            .unwrap();
        assert_eq!(unit.id(), id);
    }

    #[tokio::test]
    async fn test_recv_returns_already_delivered() {
        let router = router(8, 8);
        let id = router.emit(Unit::standard("a", b"x".to_vec())).unwrap();
        router.tick();
        let unit = router.recv(&DestinationId::from("a")).await;
        assert_eq!(unit.id(), id);
    }
}
