//! Per-destination priority queues and delivery paths.
//!
//! Each destination owns three bounded queues (one per [`PriorityClass`]) and
//! one bounded [`DeliveryPath`], all behind a single destination-local mutex.
//! Unrelated destinations never contend with each other.
//!
//! ```text
//!             ┌──────────── destination "billing" ────────────┐
//!  emit() ──► │ CONTROL  [u u]                                │
//!             │ STANDARD [u u u u]  ── circulate() ──► path ──┼──► take()
//!             │ RECOVERY [u]                                  │
//!             └───────────────────────────────────────────────┘
//! ```

use std::collections::VecDeque;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::unit::{DestinationId, PriorityClass, Unit, UnitOutcome};

/// Bounded buffer at a destination that units are pumped into.
///
/// Consumers pull from it; only the scheduler pushes.
#[derive(Debug)]
pub struct DeliveryPath {
    capacity: usize,
    pending: VecDeque<Unit>,
    open: bool,
}

impl DeliveryPath {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: VecDeque::with_capacity(capacity.min(1024)),
            open: true,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// A closed path accepts nothing, exactly like a full one.
    fn has_room(&self) -> bool {
        self.open && self.pending.len() < self.capacity
    }
}

/// A unit that reached a terminal outcome during a tick.
#[derive(Debug, Clone)]
pub struct Transition {
    pub unit: Unit,
    pub outcome: UnitOutcome,
}

/// Counts of what one circulation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub delivered: u64,
    pub expired: u64,
    pub dropped: u64,
    pub recirculated: u64,
}

impl TickReport {
    /// Whether any unit moved or changed state.
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

impl AddAssign for TickReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.expired += other.expired;
        self.dropped += other.dropped;
        self.recirculated += other.recirculated;
    }
}

/// Point-in-time view of a destination, for introspection and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationSnapshot {
    pub control_queued: usize,
    pub standard_queued: usize,
    pub recovery_queued: usize,
    pub pending: usize,
    pub capacity: usize,
    pub open: bool,
}

impl DestinationSnapshot {
    pub fn queued(&self, priority: PriorityClass) -> usize {
        match priority {
            PriorityClass::Control => self.control_queued,
            PriorityClass::Standard => self.standard_queued,
            PriorityClass::Recovery => self.recovery_queued,
        }
    }
}

#[derive(Debug)]
struct DestinationState {
    queues: [VecDeque<Unit>; 3],
    path: DeliveryPath,
}

impl DestinationState {
    fn new(path_capacity: usize) -> Self {
        Self {
            queues: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            path: DeliveryPath::new(path_capacity),
        }
    }

    /// One pass over all queues in strict priority order.
    ///
    /// Only the units present when a class's pass begins are examined, so a
    /// recirculated unit is attempted at most once per tick.
    fn circulate(
        &mut self,
        now: Instant,
        max_recirculations: u32,
        transitions: &mut Vec<Transition>,
    ) -> TickReport {
        let mut report = TickReport::default();

        for priority in PriorityClass::DRAIN_ORDER {
            let queue = &mut self.queues[priority.index()];
            let examined = queue.len();

            for _ in 0..examined {
                let Some(mut unit) = queue.pop_front() else {
                    break;
                };

                if unit.is_expired(now) {
                    report.expired += 1;
                    transitions.push(Transition {
                        unit,
                        outcome: UnitOutcome::Expired,
                    });
                    continue;
                }

                if self.path.has_room() {
                    report.delivered += 1;
                    transitions.push(Transition {
                        unit: unit.clone(),
                        outcome: UnitOutcome::Delivered,
                    });
                    self.path.pending.push_back(unit);
                    continue;
                }

                if unit.record_recirculation() >= max_recirculations {
                    report.dropped += 1;
                    transitions.push(Transition {
                        unit,
                        outcome: UnitOutcome::Dropped,
                    });
                } else {
                    report.recirculated += 1;
                    queue.push_back(unit);
                }
            }
        }

        report
    }

    fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            control_queued: self.queues[PriorityClass::Control.index()].len(),
            standard_queued: self.queues[PriorityClass::Standard.index()].len(),
            recovery_queued: self.queues[PriorityClass::Recovery.index()].len(),
            pending: self.path.pending_count(),
            capacity: self.path.capacity(),
            open: self.path.is_open(),
        }
    }
}

/// Queues, path, and wake-up signal for one destination.
#[derive(Debug)]
pub(crate) struct DestinationSlot {
    state: Mutex<DestinationState>,
    delivered: Notify,
}

impl DestinationSlot {
    fn lock(&self) -> MutexGuard<'_, DestinationState> {
        // Units are plain data; a panicked holder cannot leave them half-moved.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn take(&self) -> Option<Unit> {
        self.lock().path.pending.pop_front()
    }

    pub(crate) fn delivered(&self) -> &Notify {
        &self.delivered
    }
}

/// All destinations known to the router.
///
/// Destinations are created lazily on first use and live for the life of the
/// process; idle ones just sit empty.
#[derive(Debug)]
pub struct PriorityQueueSet {
    destinations: DashMap<DestinationId, Arc<DestinationSlot>>,
    queue_capacity: usize,
    path_capacity: usize,
}

impl PriorityQueueSet {
    /// Create a queue set.
    ///
    /// `queue_capacity` bounds each priority queue; `path_capacity` bounds
    /// each destination's delivery path.
    pub fn new(queue_capacity: usize, path_capacity: usize) -> Self {
        Self {
            destinations: DashMap::new(),
            queue_capacity,
            path_capacity,
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn path_capacity(&self) -> usize {
        self.path_capacity
    }

    pub(crate) fn slot(&self, destination: &DestinationId) -> Arc<DestinationSlot> {
        if let Some(slot) = self.destinations.get(destination) {
            return slot.clone();
        }
        self.destinations
            .entry(destination.clone())
            .or_insert_with(|| {
                Arc::new(DestinationSlot {
                    state: Mutex::new(DestinationState::new(self.path_capacity)),
                    delivered: Notify::new(),
                })
            })
            .clone()
    }

    /// Append a unit to the tail of its priority queue.
    ///
    /// Hands the unit back when that queue is at capacity.
    pub fn enqueue(&self, unit: Unit) -> Result<(), Unit> {
        let slot = self.slot(unit.destination());
        let mut state = slot.lock();
        let queue = &mut state.queues[unit.priority().index()];
        if queue.len() >= self.queue_capacity {
            return Err(unit);
        }
        queue.push_back(unit);
        Ok(())
    }

    /// Pop the oldest delivered unit for a destination.
    pub fn take(&self, destination: &DestinationId) -> Option<Unit> {
        let slot = self.destinations.get(destination)?.value().clone();
        slot.take()
    }

    /// Pop up to `max` delivered units for a destination, oldest first.
    pub fn take_batch(&self, destination: &DestinationId, max: usize) -> Vec<Unit> {
        let Some(slot) = self.destinations.get(destination).map(|s| s.value().clone()) else {
            return Vec::new();
        };
        let mut state = slot.lock();
        let n = max.min(state.path.pending.len());
        state.path.pending.drain(..n).collect()
    }

    /// Stop delivering into a destination's path. Queued units recirculate.
    pub fn close_path(&self, destination: &DestinationId) {
        self.slot(destination).lock().path.open = false;
    }

    /// Resume delivering into a destination's path.
    pub fn open_path(&self, destination: &DestinationId) {
        self.slot(destination).lock().path.open = true;
    }

    pub fn snapshot(&self, destination: &DestinationId) -> Option<DestinationSnapshot> {
        let slot = self.destinations.get(destination)?.value().clone();
        let snapshot = slot.lock().snapshot();
        Some(snapshot)
    }

    /// Names of every destination seen so far.
    pub fn destinations(&self) -> Vec<DestinationId> {
        self.destinations.iter().map(|e| e.key().clone()).collect()
    }

    /// Run one circulation pass over every destination.
    ///
    /// Each destination is locked only for its own pass. Terminal transitions
    /// are appended to `transitions` for the caller to dispatch once no
    /// destination lock is held.
    pub fn circulate(
        &self,
        now: Instant,
        max_recirculations: u32,
        transitions: &mut Vec<Transition>,
    ) -> TickReport {
        // Snapshot first so no DashMap shard lock is held while a destination is locked.
        let slots: Vec<Arc<DestinationSlot>> =
            self.destinations.iter().map(|e| e.value().clone()).collect();

        let mut report = TickReport::default();
        for slot in slots {
            let pass = slot.lock().circulate(now, max_recirculations, transitions);
            if pass.delivered > 0 {
                slot.delivered.notify_waiters();
            }
            report += pass;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unit(dest: &str, priority: PriorityClass, tag: u8) -> Unit {
        Unit::new(dest, priority, vec![tag]).with_ttl(Duration::from_secs(60))
    }

    #[test]
    fn test_enqueue_respects_queue_capacity() {
        let set = PriorityQueueSet::new(2, 10);
        let dest = DestinationId::from("a");

        assert!(set.enqueue(unit("a", PriorityClass::Standard, 1)).is_ok());
        assert!(set.enqueue(unit("a", PriorityClass::Standard, 2)).is_ok());
        let rejected = set.enqueue(unit("a", PriorityClass::Standard, 3)).unwrap_err();
        assert_eq!(rejected.payload()[0], 3);

        // Other classes have their own bound.
        assert!(set.enqueue(unit("a", PriorityClass::Control, 4)).is_ok());
        let snapshot = set.snapshot(&dest).unwrap();
        assert_eq!(snapshot.standard_queued, 2);
        assert_eq!(snapshot.control_queued, 1);
    }

    #[test]
    fn test_circulate_delivers_in_priority_order() {
        let set = PriorityQueueSet::new(16, 3);
        let dest = DestinationId::from("a");
        set.enqueue(unit("a", PriorityClass::Recovery, 3)).unwrap();
        set.enqueue(unit("a", PriorityClass::Standard, 2)).unwrap();
        set.enqueue(unit("a", PriorityClass::Control, 1)).unwrap();

        let mut transitions = Vec::new();
        let report = set.circulate(Instant::now(), 3, &mut transitions);
        assert_eq!(report.delivered, 3);

        let order: Vec<u8> = set
            .take_batch(&dest, 10)
            .iter()
            .map(|u| u.payload()[0])
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_path_recirculates_then_drops() {
        let set = PriorityQueueSet::new(16, 1);
        let dest = DestinationId::from("a");
        set.enqueue(unit("a", PriorityClass::Standard, 1)).unwrap();
        set.enqueue(unit("a", PriorityClass::Standard, 2)).unwrap();

        let mut transitions = Vec::new();
        let first = set.circulate(Instant::now(), 2, &mut transitions);
        assert_eq!(first.delivered, 1);
        assert_eq!(first.recirculated, 1);

        let second = set.circulate(Instant::now(), 2, &mut transitions);
        assert_eq!(second.dropped, 1);
        assert_eq!(set.snapshot(&dest).unwrap().standard_queued, 0);

        let outcomes: Vec<UnitOutcome> = transitions.iter().map(|t| t.outcome).collect();
        assert_eq!(outcomes, vec![UnitOutcome::Delivered, UnitOutcome::Dropped]);
    }

    #[test]
    fn test_expired_units_never_reach_path() {
        let set = PriorityQueueSet::new(16, 4);
        let dest = DestinationId::from("a");
        let short = Unit::standard("a", vec![1]).with_ttl(Duration::from_millis(10));
        let deadline = short.expires_at().unwrap();
        set.enqueue(short).unwrap();

        let mut transitions = Vec::new();
        let report = set.circulate(deadline, 3, &mut transitions);
        assert_eq!(report.expired, 1);
        assert_eq!(report.delivered, 0);
        assert!(set.take(&dest).is_none());
    }

    #[test]
    fn test_closed_path_behaves_as_full() {
        let set = PriorityQueueSet::new(16, 4);
        let dest = DestinationId::from("a");
        set.close_path(&dest);
        set.enqueue(unit("a", PriorityClass::Control, 1)).unwrap();

        let mut transitions = Vec::new();
        let report = set.circulate(Instant::now(), 5, &mut transitions);
        assert_eq!(report.recirculated, 1);

        set.open_path(&dest);
        let report = set.circulate(Instant::now(), 5, &mut transitions);
        assert_eq!(report.delivered, 1);
        assert_eq!(set.take(&dest).unwrap().recirculation_count(), 1);
    }

    #[test]
    fn test_take_on_unknown_destination() {
        let set = PriorityQueueSet::new(4, 4);
        assert!(set.take(&DestinationId::from("nowhere")).is_none());
        assert!(set.take_batch(&DestinationId::from("nowhere"), 5).is_empty());
        assert!(set.snapshot(&DestinationId::from("nowhere")).is_none());
    }
}
