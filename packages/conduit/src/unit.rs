//! Units: time-bounded carriers routed toward a destination.
//!
//! A unit moves through `QUEUED → IN_TRANSIT → {DELIVERED | EXPIRED | DROPPED}`.
//! It is owned by exactly one priority queue or delivery path at a time; the
//! router hands out cheap clones (the payload is a shared [`Bytes`]) only to
//! trigger handlers observing a transition.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ConduitError, Result};

/// Unique identifier of a unit (UUIDv7, so ids sort by creation time).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UnitId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of the destination a unit is routed to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl From<&str> for DestinationId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DestinationId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority class of a unit. Determines drain order, not weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Standard,
    Control,
    Recovery,
}

impl PriorityClass {
    /// Order in which the scheduler drains a destination's queues.
    pub const DRAIN_ORDER: [PriorityClass; 3] = [
        PriorityClass::Control,
        PriorityClass::Standard,
        PriorityClass::Recovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Standard => "standard",
            PriorityClass::Control => "control",
            PriorityClass::Recovery => "recovery",
        }
    }

    /// Slot of this class in per-destination queue arrays.
    pub(crate) fn index(&self) -> usize {
        match self {
            PriorityClass::Control => 0,
            PriorityClass::Standard => 1,
            PriorityClass::Recovery => 2,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a unit. Every emitted unit reaches exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Delivered,
    Expired,
    Dropped,
}

impl UnitOutcome {
    /// Trigger event type dispatched when a unit reaches this outcome.
    pub fn event_type(&self) -> &'static str {
        match self {
            UnitOutcome::Delivered => crate::trigger::UNIT_DELIVERED,
            UnitOutcome::Expired => crate::trigger::UNIT_EXPIRED,
            UnitOutcome::Dropped => crate::trigger::UNIT_DROPPED,
        }
    }
}

impl fmt::Display for UnitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitOutcome::Delivered => write!(f, "delivered"),
            UnitOutcome::Expired => write!(f, "expired"),
            UnitOutcome::Dropped => write!(f, "dropped"),
        }
    }
}

/// A typed, time-bounded message carrying a payload toward a destination.
///
/// # Example
///
/// ```ignore
/// let unit = Unit::control("billing", b"rebalance".to_vec())
///     .with_ttl(Duration::from_secs(5))
///     .with_event_type("billing.rebalance");
/// engine.emit(unit)?;
/// ```
#[derive(Clone, Debug)]
pub struct Unit {
    id: UnitId,
    destination: DestinationId,
    priority: PriorityClass,
    payload: Bytes,
    created_at: Instant,
    ttl: Option<Duration>,
    recirculation_count: u32,
    event_type: Option<String>,
}

impl Unit {
    /// Create a unit. The TTL defaults to the router's configured unit TTL.
    pub fn new(
        destination: impl Into<DestinationId>,
        priority: PriorityClass,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: UnitId::new(),
            destination: destination.into(),
            priority,
            payload: payload.into(),
            created_at: Instant::now(),
            ttl: None,
            recirculation_count: 0,
            event_type: None,
        }
    }

    pub fn standard(destination: impl Into<DestinationId>, payload: impl Into<Bytes>) -> Self {
        Self::new(destination, PriorityClass::Standard, payload)
    }

    pub fn control(destination: impl Into<DestinationId>, payload: impl Into<Bytes>) -> Self {
        Self::new(destination, PriorityClass::Control, payload)
    }

    pub fn recovery(destination: impl Into<DestinationId>, payload: impl Into<Bytes>) -> Self {
        Self::new(destination, PriorityClass::Recovery, payload)
    }

    /// Set an explicit time-to-live, measured from creation.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Label the unit with an event type; handlers registered for it fire on emission.
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn destination(&self) -> &DestinationId {
        &self.destination
    }

    pub fn priority(&self) -> PriorityClass {
        self.priority
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// Failed delivery attempts so far.
    pub fn recirculation_count(&self) -> u32 {
        self.recirculation_count
    }

    /// Instant after which the unit is expired. `None` when no TTL is set.
    pub fn expires_at(&self) -> Option<Instant> {
        self.ttl.and_then(|ttl| self.created_at.checked_add(ttl))
    }

    /// Whether `created_at + ttl` has elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at() {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    /// Check the emission contract: a destination, a payload, and a non-zero TTL.
    pub fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            return Err(ConduitError::validation("destination", "must not be empty"));
        }
        if self.payload.is_empty() {
            return Err(ConduitError::validation("payload", "must not be empty"));
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(ConduitError::validation("ttl", "must be greater than zero"));
        }
        if matches!(self.event_type.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(ConduitError::validation("event_type", "must not be blank"));
        }
        Ok(())
    }

    pub(crate) fn apply_default_ttl(&mut self, ttl: Duration) {
        if self.ttl.is_none() {
            self.ttl = Some(ttl);
        }
    }

    /// Count one failed delivery attempt and return the new total.
    pub(crate) fn record_recirculation(&mut self) -> u32 {
        self.recirculation_count = self.recirculation_count.saturating_add(1);
        self.recirculation_count
    }
}
