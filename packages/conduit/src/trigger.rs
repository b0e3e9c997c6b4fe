//! Trigger registry: event-type keyed handlers dispatched synchronously.
//!
//! Handlers observe units at well-known points of their lifecycle
//! (`unit.emitted`, `unit.delivered`, `unit.expired`, `unit.dropped`) and under
//! any custom event type a unit is labelled with.
//!
//! # Fan-out
//!
//! `dispatch` calls every handler registered for the event type, in
//! registration order. A failing or panicking handler does not stop the
//! remaining ones; the first failure is returned once all have run.
//!
//! # Reentrancy
//!
//! The registry lock is held only long enough to snapshot the handler list.
//! Handlers run without it, so they may emit units, register handlers, or
//! dispatch again without deadlocking.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;
use tracing::warn;

use crate::error::{ConduitError, Result};
use crate::unit::Unit;

/// Dispatched when a unit is accepted for routing.
pub const UNIT_EMITTED: &str = "unit.emitted";
/// Dispatched when a unit enters its destination's delivery path.
pub const UNIT_DELIVERED: &str = "unit.delivered";
/// Dispatched when a unit's TTL elapses before delivery.
pub const UNIT_EXPIRED: &str = "unit.expired";
/// Dispatched when a unit is discarded by backpressure.
pub const UNIT_DROPPED: &str = "unit.dropped";

/// Callback invoked for units of a registered event type.
///
/// Implemented for any `Fn(&Unit) -> anyhow::Result<()>` closure.
pub trait TriggerHandler: Send + Sync + 'static {
    fn handle(&self, unit: &Unit) -> anyhow::Result<()>;
}

impl<F> TriggerHandler for F
where
    F: Fn(&Unit) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, unit: &Unit) -> anyhow::Result<()> {
        self(unit)
    }
}

/// Identifies one registration, for `unregister`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Clone)]
struct Registration {
    id: HandlerId,
    name: &'static str,
    handler: Arc<dyn TriggerHandler>,
}

/// Registry mapping event types to handlers.
///
/// Handler lists are copy-on-write: registration swaps in a new list, and
/// dispatch iterates over the snapshot it took.
#[derive(Default)]
pub struct TriggerRegistry {
    handlers: RwLock<HashMap<String, Arc<[Registration]>>>,
    next_id: AtomicU64,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a closure handler for `event_type`.
    ///
    /// Fails with a validation error when the event type is blank.
    pub fn register<F>(&self, event_type: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Unit) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(event_type, handler)
    }

    /// Append a [`TriggerHandler`] implementation for `event_type`.
    pub fn register_handler<H>(&self, event_type: &str, handler: H) -> Result<HandlerId>
    where
        H: TriggerHandler,
    {
        if event_type.trim().is_empty() {
            return Err(ConduitError::validation("event_type", "must not be blank"));
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Registration {
            id,
            name: std::any::type_name::<H>(),
            handler: Arc::new(handler),
        };

        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let list = handlers
            .get(event_type)
            .map(|existing| {
                let mut list = existing.to_vec();
                list.push(registration.clone());
                list
            })
            .unwrap_or_else(|| vec![registration]);
        handlers.insert(event_type.to_string(), list.into());
        Ok(id)
    }

    /// Remove a registration. Returns `false` if it was not registered.
    pub fn unregister(&self, event_type: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(existing) = handlers.get(event_type) else {
            return false;
        };
        if !existing.iter().any(|r| r.id == id) {
            return false;
        }

        let remaining: Vec<Registration> =
            existing.iter().filter(|r| r.id != id).cloned().collect();
        if remaining.is_empty() {
            handlers.remove(event_type);
        } else {
            handlers.insert(event_type.to_string(), remaining.into());
        }
        true
    }

    /// Invoke every handler registered for `event_type` with `unit`.
    ///
    /// Returns `Ok(())` when no handlers exist or all succeeded. Otherwise
    /// returns [`ConduitError::HandlerFailed`] carrying the first error and
    /// the number of failed handlers.
    pub fn dispatch(&self, event_type: &str, unit: &Unit) -> Result<()> {
        let Some(snapshot) = self.snapshot(event_type) else {
            return Ok(());
        };

        let mut first_error = None;
        let mut failures = 0;

        for registration in snapshot.iter() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                registration.handler.handle(unit)
            }))
            .unwrap_or_else(|panic| Err(anyhow!("handler panicked: {}", panic_message(&panic))));

            if let Err(error) = outcome {
                warn!(
                    event_type,
                    unit = %unit.id(),
                    handler = registration.name,
                    error = %error,
                    "trigger handler failed"
                );
                failures += 1;
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(error) => Err(ConduitError::HandlerFailed {
                event_type: event_type.to_string(),
                failures,
                error,
            }),
        }
    }

    /// Number of handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.snapshot(event_type).map(|list| list.len()).unwrap_or(0)
    }

    /// Whether any handler is registered for `event_type`.
    pub fn has_handlers(&self, event_type: &str) -> bool {
        self.handler_count(event_type) > 0
    }

    fn snapshot(&self, event_type: &str) -> Option<Arc<[Registration]>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TriggerRegistry")
            .field("event_types", &handlers.len())
            .finish()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn unit() -> Unit {
        Unit::standard("dest", b"payload".to_vec())
    }

    #[test]
    fn test_dispatch_without_handlers_is_noop() {
        let registry = TriggerRegistry::new();
        assert!(registry.dispatch("nothing.here", &unit()).is_ok());
    }

    #[test]
    fn test_register_rejects_blank_event_type() {
        let registry = TriggerRegistry::new();
        let err = registry.register(" ", |_| Ok(())).unwrap_err();
        assert!(matches!(err, ConduitError::Validation { .. }));
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let registry = TriggerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            registry
                .register("ordered", move |_: &Unit| {
                    order.lock().unwrap().push(i);
                    Ok(())
                })
                .unwrap();
        }

        registry.dispatch("ordered", &unit()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_failure_does_not_stop_fan_out() {
        let registry = TriggerRegistry::new();
        let calls = Arc::new(Mutex::new(0));

        registry
            .register("fanout", |_: &Unit| Err(anyhow!("first failure")))
            .unwrap();
        let counter = calls.clone();
        registry
            .register("fanout", move |_: &Unit| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();
        registry
            .register("fanout", |_: &Unit| Err(anyhow!("second failure")))
            .unwrap();

        let err = registry.dispatch("fanout", &unit()).unwrap_err();
        assert_eq!(*calls.lock().unwrap(), 1);
        match err {
            ConduitError::HandlerFailed {
                failures, error, ..
            } => {
                assert_eq!(failures, 2);
                assert_eq!(error.to_string(), "first failure");
            }
            other => panic!("expected HandlerFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_panicking_handler_is_reported() {
        let registry = TriggerRegistry::new();
        registry
            .register("panics", |_: &Unit| -> anyhow::Result<()> { panic!("kaboom") })
            .unwrap();

        let err = registry.dispatch("panics", &unit()).unwrap_err();
        assert!(err.to_string().contains("kaboom"));
    }

    #[test]
    fn test_unregister_removes_only_that_handler() {
        let registry = TriggerRegistry::new();
        let a = registry.register("evt", |_: &Unit| Ok(())).unwrap();
        let b = registry.register("evt", |_: &Unit| Ok(())).unwrap();
        assert_eq!(registry.handler_count("evt"), 2);

        assert!(registry.unregister("evt", a));
        assert!(!registry.unregister("evt", a));
        assert_eq!(registry.handler_count("evt"), 1);

        assert!(registry.unregister("evt", b));
        assert!(!registry.has_handlers("evt"));
    }

    #[test]
    fn test_handler_can_reenter_registry() {
        let registry = Arc::new(TriggerRegistry::new());
        let inner_calls = Arc::new(Mutex::new(0));

        let counter = inner_calls.clone();
        registry
            .register("inner", move |_: &Unit| {
                *counter.lock().unwrap() += 1;
                Ok(())
            })
            .unwrap();

        let reentrant = registry.clone();
        registry
            .register("outer", move |unit: &Unit| {
                reentrant.register("late", |_: &Unit| Ok(()))?;
                reentrant.dispatch("inner", unit)?;
                Ok(())
            })
            .unwrap();

        registry.dispatch("outer", &unit()).unwrap();
        assert_eq!(*inner_calls.lock().unwrap(), 1);
        assert!(registry.has_handlers("late"));
    }
}
