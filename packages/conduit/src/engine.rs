//! Conduit engine: wires routing, dedup locks, and storage together.
//!
//! ```text
//!                ┌────────────── Engine ───────────────┐
//!  emit ───────► │ Router ◄── CirculationScheduler      │ ──► take / recv
//!                │   │                                  │
//!                │   └──► TriggerRegistry ──► handlers  │
//!  acquire ────► │ DedupLockRegistry ◄── sweeper        │
//!  store ──────► │ ErasureCodedStore ──► primary        │
//!                │                   └─► secondary      │
//!                └──────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let handle = EngineBuilder::new(Config::from_env()?)
//!     .with_primary_backend(primary)
//!     .with_secondary_backend(secondary)
//!     .build()?
//!     .start();
//!
//! handle.register_handler("unit.delivered", |unit: &Unit| {
//!     tracing::info!(unit = %unit.id(), "delivered");
//!     Ok(())
//! })?;
//! handle.emit(Unit::control("billing", b"rebalance".to_vec()))?;
//!
//! handle.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;

use crate::backend::{MemoryBackend, ObjectBackend};
use crate::config::Config;
use crate::erasure::ErasureCoder;
use crate::error::{ConduitError, Result};
use crate::lock::DedupLockRegistry;
use crate::metrics::MetricsSnapshot;
use crate::queue::TickReport;
use crate::router::Router;
use crate::scheduler::CirculationScheduler;
use crate::store::{ErasureCodedStore, Metadata, RetrievedObject, StoreReceipt};
use crate::task::BackgroundTask;
use crate::trigger::{HandlerId, TriggerRegistry};
use crate::unit::{DestinationId, Unit, UnitId};

/// Result of [`Engine::store_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOnce {
    /// This call held the lock and persisted the object.
    Stored(StoreReceipt),
    /// Another call with the same signature was in flight; nothing written.
    Duplicate,
}

// =============================================================================
// Engine
// =============================================================================

/// The assembled system. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    router: Router,
    locks: Arc<DedupLockRegistry>,
    store: Arc<ErasureCodedStore>,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        self.router.triggers()
    }

    pub fn locks(&self) -> &Arc<DedupLockRegistry> {
        &self.locks
    }

    pub fn object_store(&self) -> &Arc<ErasureCodedStore> {
        &self.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.router.metrics().snapshot()
    }

    /// Register a closure for `event_type`.
    pub fn register_handler<F>(&self, event_type: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Unit) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.triggers().register(event_type, handler)
    }

    pub fn unregister_handler(&self, event_type: &str, id: HandlerId) -> bool {
        self.triggers().unregister(event_type, id)
    }

    /// Accept a unit for routing. See [`Router::emit`].
    pub fn emit(&self, unit: Unit) -> Result<UnitId> {
        self.router.emit(unit)
    }

    /// Run one circulation pass now, independent of the scheduler.
    pub fn tick(&self) -> TickReport {
        self.router.tick()
    }

    pub fn take(&self, destination: &DestinationId) -> Option<Unit> {
        self.router.take(destination)
    }

    pub fn take_batch(&self, destination: &DestinationId, max: usize) -> Vec<Unit> {
        self.router.take_batch(destination, max)
    }

    pub async fn recv(&self, destination: &DestinationId) -> Unit {
        self.router.recv(destination).await
    }

    /// Claim `signature` for `ttl`. `false` means a duplicate is in flight.
    pub fn acquire(&self, signature: &str, ttl: Duration) -> Result<bool> {
        self.locks.acquire(signature, ttl)
    }

    /// Like [`acquire`](Self::acquire) but a duplicate is an error.
    pub fn acquire_exclusive(&self, signature: &str, ttl: Duration) -> Result<()> {
        if self.locks.acquire(signature, ttl)? {
            Ok(())
        } else {
            Err(ConduitError::DuplicateOperation {
                signature: signature.to_string(),
            })
        }
    }

    /// Release `signature`. No-op when it is not held.
    pub fn release(&self, signature: &str) -> Result<()> {
        self.locks.release(signature).map(|_| ())
    }

    pub async fn store(
        &self,
        key: &str,
        payload: &[u8],
        metadata: Metadata,
        context: Value,
    ) -> Result<StoreReceipt> {
        self.store.store(key, payload, metadata, context).await
    }

    pub async fn retrieve(&self, key: &str) -> Result<RetrievedObject> {
        self.store.retrieve(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.store.delete(key).await
    }

    /// Persist unless an operation with the same signature is in flight.
    ///
    /// The lock is held for the duration of the write and released after.
    pub async fn store_once(
        &self,
        signature: &str,
        key: &str,
        payload: &[u8],
        metadata: Metadata,
        context: Value,
    ) -> Result<StoreOnce> {
        let Some(guard) = self.locks.acquire_guard(signature, self.config.lock_ttl)? else {
            info!(signature, key, "duplicate store suppressed");
            return Ok(StoreOnce::Duplicate);
        };
        let receipt = self.store.store(key, payload, metadata, context).await;
        drop(guard);
        receipt.map(StoreOnce::Stored)
    }

    /// Start the circulation scheduler and lock sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> EngineHandle {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis() as u64,
            lock_sweep_interval_ms = self.config.lock_sweep_interval.as_millis() as u64,
            "starting conduit engine"
        );

        let scheduler =
            CirculationScheduler::new(self.router.clone(), self.config.tick_interval).start();
        let sweeper = self.locks.spawn_sweeper(self.config.lock_sweep_interval);

        EngineHandle {
            engine: self,
            tasks: vec![scheduler, sweeper],
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("router", &self.router)
            .field("locks", &self.locks.len())
            .field("store", &self.store)
            .finish()
    }
}

// =============================================================================
// Engine Handle
// =============================================================================

/// Handle to a running engine.
///
/// Owns the background tasks. Dropping the handle cancels them; prefer
/// [`shutdown`](Self::shutdown), which also waits for them to exit.
pub struct EngineHandle {
    engine: Engine,
    tasks: Vec<BackgroundTask>,
}

impl EngineHandle {
    /// The engine, for cloning into other tasks.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn register_handler<F>(&self, event_type: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Unit) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.engine.register_handler(event_type, handler)
    }

    pub fn emit(&self, unit: Unit) -> Result<UnitId> {
        self.engine.emit(unit)
    }

    pub fn take(&self, destination: &DestinationId) -> Option<Unit> {
        self.engine.take(destination)
    }

    pub fn take_batch(&self, destination: &DestinationId, max: usize) -> Vec<Unit> {
        self.engine.take_batch(destination, max)
    }

    pub async fn recv(&self, destination: &DestinationId) -> Unit {
        self.engine.recv(destination).await
    }

    pub fn acquire(&self, signature: &str, ttl: Duration) -> Result<bool> {
        self.engine.acquire(signature, ttl)
    }

    pub fn release(&self, signature: &str) -> Result<()> {
        self.engine.release(signature)
    }

    pub async fn store(
        &self,
        key: &str,
        payload: &[u8],
        metadata: Metadata,
        context: Value,
    ) -> Result<StoreReceipt> {
        self.engine.store(key, payload, metadata, context).await
    }

    pub async fn retrieve(&self, key: &str) -> Result<RetrievedObject> {
        self.engine.retrieve(key).await
    }

    pub async fn store_once(
        &self,
        signature: &str,
        key: &str,
        payload: &[u8],
        metadata: Metadata,
        context: Value,
    ) -> Result<StoreOnce> {
        self.engine
            .store_once(signature, key, payload, metadata, context)
            .await
    }

    /// Whether every background task is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(BackgroundTask::is_running)
    }

    /// Cancel the background tasks and wait for them to exit.
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.shutdown().await;
        }
        info!("conduit engine stopped");
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.engine)
            .field("tasks", &self.tasks.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Engine Builder
// =============================================================================

/// Builder for an [`Engine`].
///
/// Without explicit backends the primary is an in-memory backend and there is
/// no secondary.
pub struct EngineBuilder {
    config: Config,
    triggers: Option<Arc<TriggerRegistry>>,
    primary: Option<Arc<dyn ObjectBackend>>,
    secondary: Option<Arc<dyn ObjectBackend>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            triggers: None,
            primary: None,
            secondary: None,
        }
    }

    /// Use an existing trigger registry (e.g. shared between engines).
    pub fn with_triggers(mut self, triggers: Arc<TriggerRegistry>) -> Self {
        self.triggers = Some(triggers);
        self
    }

    pub fn with_primary_backend(mut self, backend: Arc<dyn ObjectBackend>) -> Self {
        self.primary = Some(backend);
        self
    }

    pub fn with_secondary_backend(mut self, backend: Arc<dyn ObjectBackend>) -> Self {
        self.secondary = Some(backend);
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let triggers = self
            .triggers
            .unwrap_or_else(|| Arc::new(TriggerRegistry::new()));
        let router = Router::new(self.config.router_settings(), triggers);

        let coder = ErasureCoder::new(self.config.data_shards, self.config.parity_shards)?;
        let primary: Arc<dyn ObjectBackend> = match self.primary {
            Some(backend) => backend,
            None => Arc::new(MemoryBackend::new("memory")),
        };
        let store = ErasureCodedStore::new(coder, primary, self.secondary);

        Ok(Engine {
            config: Arc::new(self.config),
            router,
            locks: Arc::new(DedupLockRegistry::new()),
            store: Arc::new(store),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::UNIT_DELIVERED;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_build_rejects_invalid_config() {
        let err = EngineBuilder::new(Config::default().with_queue_capacity(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConduitError::Validation { .. }));
    }

    #[test]
    fn test_acquire_exclusive_reports_duplicate() {
        let engine = EngineBuilder::new(Config::default()).build().unwrap();
        engine
            .acquire_exclusive("op", Duration::from_secs(5))
            .unwrap();
        let err = engine
            .acquire_exclusive("op", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ConduitError::DuplicateOperation { .. }));
        assert!(!err.is_retryable());

        engine.release("op").unwrap();
        assert!(engine.acquire("op", Duration::from_secs(5)).unwrap());
    }

    #[tokio::test]
    async fn test_store_once_suppresses_inflight_duplicate() {
        let engine = EngineBuilder::new(Config::default()).build().unwrap();

        assert!(engine.acquire("persist:k", Duration::from_secs(5)).unwrap());
        let outcome = engine
            .store_once("persist:k", "k", b"x", Metadata::new(), Value::Null)
            .await
            .unwrap();
        assert_eq!(outcome, StoreOnce::Duplicate);
        assert!(matches!(
            engine.retrieve("k").await,
            Err(ConduitError::NotFound { .. })
        ));

        engine.release("persist:k").unwrap();
        let outcome = engine
            .store_once("persist:k", "k", b"x", Metadata::new(), Value::Null)
            .await
            .unwrap();
        assert!(matches!(outcome, StoreOnce::Stored(_)));
        assert!(engine.locks().is_empty());
    }

    #[tokio::test]
    async fn test_started_engine_delivers_and_shuts_down() {
        let config = Config::default().with_tick_interval(Duration::from_millis(5));
        let handle = EngineBuilder::new(config).build().unwrap().start();

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = delivered.clone();
        handle
            .register_handler(UNIT_DELIVERED, move |_: &Unit| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let id = handle.emit(Unit::standard("svc", b"ping".to_vec())).unwrap();
        let unit = tokio::time::timeout(
            Duration::from_secs(2),
            handle.recv(&DestinationId::from("svc")),
        )
        .await
        .expect("unit was never delivered");

        assert_eq!(unit.id(), id);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(handle.is_running());

        handle.shutdown().await;
    }
}
