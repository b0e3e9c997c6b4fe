//! # Conduit
//!
//! Priority-tiered routing of short-lived units, deduplication of in-flight
//! operations, and erasure-coded storage across two backends.
//!
//! ## Components
//!
//! - [`Router`] accepts [`Unit`]s into per-destination queues, one per
//!   [`PriorityClass`]. The [`CirculationScheduler`] pumps them into each
//!   destination's delivery path once per tick, CONTROL before STANDARD
//!   before RECOVERY. Units expire by TTL and are dropped after too many
//!   failed delivery attempts.
//! - [`TriggerRegistry`] fans lifecycle events (`unit.emitted`,
//!   `unit.delivered`, `unit.expired`, `unit.dropped`) out to handlers.
//! - [`DedupLockRegistry`] suppresses duplicate operations by signature.
//! - [`ErasureCodedStore`] encodes payloads into Reed-Solomon shards and
//!   persists them on a primary backend with fallback to a secondary.
//! - [`Engine`] wires them together and owns the background tasks.
//!
//! ## Guarantees
//!
//! - Every emitted unit reaches exactly one of DELIVERED, EXPIRED, DROPPED.
//! - Emitters never block and never see backpressure as an error.
//! - At most one live lock per signature.
//! - A stored object survives the loss or corruption of any `m` shards.
//!
//! ## Example
//!
//! ```ignore
//! use conduit::{Config, EngineBuilder, Unit};
//!
//! let handle = EngineBuilder::new(Config::default()).build()?.start();
//! handle.emit(Unit::standard("reports", b"daily".to_vec()))?;
//! let unit = handle.recv(&"reports".into()).await;
//! handle.shutdown().await;
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod erasure;
pub mod error;
pub mod lock;
pub mod metrics;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod store;
pub mod strand;
pub mod task;
pub mod trigger;
pub mod unit;

pub use backend::{BackendError, MemoryBackend, ObjectBackend, PersistedRecord, PostgresBackend};
pub use config::Config;
pub use engine::{Engine, EngineBuilder, EngineHandle, StoreOnce};
pub use erasure::{ErasureCoder, ShardSet};
pub use error::{ConduitError, ErrorCategory, Result};
pub use lock::{DedupLockRegistry, LockGuard, LockRecord, LockStatus};
pub use metrics::{MetricsSnapshot, RoutingMetrics};
pub use queue::{DeliveryPath, DestinationSnapshot, PriorityQueueSet, TickReport};
pub use router::{Router, RouterSettings};
pub use scheduler::CirculationScheduler;
pub use store::{
    BackendRole, ErasureCodedStore, Metadata, RetrievedObject, StoreReceipt, StoredObject,
};
pub use strand::{ShardManifest, Strands};
pub use task::BackgroundTask;
pub use trigger::{
    HandlerId, TriggerHandler, TriggerRegistry, UNIT_DELIVERED, UNIT_DROPPED, UNIT_EMITTED,
    UNIT_EXPIRED,
};
pub use unit::{DestinationId, PriorityClass, Unit, UnitId, UnitOutcome};
