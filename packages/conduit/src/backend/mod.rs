//! Object backends: where encoded strands are persisted.
//!
//! A backend stores whole records keyed by object key. Writes are atomic
//! upserts (last write wins); the store never writes partial records.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// One persisted object as a backend sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedRecord {
    pub key: String,
    /// Strand frame (manifest, primary strand, secondary strand).
    pub encoded_strands: Bytes,
    pub metadata: serde_json::Value,
    pub context: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Failure reported by a single backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend is reachable but holds nothing under the key.
    #[error("not found")]
    NotFound,

    /// The backend could not serve the request.
    #[error("unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl BackendError {
    pub fn unavailable(error: impl Into<anyhow::Error>) -> Self {
        BackendError::Unavailable(error.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound)
    }
}

/// A transactional key-value store for persisted records.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Insert or replace the record for `record.key` in one transaction.
    async fn put(&self, record: &PersistedRecord) -> Result<(), BackendError>;

    /// Fetch the record for `key`.
    async fn get(&self, key: &str) -> Result<PersistedRecord, BackendError>;

    /// Delete the record for `key`. Returns whether one existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;
}
