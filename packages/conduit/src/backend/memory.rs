//! In-process backend, used in tests and for running without a database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BackendError, ObjectBackend, PersistedRecord};

/// Records held in a map. Can be switched offline to simulate an outage.
#[derive(Debug)]
pub struct MemoryBackend {
    name: String,
    records: RwLock<HashMap<String, PersistedRecord>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Make every subsequent call fail with `Unavailable` (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check(&self) -> Result<(), BackendError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError::unavailable(anyhow!(
                "backend {} is offline",
                self.name
            )))
        }
    }
}

#[async_trait]
impl ObjectBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, record: &PersistedRecord) -> Result<(), BackendError> {
        self.check()?;
        self.records
            .write()
            .await
            .insert(record.key.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<PersistedRecord, BackendError> {
        self.check()?;
        self.records
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.check()?;
        Ok(self.records.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use serde_json::json;

    fn record(key: &str, body: &'static [u8]) -> PersistedRecord {
        PersistedRecord {
            key: key.to_string(),
            encoded_strands: Bytes::from_static(body),
            metadata: json!({}),
            context: json!({}),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let backend = MemoryBackend::new("mem");
        backend.put(&record("k", b"one")).await.unwrap();
        backend.put(&record("k", b"two")).await.unwrap();

        let got = backend.get("k").await.unwrap();
        assert_eq!(got.encoded_strands.as_ref(), b"two");
        assert_eq!(backend.len().await, 1);

        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert!(backend.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_offline_backend_is_unavailable() {
        let backend = MemoryBackend::new("mem");
        backend.set_available(false);

        let err = backend.put(&record("k", b"x")).await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(err.to_string().contains("offline"));

        backend.set_available(true);
        assert!(backend.put(&record("k", b"x")).await.is_ok());
    }
}
