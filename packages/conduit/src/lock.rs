//! Deduplication locks keyed by operation signature.
//!
//! A signature identifies a logical operation (for example
//! `"persist:invoice-42"`). While a live record exists for it, further
//! `acquire` calls answer `false` instead of starting the operation twice.
//!
//! ```text
//! ABSENT ──reserve──► PENDING ──activate──► ACTIVE ──release──► COMPLETED (removed)
//!    │                   │                    ▲  │
//!    └──────acquire──────┼────────────────────┘  │
//!                        └──── now > expires_at ─┴─► EXPIRED (removed by sweep/acquire)
//! ```
//!
//! TTLs are checked passively: on acquire, and by the periodic sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ConduitError, Result};
use crate::task::BackgroundTask;

/// Lifecycle state of a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    /// Identity claimed, work not started.
    Pending,
    /// Work in progress.
    Active,
    /// Released by its holder. Only seen on the record `release` hands back.
    Completed,
}

/// One in-flight operation.
#[derive(Debug, Clone)]
pub struct LockRecord {
    signature: String,
    created_at: Instant,
    expires_at: Instant,
    status: LockStatus,
    lease: u64,
}

impl LockRecord {
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn status(&self) -> LockStatus {
        self.status
    }

    fn is_live(&self, now: Instant) -> bool {
        now <= self.expires_at
    }
}

/// Registry of in-flight operation signatures.
#[derive(Debug, Default)]
pub struct DedupLockRegistry {
    records: RwLock<HashMap<String, LockRecord>>,
    next_lease: AtomicU64,
}

impl DedupLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `signature` for `ttl`, going straight to ACTIVE.
    ///
    /// Returns `false` if a live record already exists. An expired record is
    /// replaced.
    pub fn acquire(&self, signature: &str, ttl: Duration) -> Result<bool> {
        Ok(self.insert(signature, ttl, LockStatus::Active)?.is_some())
    }

    /// Claim `signature` as PENDING. Blocks duplicates exactly like `acquire`.
    pub fn reserve(&self, signature: &str, ttl: Duration) -> Result<bool> {
        Ok(self.insert(signature, ttl, LockStatus::Pending)?.is_some())
    }

    /// Move a live PENDING record to ACTIVE.
    ///
    /// Returns `false` when there is no live pending record for `signature`.
    pub fn activate(&self, signature: &str) -> Result<bool> {
        let now = Instant::now();
        let mut records = self.write()?;
        match records.get_mut(signature) {
            Some(record) if record.is_live(now) && record.status == LockStatus::Pending => {
                record.status = LockStatus::Active;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Complete and remove the record for `signature`.
    ///
    /// Returns the completed record, or `None` when nothing live was held.
    /// Releasing an absent or expired signature is a no-op.
    pub fn release(&self, signature: &str) -> Result<Option<LockRecord>> {
        let now = Instant::now();
        let mut records = self.write()?;
        match records.remove(signature) {
            Some(mut record) if record.is_live(now) => {
                record.status = LockStatus::Completed;
                debug!(signature, "lock released");
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    /// Like [`acquire`](Self::acquire), but the lock is released when the
    /// returned guard drops. `None` means a duplicate is in flight.
    pub fn acquire_guard(self: &Arc<Self>, signature: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        let Some(lease) = self.insert(signature, ttl, LockStatus::Active)? else {
            return Ok(None);
        };
        Ok(Some(LockGuard {
            registry: Arc::clone(self),
            signature: signature.to_string(),
            lease,
            released: false,
        }))
    }

    /// Remove every expired record. Returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let now = Instant::now();
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, record| record.is_live(now));
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, remaining = records.len(), "swept expired locks");
        }
        Ok(removed)
    }

    /// Status of the live record for `signature`, if any.
    pub fn status(&self, signature: &str) -> Result<Option<LockStatus>> {
        let now = Instant::now();
        Ok(self
            .read()?
            .get(signature)
            .filter(|record| record.is_live(now))
            .map(|record| record.status))
    }

    /// Number of records held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep`](Self::sweep) every `interval` in the background.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> BackgroundTask {
        let registry = Arc::clone(self);
        BackgroundTask::spawn_periodic("lock-sweeper", interval, move || {
            if let Err(e) = registry.sweep() {
                warn!(error = %e, "lock sweep failed");
            }
        })
    }

    /// Check-then-set under the write lock. Returns the new lease on success.
    fn insert(&self, signature: &str, ttl: Duration, status: LockStatus) -> Result<Option<u64>> {
        if signature.trim().is_empty() {
            return Err(ConduitError::validation("signature", "must not be empty"));
        }
        if ttl.is_zero() {
            return Err(ConduitError::validation("ttl", "must be greater than zero"));
        }

        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .ok_or_else(|| ConduitError::validation("ttl", "too large"))?;
        let mut records = self.write()?;
        if let Some(existing) = records.get(signature) {
            if existing.is_live(now) {
                debug!(signature, status = ?existing.status, "duplicate operation suppressed");
                return Ok(None);
            }
        }

        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);
        records.insert(
            signature.to_string(),
            LockRecord {
                signature: signature.to_string(),
                created_at: now,
                expires_at,
                status,
                lease,
            },
        );
        Ok(Some(lease))
    }

    /// Release only if the record still belongs to `lease`.
    fn release_lease(&self, signature: &str, lease: u64) -> Result<bool> {
        let mut records = self.write()?;
        if records.get(signature).is_some_and(|r| r.lease == lease) {
            records.remove(signature);
            return Ok(true);
        }
        Ok(false)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, LockRecord>>> {
        self.records.read().map_err(|_| ConduitError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, LockRecord>>> {
        self.records.write().map_err(|_| ConduitError::LockPoisoned)
    }
}

/// Releases its lock on drop.
///
/// If the lock expired and someone else acquired the signature meanwhile,
/// dropping the guard leaves their record alone.
#[derive(Debug)]
pub struct LockGuard {
    registry: Arc<DedupLockRegistry>,
    signature: String,
    lease: u64,
    released: bool,
}

impl LockGuard {
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Release now instead of on drop.
    pub fn release(mut self) -> Result<bool> {
        self.released = true;
        self.registry.release_lease(&self.signature, self.lease)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.registry.release_lease(&self.signature, self.lease) {
            warn!(signature = %self.signature, error = %e, "failed to release lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn test_acquire_is_exclusive() {
        let registry = DedupLockRegistry::new();
        assert!(registry.acquire("persist:1", TTL).unwrap());
        assert!(!registry.acquire("persist:1", TTL).unwrap());
        assert!(registry.acquire("persist:2", TTL).unwrap());
        assert_eq!(registry.status("persist:1").unwrap(), Some(LockStatus::Active));
    }

    #[test]
    fn test_release_then_reacquire() {
        let registry = DedupLockRegistry::new();
        registry.acquire("op", TTL).unwrap();

        let record = registry.release("op").unwrap().unwrap();
        assert_eq!(record.status(), LockStatus::Completed);
        assert_eq!(record.signature(), "op");
        assert!(registry.is_empty());

        assert!(registry.acquire("op", TTL).unwrap());
    }

    #[test]
    fn test_rejects_unrepresentable_ttl() {
        let registry = DedupLockRegistry::new();
        assert!(matches!(
            registry.acquire("op", Duration::MAX),
            Err(ConduitError::Validation { field: "ttl", .. })
        ));
        assert!(matches!(
            registry.reserve("op", Duration::MAX),
            Err(ConduitError::Validation { field: "ttl", .. })
        ));
        assert!(registry.is_empty());
        assert!(registry.acquire("op", TTL).unwrap());
    }

    #[test]
    fn test_release_absent_is_noop() {
        let registry = DedupLockRegistry::new();
        assert!(registry.release("never-held").unwrap().is_none());
    }

    #[test]
    fn test_validation() {
        let registry = DedupLockRegistry::new();
        assert!(matches!(
            registry.acquire("", TTL),
            Err(ConduitError::Validation {
                field: "signature",
                ..
            })
        ));
        assert!(matches!(
            registry.acquire("op", Duration::ZERO),
            Err(ConduitError::Validation { field: "ttl", .. })
        ));
    }

    #[test]
    fn test_reserve_blocks_and_activates() {
        let registry = DedupLockRegistry::new();
        assert!(registry.reserve("op", TTL).unwrap());
        assert_eq!(registry.status("op").unwrap(), Some(LockStatus::Pending));
        assert!(!registry.acquire("op", TTL).unwrap());

        assert!(registry.activate("op").unwrap());
        assert_eq!(registry.status("op").unwrap(), Some(LockStatus::Active));
        assert!(!registry.activate("op").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_is_replaced() {
        let registry = DedupLockRegistry::new();
        registry.acquire("op", Duration::from_millis(50)).unwrap();

        tokio::time::advance(Duration::from_millis(51)).await;
        assert_eq!(registry.status("op").unwrap(), None);
        assert!(registry.release("op").unwrap().is_none());

        registry.acquire("op2", Duration::from_millis(50)).unwrap();
        tokio::time::advance(Duration::from_millis(51)).await;
        assert!(registry.acquire("op2", TTL).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let registry = DedupLockRegistry::new();
        registry.acquire("short", Duration::from_millis(10)).unwrap();
        registry.acquire("long", TTL).unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(registry.sweep().unwrap(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.status("long").unwrap(), Some(LockStatus::Active));
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = Arc::new(DedupLockRegistry::new());
        {
            let guard = registry.acquire_guard("op", TTL).unwrap().unwrap();
            assert_eq!(guard.signature(), "op");
            assert!(registry.acquire_guard("op", TTL).unwrap().is_none());
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_guard_leaves_new_holder_alone() {
        let registry = Arc::new(DedupLockRegistry::new());
        let stale = registry
            .acquire_guard("op", Duration::from_millis(10))
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        assert!(registry.acquire("op", TTL).unwrap());

        assert!(!stale.release().unwrap());
        assert_eq!(registry.status("op").unwrap(), Some(LockStatus::Active));
    }
}
