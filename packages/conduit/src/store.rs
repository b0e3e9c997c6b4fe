//! Erasure-coded object store over a primary and a secondary backend.
//!
//! # Writes
//!
//! A payload is encoded into data and parity shards, framed as strands, and
//! written as one record to the primary backend. If the primary rejects the
//! write the identical record goes to the secondary. The call fails only when
//! both backends refused it.
//!
//! # Reads
//!
//! Both backends are read concurrently. When both hold a reconstructable
//! copy the one with the later `updated_at` wins (the primary on a tie), so a
//! write that fell back to the secondary is not shadowed by an older primary
//! copy once the primary returns.
//!
//! | primary          | secondary        | result                          |
//! |------------------|------------------|---------------------------------|
//! | ok               | ok               | newer copy                      |
//! | ok               | anything else    | primary copy                    |
//! | any failure      | ok               | secondary copy                  |
//! | unrecoverable    | anything else    | primary's reconstruction error  |
//! | not found        | unrecoverable    | secondary's reconstruction error|
//! | not found        | not found        | `NotFound`                      |
//! | unreachable      | not found/unreachable | `BackendUnavailable`       |

use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ObjectBackend, PersistedRecord};
use crate::erasure::{ErasureCoder, ShardSet};
use crate::error::{ConduitError, Result};
use crate::strand::Strands;

/// Free-form string-keyed metadata stored beside a payload.
pub type Metadata = serde_json::Map<String, Value>;

/// Which backend served or accepted a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    Primary,
    Secondary,
}

impl std::fmt::Display for BackendRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendRole::Primary => write!(f, "primary"),
            BackendRole::Secondary => write!(f, "secondary"),
        }
    }
}

/// An object as persisted: key, strands, and caller-supplied annotations.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub key: String,
    pub strands: Strands,
    pub metadata: Metadata,
    pub context: Value,
}

impl StoredObject {
    fn into_record(self) -> PersistedRecord {
        PersistedRecord {
            encoded_strands: self.strands.to_bytes(),
            key: self.key,
            metadata: Value::Object(self.metadata),
            context: self.context,
            updated_at: Utc::now(),
        }
    }

    fn from_record(record: PersistedRecord) -> Result<Self> {
        let metadata = match record.metadata {
            Value::Object(map) => map,
            Value::Null => Metadata::new(),
            other => {
                return Err(ConduitError::Codec(format!(
                    "metadata must be a JSON object, found {other}"
                )))
            }
        };
        Ok(Self {
            strands: Strands::from_bytes(record.encoded_strands)?,
            key: record.key,
            metadata,
            context: record.context,
        })
    }
}

/// Outcome of a successful `store`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreReceipt {
    pub key: String,
    pub backend: BackendRole,
    pub payload_len: usize,
    pub encoded_len: usize,
}

/// Outcome of a successful `retrieve`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedObject {
    pub payload: Bytes,
    pub metadata: Metadata,
    pub context: Value,
    pub source: BackendRole,
    /// When the served copy was written.
    pub updated_at: DateTime<Utc>,
}

/// How reading one backend went.
enum ReadAttempt {
    Found(RetrievedObject),
    Missing,
    Unreadable(BackendError),
    Unrecoverable(ConduitError),
}

/// Encodes payloads and persists them across two backends.
pub struct ErasureCodedStore {
    coder: ErasureCoder,
    primary: Arc<dyn ObjectBackend>,
    secondary: Option<Arc<dyn ObjectBackend>>,
}

impl ErasureCodedStore {
    pub fn new(
        coder: ErasureCoder,
        primary: Arc<dyn ObjectBackend>,
        secondary: Option<Arc<dyn ObjectBackend>>,
    ) -> Self {
        Self {
            coder,
            primary,
            secondary,
        }
    }

    pub fn coder(&self) -> &ErasureCoder {
        &self.coder
    }

    /// Split `payload` into data and parity shards.
    pub fn encode(&self, payload: &[u8]) -> Result<ShardSet> {
        self.coder.encode(payload)
    }

    /// Reconstruct a payload from a (possibly damaged) shard set.
    pub fn decode(&self, set: ShardSet) -> Result<Vec<u8>> {
        self.coder.decode(set)
    }

    /// Encode and persist `payload` under `key`. Last write wins.
    pub async fn store(
        &self,
        key: &str,
        payload: &[u8],
        metadata: Metadata,
        context: Value,
    ) -> Result<StoreReceipt> {
        validate_key(key)?;

        let strands = Strands::from_shard_set(&self.encode(payload)?)?;
        let record = StoredObject {
            key: key.to_string(),
            strands,
            metadata,
            context,
        }
        .into_record();
        let encoded_len = record.encoded_strands.len();

        let backend = match self.primary.put(&record).await {
            Ok(()) => BackendRole::Primary,
            Err(primary_err) => {
                warn!(
                    key,
                    backend = self.primary.name(),
                    error = %primary_err,
                    "primary write failed, trying secondary"
                );
                let Some(secondary) = &self.secondary else {
                    return Err(ConduitError::BackendUnavailable {
                        primary: primary_err,
                        secondary: not_configured(),
                    });
                };
                secondary.put(&record).await.map_err(|secondary_err| {
                    ConduitError::BackendUnavailable {
                        primary: primary_err,
                        secondary: secondary_err,
                    }
                })?;
                BackendRole::Secondary
            }
        };

        info!(key, backend = %backend, payload_len = payload.len(), encoded_len, "object stored");

        Ok(StoreReceipt {
            key: key.to_string(),
            backend,
            payload_len: payload.len(),
            encoded_len,
        })
    }

    /// Fetch and reconstruct the object stored under `key`.
    pub async fn retrieve(&self, key: &str) -> Result<RetrievedObject> {
        validate_key(key)?;

        let Some(secondary_backend) = &self.secondary else {
            return match self
                .read(self.primary.as_ref(), BackendRole::Primary, key)
                .await
            {
                ReadAttempt::Found(object) => Ok(object),
                ReadAttempt::Missing => Err(ConduitError::NotFound {
                    key: key.to_string(),
                }),
                ReadAttempt::Unrecoverable(e) => Err(e),
                ReadAttempt::Unreadable(e) => Err(ConduitError::BackendUnavailable {
                    primary: e,
                    secondary: not_configured(),
                }),
            };
        };

        let (primary, secondary) = tokio::join!(
            self.read(self.primary.as_ref(), BackendRole::Primary, key),
            self.read(secondary_backend.as_ref(), BackendRole::Secondary, key),
        );

        match (primary, secondary) {
            (ReadAttempt::Found(p), ReadAttempt::Found(s)) => {
                if s.updated_at > p.updated_at {
                    info!(
                        key,
                        primary_updated_at = %p.updated_at,
                        secondary_updated_at = %s.updated_at,
                        "secondary copy is newer, serving it"
                    );
                    Ok(s)
                } else {
                    Ok(p)
                }
            }
            (ReadAttempt::Found(object), secondary) => {
                log_miss(secondary_backend.name(), key, &secondary);
                Ok(object)
            }
            (primary, ReadAttempt::Found(object)) => {
                log_miss(self.primary.name(), key, &primary);
                info!(key, "object served from secondary backend");
                Ok(object)
            }
            (primary, secondary) => {
                log_miss(self.primary.name(), key, &primary);
                log_miss(secondary_backend.name(), key, &secondary);
                Err(read_failure(key, primary, secondary))
            }
        }
    }

    /// Remove `key` from both backends. Returns whether any copy existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;

        let primary = self.primary.delete(key).await;
        let secondary = match &self.secondary {
            Some(backend) => backend.delete(key).await,
            None => Ok(false),
        };

        match (primary, secondary) {
            (Ok(p), Ok(s)) => Ok(p || s),
            (Ok(p), Err(e)) | (Err(e), Ok(p)) if p => {
                warn!(key, error = %e, "delete succeeded on only one backend");
                Ok(true)
            }
            (Ok(_), Err(e)) => {
                warn!(key, error = %e, "secondary delete failed");
                Ok(false)
            }
            (Err(e), Ok(_)) => {
                warn!(key, error = %e, "primary delete failed");
                Ok(false)
            }
            (Err(p), Err(s)) => Err(ConduitError::BackendUnavailable {
                primary: p,
                secondary: s,
            }),
        }
    }

    async fn read(&self, backend: &dyn ObjectBackend, role: BackendRole, key: &str) -> ReadAttempt {
        let record = match backend.get(key).await {
            Ok(record) => record,
            Err(BackendError::NotFound) => return ReadAttempt::Missing,
            Err(e) => return ReadAttempt::Unreadable(e),
        };
        let updated_at = record.updated_at;

        match self.reconstruct(record) {
            Ok((payload, object)) => ReadAttempt::Found(RetrievedObject {
                payload: Bytes::from(payload),
                metadata: object.metadata,
                context: object.context,
                source: role,
                updated_at,
            }),
            Err(e) => ReadAttempt::Unrecoverable(e),
        }
    }

    fn reconstruct(&self, record: PersistedRecord) -> Result<(Vec<u8>, StoredObject)> {
        let object = StoredObject::from_record(record)?;
        let manifest = object.strands.manifest();
        let set = object.strands.to_shard_set()?;

        let payload = if manifest.data_shards() == self.coder.data_shards()
            && manifest.parity_shards() == self.coder.parity_shards()
        {
            self.coder.decode(set)?
        } else {
            // Written under a different geometry.
            ErasureCoder::new(manifest.data_shards(), manifest.parity_shards())?.decode(set)?
        };
        Ok((payload, object))
    }
}

impl std::fmt::Debug for ErasureCodedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasureCodedStore")
            .field("coder", &self.coder)
            .field("primary", &self.primary.name())
            .field("secondary", &self.secondary.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(ConduitError::validation("key", "must not be empty"));
    }
    Ok(())
}

fn not_configured() -> BackendError {
    BackendError::unavailable(anyhow!("no secondary backend configured"))
}

/// Error for a read where neither backend produced the object.
fn read_failure(key: &str, primary: ReadAttempt, secondary: ReadAttempt) -> ConduitError {
    match (primary, secondary) {
        (ReadAttempt::Unrecoverable(e), _) | (_, ReadAttempt::Unrecoverable(e)) => e,
        (ReadAttempt::Unreadable(p), ReadAttempt::Unreadable(s)) => {
            ConduitError::BackendUnavailable {
                primary: p,
                secondary: s,
            }
        }
        (ReadAttempt::Unreadable(p), _) => ConduitError::BackendUnavailable {
            primary: p,
            secondary: BackendError::NotFound,
        },
        (_, ReadAttempt::Unreadable(s)) => ConduitError::BackendUnavailable {
            primary: BackendError::NotFound,
            secondary: s,
        },
        _ => ConduitError::NotFound {
            key: key.to_string(),
        },
    }
}

fn log_miss(backend: &str, key: &str, attempt: &ReadAttempt) {
    match attempt {
        ReadAttempt::Found(_) => {}
        ReadAttempt::Missing => debug!(key, backend, "object not on backend"),
        ReadAttempt::Unreadable(e) => warn!(key, backend, error = %e, "backend read failed"),
        ReadAttempt::Unrecoverable(e) => {
            warn!(key, backend, error = %e, "stored copy cannot be reconstructed")
        }
    }
}
