//! Strands and their persisted frame.
//!
//! The data shards of a payload are concatenated into the primary strand and
//! the parity shards into the secondary strand. Both travel together in one
//! frame alongside a manifest with a SHA-256 digest per shard:
//!
//! ```text
//! ┌──────┬─────┬───┬───┬─────┬─────────────┬───────────┬──────────────┬─────────┬───────────┐
//! │ CSTR │ ver │ k │ m │ rsv │ payload_len │ shard_len │ digests × k+m│ primary │ secondary │
//! │  4   │  1  │ 1 │ 1 │  1  │   u64 BE    │  u64 BE   │   32 each    │ k·shard │ m·shard   │
//! └──────┴─────┴───┴───┴─────┴─────────────┴───────────┴──────────────┴─────────┴───────────┘
//! ```
//!
//! A shard whose digest does not match is handed to the decoder as missing.

use std::ops::Range;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::erasure::ShardSet;
use crate::error::{ConduitError, Result};

pub const FRAME_MAGIC: &[u8; 4] = b"CSTR";
pub const FRAME_VERSION: u8 = 1;
/// Bytes before the digest table.
pub const HEADER_LEN: usize = 4 + 1 + 1 + 1 + 1 + 8 + 8;
const DIGEST_LEN: usize = 32;

/// Geometry and integrity data of a stored payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardManifest {
    data_shards: u8,
    parity_shards: u8,
    payload_len: u64,
    shard_len: u64,
    digests: Vec<[u8; DIGEST_LEN]>,
}

impl ShardManifest {
    pub fn data_shards(&self) -> usize {
        self.data_shards as usize
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards as usize
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards() + self.parity_shards()
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    pub fn shard_len(&self) -> u64 {
        self.shard_len
    }

    pub fn digest_hex(&self, index: usize) -> Option<String> {
        self.digests.get(index).map(hex::encode)
    }

    /// Byte range of shard `index` inside the encoded frame.
    pub fn shard_range(&self, index: usize) -> Range<usize> {
        let shard_len = self.shard_len as usize;
        let start = HEADER_LEN + self.total_shards() * DIGEST_LEN + index * shard_len;
        start..start + shard_len
    }
}

/// The two strands of one payload plus their manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strands {
    manifest: ShardManifest,
    primary: Bytes,
    secondary: Bytes,
}

impl Strands {
    /// Build strands from a complete shard set.
    pub fn from_shard_set(set: &ShardSet) -> Result<Self> {
        let data_shards = u8::try_from(set.data_shards())
            .map_err(|_| ConduitError::Codec("too many data shards".into()))?;
        let parity_shards = u8::try_from(set.parity_shards())
            .map_err(|_| ConduitError::Codec("too many parity shards".into()))?;

        let mut digests: Vec<[u8; DIGEST_LEN]> = Vec::with_capacity(set.total_shards());
        let mut primary = BytesMut::with_capacity(set.data_shards() * set.shard_len());
        let mut secondary = BytesMut::with_capacity(set.parity_shards() * set.shard_len());

        for index in 0..set.total_shards() {
            let shard = set
                .shard(index)
                .ok_or_else(|| ConduitError::Codec(format!("shard {index} missing at encode")))?;
            digests.push(Sha256::digest(shard).into());
            if index < set.data_shards() {
                primary.put_slice(shard);
            } else {
                secondary.put_slice(shard);
            }
        }

        Ok(Self {
            manifest: ShardManifest {
                data_shards,
                parity_shards,
                payload_len: set.payload_len() as u64,
                shard_len: set.shard_len() as u64,
                digests,
            },
            primary: primary.freeze(),
            secondary: secondary.freeze(),
        })
    }

    pub fn manifest(&self) -> &ShardManifest {
        &self.manifest
    }

    /// Concatenated data shards.
    pub fn primary(&self) -> &Bytes {
        &self.primary
    }

    /// Concatenated parity shards.
    pub fn secondary(&self) -> &Bytes {
        &self.secondary
    }

    /// Split the strands back into shards, dropping any that fail their digest.
    pub fn to_shard_set(&self) -> Result<ShardSet> {
        let shard_len = self.manifest.shard_len as usize;
        let data_shards = self.manifest.data_shards();

        let shards = (0..self.manifest.total_shards())
            .map(|index| {
                let (strand, offset) = if index < data_shards {
                    (&self.primary, index * shard_len)
                } else {
                    (&self.secondary, (index - data_shards) * shard_len)
                };
                let shard = strand.get(offset..offset + shard_len)?;

                let actual: [u8; DIGEST_LEN] = Sha256::digest(shard).into();
                if actual != self.manifest.digests[index] {
                    warn!(
                        shard = index,
                        expected = %hex::encode(self.manifest.digests[index]),
                        actual = %hex::encode(actual),
                        "shard digest mismatch, treating as missing"
                    );
                    return None;
                }
                Some(shard.to_vec())
            })
            .collect();

        ShardSet::new(
            shards,
            data_shards,
            self.manifest.parity_shards(),
            self.manifest.payload_len as usize,
            shard_len,
        )
    }

    /// Encode the frame.
    pub fn to_bytes(&self) -> Bytes {
        let m = &self.manifest;
        let mut buf = BytesMut::with_capacity(
            HEADER_LEN + m.digests.len() * DIGEST_LEN + self.primary.len() + self.secondary.len(),
        );
        buf.put_slice(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(m.data_shards);
        buf.put_u8(m.parity_shards);
        buf.put_u8(0);
        buf.put_u64(m.payload_len);
        buf.put_u64(m.shard_len);
        for digest in &m.digests {
            buf.put_slice(digest);
        }
        buf.put_slice(&self.primary);
        buf.put_slice(&self.secondary);
        buf.freeze()
    }

    /// Decode a frame produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(mut buf: Bytes) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(corrupt("truncated header"));
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if &magic != FRAME_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(ConduitError::CorruptFrame(
                format!("unsupported frame version {version}").into(),
            ));
        }
        let data_shards = buf.get_u8();
        let parity_shards = buf.get_u8();
        let _reserved = buf.get_u8();
        let payload_len = buf.get_u64();
        let shard_len = buf.get_u64();

        if data_shards == 0 || parity_shards == 0 || shard_len == 0 {
            return Err(corrupt("empty shard geometry"));
        }
        let total = data_shards as usize + parity_shards as usize;

        let shard_len_usize =
            usize::try_from(shard_len).map_err(|_| corrupt("shard length overflow"))?;
        let primary_len = shard_len_usize
            .checked_mul(data_shards as usize)
            .ok_or_else(|| corrupt("strand length overflow"))?;
        let secondary_len = shard_len_usize
            .checked_mul(parity_shards as usize)
            .ok_or_else(|| corrupt("strand length overflow"))?;
        let body_len = primary_len
            .checked_add(secondary_len)
            .ok_or_else(|| corrupt("strand length overflow"))?;
        if payload_len > primary_len as u64 {
            return Err(corrupt("payload length exceeds primary strand"));
        }

        if buf.remaining() < total * DIGEST_LEN {
            return Err(corrupt("truncated digest table"));
        }
        let mut digests = Vec::with_capacity(total);
        for _ in 0..total {
            let mut digest = [0u8; DIGEST_LEN];
            buf.copy_to_slice(&mut digest);
            digests.push(digest);
        }

        // A short body loses trailing shards; those decode as missing.
        if buf.remaining() > body_len {
            return Err(ConduitError::CorruptFrame(
                format!(
                    "strand body is {} bytes, expected at most {}",
                    buf.remaining(),
                    body_len
                )
                .into(),
            ));
        }
        let primary = buf.split_to(primary_len.min(buf.remaining()));
        let secondary = buf;

        Ok(Self {
            manifest: ShardManifest {
                data_shards,
                parity_shards,
                payload_len,
                shard_len,
                digests,
            },
            primary,
            secondary,
        })
    }
}

fn corrupt(reason: &'static str) -> ConduitError {
    ConduitError::CorruptFrame(reason.into())
}
