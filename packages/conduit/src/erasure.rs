//! Systematic Reed-Solomon coding over GF(2^8).
//!
//! A payload is split into `k` equal data shards (the last zero-padded) and
//! `m` parity shards are computed from them. Any `k` of the `k + m` shards
//! reconstruct the payload.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{ConduitError, Result};

/// Data and parity shards of one payload. `None` marks a missing shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSet {
    shards: Vec<Option<Vec<u8>>>,
    data_shards: usize,
    parity_shards: usize,
    payload_len: usize,
    shard_len: usize,
}

impl ShardSet {
    /// Assemble a shard set, e.g. from persisted strands.
    ///
    /// `shards` holds the data shards first, then the parity shards.
    pub fn new(
        shards: Vec<Option<Vec<u8>>>,
        data_shards: usize,
        parity_shards: usize,
        payload_len: usize,
        shard_len: usize,
    ) -> Result<Self> {
        if shards.len() != data_shards + parity_shards {
            return Err(ConduitError::Codec(format!(
                "expected {} shards, got {}",
                data_shards + parity_shards,
                shards.len()
            )));
        }
        Ok(Self {
            shards,
            data_shards,
            parity_shards,
            payload_len,
            shard_len,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn shard_len(&self) -> usize {
        self.shard_len
    }

    pub fn total_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn shard(&self, index: usize) -> Option<&[u8]> {
        self.shards.get(index)?.as_deref()
    }

    pub fn data(&self) -> &[Option<Vec<u8>>] {
        &self.shards[..self.data_shards]
    }

    pub fn parity(&self) -> &[Option<Vec<u8>>] {
        &self.shards[self.data_shards..]
    }

    /// Mark a shard missing. Returns what was there.
    pub fn remove(&mut self, index: usize) -> Option<Vec<u8>> {
        self.shards.get_mut(index)?.take()
    }

    /// Shards present with the expected length.
    pub fn available(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| s.as_ref().is_some_and(|s| s.len() == self.shard_len))
            .count()
    }
}

/// Encoder/decoder for a fixed `k + m` geometry.
pub struct ErasureCoder {
    rs: ReedSolomon,
    data_shards: usize,
    parity_shards: usize,
}

impl ErasureCoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 || parity_shards == 0 {
            return Err(ConduitError::validation(
                "shards",
                "data and parity shard counts must be at least 1",
            ));
        }
        if data_shards + parity_shards > 255 {
            return Err(ConduitError::validation(
                "shards",
                "at most 255 shards in total",
            ));
        }
        Ok(Self {
            rs: ReedSolomon::new(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    /// Split `payload` into data shards and compute parity.
    pub fn encode(&self, payload: &[u8]) -> Result<ShardSet> {
        let shard_len = payload.len().div_ceil(self.data_shards).max(1);

        let mut shards: Vec<Vec<u8>> = (0..self.data_shards + self.parity_shards)
            .map(|_| vec![0u8; shard_len])
            .collect();
        for (shard, chunk) in shards.iter_mut().zip(payload.chunks(shard_len)) {
            shard[..chunk.len()].copy_from_slice(chunk);
        }

        self.rs.encode(&mut shards)?;

        ShardSet::new(
            shards.into_iter().map(Some).collect(),
            self.data_shards,
            self.parity_shards,
            payload.len(),
            shard_len,
        )
    }

    /// Reconstruct the payload from any `k` intact shards.
    pub fn decode(&self, set: ShardSet) -> Result<Vec<u8>> {
        if set.data_shards != self.data_shards || set.parity_shards != self.parity_shards {
            return Err(ConduitError::Codec(format!(
                "shard geometry {}+{} does not match coder {}+{}",
                set.data_shards, set.parity_shards, self.data_shards, self.parity_shards
            )));
        }
        if set.payload_len > set.data_shards * set.shard_len {
            return Err(ConduitError::CorruptFrame(
                "payload length exceeds data shard capacity".into(),
            ));
        }

        let available = set.available();
        if available < self.data_shards {
            return Err(ConduitError::ShardReconstruction {
                available,
                required: self.data_shards,
            });
        }

        let ShardSet {
            mut shards,
            shard_len,
            payload_len,
            ..
        } = set;

        // A wrong-length shard is as good as missing.
        for shard in shards.iter_mut() {
            if shard.as_ref().is_some_and(|s| s.len() != shard_len) {
                *shard = None;
            }
        }

        if shards[..self.data_shards].iter().any(Option::is_none) {
            self.rs.reconstruct_data(&mut shards)?;
        }

        let mut payload = Vec::with_capacity(self.data_shards * shard_len);
        for shard in shards.into_iter().take(self.data_shards) {
            let shard = shard.ok_or_else(|| {
                ConduitError::Codec("data shard missing after reconstruction".into())
            })?;
            payload.extend_from_slice(&shard);
        }
        payload.truncate(payload_len);
        Ok(payload)
    }
}

impl std::fmt::Debug for ErasureCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasureCoder")
            .field("data_shards", &self.data_shards)
            .field("parity_shards", &self.parity_shards)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pads_last_shard() {
        let coder = ErasureCoder::new(2, 2).unwrap();
        let set = coder.encode(b"abcde").unwrap();
        assert_eq!(set.shard_len(), 3);
        assert_eq!(set.payload_len(), 5);
        assert_eq!(set.shard(0), Some(&b"abc"[..]));
        assert_eq!(set.shard(1), Some(&b"de\0"[..]));
        assert_eq!(set.available(), 4);
    }

    #[test]
    fn test_empty_payload_encodes() {
        let coder = ErasureCoder::new(3, 2).unwrap();
        let set = coder.encode(b"").unwrap();
        assert_eq!(set.shard_len(), 1);
        assert!(coder.decode(set).unwrap().is_empty());
    }

    #[test]
    fn test_decode_from_parity_only() {
        let coder = ErasureCoder::new(2, 2).unwrap();
        let mut set = coder.encode(b"hello, shards").unwrap();
        set.remove(0);
        set.remove(1);
        assert_eq!(coder.decode(set).unwrap(), b"hello, shards");
    }

    #[test]
    fn test_too_few_shards() {
        let coder = ErasureCoder::new(2, 2).unwrap();
        let mut set = coder.encode(b"hello").unwrap();
        set.remove(0);
        set.remove(2);
        set.remove(3);
        match coder.decode(set) {
            Err(ConduitError::ShardReconstruction {
                available,
                required,
            }) => {
                assert_eq!(available, 1);
                assert_eq!(required, 2);
            }
            other => panic!("expected ShardReconstruction, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_zero_parity() {
        assert!(matches!(
            ErasureCoder::new(4, 0),
            Err(ConduitError::Validation { .. })
        ));
    }

    #[test]
    fn test_geometry_mismatch() {
        let set = ErasureCoder::new(2, 2).unwrap().encode(b"x").unwrap();
        let other = ErasureCoder::new(3, 2).unwrap();
        assert!(matches!(other.decode(set), Err(ConduitError::Codec(_))));
    }
}
