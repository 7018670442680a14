//! Hashing utilities for pageshard
//!
//! - BLAKE3-based shard selection (the persisted routing contract)
//! - Incremental BLAKE3 digests for replication integrity checks

use blake3::Hasher;

/// Version tag of the routing hash. Changing the algorithm or the partition
/// ordering requires a full re-migration, so bump this alongside any change.
pub const HASH_CONTRACT: &str = "blake3-le64-v1";

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally (for streaming)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a key onto one of `num_partitions` buckets.
///
/// First 8 bytes of BLAKE3(key), little-endian, modulo the bucket count.
pub fn shard_key(key: &str, num_partitions: u64) -> u64 {
    let hash = blake3::hash(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix) % num_partitions
}
