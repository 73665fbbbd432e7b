//! Bloom filter over object ID fingerprints.

use std::fmt;

use bloomfilter::Bloom;
use xxhash_rust::xxh64::xxh64;

use super::BlockError;

const FINGERPRINT_SEED: u64 = 0;

/// 64-bit fingerprint of an object ID, the unit of bloom membership.
pub fn fingerprint(id: &[u8]) -> u64 {
    xxh64(id, FINGERPRINT_SEED)
}

/// Membership filter over fingerprints.
///
/// Reports every added fingerprint as present; may report absent
/// fingerprints as present at roughly the configured rate.
pub struct BloomFilter {
    inner: Bloom<u64>,
}

impl BloomFilter {
    /// Sizes a filter for `expected_items` at `false_positive_rate`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Result<Self, BlockError> {
        let inner = Bloom::new_for_fp_rate(expected_items.max(1), false_positive_rate)
            .map_err(|e| BlockError::Internal(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn add(&mut self, fingerprint: u64) {
        self.inner.set(&fingerprint);
    }

    pub fn has(&self, fingerprint: u64) -> bool {
        self.inner.check(&fingerprint)
    }

    /// Serialized form, stored in a sealed block's bloom file.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.as_slice().to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        let inner = Bloom::from_slice(bytes)
            .map_err(|e| BlockError::Corrupt(format!("bloom filter: {e}")))?;
        Ok(Self { inner })
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("bytes", &self.inner.as_slice().len())
            .finish()
    }
}
