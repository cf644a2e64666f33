//! Bloom filter consulted under full eviction.
//!
//! A lookup that misses the hash table checks the filter before paying for
//! a disk probe: "definitely absent" short-circuits to KeyNotFound, "maybe
//! present" schedules a background fetch. Evicted keys are added so later
//! lookups stay honest.

use xxhash_rust::xxh64::xxh64;

use crate::types::DocKey;

/// Blocked bit array with double hashing.
#[derive(Debug)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    key_count: u64,
}

impl BloomFilter {
    /// Sizes the filter for `key_estimate` keys at `fp_rate` false
    /// positives.
    pub fn new(key_estimate: usize, fp_rate: f64) -> Self {
        let n = key_estimate.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        let words = num_bits.div_ceil(64) as usize;
        Self {
            bits: vec![0; words],
            num_bits: words as u64 * 64,
            num_hashes,
            key_count: 0,
        }
    }

    fn probes(&self, key: &DocKey) -> (u64, u64) {
        let h1 = xxh64(&key.name, u64::from(key.collection.0));
        let h2 = xxh64(&key.name, h1 ^ 0x9e37_79b9_7f4a_7c15);
        (h1, h2 | 1)
    }

    /// Records a key.
    pub fn add_key(&mut self, key: &DocKey) {
        let (h1, h2) = self.probes(key);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.key_count += 1;
    }

    /// Returns false only when the key was definitely never added.
    pub fn maybe_key_exists(&self, key: &DocKey) -> bool {
        let (h1, h2) = self.probes(key);
        for i in 0..u64::from(self.num_hashes) {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.bits[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Number of keys recorded since the last clear.
    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// Resets the filter (full compaction rebuilds it from disk keys).
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.key_count = 0;
    }

    /// Memory footprint of the bit array in bytes.
    pub fn footprint(&self) -> usize {
        self.bits.len() * 8
    }
}
