//! Engine configuration.

use crate::error::{EngineError, Result};

/// How values are removed from memory under pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Only the value is ejected; key and metadata stay resident.
    ValueOnly,
    /// Whole entries may leave the hash table; a bloom filter covers
    /// definitely-absent lookups.
    FullEviction,
}

/// Item selection algorithm used by the pager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerAlgorithm {
    /// Frequency-histogram percentile threshold over 8-bit counters.
    StatisticalCounter,
    /// Legacy two-phase walk over the 2-bit NRU field.
    TwoBitLru,
}

/// Conflict-resolution policy applied on `*_with_meta` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolutionMode {
    /// Winner is the higher revision seqno, ties broken by CAS.
    RevisionSeqno,
    /// Winner is the higher CAS (last write wins).
    LastWriteWins,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fixed number of vbuckets the keyspace is partitioned into.
    pub max_vbuckets: u16,
    /// Number of I/O shards; `shard = vbid % num_shards`.
    pub num_shards: usize,
    /// Hash buckets per vbucket hash table.
    pub ht_buckets: usize,
    /// Stripe locks per hash table; must be well below `ht_buckets`.
    pub ht_locks: usize,
    /// Total memory quota in bytes.
    pub mem_quota: usize,
    /// High watermark as a fraction of the quota.
    pub mem_high_wat_ratio: f64,
    /// Low watermark as a fraction of the quota.
    pub mem_low_wat_ratio: f64,
    /// Fraction of the quota a front-end mutation may fill before NoMem.
    pub mutation_mem_ratio: f64,
    /// Value or full eviction.
    pub eviction_policy: EvictionPolicy,
    /// Pager item-selection algorithm.
    pub pager_algorithm: PagerAlgorithm,
    /// Bias in `(0, 2)`: active vbuckets are paged at `percent * bias`,
    /// replicas at `percent * (2 - bias)`.
    pub pager_active_vb_bias: f64,
    /// Item pager period in milliseconds.
    pub pager_sleep_ms: u64,
    /// Expiry pager period in milliseconds.
    pub expiry_pager_sleep_ms: u64,
    /// Durability timeout scan period in milliseconds.
    pub durability_timeout_scan_ms: u64,
    /// Default sync-write timeout in milliseconds; zero means never.
    pub sync_write_timeout_ms: u64,
    /// Conflict resolution mode for replicated mutations.
    pub conflict_resolution: ConflictResolutionMode,
    /// `get_locked` default lock duration in seconds.
    pub lock_timeout_secs: u32,
    /// Open checkpoint is closed once it holds this many items.
    pub checkpoint_max_items: usize,
    /// Pager yields between vbuckets when the flusher queue exceeds this.
    pub max_persistence_queue_size: usize,
    /// Expected increments for a frequency counter to saturate.
    pub freq_counter_saturation: u32,
    /// Estimated keys for bloom filter sizing under full eviction.
    pub bloom_key_estimate: usize,
    /// Bloom filter false-positive target.
    pub bloom_fp_rate: f64,
    /// Worker threads in the NonIO background pool.
    pub nonio_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_vbuckets: 1024,
            num_shards: 4,
            ht_buckets: 3079,
            ht_locks: 47,
            mem_quota: 256 * 1024 * 1024,
            mem_high_wat_ratio: 0.85,
            mem_low_wat_ratio: 0.75,
            mutation_mem_ratio: 0.93,
            eviction_policy: EvictionPolicy::ValueOnly,
            pager_algorithm: PagerAlgorithm::StatisticalCounter,
            pager_active_vb_bias: 1.4,
            pager_sleep_ms: 5000,
            expiry_pager_sleep_ms: 10_000,
            durability_timeout_scan_ms: 25,
            sync_write_timeout_ms: 30_000,
            conflict_resolution: ConflictResolutionMode::RevisionSeqno,
            lock_timeout_secs: 15,
            checkpoint_max_items: 10_000,
            max_persistence_queue_size: 1_000_000,
            freq_counter_saturation: 65_535,
            bloom_key_estimate: 10_000,
            bloom_fp_rate: 0.01,
            nonio_threads: 2,
        }
    }
}

impl EngineConfig {
    /// Production-leaning preset: full eviction, larger quota share for
    /// mutations, more background threads.
    pub fn production() -> Self {
        Self {
            eviction_policy: EvictionPolicy::FullEviction,
            nonio_threads: 4,
            ..Self::default()
        }
    }

    /// Small preset used by tests and the demo binary: few vbuckets,
    /// tiny hash tables, aggressive pager cadence.
    pub fn small() -> Self {
        Self {
            max_vbuckets: 8,
            num_shards: 2,
            ht_buckets: 193,
            ht_locks: 7,
            mem_quota: 4 * 1024 * 1024,
            pager_sleep_ms: 50,
            expiry_pager_sleep_ms: 100,
            nonio_threads: 1,
            ..Self::default()
        }
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_vbuckets == 0 {
            return Err(EngineError::InvalidArgument(
                "max_vbuckets must be nonzero".into(),
            ));
        }
        if self.num_shards == 0 {
            return Err(EngineError::InvalidArgument(
                "num_shards must be nonzero".into(),
            ));
        }
        if self.ht_locks == 0 || self.ht_buckets == 0 {
            return Err(EngineError::InvalidArgument(
                "hash table sizing must be nonzero".into(),
            ));
        }
        if self.ht_locks > self.ht_buckets {
            return Err(EngineError::InvalidArgument(
                "ht_locks must not exceed ht_buckets".into(),
            ));
        }
        if !(self.mem_low_wat_ratio < self.mem_high_wat_ratio
            && self.mem_high_wat_ratio < 1.0
            && self.mem_low_wat_ratio > 0.0)
        {
            return Err(EngineError::InvalidArgument(
                "watermarks must satisfy 0 < low < high < 1".into(),
            ));
        }
        if !(self.pager_active_vb_bias > 0.0 && self.pager_active_vb_bias < 2.0) {
            return Err(EngineError::InvalidArgument(
                "pager_active_vb_bias must lie in (0, 2)".into(),
            ));
        }
        if !(self.bloom_fp_rate > 0.0 && self.bloom_fp_rate < 1.0) {
            return Err(EngineError::InvalidArgument(
                "bloom_fp_rate must lie in (0, 1)".into(),
            ));
        }
        Ok(())
    }
}
