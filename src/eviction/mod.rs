//! Item pager and expiry pager.
//!
//! The item pager runs when memory rises above the high watermark (or on
//! its schedule), computes how aggressively to evict from the distance to
//! the low watermark, and walks each vbucket's hash table: checkpoint
//! memory is reclaimed first, expired items are batched into soft
//! deletes, and cold values are ejected, selected by a frequency
//! histogram percentile threshold or the legacy two-phase NRU walk.
//! The pager is single-flight behind a CAS latch.

pub mod freq;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::config::{EngineConfig, PagerAlgorithm};
use crate::engine::memory::MemoryTracker;
use crate::hash_table::stored_value::MAX_NRU;
use crate::hash_table::{HashTableVisitor, StoredValue, VisitDecision};
use crate::hlc::now_secs;
use crate::types::{Cas, DocKey, VBucketState};
use crate::vbucket::VBucket;

use freq::FreqHistogram;

/// Samples before the histogram threshold is trusted.
const LEARNING_SAMPLES: u64 = 100;
/// Threshold recomputation interval once learning is over.
const UPDATE_INTERVAL: u64 = 1000;
/// Backoff added to the eviction fraction after each failed pass.
const MULTIPLIER_STEP: f64 = 0.05;
/// Hard ceiling on the replica/dead eviction fraction.
const REPLICA_PERCENT_CAP: f64 = 0.9;

/// Per-pass frequency-threshold state for the statistical-counter
/// policy.
pub struct ItemEvictionStrategy {
    hist: FreqHistogram,
    threshold: u8,
    required_percentile: f64,
}

impl ItemEvictionStrategy {
    /// `percent` is the fraction of visited items to target, in [0, 1].
    pub fn new(percent: f64) -> Self {
        Self {
            hist: FreqHistogram::new(),
            threshold: 0,
            required_percentile: (percent * 100.0).clamp(0.0, 100.0),
        }
    }

    /// Samples one counter and answers whether the value should go.
    /// The threshold is recomputed every sample while learning, then
    /// periodically.
    pub fn visit_value(&mut self, freq: u8) -> bool {
        self.hist.add(freq);
        let total = self.hist.total();
        if total <= LEARNING_SAMPLES || total % UPDATE_INTERVAL == 0 {
            self.threshold = self.hist.percentile(self.required_percentile.ceil());
        }
        freq <= self.threshold
    }

    /// Current threshold (stats and tests).
    pub fn threshold(&self) -> u8 {
        self.threshold
    }
}

/// Phase of the legacy two-phase NRU walk; alternates per completed
/// pass.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PagerPhase {
    /// Evict entries already at maximum NRU.
    Unreferenced,
    /// Age entries; evict saturating ones with probability `percent`.
    Random,
}

enum SelectionState<'a> {
    Statistical(&'a mut ItemEvictionStrategy),
    TwoBitLru {
        phase: PagerPhase,
        percent: f64,
        rng: rand::rngs::ThreadRng,
    },
}

/// Hash-table visitor driving one vbucket's share of a pager pass.
struct PagingVisitor<'a> {
    now: u32,
    selection: SelectionState<'a>,
    memory: &'a MemoryTracker,
    expired: Vec<(DocKey, Cas)>,
    evicted_keys: Vec<DocKey>,
}

impl PagingVisitor<'_> {
    fn eligible(sv: &StoredValue) -> bool {
        sv.is_resident() && !sv.is_dirty() && !sv.is_deleted() && !sv.is_temp_item()
    }
}

impl HashTableVisitor for PagingVisitor<'_> {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitDecision {
        if sv.is_expired(self.now) && !sv.is_temp_item() {
            // Soft deletes are applied after the stripe is released.
            self.expired.push((sv.key().clone(), sv.cas()));
            return VisitDecision::Keep;
        }
        if !Self::eligible(sv) {
            return VisitDecision::Keep;
        }
        let evict = match &mut self.selection {
            SelectionState::Statistical(strategy) => strategy.visit_value(sv.freq_counter()),
            SelectionState::TwoBitLru {
                phase,
                percent,
                rng,
            } => match phase {
                PagerPhase::Unreferenced => sv.nru() == MAX_NRU,
                PagerPhase::Random => {
                    let saturating = sv.nru() == MAX_NRU;
                    sv.set_nru(sv.nru().saturating_add(1));
                    saturating && rng.gen::<f64>() < *percent
                }
            },
        };
        if evict {
            self.evicted_keys.push(sv.key().clone());
            VisitDecision::Evict
        } else {
            VisitDecision::Keep
        }
    }

    fn should_stop(&mut self) -> bool {
        self.memory.below_low_wat()
    }
}

/// Summary of one pager pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassSummary {
    /// False when the single-flight latch was held by another pass.
    pub started: bool,
    /// Whether usage ended at or below the low watermark.
    pub reached_low_wat: bool,
    /// Values ejected this pass.
    pub evicted: u64,
    /// Expired items soft-deleted this pass.
    pub expired: u64,
    /// Base eviction fraction used this pass.
    pub percent: f64,
}

/// Lifetime pager counters for stats output.
#[derive(Debug, Clone, Copy, Default)]
pub struct PagerStats {
    pub passes: u64,
    pub items_evicted: u64,
    pub items_expired: u64,
    pub eviction_multiplier: f64,
}

/// The process-wide item pager.
pub struct ItemPager {
    algorithm: PagerAlgorithm,
    active_bias: f64,
    max_persistence_queue: usize,
    available: AtomicBool,
    completed: AtomicBool,
    eviction_multiplier: Mutex<f64>,
    phase: Mutex<PagerPhase>,
    passes: AtomicU64,
    items_evicted: AtomicU64,
    items_expired: AtomicU64,
}

impl ItemPager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            algorithm: config.pager_algorithm,
            active_bias: config.pager_active_vb_bias,
            max_persistence_queue: config.max_persistence_queue_size,
            available: AtomicBool::new(true),
            completed: AtomicBool::new(false),
            eviction_multiplier: Mutex::new(0.0),
            phase: Mutex::new(PagerPhase::Unreferenced),
            passes: AtomicU64::new(0),
            items_evicted: AtomicU64::new(0),
            items_expired: AtomicU64::new(0),
        }
    }

    /// Runs one pass over `vbuckets`. Reentrant calls coalesce on the
    /// single-flight latch.
    pub fn pass(&self, vbuckets: &[Arc<VBucket>], memory: &MemoryTracker) -> PassSummary {
        if self
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PassSummary::default();
        }
        self.completed.store(false, Ordering::Release);
        let mut summary = self.pass_inner(vbuckets, memory);
        summary.started = true;

        // Completion is flagged before the final memory check so a
        // concurrent scheduleNow cannot be swallowed by this pass.
        self.completed.store(true, Ordering::Release);
        summary.reached_low_wat = memory.below_low_wat();
        {
            let mut multiplier = self.eviction_multiplier.lock();
            if summary.reached_low_wat {
                *multiplier = 0.0;
            } else {
                *multiplier += MULTIPLIER_STEP;
            }
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.items_evicted
            .fetch_add(summary.evicted, Ordering::Relaxed);
        self.items_expired
            .fetch_add(summary.expired, Ordering::Relaxed);
        self.available.store(true, Ordering::Release);
        summary
    }

    fn pass_inner(&self, vbuckets: &[Arc<VBucket>], memory: &MemoryTracker) -> PassSummary {
        let mut summary = PassSummary::default();
        let current = memory.used();
        let low = memory.low_wat();
        if current <= low {
            return summary;
        }

        let to_kill = (current - low) as f64 / current as f64;
        let multiplier = *self.eviction_multiplier.lock();
        let percent = (to_kill * (1.0 + multiplier)).clamp(0.0, 1.0);
        summary.percent = percent;
        let active_percent = (percent * self.active_bias).clamp(0.0, 1.0);
        let replica_percent =
            (percent * (2.0 - self.active_bias)).clamp(0.0, REPLICA_PERCENT_CAP);

        let replica_resident_ratio = {
            let replicas: Vec<f64> = vbuckets
                .iter()
                .filter(|vb| vb.state() == VBucketState::Replica)
                .map(|vb| vb.ht.resident_ratio())
                .collect();
            if replicas.is_empty() {
                0.0
            } else {
                replicas.iter().sum::<f64>() / replicas.len() as f64
            }
        };

        let now = now_secs();
        let phase = *self.phase.lock();
        let mut visited_all = true;
        for vb in vbuckets {
            // Cheapest memory first: closed checkpoints nobody reads.
            let _ = vb.remove_closed_unref_checkpoints();
            if memory.below_low_wat() {
                visited_all = false;
                break;
            }
            let state = vb.state();
            let vb_percent = match state {
                VBucketState::Active | VBucketState::Pending => active_percent,
                VBucketState::Replica | VBucketState::Dead => replica_percent,
            };
            if vb_percent <= 0.0 {
                continue;
            }
            if state == VBucketState::Active
                && vb.ht.resident_ratio() < replica_resident_ratio
                && !memory.above_high_wat()
            {
                continue;
            }

            let mut strategy = ItemEvictionStrategy::new(vb_percent);
            let mut visitor = PagingVisitor {
                now,
                selection: match self.algorithm {
                    PagerAlgorithm::StatisticalCounter => {
                        SelectionState::Statistical(&mut strategy)
                    }
                    PagerAlgorithm::TwoBitLru => SelectionState::TwoBitLru {
                        phase,
                        percent: vb_percent,
                        rng: rand::thread_rng(),
                    },
                },
                memory,
                expired: Vec::new(),
                evicted_keys: Vec::new(),
            };
            vb.ht.visit(&mut visitor);

            let PagingVisitor {
                expired,
                evicted_keys,
                ..
            } = visitor;
            summary.evicted += evicted_keys.len() as u64;
            for key in &evicted_keys {
                vb.note_evicted_key(key);
            }
            for (key, cas) in expired {
                if vb.delete_expired_item(&key, cas).status.is_success() {
                    summary.expired += 1;
                }
            }
            if vb.disk_queue_size() > self.max_persistence_queue {
                // Let persistence catch up between vbuckets.
                std::thread::yield_now();
            }
        }
        if self.algorithm == PagerAlgorithm::TwoBitLru && visited_all {
            let mut guard = self.phase.lock();
            *guard = match *guard {
                PagerPhase::Unreferenced => PagerPhase::Random,
                PagerPhase::Random => PagerPhase::Unreferenced,
            };
        }
        debug!(
            evicted = summary.evicted,
            expired = summary.expired,
            percent = summary.percent,
            "item pager pass finished"
        );
        summary
    }

    /// Current backoff multiplier.
    pub fn eviction_multiplier(&self) -> f64 {
        *self.eviction_multiplier.lock()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            passes: self.passes.load(Ordering::Relaxed),
            items_evicted: self.items_evicted.load(Ordering::Relaxed),
            items_expired: self.items_expired.load(Ordering::Relaxed),
            eviction_multiplier: self.eviction_multiplier(),
        }
    }
}

/// Visitor collecting expired items without evicting anything.
struct ExpiryVisitor {
    now: u32,
    expired: Vec<(DocKey, Cas)>,
}

impl HashTableVisitor for ExpiryVisitor {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitDecision {
        if sv.is_expired(self.now) && !sv.is_temp_item() {
            self.expired.push((sv.key().clone(), sv.cas()));
        }
        VisitDecision::Keep
    }
}

/// The process-wide expiry pager: scans active vbuckets and batches
/// soft deletes of expired items.
pub struct ExpiryPager {
    passes: AtomicU64,
    items_expired: AtomicU64,
}

impl ExpiryPager {
    pub fn new() -> Self {
        Self {
            passes: AtomicU64::new(0),
            items_expired: AtomicU64::new(0),
        }
    }

    /// Runs one scan; returns the number of items soft-deleted.
    pub fn pass(&self, vbuckets: &[Arc<VBucket>]) -> u64 {
        let now = now_secs();
        let mut total = 0;
        for vb in vbuckets {
            if vb.state() != VBucketState::Active {
                continue;
            }
            let mut visitor = ExpiryVisitor {
                now,
                expired: Vec::new(),
            };
            vb.ht.visit(&mut visitor);
            for (key, cas) in visitor.expired {
                if vb.delete_expired_item(&key, cas).status.is_success() {
                    total += 1;
                }
            }
        }
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.items_expired.fetch_add(total, Ordering::Relaxed);
        total
    }

    /// Lifetime counters: `(passes, items_expired)`.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.passes.load(Ordering::Relaxed),
            self.items_expired.load(Ordering::Relaxed),
        )
    }
}

impl Default for ExpiryPager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_targets_cold_items() {
        let mut strategy = ItemEvictionStrategy::new(0.5);
        let mut evicted_cold = 0;
        let mut evicted_hot = 0;
        for i in 0..2000u32 {
            let freq = if i % 10 == 0 { 200u8 } else { 4u8 };
            if strategy.visit_value(freq) {
                if freq == 4 {
                    evicted_cold += 1;
                } else {
                    evicted_hot += 1;
                }
            }
        }
        assert!(evicted_cold > 1000, "cold items selected: {evicted_cold}");
        assert_eq!(evicted_hot, 0, "hot items must survive a 50% target");
    }

    #[test]
    fn zero_percent_strategy_still_learns_threshold() {
        let mut strategy = ItemEvictionStrategy::new(0.0);
        for _ in 0..200 {
            strategy.visit_value(100);
        }
        assert!(strategy.threshold() <= 100);
    }
}
