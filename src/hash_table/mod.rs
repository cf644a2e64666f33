//! Per-vbucket hash table with striped bucket locks.
//!
//! The table is partitioned into `N` hash buckets covered by `L` stripe
//! locks (`L << N`, `stripe = bucket % L`). Each stripe *owns* its share
//! of buckets inside a mutex, so the only way to reach a [`StoredValue`]
//! is through a [`LockedBucket`] handle holding the stripe guard; the
//! "every access holds the covering lock" contract is enforced by the
//! borrow checker rather than by convention.
//!
//! Lock rank: stripe locks sit below the vbucket state lock and above the
//! checkpoint manager lock.

pub mod stored_value;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use xxhash_rust::xxh64::xxh64;

use crate::config::EvictionPolicy;
use crate::engine::memory::MemoryTracker;
use crate::eviction::freq::ProbabilisticCounter;
use crate::types::DocKey;

pub use stored_value::StoredValue;

/// Whether `find` should surface tombstones.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WantsDeleted {
    Yes,
    No,
}

/// Whether `find` counts as an access for reference tracking.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TrackReference {
    Yes,
    No,
}

/// Outcome of an eviction attempt on one key.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum EjectOutcome {
    /// Key absent.
    NotFound,
    /// Entry present but dirty, temp, a tombstone, or already ejected.
    Ineligible,
    /// Value dropped; metadata retained (value eviction).
    Ejected,
    /// Whole entry removed from the table (full eviction).
    Removed,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Class {
    Live,
    Deleted,
    Temp,
}

fn classify(sv: &StoredValue) -> Class {
    if sv.is_temp_item() {
        Class::Temp
    } else if sv.is_deleted() {
        Class::Deleted
    } else {
        Class::Live
    }
}

/// Aggregate counters, readable without any stripe lock.
#[derive(Debug, Default)]
pub struct HashTableStats {
    curr_items: AtomicUsize,
    num_deleted: AtomicUsize,
    num_temp: AtomicUsize,
    num_non_resident: AtomicUsize,
    num_ejects: AtomicU64,
    mem: AtomicUsize,
}

impl HashTableStats {
    fn on_insert(&self, sv: &StoredValue) {
        match classify(sv) {
            Class::Live => self.curr_items.fetch_add(1, Ordering::Relaxed),
            Class::Deleted => self.num_deleted.fetch_add(1, Ordering::Relaxed),
            Class::Temp => self.num_temp.fetch_add(1, Ordering::Relaxed),
        };
        if !sv.is_resident() && !sv.is_deleted() && !sv.is_temp_item() {
            self.num_non_resident.fetch_add(1, Ordering::Relaxed);
        }
        self.mem.fetch_add(sv.footprint(), Ordering::Relaxed);
    }

    fn on_remove(&self, sv: &StoredValue) {
        match classify(sv) {
            Class::Live => self.curr_items.fetch_sub(1, Ordering::Relaxed),
            Class::Deleted => self.num_deleted.fetch_sub(1, Ordering::Relaxed),
            Class::Temp => self.num_temp.fetch_sub(1, Ordering::Relaxed),
        };
        if !sv.is_resident() && !sv.is_deleted() && !sv.is_temp_item() {
            self.num_non_resident.fetch_sub(1, Ordering::Relaxed);
        }
        self.mem.fetch_sub(sv.footprint(), Ordering::Relaxed);
    }
}

struct Stripe {
    chains: Vec<Vec<StoredValue>>,
}

/// The per-vbucket key → stored value mapping.
pub struct HashTable {
    stripes: Vec<Mutex<Stripe>>,
    num_buckets: usize,
    policy: EvictionPolicy,
    memory: Arc<MemoryTracker>,
    freq: ProbabilisticCounter,
    stats: HashTableStats,
    max_deleted_rev: AtomicU64,
}

impl HashTable {
    /// Builds a table with `num_buckets` hash buckets striped over
    /// `num_locks` mutexes.
    pub fn new(
        num_buckets: usize,
        num_locks: usize,
        policy: EvictionPolicy,
        freq_saturation: u32,
        memory: Arc<MemoryTracker>,
    ) -> Self {
        assert!(num_buckets > 0 && num_locks > 0 && num_locks <= num_buckets);
        let chains_per_stripe = num_buckets.div_ceil(num_locks);
        let stripes = (0..num_locks)
            .map(|_| {
                Mutex::new(Stripe {
                    chains: vec![Vec::new(); chains_per_stripe],
                })
            })
            .collect();
        Self {
            stripes,
            num_buckets,
            policy,
            memory,
            freq: ProbabilisticCounter::new(freq_saturation),
            stats: HashTableStats::default(),
            max_deleted_rev: AtomicU64::new(0),
        }
    }

    fn bucket_of(&self, key: &DocKey) -> usize {
        let hash = xxh64(&key.name, u64::from(key.collection.0));
        (hash % self.num_buckets as u64) as usize
    }

    /// Acquires the stripe lock covering `key`'s bucket and returns the
    /// handle all per-value operations go through.
    pub fn lock_key(&self, key: &DocKey) -> LockedBucket<'_> {
        let bucket = self.bucket_of(key);
        let stripe_idx = bucket % self.stripes.len();
        let chain = bucket / self.stripes.len();
        LockedBucket {
            table: self,
            guard: self.stripes[stripe_idx].lock(),
            chain,
        }
    }

    /// Visits every stored value, one stripe at a time. The visitor may
    /// adjust reference-tracking fields; eviction decisions are applied
    /// by the table under the held stripe lock. `should_stop` is polled
    /// between stripes so a pass can end early.
    pub fn visit(&self, visitor: &mut dyn HashTableVisitor) {
        for stripe in &self.stripes {
            if visitor.should_stop() {
                return;
            }
            let mut guard = stripe.lock();
            for chain_idx in 0..guard.chains.len() {
                let mut i = 0;
                while i < guard.chains[chain_idx].len() {
                    let decision = visitor.visit(&mut guard.chains[chain_idx][i]);
                    match decision {
                        VisitDecision::Keep => i += 1,
                        VisitDecision::Evict => {
                            match self.eject_at(&mut guard, chain_idx, i) {
                                EjectOutcome::Removed => {}
                                _ => i += 1,
                            }
                        }
                    }
                }
            }
        }
    }

    fn eject_at(&self, guard: &mut Stripe, chain: usize, idx: usize) -> EjectOutcome {
        let sv = &mut guard.chains[chain][idx];
        if sv.is_dirty() || sv.is_temp_item() || sv.is_deleted() {
            return EjectOutcome::Ineligible;
        }
        match self.policy {
            EvictionPolicy::ValueOnly => {
                if !sv.is_resident() {
                    return EjectOutcome::Ineligible;
                }
                let before = sv.footprint();
                sv.eject_value();
                let after = sv.footprint();
                self.stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
                self.stats.num_ejects.fetch_add(1, Ordering::Relaxed);
                self.stats.mem.fetch_sub(before - after, Ordering::Relaxed);
                self.memory.debit(before - after);
                EjectOutcome::Ejected
            }
            EvictionPolicy::FullEviction => {
                let sv = guard.chains[chain].swap_remove(idx);
                self.stats.on_remove(&sv);
                self.stats.num_ejects.fetch_add(1, Ordering::Relaxed);
                self.memory.debit(sv.footprint());
                EjectOutcome::Removed
            }
        }
    }

    /// Configured eviction policy.
    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Largest revision of any deleted or expired value this table has
    /// seen; never decreases.
    pub fn max_deleted_rev_seqno(&self) -> u64 {
        self.max_deleted_rev.load(Ordering::Acquire)
    }

    /// Advances the max deleted revision watermark.
    pub fn note_deleted_rev_seqno(&self, rev: u64) {
        self.max_deleted_rev.fetch_max(rev, Ordering::AcqRel);
    }

    /// Live (non-deleted, non-temp) items.
    pub fn num_items(&self) -> usize {
        self.stats.curr_items.load(Ordering::Relaxed)
    }

    /// Tombstones currently held.
    pub fn num_deleted_items(&self) -> usize {
        self.stats.num_deleted.load(Ordering::Relaxed)
    }

    /// Temp placeholders currently held.
    pub fn num_temp_items(&self) -> usize {
        self.stats.num_temp.load(Ordering::Relaxed)
    }

    /// Live items whose body has been ejected.
    pub fn num_non_resident(&self) -> usize {
        self.stats.num_non_resident.load(Ordering::Relaxed)
    }

    /// Lifetime count of ejected values.
    pub fn num_ejects(&self) -> u64 {
        self.stats.num_ejects.load(Ordering::Relaxed)
    }

    /// Bytes attributed to this table.
    pub fn mem_used(&self) -> usize {
        self.stats.mem.load(Ordering::Relaxed)
    }

    /// Fraction of live items whose body is resident, in `[0, 1]`.
    pub fn resident_ratio(&self) -> f64 {
        let items = self.num_items();
        if items == 0 {
            return 1.0;
        }
        let resident = items.saturating_sub(self.num_non_resident());
        resident as f64 / items as f64
    }

    /// Number of hash buckets.
    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Number of stripe locks.
    pub fn num_locks(&self) -> usize {
        self.stripes.len()
    }
}

/// What the table does with a visited entry.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VisitDecision {
    Keep,
    Evict,
}

/// Callback walked over every stored value by [`HashTable::visit`].
pub trait HashTableVisitor {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitDecision;

    /// Polled between stripes; returning true ends the visit early.
    fn should_stop(&mut self) -> bool {
        false
    }
}

/// Handle proving the stripe lock covering one hash bucket is held.
///
/// All single-key operations (the vbucket mutation state machine) run
/// through this type; it cannot outlive the table borrow and releases the
/// stripe on drop.
pub struct LockedBucket<'a> {
    table: &'a HashTable,
    guard: MutexGuard<'a, Stripe>,
    chain: usize,
}

impl<'a> LockedBucket<'a> {
    fn position(&self, key: &DocKey, wants_deleted: WantsDeleted) -> Option<usize> {
        self.guard.chains[self.chain]
            .iter()
            .position(|sv| sv.key() == key)
            .filter(|&i| {
                wants_deleted == WantsDeleted::Yes || !self.guard.chains[self.chain][i].is_deleted()
            })
    }

    /// Looks up `key` in the locked bucket.
    pub fn find(
        &mut self,
        key: &DocKey,
        wants_deleted: WantsDeleted,
        track: TrackReference,
    ) -> Option<&mut StoredValue> {
        let idx = self.position(key, wants_deleted)?;
        let freq = self.table.freq;
        let sv = &mut self.guard.chains[self.chain][idx];
        if track == TrackReference::Yes && !sv.is_temp_item() {
            let bumped = freq.increment(sv.freq_counter(), &mut rand::thread_rng());
            sv.record_access(bumped);
        }
        Some(sv)
    }

    /// Inserts a new entry. The key must be absent from the bucket.
    pub fn insert(&mut self, sv: StoredValue) {
        debug_assert!(self.position(sv.key(), WantsDeleted::Yes).is_none());
        self.table.stats.on_insert(&sv);
        self.table.memory.credit(sv.footprint());
        self.guard.chains[self.chain].push(sv);
    }

    /// Removes an entry outright, returning it.
    pub fn remove(&mut self, key: &DocKey) -> Option<StoredValue> {
        let idx = self.position(key, WantsDeleted::Yes)?;
        let sv = self.guard.chains[self.chain].swap_remove(idx);
        self.table.stats.on_remove(&sv);
        self.table.memory.debit(sv.footprint());
        Some(sv)
    }

    /// Mutates an entry in place, rebalancing classification and memory
    /// accounting around the closure.
    pub fn mutate<R>(
        &mut self,
        key: &DocKey,
        f: impl FnOnce(&mut StoredValue) -> R,
    ) -> Option<R> {
        let idx = self.position(key, WantsDeleted::Yes)?;
        let sv = &mut self.guard.chains[self.chain][idx];
        let before_size = sv.footprint();
        let before_class = classify(sv);
        let before_non_resident = !sv.is_resident() && before_class == Class::Live;
        let result = f(sv);
        let after_size = sv.footprint();
        let after_class = classify(sv);
        let after_non_resident = !sv.is_resident() && after_class == Class::Live;

        let stats = &self.table.stats;
        if before_class != after_class {
            match before_class {
                Class::Live => stats.curr_items.fetch_sub(1, Ordering::Relaxed),
                Class::Deleted => stats.num_deleted.fetch_sub(1, Ordering::Relaxed),
                Class::Temp => stats.num_temp.fetch_sub(1, Ordering::Relaxed),
            };
            match after_class {
                Class::Live => stats.curr_items.fetch_add(1, Ordering::Relaxed),
                Class::Deleted => stats.num_deleted.fetch_add(1, Ordering::Relaxed),
                Class::Temp => stats.num_temp.fetch_add(1, Ordering::Relaxed),
            };
        }
        match (before_non_resident, after_non_resident) {
            (false, true) => {
                stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
            }
            (true, false) => {
                stats.num_non_resident.fetch_sub(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if after_size > before_size {
            stats.mem.fetch_add(after_size - before_size, Ordering::Relaxed);
            self.table.memory.credit(after_size - before_size);
        } else if before_size > after_size {
            stats.mem.fetch_sub(before_size - after_size, Ordering::Relaxed);
            self.table.memory.debit(before_size - after_size);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionId, Item};
    use bytes::Bytes;

    fn table() -> HashTable {
        let memory = Arc::new(MemoryTracker::new(64 * 1024 * 1024, 0.85, 0.75, 0.93));
        HashTable::new(193, 7, EvictionPolicy::ValueOnly, 65_535, memory)
    }

    fn full_eviction_table() -> HashTable {
        let memory = Arc::new(MemoryTracker::new(64 * 1024 * 1024, 0.85, 0.75, 0.93));
        HashTable::new(193, 7, EvictionPolicy::FullEviction, 65_535, memory)
    }

    fn item(name: &str, value: &str) -> Item {
        Item::new(DocKey::in_default(name.to_owned()), value.to_owned())
    }

    #[test]
    fn insert_find_remove() {
        let ht = table();
        let key = DocKey::in_default("alpha");
        {
            let mut lb = ht.lock_key(&key);
            lb.insert(StoredValue::from_item(&item("alpha", "v1")));
        }
        assert_eq!(ht.num_items(), 1);
        {
            let mut lb = ht.lock_key(&key);
            let sv = lb
                .find(&key, WantsDeleted::No, TrackReference::No)
                .expect("present");
            assert_eq!(sv.value().unwrap(), &Bytes::from("v1"));
        }
        {
            let mut lb = ht.lock_key(&key);
            assert!(lb.remove(&key).is_some());
        }
        assert_eq!(ht.num_items(), 0);
        assert_eq!(ht.mem_used(), 0);
    }

    #[test]
    fn wants_deleted_filters_tombstones() {
        let ht = table();
        let key = DocKey::in_default("gone");
        {
            let mut lb = ht.lock_key(&key);
            lb.insert(StoredValue::from_item(&item("gone", "v")));
            lb.mutate(&key, |sv| sv.delete_in_place(None, 0, 100));
        }
        let mut lb = ht.lock_key(&key);
        assert!(lb.find(&key, WantsDeleted::No, TrackReference::No).is_none());
        assert!(lb.find(&key, WantsDeleted::Yes, TrackReference::No).is_some());
        drop(lb);
        assert_eq!(ht.num_items(), 0);
        assert_eq!(ht.num_deleted_items(), 1);
    }

    #[test]
    fn tracked_reads_warm_the_counter() {
        let ht = table();
        let key = DocKey::in_default("hot");
        {
            let mut lb = ht.lock_key(&key);
            lb.insert(StoredValue::from_item(&item("hot", "v")));
        }
        let start = {
            let mut lb = ht.lock_key(&key);
            lb.find(&key, WantsDeleted::No, TrackReference::No)
                .unwrap()
                .freq_counter()
        };
        for _ in 0..5000 {
            let mut lb = ht.lock_key(&key);
            lb.find(&key, WantsDeleted::No, TrackReference::Yes);
        }
        let end = {
            let mut lb = ht.lock_key(&key);
            lb.find(&key, WantsDeleted::No, TrackReference::No)
                .unwrap()
                .freq_counter()
        };
        assert!(end > start, "freq counter should have warmed: {start} -> {end}");
    }

    #[test]
    fn value_eviction_keeps_metadata() {
        let ht = table();
        let key = DocKey::in_default("cold");
        {
            let mut lb = ht.lock_key(&key);
            let mut sv = StoredValue::from_item(&item("cold", "value-bytes"));
            sv.mark_clean();
            lb.insert(sv);
        }
        struct EvictAll;
        impl HashTableVisitor for EvictAll {
            fn visit(&mut self, _sv: &mut StoredValue) -> VisitDecision {
                VisitDecision::Evict
            }
        }
        ht.visit(&mut EvictAll);
        assert_eq!(ht.num_items(), 1);
        assert_eq!(ht.num_non_resident(), 1);
        assert_eq!(ht.num_ejects(), 1);
        let mut lb = ht.lock_key(&key);
        let sv = lb.find(&key, WantsDeleted::No, TrackReference::No).unwrap();
        assert!(!sv.is_resident());
        assert_eq!(sv.rev_seqno(), 0);
    }

    #[test]
    fn full_eviction_removes_clean_entries() {
        let ht = full_eviction_table();
        let key = DocKey::in_default("cold");
        {
            let mut lb = ht.lock_key(&key);
            let mut sv = StoredValue::from_item(&item("cold", "value"));
            sv.mark_clean();
            lb.insert(sv);
        }
        struct EvictAll;
        impl HashTableVisitor for EvictAll {
            fn visit(&mut self, _sv: &mut StoredValue) -> VisitDecision {
                VisitDecision::Evict
            }
        }
        ht.visit(&mut EvictAll);
        assert_eq!(ht.num_items(), 0);
        let mut lb = ht.lock_key(&key);
        assert!(lb.find(&key, WantsDeleted::Yes, TrackReference::No).is_none());
    }

    #[test]
    fn dirty_entries_are_not_evictable() {
        let ht = table();
        let key = DocKey::in_default("dirty");
        {
            let mut lb = ht.lock_key(&key);
            lb.insert(StoredValue::from_item(&item("dirty", "v")));
        }
        struct EvictAll;
        impl HashTableVisitor for EvictAll {
            fn visit(&mut self, _sv: &mut StoredValue) -> VisitDecision {
                VisitDecision::Evict
            }
        }
        ht.visit(&mut EvictAll);
        assert_eq!(ht.num_non_resident(), 0);
        assert_eq!(ht.num_ejects(), 0);
    }

    #[test]
    fn keys_in_distinct_collections_are_distinct() {
        let ht = table();
        let k1 = DocKey::new(CollectionId(1), "same");
        let k2 = DocKey::new(CollectionId(2), "same");
        {
            let mut lb = ht.lock_key(&k1);
            lb.insert(StoredValue::from_item(&Item::new(k1.clone(), "a")));
        }
        {
            let mut lb = ht.lock_key(&k2);
            lb.insert(StoredValue::from_item(&Item::new(k2.clone(), "b")));
        }
        assert_eq!(ht.num_items(), 2);
    }

    #[test]
    fn max_deleted_rev_is_monotone() {
        let ht = table();
        ht.note_deleted_rev_seqno(5);
        ht.note_deleted_rev_seqno(3);
        assert_eq!(ht.max_deleted_rev_seqno(), 5);
    }
}
