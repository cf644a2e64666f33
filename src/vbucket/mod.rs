//! VBucket: one partition of the keyspace and its mutation state machine.
//!
//! Every operation follows the same shape: take the stripe lock covering
//! the key, decide against the stored-value state machine, apply the
//! mutation, queue it into the checkpoint while still holding the stripe
//! lock, then release and notify the durability monitor. New-seqno
//! notifications never run under the stripe lock.
//!
//! Lock rank within a vbucket: state lock, hash stripe, checkpoint
//! manager, durability monitor. The collections manifest is read before
//! the stripe lock is taken and written while no stripe is held.

pub mod xattr;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::checkpoint::{
    CheckpointManager, CheckpointStats, GenerateBySeqno, QueueOp, QueuedItem, PERSISTENCE_CURSOR,
};
use crate::collections::{system_event_key, Manifest, VbucketManifest};
use crate::config::{ConflictResolutionMode, EngineConfig, EvictionPolicy};
use crate::durability::{DurabilityLevel, DurabilityMonitor, DurabilityStats, SyncWrite};
use crate::engine::memory::MemoryTracker;
use crate::error::{Result, Status};
use crate::failover::FailoverTable;
use crate::hash_table::stored_value::{
    StoredValue, PER_ENTRY_OVERHEAD, SEQNO_TEMP_DELETED, SEQNO_TEMP_INITIAL,
    SEQNO_TEMP_NON_EXISTENT,
};
use crate::hash_table::{HashTable, LockedBucket, TrackReference, WantsDeleted};
use crate::hlc::{now_secs, Hlc};
use crate::types::{datatype, Cas, CollectionId, DocKey, Item, ItemMeta, VBucketState, Vbid};

/// Whether a read of an expired item may enqueue its soft delete.
/// Read-only call sites (backup, replication) opt out.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum QueueExpired {
    Yes,
    No,
}

/// Result of a read operation.
#[derive(Debug)]
pub struct GetValue {
    pub status: Status,
    pub item: Option<Item>,
}

impl GetValue {
    fn fail(status: Status) -> Self {
        Self { status, item: None }
    }
}

/// Result of a mutation.
#[derive(Debug, Clone, Copy)]
pub struct MutationOutcome {
    pub status: Status,
    pub cas: Cas,
    pub seqno: u64,
}

impl MutationOutcome {
    fn fail(status: Status) -> Self {
        Self {
            status,
            cas: 0,
            seqno: 0,
        }
    }
}

/// Durability requested alongside a mutation.
#[derive(Debug, Clone, Copy)]
pub struct DurabilityRequirement {
    pub level: DurabilityLevel,
    /// `None` means the write never times out.
    pub timeout: Option<Duration>,
    /// Opaque client token surfaced on commit or abort.
    pub cookie: u64,
}

/// Answer to `get_key_stats`.
#[derive(Debug, Clone, Copy)]
pub struct KeyStats {
    pub deleted: bool,
    pub exptime: u32,
    pub flags: u32,
    pub resident: bool,
    pub logically_deleted: bool,
    pub state: VBucketState,
}

/// Outcome of the external disk probe resolving a temp-initial slot.
#[derive(Debug, Clone)]
pub enum BgFetchResult {
    /// Document (possibly a tombstone) found on disk.
    Found(Item),
    /// Key does not exist on disk.
    NotFound,
}

/// Persisted per-vbucket state record, produced for and consumed from
/// the flusher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VbucketStateRecord {
    pub state: VBucketState,
    pub persistence_checkpoint_id: u64,
    pub high_seqno: u64,
    pub purge_seqno: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub max_cas: u64,
    pub hlc_epoch_seqno: u64,
    pub failover_log: String,
    pub collections_blob: String,
}

#[derive(Debug, Default)]
struct VBucketOpStats {
    ops_create: AtomicU64,
    ops_update: AtomicU64,
    ops_delete: AtomicU64,
    ops_reject: AtomicU64,
    ops_get: AtomicU64,
    bg_fetches: AtomicU64,
    num_expired: AtomicU64,
    conflict_resolution_losses: AtomicU64,
}

/// Counter snapshot for stats rendering.
#[derive(Debug, Clone, Copy, Default)]
pub struct VBucketOpCounters {
    pub ops_create: u64,
    pub ops_update: u64,
    pub ops_delete: u64,
    pub ops_reject: u64,
    pub ops_get: u64,
    pub bg_fetches: u64,
    pub num_expired: u64,
    pub conflict_resolution_losses: u64,
}

enum ProcessOutcome {
    Create,
    Update,
    Fail(Status),
    /// Disk probe required; `insert_temp` when no placeholder exists yet.
    NeedsBgFetch {
        insert_temp: bool,
    },
}

/// Store operation variants sharing the decision table.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum StoreMode {
    Set,
    Add,
    Replace,
    SetWithMeta,
    AddWithMeta,
    Backfill,
}

impl StoreMode {
    fn has_meta(self) -> bool {
        matches!(
            self,
            StoreMode::SetWithMeta | StoreMode::AddWithMeta | StoreMode::Backfill
        )
    }

    fn resolves_conflicts(self) -> bool {
        matches!(self, StoreMode::SetWithMeta | StoreMode::AddWithMeta)
    }

    fn is_add(self) -> bool {
        matches!(self, StoreMode::Add | StoreMode::AddWithMeta)
    }
}

/// One virtual bucket.
pub struct VBucket {
    pub id: Vbid,
    state: RwLock<VBucketState>,
    pub ht: HashTable,
    checkpoint: Mutex<CheckpointManager>,
    durability: Mutex<DurabilityMonitor>,
    manifest: RwLock<VbucketManifest>,
    failover: Mutex<FailoverTable>,
    pub hlc: Hlc,
    bloom: Option<Mutex<BloomFilter>>,
    persistence_seqno: AtomicU64,
    purge_seqno: AtomicU64,
    disk_queue_size: AtomicUsize,
    pending_ops: Mutex<Vec<DocKey>>,
    memory: Arc<MemoryTracker>,
    conflict_mode: ConflictResolutionMode,
    lock_timeout_secs: u32,
    stats: VBucketOpStats,
}

impl VBucket {
    /// Builds a vbucket in `initial_state` against the shared memory
    /// tracker.
    pub fn new(
        id: Vbid,
        initial_state: VBucketState,
        config: &EngineConfig,
        memory: Arc<MemoryTracker>,
    ) -> Self {
        let ht = HashTable::new(
            config.ht_buckets,
            config.ht_locks,
            config.eviction_policy,
            config.freq_counter_saturation,
            memory.clone(),
        );
        let mut checkpoint =
            CheckpointManager::new(id, 0, config.checkpoint_max_items, memory.clone());
        checkpoint.register_cursor(PERSISTENCE_CURSOR);
        let bloom = match config.eviction_policy {
            EvictionPolicy::FullEviction => Some(Mutex::new(BloomFilter::new(
                config.bloom_key_estimate,
                config.bloom_fp_rate,
            ))),
            EvictionPolicy::ValueOnly => None,
        };
        Self {
            id,
            state: RwLock::new(initial_state),
            ht,
            checkpoint: Mutex::new(checkpoint),
            durability: Mutex::new(DurabilityMonitor::new(id)),
            manifest: RwLock::new(VbucketManifest::new()),
            failover: Mutex::new(FailoverTable::new()),
            hlc: Hlc::new(0),
            bloom,
            persistence_seqno: AtomicU64::new(0),
            purge_seqno: AtomicU64::new(0),
            disk_queue_size: AtomicUsize::new(0),
            pending_ops: Mutex::new(Vec::new()),
            memory,
            conflict_mode: config.conflict_resolution,
            lock_timeout_secs: config.lock_timeout_secs,
            stats: VBucketOpStats::default(),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    /// Transitions the vbucket; promotion to active records a new
    /// failover entry at the current high seqno.
    pub fn set_state(&self, new: VBucketState) {
        let mut guard = self.state.write();
        let old = *guard;
        *guard = new;
        drop(guard);
        if new == VBucketState::Active && old != VBucketState::Active {
            let high = self.high_seqno();
            self.failover.lock().create_entry(high);
        }
        debug!(vbid = %self.id, from = %old, to = %new, "vbucket state change");
    }

    /// Highest seqno assigned by this vbucket.
    pub fn high_seqno(&self) -> u64 {
        self.checkpoint.lock().high_seqno()
    }

    /// Seqno the flusher has persisted up to.
    pub fn persistence_seqno(&self) -> u64 {
        self.persistence_seqno.load(Ordering::Acquire)
    }

    /// Records flusher progress (warmup and test hook).
    pub fn set_persistence_seqno(&self, seqno: u64) {
        self.persistence_seqno.fetch_max(seqno, Ordering::AcqRel);
    }

    /// Seqno below which dropped-collection data has been purged.
    pub fn purge_seqno(&self) -> u64 {
        self.purge_seqno.load(Ordering::Acquire)
    }

    /// Items queued for the flusher and not yet drained.
    pub fn disk_queue_size(&self) -> usize {
        self.disk_queue_size.load(Ordering::Acquire)
    }

    fn maybe_on_disk(&self, key: &DocKey) -> bool {
        match &self.bloom {
            Some(bloom) => bloom.lock().maybe_key_exists(key),
            None => false,
        }
    }

    /// Records an evicted key so later lookups keep consulting disk.
    pub fn note_evicted_key(&self, key: &DocKey) {
        if let Some(bloom) = &self.bloom {
            bloom.lock().add_key(key);
        }
    }

    fn collection_is_valid(&self, key: &DocKey) -> bool {
        self.manifest.read().does_key_contain_valid_collection(key)
    }

    fn push_pending_op(&self, key: &DocKey) {
        self.stats.bg_fetches.fetch_add(1, Ordering::Relaxed);
        self.pending_ops.lock().push(key.clone());
    }

    // ---- write family ----------------------------------------------------

    /// Unconditional (or CAS-guarded) store.
    pub fn set(&self, item: Item, cas: Cas) -> MutationOutcome {
        self.store(item, cas, StoreMode::Set, None)
    }

    /// Store that only succeeds when the key is absent (or a tombstone).
    pub fn add(&self, item: Item) -> MutationOutcome {
        self.store(item, 0, StoreMode::Add, None)
    }

    /// Store that only succeeds over an existing live value.
    pub fn replace(&self, item: Item, cas: Cas) -> MutationOutcome {
        self.store(item, cas, StoreMode::Replace, None)
    }

    /// Store carrying external metadata (replication / XDCR), subject to
    /// conflict resolution.
    pub fn set_with_meta(&self, item: Item, cas: Cas, allow_existing: bool) -> MutationOutcome {
        let mode = if allow_existing {
            StoreMode::SetWithMeta
        } else {
            StoreMode::AddWithMeta
        };
        self.store(item, cas, mode, None)
    }

    /// Synchronous store: tracked by the durability monitor until the
    /// chain acknowledges it.
    pub fn set_durable(
        &self,
        item: Item,
        cas: Cas,
        requirement: DurabilityRequirement,
    ) -> MutationOutcome {
        self.store(item, cas, StoreMode::Set, Some(requirement))
    }

    /// Replica takeover of a backfill item: metadata and seqno applied
    /// verbatim, no conflict resolution.
    pub fn add_backfill_item(&self, item: Item) -> MutationOutcome {
        debug_assert!(item.by_seqno > 0, "backfill items carry their seqno");
        self.store(item, 0, StoreMode::Backfill, None)
    }

    fn store(
        &self,
        mut item: Item,
        cas: Cas,
        mode: StoreMode,
        durability: Option<DurabilityRequirement>,
    ) -> MutationOutcome {
        let state = self.state();
        if state == VBucketState::Dead {
            return MutationOutcome::fail(Status::Ranged);
        }
        let now = now_secs();
        if !self.collection_is_valid(&item.key) {
            self.stats.ops_reject.fetch_add(1, Ordering::Relaxed);
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        let replication = state != VBucketState::Active || mode.has_meta();
        let incoming = PER_ENTRY_OVERHEAD + item.key.footprint() + item.value.len();
        if !self.memory.has_headroom(incoming, replication) {
            self.stats.ops_reject.fetch_add(1, Ordering::Relaxed);
            return MutationOutcome::fail(Status::NoMem);
        }
        if durability.is_some() && !self.durability.lock().has_topology() {
            return MutationOutcome::fail(Status::NotStored);
        }

        let mut lb = self.ht.lock_key(&item.key);
        let seqno = match self.process_store(&mut lb, &item, cas, mode, now, state) {
            ProcessOutcome::Fail(status) => {
                if status == Status::KeyExists && mode.resolves_conflicts() {
                    self.stats
                        .conflict_resolution_losses
                        .fetch_add(1, Ordering::Relaxed);
                }
                return MutationOutcome::fail(status);
            }
            ProcessOutcome::NeedsBgFetch { insert_temp } => {
                if insert_temp {
                    lb.insert(StoredValue::new_temp(item.key.clone(), SEQNO_TEMP_INITIAL));
                }
                drop(lb);
                self.push_pending_op(&item.key);
                return MutationOutcome::fail(Status::WouldBlock);
            }
            ProcessOutcome::Create => {
                self.assign_version(&mut item, mode, None);
                let mut sv = StoredValue::from_item(&item);
                let seqno = self.queue_mutation(&item, mode);
                sv.set_by_seqno(seqno);
                lb.insert(sv);
                self.stats.ops_create.fetch_add(1, Ordering::Relaxed);
                seqno
            }
            ProcessOutcome::Update => {
                let prior_rev = lb
                    .find(&item.key, WantsDeleted::Yes, TrackReference::No)
                    .map(|v| v.rev_seqno())
                    .unwrap_or(0);
                self.assign_version(&mut item, mode, Some(prior_rev));
                let seqno = self.queue_mutation(&item, mode);
                let delete_time = now;
                lb.mutate(&item.key, |v| {
                    v.apply_item(&item, delete_time);
                    v.set_by_seqno(seqno);
                });
                self.stats.ops_update.fetch_add(1, Ordering::Relaxed);
                seqno
            }
        };
        if item.deleted {
            self.ht.note_deleted_rev_seqno(item.rev_seqno);
        }
        drop(lb);
        match self.notify_new_seqno(seqno, durability) {
            Some(overriding) => overriding,
            None => MutationOutcome {
                status: Status::Success,
                cas: item.cas,
                seqno,
            },
        }
    }

    /// Post-mutation notification, run with the stripe lock released.
    /// Returns an overriding outcome only on durability bookkeeping
    /// failure.
    fn notify_new_seqno(
        &self,
        seqno: u64,
        durability: Option<DurabilityRequirement>,
    ) -> Option<MutationOutcome> {
        self.disk_queue_size.fetch_add(1, Ordering::AcqRel);
        if let Some(req) = durability {
            match self.durability.lock().add_sync_write(
                seqno,
                req.level,
                req.timeout,
                req.cookie,
                Instant::now(),
            ) {
                Ok(committed) => {
                    if !committed.is_empty() {
                        debug!(
                            vbid = %self.id,
                            count = committed.len(),
                            "sync writes committed on add"
                        );
                    }
                }
                Err(err) => {
                    warn!(vbid = %self.id, %err, "sync write not tracked");
                    return Some(MutationOutcome::fail(Status::NotStored));
                }
            }
        }
        None
    }

    fn assign_version(&self, item: &mut Item, mode: StoreMode, prior_rev: Option<u64>) {
        if mode.has_meta() {
            // Remote metadata applied verbatim; the clock only observes.
            self.hlc.accept_cas(item.cas);
        } else {
            item.cas = self.hlc.next_cas();
            let floor = self.ht.max_deleted_rev_seqno();
            item.rev_seqno = prior_rev.unwrap_or(0).max(floor) + 1;
        }
    }

    fn queue_mutation(&self, item: &Item, mode: StoreMode) -> u64 {
        let op = if item.deleted {
            QueueOp::Delete
        } else {
            QueueOp::Mutation
        };
        let (generate, provided) = if mode == StoreMode::Backfill {
            (GenerateBySeqno::No, item.by_seqno)
        } else {
            (GenerateBySeqno::Yes, 0)
        };
        self.checkpoint
            .lock()
            .queue_dirty(item.key.clone(), op, item.cas, generate, provided, None)
    }

    fn process_store(
        &self,
        lb: &mut LockedBucket<'_>,
        item: &Item,
        cas: Cas,
        mode: StoreMode,
        now: u32,
        state: VBucketState,
    ) -> ProcessOutcome {
        let Some(v) = lb.find(&item.key, WantsDeleted::Yes, TrackReference::No) else {
            return match mode {
                StoreMode::Replace => {
                    if self.maybe_on_disk(&item.key) {
                        ProcessOutcome::NeedsBgFetch { insert_temp: true }
                    } else {
                        ProcessOutcome::Fail(Status::KeyNotFound)
                    }
                }
                _ if cas != 0 => {
                    if self.maybe_on_disk(&item.key) {
                        ProcessOutcome::NeedsBgFetch { insert_temp: true }
                    } else {
                        ProcessOutcome::Fail(Status::KeyNotFound)
                    }
                }
                StoreMode::Add | StoreMode::AddWithMeta if self.maybe_on_disk(&item.key) => {
                    // The key may exist on disk; absence must be proven
                    // before add can succeed under full eviction.
                    ProcessOutcome::NeedsBgFetch { insert_temp: true }
                }
                _ => ProcessOutcome::Create,
            };
        };

        // Replication streams override client CAS locks.
        if state == VBucketState::Active {
            if v.is_locked(now) {
                if cas != 0 && cas == v.cas() {
                    v.unlock();
                } else {
                    return ProcessOutcome::Fail(Status::Locked);
                }
            }
        } else {
            v.unlock();
        }

        if mode.resolves_conflicts()
            && !v.is_temp_item()
            && !remote_wins(self.conflict_mode, v.meta(), item.meta())
        {
            return ProcessOutcome::Fail(Status::KeyExists);
        }

        if v.is_temp_initial() {
            // A probe for this key is already in flight.
            return ProcessOutcome::NeedsBgFetch { insert_temp: false };
        }

        if mode == StoreMode::Replace {
            let dead = v.is_deleted() || v.is_temp_item();
            let deleted_transition = item.deleted && v.is_deleted() && !v.is_temp_item();
            if (dead || v.is_expired(now)) && !deleted_transition {
                return ProcessOutcome::Fail(Status::KeyNotFound);
            }
        }

        if v.is_expired(now) && !mode.has_meta() && !item.deleted && cas != 0 {
            // CAS over an expired value never succeeds.
            return ProcessOutcome::Fail(Status::KeyNotFound);
        }

        if (v.is_deleted() || v.is_temp_deleted()) && !item.deleted && cas != 0 {
            // Replace-over-tombstone is forbidden.
            return ProcessOutcome::Fail(Status::KeyNotFound);
        }

        if mode.is_add() && !v.is_temp_item() && !v.is_deleted() && !v.is_expired(now) {
            return ProcessOutcome::Fail(Status::NotStored);
        }

        if cas != 0 && cas != v.cas() {
            if v.is_temp_non_existent() {
                return ProcessOutcome::Fail(Status::KeyNotFound);
            }
            return ProcessOutcome::Fail(Status::KeyExists);
        }

        ProcessOutcome::Update
    }

    // ---- delete family ---------------------------------------------------

    /// Client soft delete.
    pub fn delete_item(&self, key: &DocKey, cas: Cas) -> MutationOutcome {
        self.delete_inner(key, cas, None, None)
    }

    /// Soft delete tracked by the durability monitor.
    pub fn delete_durable(
        &self,
        key: &DocKey,
        cas: Cas,
        requirement: DurabilityRequirement,
    ) -> MutationOutcome {
        self.delete_inner(key, cas, None, Some(requirement))
    }

    /// Replicated tombstone carrying external metadata. A non-empty
    /// `item.value` (system xattrs) survives as the tombstone body;
    /// otherwise system xattrs of the local value are preserved.
    pub fn delete_with_meta(&self, item: Item, cas: Cas) -> MutationOutcome {
        debug_assert!(item.deleted);
        let key = item.key.clone();
        self.delete_inner(&key, cas, Some(item), None)
    }

    fn delete_inner(
        &self,
        key: &DocKey,
        cas: Cas,
        meta_item: Option<Item>,
        durability: Option<DurabilityRequirement>,
    ) -> MutationOutcome {
        let state = self.state();
        if state == VBucketState::Dead {
            return MutationOutcome::fail(Status::Ranged);
        }
        let now = now_secs();
        if !self.collection_is_valid(key) {
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        if durability.is_some() && !self.durability.lock().has_topology() {
            return MutationOutcome::fail(Status::NotStored);
        }

        let mut lb = self.ht.lock_key(key);
        if lb.find(key, WantsDeleted::Yes, TrackReference::No).is_none() {
            if self.maybe_on_disk(key) {
                lb.insert(StoredValue::new_temp(key.clone(), SEQNO_TEMP_INITIAL));
                drop(lb);
                self.push_pending_op(key);
                return MutationOutcome::fail(Status::WouldBlock);
            }
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        let prior_rev = {
            let v = lb
                .find(key, WantsDeleted::Yes, TrackReference::No)
                .expect("checked above");
            if v.is_temp_initial() {
                drop(lb);
                self.push_pending_op(key);
                return MutationOutcome::fail(Status::WouldBlock);
            }
            if v.is_deleted() || v.is_temp_item() {
                return MutationOutcome::fail(Status::KeyNotFound);
            }
            if state == VBucketState::Active {
                if v.is_locked(now) {
                    if cas != 0 && cas == v.cas() {
                        v.unlock();
                    } else {
                        return MutationOutcome::fail(Status::Locked);
                    }
                }
            } else {
                v.unlock();
            }
            if let Some(remote) = &meta_item {
                if !remote_wins(self.conflict_mode, v.meta(), remote.meta()) {
                    self.stats
                        .conflict_resolution_losses
                        .fetch_add(1, Ordering::Relaxed);
                    return MutationOutcome::fail(Status::KeyExists);
                }
            }
            if v.is_expired(now) && cas != 0 {
                return MutationOutcome::fail(Status::KeyNotFound);
            }
            if cas != 0 && cas != v.cas() {
                return MutationOutcome::fail(Status::KeyExists);
            }
            v.rev_seqno()
        };

        let (new_cas, new_rev) = match &meta_item {
            Some(remote) => {
                self.hlc.accept_cas(remote.cas);
                (remote.cas, remote.rev_seqno)
            }
            None => (self.hlc.next_cas(), prior_rev + 1),
        };
        let preserved = meta_item
            .as_ref()
            .filter(|m| !m.value.is_empty())
            .map(|m| (Some(m.value.clone()), m.datatype));

        let seqno = self.checkpoint.lock().queue_dirty(
            key.clone(),
            QueueOp::Delete,
            new_cas,
            GenerateBySeqno::Yes,
            0,
            None,
        );
        lb.mutate(key, |v| {
            let (value, dt) = match preserved {
                Some(explicit) => explicit,
                None => {
                    let current = v.value().cloned().unwrap_or_default();
                    xattr::prune_for_deletion(&current, v.datatype())
                        .unwrap_or((None, datatype::RAW))
                }
            };
            v.delete_in_place(value, dt, now);
            v.set_version(new_cas, new_rev);
            v.set_by_seqno(seqno);
        });
        drop(lb);

        self.ht.note_deleted_rev_seqno(new_rev);
        self.stats.ops_delete.fetch_add(1, Ordering::Relaxed);
        match self.notify_new_seqno(seqno, durability) {
            Some(overriding) => overriding,
            None => MutationOutcome {
                status: Status::Success,
                cas: new_cas,
                seqno,
            },
        }
    }

    /// Removes the entry outright, bypassing tombstoning. Used by
    /// rollback and by purging dropped-collection data; nothing is
    /// queued.
    pub fn delete_key(&self, key: &DocKey) -> bool {
        let mut lb = self.ht.lock_key(key);
        lb.remove(key).is_some()
    }

    /// Soft-deletes an item found expired by a pager or read visit; a
    /// no-op when the value changed since it was observed.
    pub fn delete_expired_item(&self, key: &DocKey, observed_cas: Cas) -> MutationOutcome {
        let now = now_secs();
        let mut lb = self.ht.lock_key(key);
        let still_expired = lb
            .find(key, WantsDeleted::No, TrackReference::No)
            .map(|v| v.is_expired(now) && v.cas() == observed_cas)
            .unwrap_or(false);
        if !still_expired {
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        let seqno = self.expire_locked(&mut lb, key, now);
        drop(lb);
        self.disk_queue_size.fetch_add(1, Ordering::AcqRel);
        MutationOutcome {
            status: Status::Success,
            cas: 0,
            seqno,
        }
    }

    /// Tombstones an expired value under an already-held bucket lock and
    /// queues the delete. Returns the assigned seqno.
    fn expire_locked(&self, lb: &mut LockedBucket<'_>, key: &DocKey, now: u32) -> u64 {
        let new_cas = self.hlc.next_cas();
        let seqno = self.checkpoint.lock().queue_dirty(
            key.clone(),
            QueueOp::Delete,
            new_cas,
            GenerateBySeqno::Yes,
            0,
            None,
        );
        let mut new_rev = 0;
        lb.mutate(key, |v| {
            let current = v.value().cloned().unwrap_or_default();
            let (value, dt) = xattr::prune_for_deletion(&current, v.datatype())
                .unwrap_or((None, datatype::RAW));
            new_rev = v.rev_seqno() + 1;
            v.delete_in_place(value, dt, now);
            v.set_version(new_cas, new_rev);
            v.set_by_seqno(seqno);
        });
        self.ht.note_deleted_rev_seqno(new_rev);
        self.stats.num_expired.fetch_add(1, Ordering::Relaxed);
        seqno
    }

    // ---- read family -----------------------------------------------------

    /// Plain read. In an active vbucket an expired value is reported
    /// absent and (with `QueueExpired::Yes`) its soft delete is queued;
    /// non-active vbuckets return the value as stored.
    pub fn get(&self, key: &DocKey, queue_expired: QueueExpired) -> GetValue {
        let state = self.state();
        if state == VBucketState::Dead {
            return GetValue::fail(Status::Ranged);
        }
        if !self.collection_is_valid(key) {
            return GetValue::fail(Status::KeyNotFound);
        }
        self.stats.ops_get.fetch_add(1, Ordering::Relaxed);
        let now = now_secs();

        let mut lb = self.ht.lock_key(key);
        if lb.find(key, WantsDeleted::Yes, TrackReference::No).is_none() {
            if self.maybe_on_disk(key) {
                lb.insert(StoredValue::new_temp(key.clone(), SEQNO_TEMP_INITIAL));
                drop(lb);
                self.push_pending_op(key);
                return GetValue::fail(Status::WouldBlock);
            }
            return GetValue::fail(Status::KeyNotFound);
        }
        let expired = {
            let v = lb
                .find(key, WantsDeleted::Yes, TrackReference::Yes)
                .expect("checked above");
            if v.is_temp_initial() {
                drop(lb);
                self.push_pending_op(key);
                return GetValue::fail(Status::WouldBlock);
            }
            if v.is_temp_non_existent() || v.is_deleted() {
                // Tombstones, cached disk probes included, answer here
                // without another probe.
                return GetValue::fail(Status::KeyNotFound);
            }
            if v.is_expired(now) {
                if state != VBucketState::Active {
                    let item = v.to_item();
                    return GetValue {
                        status: Status::Success,
                        item,
                    };
                }
                true
            } else {
                if !v.is_resident() {
                    drop(lb);
                    self.push_pending_op(key);
                    return GetValue::fail(Status::WouldBlock);
                }
                let item = v.to_item();
                return GetValue {
                    status: Status::Success,
                    item,
                };
            }
        };
        if expired && queue_expired == QueueExpired::Yes {
            self.expire_locked(&mut lb, key, now);
            drop(lb);
            self.disk_queue_size.fetch_add(1, Ordering::AcqRel);
        }
        GetValue::fail(Status::KeyNotFound)
    }

    /// Read that also rewrites the expiry deadline.
    pub fn get_and_update_ttl(&self, key: &DocKey, exptime: u32) -> GetValue {
        let state = self.state();
        if state == VBucketState::Dead {
            return GetValue::fail(Status::Ranged);
        }
        let now = now_secs();
        let mut lb = self.ht.lock_key(key);
        if lb.find(key, WantsDeleted::Yes, TrackReference::No).is_none() {
            if self.maybe_on_disk(key) {
                lb.insert(StoredValue::new_temp(key.clone(), SEQNO_TEMP_INITIAL));
                drop(lb);
                self.push_pending_op(key);
                return GetValue::fail(Status::WouldBlock);
            }
            return GetValue::fail(Status::KeyNotFound);
        }
        let expired = {
            let v = lb
                .find(key, WantsDeleted::Yes, TrackReference::Yes)
                .expect("checked above");
            if v.is_temp_item() || v.is_deleted() {
                return GetValue::fail(Status::KeyNotFound);
            }
            if state == VBucketState::Active && v.is_locked(now) {
                return GetValue::fail(Status::Locked);
            }
            if v.is_expired(now) {
                true
            } else {
                if !v.is_resident() {
                    drop(lb);
                    self.push_pending_op(key);
                    return GetValue::fail(Status::WouldBlock);
                }
                false
            }
        };
        if expired {
            if state == VBucketState::Active {
                self.expire_locked(&mut lb, key, now);
                drop(lb);
                self.disk_queue_size.fetch_add(1, Ordering::AcqRel);
            }
            return GetValue::fail(Status::KeyNotFound);
        }
        let new_cas = self.hlc.next_cas();
        let seqno = self.checkpoint.lock().queue_dirty(
            key.clone(),
            QueueOp::Mutation,
            new_cas,
            GenerateBySeqno::Yes,
            0,
            None,
        );
        let mut item = None;
        lb.mutate(key, |v| {
            v.set_exptime(exptime);
            let rev = v.rev_seqno();
            v.set_version(new_cas, rev);
            v.mark_dirty();
            v.set_by_seqno(seqno);
            item = v.to_item();
        });
        drop(lb);
        self.disk_queue_size.fetch_add(1, Ordering::AcqRel);
        GetValue {
            status: Status::Success,
            item,
        }
    }

    /// CAS-locking read: the returned CAS is the only one that can write
    /// or unlock the key until the lock expires.
    pub fn get_locked(&self, key: &DocKey, lock_timeout: Option<u32>) -> GetValue {
        let state = self.state();
        if state != VBucketState::Active {
            return GetValue::fail(Status::Ranged);
        }
        let now = now_secs();
        let mut lb = self.ht.lock_key(key);
        if lb.find(key, WantsDeleted::Yes, TrackReference::No).is_none() {
            if self.maybe_on_disk(key) {
                lb.insert(StoredValue::new_temp(key.clone(), SEQNO_TEMP_INITIAL));
                drop(lb);
                self.push_pending_op(key);
                return GetValue::fail(Status::WouldBlock);
            }
            return GetValue::fail(Status::KeyNotFound);
        }
        let v = lb
            .find(key, WantsDeleted::Yes, TrackReference::Yes)
            .expect("checked above");
        if v.is_temp_item() || v.is_deleted() || v.is_expired(now) {
            return GetValue::fail(Status::KeyNotFound);
        }
        if v.is_locked(now) {
            return GetValue::fail(Status::LockedTmpFail);
        }
        if !v.is_resident() {
            drop(lb);
            self.push_pending_op(key);
            return GetValue::fail(Status::WouldBlock);
        }
        let timeout = lock_timeout.unwrap_or(self.lock_timeout_secs);
        let new_cas = self.hlc.next_cas();
        v.lock(now + timeout, new_cas);
        let item = v.to_item();
        GetValue {
            status: Status::Success,
            item,
        }
    }

    /// Metadata-only read; tombstone metadata is reported.
    pub fn get_meta_data(&self, key: &DocKey) -> (Status, Option<ItemMeta>) {
        let mut lb = self.ht.lock_key(key);
        if lb.find(key, WantsDeleted::Yes, TrackReference::No).is_none() {
            if self.maybe_on_disk(key) {
                lb.insert(StoredValue::new_temp(key.clone(), SEQNO_TEMP_INITIAL));
                drop(lb);
                self.push_pending_op(key);
                return (Status::WouldBlock, None);
            }
            return (Status::KeyNotFound, None);
        }
        let v = lb
            .find(key, WantsDeleted::Yes, TrackReference::No)
            .expect("checked above");
        if v.is_temp_initial() {
            drop(lb);
            self.push_pending_op(key);
            return (Status::WouldBlock, None);
        }
        if v.is_temp_non_existent() {
            return (Status::KeyNotFound, None);
        }
        (Status::Success, Some(v.meta()))
    }

    /// Presence / residency diagnostics for one key.
    pub fn get_key_stats(&self, key: &DocKey) -> (Status, Option<KeyStats>) {
        let state = self.state();
        let found = {
            let mut lb = self.ht.lock_key(key);
            match lb.find(key, WantsDeleted::Yes, TrackReference::No) {
                None => None,
                Some(v) if v.is_temp_initial() => {
                    drop(lb);
                    self.push_pending_op(key);
                    return (Status::WouldBlock, None);
                }
                Some(v) if v.is_temp_non_existent() => return (Status::KeyNotFound, None),
                Some(v) => Some((
                    v.is_deleted(),
                    v.exptime(),
                    v.flags(),
                    v.is_resident(),
                    v.by_seqno().max(0) as u64,
                )),
            }
        };
        match found {
            None => (Status::KeyNotFound, None),
            Some((deleted, exptime, flags, resident, seqno)) => {
                let logically_deleted = self.manifest.read().is_logically_deleted(key, seqno);
                (
                    Status::Success,
                    Some(KeyStats {
                        deleted,
                        exptime,
                        flags,
                        resident,
                        logically_deleted,
                        state,
                    }),
                )
            }
        }
    }

    // ---- background fetch ------------------------------------------------

    /// Resolves an outstanding disk probe for `key`.
    pub fn complete_bg_fetch(&self, key: &DocKey, result: BgFetchResult) -> Status {
        let mut lb = self.ht.lock_key(key);
        let Some(snapshot) = lb
            .find(key, WantsDeleted::Yes, TrackReference::No)
            .map(|v| (v.is_temp_initial(), v.is_resident(), v.is_dirty(), v.cas()))
        else {
            return Status::KeyNotFound;
        };
        let (temp_initial, resident, dirty, current_cas) = snapshot;
        if temp_initial {
            lb.mutate(key, |v| match &result {
                BgFetchResult::Found(item) if !item.deleted => v.restore(item),
                BgFetchResult::Found(item) => {
                    v.set_version(item.cas, item.rev_seqno);
                    v.convert_to_temp(SEQNO_TEMP_DELETED);
                }
                BgFetchResult::NotFound => v.convert_to_temp(SEQNO_TEMP_NON_EXISTENT),
            });
            return Status::Success;
        }
        // A live entry that lost its body can be refilled when nothing
        // changed since eviction.
        if !resident && !dirty {
            if let BgFetchResult::Found(item) = &result {
                if item.cas == current_cas && !item.deleted {
                    lb.mutate(key, |v| v.restore(item));
                }
            }
        }
        Status::Success
    }

    /// Fires every operation parked behind background fetches, returning
    /// the keys to re-notify.
    pub fn fire_all_ops(&self) -> Vec<DocKey> {
        std::mem::take(&mut *self.pending_ops.lock())
    }

    // ---- durability ------------------------------------------------------

    /// Installs the replication chain for this vbucket.
    pub fn set_replication_topology(&self, chain: &[&str]) -> Result<()> {
        self.durability.lock().set_replication_topology(chain)
    }

    /// Handles a replica's seqno ack; returns committed writes.
    pub fn seqno_ack_received(
        &self,
        node: &str,
        mem_seqno: u64,
        disk_seqno: u64,
    ) -> Result<Vec<SyncWrite>> {
        self.durability
            .lock()
            .seqno_ack_received(node, mem_seqno, disk_seqno)
    }

    /// Feeds the current persistence seqno into the monitor; returns
    /// committed writes.
    pub fn notify_local_persistence(&self) -> Vec<SyncWrite> {
        let seqno = self.persistence_seqno();
        self.durability.lock().notify_local_persistence(seqno)
    }

    /// Aborts tracked writes whose timeout elapsed by `now`.
    pub fn process_durability_timeout(&self, now: Instant) -> Vec<SyncWrite> {
        self.durability.lock().process_timeout(now)
    }

    /// Durability monitor snapshot.
    pub fn durability_stats(&self) -> DurabilityStats {
        self.durability.lock().stats()
    }

    /// Number of writes still tracked.
    pub fn num_tracked_sync_writes(&self) -> usize {
        self.durability.lock().num_tracked()
    }

    // ---- collections -----------------------------------------------------

    /// Applies a new bucket-level manifest declaration: all deletions
    /// first, then all additions; the final event of each pass carries
    /// the new uid, every other event the old one. Returns whether any
    /// event was queued.
    pub fn update_collections(&self, new: &Manifest) -> Result<bool> {
        let mut manifest = self.manifest.write();
        let changes = manifest.compute_changes(new)?;
        if changes.is_empty() {
            manifest.set_uid(new.uid);
            return Ok(false);
        }
        let mut ckpt = self.checkpoint.lock();
        let n_del = changes.deletions.len();
        for (i, &cid) in changes.deletions.iter().enumerate() {
            let carried = if i + 1 == n_del {
                new.uid
            } else {
                manifest.uid()
            };
            let seqno = ckpt.high_seqno() + 1;
            manifest.begin_collection_delete(cid, seqno);
            let blob = manifest.encode_event_blob(cid, carried);
            let queued = ckpt.queue_system_event(Some(system_event_key(cid)), blob, 0);
            debug_assert_eq!(queued, seqno);
        }
        let n_add = changes.additions.len();
        for (i, &cid) in changes.additions.iter().enumerate() {
            let carried = if i + 1 == n_add {
                new.uid
            } else {
                manifest.uid()
            };
            let seqno = ckpt.high_seqno() + 1;
            manifest.add_collection(cid, seqno);
            let blob = manifest.encode_event_blob(cid, carried);
            let queued = ckpt.queue_system_event(Some(system_event_key(cid)), blob, 0);
            debug_assert_eq!(queued, seqno);
        }
        drop(ckpt);
        manifest.set_uid(new.uid);
        debug!(
            vbid = %self.id,
            uid = %new.uid,
            deletions = n_del,
            additions = n_add,
            "collections manifest updated"
        );
        Ok(true)
    }

    /// Finishes a collection deletion after its end event persisted:
    /// drops the entry and queues the hard-delete event.
    pub fn complete_collection_deletion(&self, cid: CollectionId) -> Result<()> {
        let mut manifest = self.manifest.write();
        let end_seqno = manifest
            .entry(cid)
            .filter(|e| !e.is_open())
            .map(|e| e.end_seqno);
        manifest.complete_deletion(cid)?;
        if let Some(end) = end_seqno {
            self.purge_seqno.fetch_max(end, Ordering::AcqRel);
        }
        let blob = manifest.encode_event_blob(cid, manifest.uid());
        self.checkpoint
            .lock()
            .queue_system_event(Some(system_event_key(cid)), blob, 0);
        Ok(())
    }

    /// Collections gate: is the key's collection open?
    pub fn does_key_contain_valid_collection(&self, key: &DocKey) -> bool {
        self.collection_is_valid(key)
    }

    /// Collections gate consulted when replaying streams.
    pub fn is_logically_deleted(&self, key: &DocKey, seqno: u64) -> bool {
        self.manifest.read().is_logically_deleted(key, seqno)
    }

    /// Read-only view of the manifest (stats, tests).
    pub fn with_manifest<R>(&self, f: impl FnOnce(&VbucketManifest) -> R) -> R {
        f(&self.manifest.read())
    }

    // ---- checkpoint ------------------------------------------------------

    /// Forces checkpoint rotation; returns the new open checkpoint id.
    pub fn create_new_checkpoint(&self) -> u64 {
        self.checkpoint.lock().create_new_checkpoint()
    }

    /// Reclaims closed, unreferenced checkpoints.
    pub fn remove_closed_unref_checkpoints(&self) -> (usize, bool) {
        self.checkpoint.lock().remove_closed_unref_checkpoints()
    }

    /// Id of the open checkpoint.
    pub fn get_open_checkpoint_id(&self) -> u64 {
        self.checkpoint.lock().get_open_checkpoint_id()
    }

    /// Checkpoint counters for stats.
    pub fn checkpoint_stats(&self) -> CheckpointStats {
        self.checkpoint.lock().stats()
    }

    /// Drains up to `limit` items for the persistence cursor, advancing
    /// the persistence seqno, marking drained values clean, and easing
    /// the flusher queue gauge, the way the external flusher would.
    pub fn drain_for_persistence(&self, limit: usize) -> Vec<QueuedItem> {
        let items = self
            .checkpoint
            .lock()
            .next_items_for_cursor(PERSISTENCE_CURSOR, limit);
        for queued in &items {
            let Some(key) = &queued.key else { continue };
            if queued.op == QueueOp::SystemEvent {
                continue;
            }
            let mut lb = self.ht.lock_key(key);
            lb.mutate(key, |v| {
                if v.by_seqno() == queued.by_seqno as i64 {
                    v.mark_clean();
                }
            });
        }
        if let Some(last) = items.last() {
            self.set_persistence_seqno(last.by_seqno);
        }
        let drained = items.len();
        self.disk_queue_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(drained))
            })
            .ok();
        items
    }

    // ---- persisted state -------------------------------------------------

    /// Builds the persisted state record handed to the flusher.
    pub fn snapshot_state(&self) -> Result<VbucketStateRecord> {
        let (snap_start, snap_end) = self.checkpoint.lock().snapshot_range();
        Ok(VbucketStateRecord {
            state: self.state(),
            persistence_checkpoint_id: self.get_open_checkpoint_id(),
            high_seqno: self.high_seqno(),
            purge_seqno: self.purge_seqno(),
            snap_start,
            snap_end,
            max_cas: self.hlc.max_cas(),
            hlc_epoch_seqno: self.hlc.epoch_seqno(),
            failover_log: self.failover.lock().to_json()?,
            collections_blob: self.manifest.read().to_json()?,
        })
    }

    /// Failover table accessor.
    pub fn with_failover_table<R>(&self, f: impl FnOnce(&FailoverTable) -> R) -> R {
        f(&self.failover.lock())
    }

    /// Zeroes the per-vbucket operation counters (`reset` command).
    pub fn reset_op_counters(&self) {
        self.stats.ops_create.store(0, Ordering::Relaxed);
        self.stats.ops_update.store(0, Ordering::Relaxed);
        self.stats.ops_delete.store(0, Ordering::Relaxed);
        self.stats.ops_reject.store(0, Ordering::Relaxed);
        self.stats.ops_get.store(0, Ordering::Relaxed);
        self.stats.bg_fetches.store(0, Ordering::Relaxed);
        self.stats.num_expired.store(0, Ordering::Relaxed);
        self.stats
            .conflict_resolution_losses
            .store(0, Ordering::Relaxed);
    }

    /// Operation counter snapshot.
    pub fn op_counters(&self) -> VBucketOpCounters {
        VBucketOpCounters {
            ops_create: self.stats.ops_create.load(Ordering::Relaxed),
            ops_update: self.stats.ops_update.load(Ordering::Relaxed),
            ops_delete: self.stats.ops_delete.load(Ordering::Relaxed),
            ops_reject: self.stats.ops_reject.load(Ordering::Relaxed),
            ops_get: self.stats.ops_get.load(Ordering::Relaxed),
            bg_fetches: self.stats.bg_fetches.load(Ordering::Relaxed),
            num_expired: self.stats.num_expired.load(Ordering::Relaxed),
            conflict_resolution_losses: self
                .stats
                .conflict_resolution_losses
                .load(Ordering::Relaxed),
        }
    }
}

/// Conflict resolution: does the remote mutation win over the local one?
fn remote_wins(mode: ConflictResolutionMode, local: ItemMeta, remote: ItemMeta) -> bool {
    match mode {
        ConflictResolutionMode::RevisionSeqno => {
            if remote.rev_seqno != local.rev_seqno {
                remote.rev_seqno > local.rev_seqno
            } else {
                remote.cas > local.cas
            }
        }
        ConflictResolutionMode::LastWriteWins => remote.cas > local.cas,
    }
}
