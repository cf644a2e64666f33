//! One hash table slot entry and its state bits.

use bytes::Bytes;

use crate::eviction::freq::freq_to_nru;
use crate::types::{Cas, DocKey, Item, ItemMeta};

/// Seqno not yet assigned; the value is waiting for checkpoint linkage.
pub const SEQNO_PENDING: i64 = -1;
/// Temp item holding a tombstone fetched from disk.
pub const SEQNO_TEMP_DELETED: i64 = -3;
/// Temp item recording that the key does not exist on disk.
pub const SEQNO_TEMP_NON_EXISTENT: i64 = -4;
/// Temp item inserted while a background fetch is outstanding.
pub const SEQNO_TEMP_INITIAL: i64 = -5;

/// Frequency counter assigned to freshly stored values: warm enough to
/// survive the first pager pass.
pub const INITIAL_FREQ_COUNTER: u8 = 64;
/// Coldest NRU value.
pub const MAX_NRU: u8 = 3;
/// NRU assigned to freshly stored values.
pub const INITIAL_NRU: u8 = 2;

/// Fixed per-entry overhead charged to memory accounting, covering the
/// struct itself plus chain bookkeeping.
pub const PER_ENTRY_OVERHEAD: usize = 120;

/// A stored value: the in-memory representation of one key.
#[derive(Debug, Clone)]
pub struct StoredValue {
    key: DocKey,
    value: Option<Bytes>,
    cas: Cas,
    rev_seqno: u64,
    by_seqno: i64,
    flags: u32,
    exptime: u32,
    /// Lock expiry while the value is alive; deletion time once deleted.
    lock_or_delete_time: u32,
    datatype: u8,
    freq_counter: u8,
    nru: u8,
    dirty: bool,
    deleted: bool,
    resident: bool,
    stale: bool,
    new_cache_item: bool,
}

impl StoredValue {
    /// Creates a resident, dirty entry from a caller item.
    pub fn from_item(item: &Item) -> Self {
        Self {
            key: item.key.clone(),
            value: if item.deleted && item.value.is_empty() {
                None
            } else {
                Some(item.value.clone())
            },
            cas: item.cas,
            rev_seqno: item.rev_seqno,
            by_seqno: SEQNO_PENDING,
            flags: item.flags,
            exptime: item.exptime,
            lock_or_delete_time: 0,
            datatype: item.datatype,
            freq_counter: INITIAL_FREQ_COUNTER,
            nru: INITIAL_NRU,
            dirty: true,
            deleted: item.deleted,
            resident: true,
            stale: false,
            new_cache_item: true,
        }
    }

    /// Creates a temp placeholder with one of the temp sentinels.
    pub fn new_temp(key: DocKey, sentinel: i64) -> Self {
        debug_assert!(matches!(
            sentinel,
            SEQNO_TEMP_INITIAL | SEQNO_TEMP_DELETED | SEQNO_TEMP_NON_EXISTENT
        ));
        Self {
            key,
            value: None,
            cas: 0,
            rev_seqno: 0,
            by_seqno: sentinel,
            flags: 0,
            exptime: 0,
            lock_or_delete_time: 0,
            datatype: 0,
            freq_counter: INITIAL_FREQ_COUNTER,
            nru: INITIAL_NRU,
            dirty: false,
            deleted: sentinel == SEQNO_TEMP_DELETED,
            resident: false,
            stale: false,
            new_cache_item: true,
        }
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn cas(&self) -> Cas {
        self.cas
    }

    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    pub fn by_seqno(&self) -> i64 {
        self.by_seqno
    }

    /// Records the seqno assigned by the checkpoint manager.
    pub fn set_by_seqno(&mut self, seqno: u64) {
        self.by_seqno = seqno as i64;
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    /// Updates the expiry deadline (`get_and_update_ttl`).
    pub fn set_exptime(&mut self, exptime: u32) {
        self.exptime = exptime;
    }

    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Called when the flusher has persisted this value.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
        self.new_cache_item = false;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_resident(&self) -> bool {
        self.resident
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn is_new_cache_item(&self) -> bool {
        self.new_cache_item
    }

    /// Any of the three temp sentinels.
    pub fn is_temp_item(&self) -> bool {
        matches!(
            self.by_seqno,
            SEQNO_TEMP_INITIAL | SEQNO_TEMP_DELETED | SEQNO_TEMP_NON_EXISTENT
        )
    }

    pub fn is_temp_initial(&self) -> bool {
        self.by_seqno == SEQNO_TEMP_INITIAL
    }

    pub fn is_temp_deleted(&self) -> bool {
        self.by_seqno == SEQNO_TEMP_DELETED
    }

    pub fn is_temp_non_existent(&self) -> bool {
        self.by_seqno == SEQNO_TEMP_NON_EXISTENT
    }

    /// True when the expiry deadline has passed.
    pub fn is_expired(&self, now: u32) -> bool {
        !self.deleted && self.exptime != 0 && self.exptime < now
    }

    /// True while a CAS lock is held and unexpired.
    pub fn is_locked(&self, now: u32) -> bool {
        !self.deleted && self.lock_or_delete_time != 0 && now < self.lock_or_delete_time
    }

    /// Takes a CAS lock until `until` and stamps the new CAS.
    pub fn lock(&mut self, until: u32, new_cas: Cas) {
        self.lock_or_delete_time = until;
        self.cas = new_cas;
    }

    /// Drops any CAS lock.
    pub fn unlock(&mut self) {
        if !self.deleted {
            self.lock_or_delete_time = 0;
        }
    }

    /// Deletion timestamp for a tombstone; zero otherwise.
    pub fn delete_time(&self) -> u32 {
        if self.deleted {
            self.lock_or_delete_time
        } else {
            0
        }
    }

    /// 8-bit access frequency counter.
    pub fn freq_counter(&self) -> u8 {
        self.freq_counter
    }

    pub fn set_freq_counter(&mut self, value: u8) {
        self.freq_counter = value;
    }

    /// 2-bit NRU value (0 hottest, 3 coldest).
    pub fn nru(&self) -> u8 {
        self.nru
    }

    pub fn set_nru(&mut self, nru: u8) {
        self.nru = nru.min(MAX_NRU);
    }

    /// NRU derived from the frequency counter, for stats output.
    pub fn reported_nru(&self) -> u8 {
        freq_to_nru(self.freq_counter)
    }

    /// Marks a read access: warms both reference trackers.
    pub fn record_access(&mut self, incremented_freq: u8) {
        self.freq_counter = incremented_freq;
        self.nru = self.nru.saturating_sub(1);
        self.new_cache_item = false;
    }

    /// Overwrites this entry from `item`, keeping the slot. The caller
    /// decides CAS and revision beforehand.
    pub fn apply_item(&mut self, item: &Item, delete_time: u32) {
        self.value = if item.deleted && item.value.is_empty() {
            None
        } else {
            Some(item.value.clone())
        };
        self.cas = item.cas;
        self.rev_seqno = item.rev_seqno;
        self.flags = item.flags;
        self.exptime = item.exptime;
        self.datatype = item.datatype;
        self.deleted = item.deleted;
        self.lock_or_delete_time = if item.deleted { delete_time } else { 0 };
        self.by_seqno = SEQNO_PENDING;
        self.dirty = true;
        self.resident = true;
        self.stale = false;
    }

    /// Soft delete in place: drops the body (or retains a pruned xattr
    /// blob), flips the tombstone bit, stamps the deletion time.
    pub fn delete_in_place(&mut self, preserved_value: Option<Bytes>, datatype: u8, delete_time: u32) {
        self.value = preserved_value;
        self.datatype = datatype;
        self.deleted = true;
        self.lock_or_delete_time = delete_time;
        self.by_seqno = SEQNO_PENDING;
        self.dirty = true;
        self.resident = true;
    }

    /// Stamps CAS and revision (engine-generated path).
    pub fn set_version(&mut self, cas: Cas, rev_seqno: u64) {
        self.cas = cas;
        self.rev_seqno = rev_seqno;
    }

    /// Ejects the body, keeping metadata. Only legal for clean, resident,
    /// unlocked live values; callers check eligibility.
    pub fn eject_value(&mut self) {
        self.value = None;
        self.resident = false;
    }

    /// Restores a fully fetched value into a temp-initial slot.
    pub fn restore(&mut self, item: &Item) {
        self.value = Some(item.value.clone());
        self.cas = item.cas;
        self.rev_seqno = item.rev_seqno;
        self.by_seqno = item.by_seqno as i64;
        self.flags = item.flags;
        self.exptime = item.exptime;
        self.datatype = item.datatype;
        self.deleted = item.deleted;
        self.dirty = false;
        self.resident = true;
    }

    /// Converts a temp-initial slot after a negative disk probe.
    pub fn convert_to_temp(&mut self, sentinel: i64) {
        debug_assert!(matches!(
            sentinel,
            SEQNO_TEMP_DELETED | SEQNO_TEMP_NON_EXISTENT
        ));
        self.value = None;
        self.by_seqno = sentinel;
        self.deleted = sentinel == SEQNO_TEMP_DELETED;
        self.resident = false;
        self.dirty = false;
    }

    /// Approximate heap footprint, charged to memory accounting.
    pub fn footprint(&self) -> usize {
        PER_ENTRY_OVERHEAD
            + self.key.footprint()
            + self.value.as_ref().map(Bytes::len).unwrap_or(0)
    }

    /// Metadata view.
    pub fn meta(&self) -> ItemMeta {
        ItemMeta {
            cas: self.cas,
            rev_seqno: self.rev_seqno,
            flags: self.flags,
            exptime: self.exptime,
            deleted: self.deleted,
            datatype: self.datatype,
        }
    }

    /// Full item copy; `None` when the body is not resident.
    pub fn to_item(&self) -> Option<Item> {
        if !self.resident && !self.deleted {
            return None;
        }
        Some(Item {
            key: self.key.clone(),
            value: self.value.clone().unwrap_or_default(),
            flags: self.flags,
            exptime: self.exptime,
            datatype: self.datatype,
            cas: self.cas,
            rev_seqno: self.rev_seqno,
            by_seqno: self.by_seqno.max(0) as u64,
            deleted: self.deleted,
        })
    }
}
