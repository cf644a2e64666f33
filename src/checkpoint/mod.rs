//! Per-vbucket checkpoint manager.
//!
//! Mutations are appended to an ordered list of checkpoints; persistence
//! and replication consume them through named cursors. Seqnos observed in
//! the log are strictly monotonic. Closed checkpoints with no cursor
//! inside them can be reclaimed, which is the item pager's cheapest source
//! of memory.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::engine::memory::MemoryTracker;
use crate::types::{Cas, DocKey, Vbid};

/// Name of the cursor owned by the (external) flusher.
pub const PERSISTENCE_CURSOR: &str = "persistence";

const ITEM_OVERHEAD: usize = 64;

/// Whether `queue_dirty` assigns the next seqno or trusts the caller's
/// (replica streams apply remote seqnos verbatim).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GenerateBySeqno {
    Yes,
    No,
}

/// Operation carried by a queued item.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum QueueOp {
    /// Store or update of a live value.
    Mutation,
    /// Tombstone write.
    Delete,
    /// Collection lifecycle event; payload holds the manifest blob.
    SystemEvent,
    /// Slot superseded by dedup; skipped by cursors.
    Empty,
}

/// One entry in a checkpoint.
#[derive(Clone, Debug)]
pub struct QueuedItem {
    pub op: QueueOp,
    pub key: Option<DocKey>,
    pub by_seqno: u64,
    pub cas: Cas,
    /// System-event payload; `None` for document entries.
    pub payload: Option<Bytes>,
}

impl QueuedItem {
    fn footprint(&self) -> usize {
        ITEM_OVERHEAD
            + self.key.as_ref().map(DocKey::footprint).unwrap_or(0)
            + self.payload.as_ref().map(Bytes::len).unwrap_or(0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CheckpointState {
    Open,
    Closed,
}

struct Checkpoint {
    id: u64,
    snap_start: u64,
    snap_end: u64,
    state: CheckpointState,
    items: Vec<QueuedItem>,
    key_index: FxHashMap<DocKey, usize>,
    num_live_items: usize,
    mem_bytes: usize,
}

impl Checkpoint {
    fn new(id: u64, snap_start: u64) -> Self {
        Self {
            id,
            snap_start,
            snap_end: snap_start,
            state: CheckpointState::Open,
            items: Vec::new(),
            key_index: FxHashMap::default(),
            num_live_items: 0,
            mem_bytes: 0,
        }
    }
}

/// Cursor position: checkpoint id plus index of the next unread item.
#[derive(Clone, Debug)]
struct Cursor {
    ckpt_id: u64,
    item_idx: usize,
}

/// Stats snapshot rendered by the `checkpoint` admin command.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointStats {
    pub num_checkpoints: usize,
    pub open_checkpoint_id: u64,
    pub num_open_checkpoint_items: usize,
    pub high_seqno: u64,
    pub mem_bytes: usize,
    pub num_items_deduped: u64,
    pub num_checkpoints_removed: u64,
}

/// The ordered sequence of checkpoints for one vbucket.
pub struct CheckpointManager {
    vbid: Vbid,
    checkpoints: VecDeque<Checkpoint>,
    next_ckpt_id: u64,
    high_seqno: u64,
    cursors: FxHashMap<String, Cursor>,
    max_items_per_checkpoint: usize,
    memory: Arc<MemoryTracker>,
    num_items_deduped: u64,
    num_checkpoints_removed: u64,
}

impl CheckpointManager {
    /// Opens checkpoint 1 starting after `start_seqno`.
    pub fn new(
        vbid: Vbid,
        start_seqno: u64,
        max_items_per_checkpoint: usize,
        memory: Arc<MemoryTracker>,
    ) -> Self {
        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(Checkpoint::new(1, start_seqno + 1));
        Self {
            vbid,
            checkpoints,
            next_ckpt_id: 2,
            high_seqno: start_seqno,
            cursors: FxHashMap::default(),
            max_items_per_checkpoint: max_items_per_checkpoint.max(2),
            memory,
            num_items_deduped: 0,
            num_checkpoints_removed: 0,
        }
    }

    fn open_checkpoint_mut(&mut self) -> &mut Checkpoint {
        self.checkpoints
            .back_mut()
            .expect("manager always holds an open checkpoint")
    }

    /// Id of the open checkpoint.
    pub fn get_open_checkpoint_id(&self) -> u64 {
        self.checkpoints
            .back()
            .expect("manager always holds an open checkpoint")
            .id
    }

    /// Highest seqno assigned so far.
    pub fn high_seqno(&self) -> u64 {
        self.high_seqno
    }

    /// Number of checkpoints currently held.
    pub fn num_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Bytes attributed to queued items across all checkpoints.
    pub fn mem_used(&self) -> usize {
        self.checkpoints.iter().map(|c| c.mem_bytes).sum()
    }

    fn maybe_rotate_open_checkpoint(&mut self) {
        if self.open_checkpoint_mut().num_live_items >= self.max_items_per_checkpoint {
            self.create_new_checkpoint();
        }
    }

    /// Closes the open checkpoint and opens a fresh one, returning the
    /// new open checkpoint id. A no-op if the open checkpoint is empty.
    pub fn create_new_checkpoint(&mut self) -> u64 {
        if self.open_checkpoint_mut().num_live_items == 0 {
            return self.get_open_checkpoint_id();
        }
        let id = self.next_ckpt_id;
        self.next_ckpt_id += 1;
        self.open_checkpoint_mut().state = CheckpointState::Closed;
        let snap_start = self.high_seqno + 1;
        self.checkpoints.push_back(Checkpoint::new(id, snap_start));
        tracing::debug!(vbid = %self.vbid, checkpoint_id = id, "opened new checkpoint");
        id
    }

    /// Appends a document entry and returns its assigned seqno.
    ///
    /// Within the open checkpoint a previous entry for the same key is
    /// superseded in place when no cursor has read past it; the new entry
    /// still consumes a fresh seqno, so seqnos stay strictly monotonic.
    /// `pre_link` runs after seqno assignment, before the entry becomes
    /// visible to cursors.
    pub fn queue_dirty(
        &mut self,
        key: DocKey,
        op: QueueOp,
        cas: Cas,
        generate: GenerateBySeqno,
        provided_seqno: u64,
        mut pre_link: Option<&mut dyn FnMut(u64)>,
    ) -> u64 {
        debug_assert!(matches!(op, QueueOp::Mutation | QueueOp::Delete));
        self.maybe_rotate_open_checkpoint();
        let seqno = match generate {
            GenerateBySeqno::Yes => self.high_seqno + 1,
            GenerateBySeqno::No => {
                assert!(
                    provided_seqno > self.high_seqno,
                    "{}: backfill seqno {} must exceed high seqno {}",
                    self.vbid,
                    provided_seqno,
                    self.high_seqno
                );
                provided_seqno
            }
        };
        if let Some(hook) = pre_link.as_mut() {
            hook(seqno);
        }

        let open_id = self.get_open_checkpoint_id();
        let dedup_idx = {
            let open = self.checkpoints.back().unwrap();
            open.key_index.get(&key).copied().filter(|&idx| {
                // Dedup only when nobody inside this checkpoint already
                // consumed the superseded entry.
                self.cursors
                    .values()
                    .all(|c| c.ckpt_id != open_id || c.item_idx <= idx)
            })
        };

        let item = QueuedItem {
            op,
            key: Some(key.clone()),
            by_seqno: seqno,
            cas,
            payload: None,
        };
        let footprint = item.footprint();
        let mut deduped_bytes = 0;
        {
            let open = self
                .checkpoints
                .back_mut()
                .expect("manager always holds an open checkpoint");
            if let Some(idx) = dedup_idx {
                let old = &mut open.items[idx];
                let freed = old.footprint();
                old.op = QueueOp::Empty;
                old.key = None;
                old.payload = None;
                open.num_live_items -= 1;
                open.mem_bytes -= freed - ITEM_OVERHEAD;
                deduped_bytes = freed - ITEM_OVERHEAD;
            }
            let idx = open.items.len();
            open.items.push(item);
            open.key_index.insert(key, idx);
            open.num_live_items += 1;
            open.mem_bytes += footprint;
            open.snap_end = seqno;
        }
        if deduped_bytes > 0 {
            self.num_items_deduped += 1;
            self.memory.debit(deduped_bytes);
        }
        self.memory.credit(footprint);
        self.high_seqno = seqno;
        seqno
    }

    /// Appends a system event (collection lifecycle) entry; never
    /// deduplicated.
    pub fn queue_system_event(&mut self, key: Option<DocKey>, payload: Bytes, cas: Cas) -> u64 {
        self.maybe_rotate_open_checkpoint();
        let seqno = self.high_seqno + 1;
        let item = QueuedItem {
            op: QueueOp::SystemEvent,
            key,
            by_seqno: seqno,
            cas,
            payload: Some(payload),
        };
        let footprint = item.footprint();
        {
            let open = self
                .checkpoints
                .back_mut()
                .expect("manager always holds an open checkpoint");
            let idx = open.items.len();
            if let Some(k) = item.key.clone() {
                open.key_index.insert(k, idx);
            }
            open.items.push(item);
            open.num_live_items += 1;
            open.mem_bytes += footprint;
            open.snap_end = seqno;
        }
        self.memory.credit(footprint);
        self.high_seqno = seqno;
        seqno
    }

    /// Registers a cursor at the start of the oldest retained checkpoint.
    pub fn register_cursor(&mut self, name: &str) {
        let front = self.checkpoints.front().expect("non-empty");
        self.cursors.insert(
            name.to_owned(),
            Cursor {
                ckpt_id: front.id,
                item_idx: 0,
            },
        );
    }

    /// Removes a cursor, releasing its hold on closed checkpoints.
    pub fn remove_cursor(&mut self, name: &str) {
        self.cursors.remove(name);
    }

    /// Drains up to `limit` unread items for `name`, advancing it across
    /// checkpoint boundaries.
    pub fn next_items_for_cursor(&mut self, name: &str, limit: usize) -> Vec<QueuedItem> {
        let Some(mut cursor) = self.cursors.get(name).cloned() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        'outer: for ckpt in &self.checkpoints {
            if ckpt.id < cursor.ckpt_id {
                continue;
            }
            if ckpt.id > cursor.ckpt_id {
                cursor.ckpt_id = ckpt.id;
                cursor.item_idx = 0;
            }
            while cursor.item_idx < ckpt.items.len() {
                let item = &ckpt.items[cursor.item_idx];
                cursor.item_idx += 1;
                if item.op != QueueOp::Empty {
                    out.push(item.clone());
                    if out.len() >= limit {
                        break 'outer;
                    }
                }
            }
        }
        self.cursors.insert(name.to_owned(), cursor);
        out
    }

    /// Seqno of the last item consumed by `name`, if the cursor exists
    /// and has consumed anything in its current checkpoint.
    pub fn cursor_checkpoint_id(&self, name: &str) -> Option<u64> {
        self.cursors.get(name).map(|c| c.ckpt_id)
    }

    /// Reclaims closed checkpoints that no cursor still references.
    ///
    /// Returns the number of queued items released and whether the open
    /// checkpoint was rotated because it had grown past the item cap.
    pub fn remove_closed_unref_checkpoints(&mut self) -> (usize, bool) {
        let rotated = if self.open_checkpoint_mut().num_live_items >= self.max_items_per_checkpoint
        {
            self.create_new_checkpoint();
            true
        } else {
            false
        };

        let mut removed_items = 0;
        while self.checkpoints.len() > 1 {
            let front = self.checkpoints.front().expect("non-empty");
            if front.state != CheckpointState::Closed {
                break;
            }
            let id = front.id;
            if self.cursors.values().any(|c| c.ckpt_id <= id) {
                break;
            }
            let ckpt = self.checkpoints.pop_front().unwrap();
            removed_items += ckpt.num_live_items;
            self.memory.debit(ckpt.mem_bytes);
            self.num_checkpoints_removed += 1;
            tracing::debug!(
                vbid = %self.vbid,
                checkpoint_id = ckpt.id,
                items = ckpt.num_live_items,
                "reclaimed closed checkpoint"
            );
        }
        (removed_items, rotated)
    }

    /// Snapshot bounds of the open checkpoint, for the persisted state
    /// record.
    pub fn snapshot_range(&self) -> (u64, u64) {
        let open = self.checkpoints.back().expect("non-empty");
        (open.snap_start, open.snap_end)
    }

    /// Stats snapshot.
    pub fn stats(&self) -> CheckpointStats {
        let open = self.checkpoints.back().expect("non-empty");
        CheckpointStats {
            num_checkpoints: self.checkpoints.len(),
            open_checkpoint_id: open.id,
            num_open_checkpoint_items: open.num_live_items,
            high_seqno: self.high_seqno,
            mem_bytes: self.mem_used(),
            num_items_deduped: self.num_items_deduped,
            num_checkpoints_removed: self.num_checkpoints_removed,
        }
    }
}
