//! Per-vbucket collections manifest.
//!
//! Tracks the lifecycle of logical collections: open entries accept
//! writes, deleting entries (end seqno recorded, disk purge outstanding)
//! gate replayed items through the logical-deletion check, and completed
//! deletions vanish from the map. The bucket-level [`Manifest`] is the
//! declared desired state; the vbucket applies diffs against it.

use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::hash as crc32;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::{CollectionId, DocKey, ManifestUid};

/// End seqno marking an entry as open.
pub const END_SEQNO_OPEN: u64 = u64::MAX;

/// Key under which collection system events are queued; the collection
/// field carries the changed collection id.
pub fn system_event_key(cid: CollectionId) -> DocKey {
    DocKey::new(cid, Bytes::from_static(b"_collection"))
}

/// One collection's lifecycle window within a vbucket.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Seqno of the begin event that opened the collection.
    #[serde(rename = "startSeqno")]
    pub start_seqno: u64,
    /// Seqno of the end event, or [`END_SEQNO_OPEN`] while open.
    #[serde(rename = "endSeqno")]
    pub end_seqno: u64,
}

impl ManifestEntry {
    /// True while the collection accepts writes.
    pub fn is_open(&self) -> bool {
        self.end_seqno == END_SEQNO_OPEN
    }
}

/// Bucket-level manifest declaration: the input to `update`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    /// Monotone revision of the declaration.
    pub uid: ManifestUid,
    /// Declared collections.
    pub collections: Vec<ManifestCollection>,
}

/// One declared collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestCollection {
    /// Human-readable name.
    pub name: String,
    /// Collection id.
    pub uid: CollectionId,
}

impl Manifest {
    /// The implicit initial manifest: just the default collection.
    pub fn initial() -> Self {
        Self {
            uid: ManifestUid(0),
            collections: vec![ManifestCollection {
                name: "_default".to_owned(),
                uid: CollectionId::DEFAULT,
            }],
        }
    }

    /// Parses a declaration from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serializes the declaration.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn contains(&self, cid: CollectionId) -> bool {
        self.collections.iter().any(|c| c.uid == cid)
    }
}

/// Additions and deletions required to move to a new declaration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestChanges {
    pub additions: Vec<CollectionId>,
    pub deletions: Vec<CollectionId>,
}

impl ManifestChanges {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }
}

/// Persisted JSON shape of the per-vbucket manifest.
#[derive(Serialize, Deserialize)]
struct PersistedManifest {
    uid: ManifestUid,
    collections: Vec<PersistedEntry>,
}

#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    uid: CollectionId,
    #[serde(flatten)]
    entry: ManifestEntry,
}

/// The per-vbucket manifest state.
#[derive(Debug, Clone)]
pub struct VbucketManifest {
    uid: ManifestUid,
    entries: FxHashMap<CollectionId, ManifestEntry>,
    greatest_end_seqno: u64,
    n_deleting: usize,
    default_exists: bool,
}

impl VbucketManifest {
    /// A fresh manifest holding the open default collection.
    pub fn new() -> Self {
        let mut entries = FxHashMap::default();
        entries.insert(
            CollectionId::DEFAULT,
            ManifestEntry {
                start_seqno: 0,
                end_seqno: END_SEQNO_OPEN,
            },
        );
        Self {
            uid: ManifestUid(0),
            entries,
            greatest_end_seqno: END_SEQNO_OPEN,
            n_deleting: 0,
            default_exists: true,
        }
    }

    /// Current manifest uid.
    pub fn uid(&self) -> ManifestUid {
        self.uid
    }

    /// Records the uid after an update has fully applied.
    pub fn set_uid(&mut self, uid: ManifestUid) {
        debug_assert!(uid.0 >= self.uid.0, "manifest uid must be monotone");
        self.uid = uid;
    }

    /// Largest end seqno across deleting entries, or the open sentinel
    /// when nothing is deleting.
    pub fn greatest_end_seqno(&self) -> u64 {
        self.greatest_end_seqno
    }

    /// Number of collections with an outstanding deletion.
    pub fn n_deleting(&self) -> usize {
        self.n_deleting
    }

    /// Whether the default collection is open.
    pub fn default_collection_exists(&self) -> bool {
        self.default_exists
    }

    /// Entry for `cid`, if retained.
    pub fn entry(&self, cid: CollectionId) -> Option<&ManifestEntry> {
        self.entries.get(&cid)
    }

    /// Open collections, unordered.
    pub fn open_collections(&self) -> impl Iterator<Item = CollectionId> + '_ {
        self.entries
            .iter()
            .filter(|(_, e)| e.is_open())
            .map(|(&cid, _)| cid)
    }

    /// Diffs the currently open set against a new declaration.
    ///
    /// An addition that targets a collection still in deleting state
    /// fails the whole update.
    pub fn compute_changes(&self, new: &Manifest) -> Result<ManifestChanges> {
        if new.uid.0 < self.uid.0 {
            return Err(EngineError::InvalidArgument(format!(
                "manifest uid {} regresses current {}",
                new.uid, self.uid
            )));
        }
        let mut changes = ManifestChanges::default();
        for declared in &new.collections {
            match self.entries.get(&declared.uid) {
                None => changes.additions.push(declared.uid),
                Some(entry) if entry.is_open() => {}
                Some(_) => {
                    return Err(EngineError::InvalidArgument(format!(
                        "collection {} is still being deleted",
                        declared.uid
                    )));
                }
            }
        }
        for (&cid, entry) in &self.entries {
            if entry.is_open() && !new.contains(cid) {
                changes.deletions.push(cid);
            }
        }
        changes.additions.sort_unstable();
        changes.deletions.sort_unstable();
        Ok(changes)
    }

    /// Opens a collection whose begin event landed at `start_seqno`.
    pub fn add_collection(&mut self, cid: CollectionId, start_seqno: u64) {
        debug_assert!(!self.entries.contains_key(&cid));
        self.entries.insert(
            cid,
            ManifestEntry {
                start_seqno,
                end_seqno: END_SEQNO_OPEN,
            },
        );
        if cid == CollectionId::DEFAULT {
            self.default_exists = true;
        }
    }

    /// Moves an open collection into deleting state; `end_seqno` is the
    /// seqno of its end event.
    pub fn begin_collection_delete(&mut self, cid: CollectionId, end_seqno: u64) {
        let entry = self
            .entries
            .get_mut(&cid)
            .expect("deleting an unknown collection");
        assert!(entry.is_open(), "collection {cid} already deleting");
        entry.end_seqno = end_seqno;
        self.n_deleting += 1;
        if self.greatest_end_seqno == END_SEQNO_OPEN || end_seqno > self.greatest_end_seqno {
            self.greatest_end_seqno = end_seqno;
        }
        if cid == CollectionId::DEFAULT {
            self.default_exists = false;
        }
    }

    /// Finishes a deletion once the flusher persisted the end event:
    /// drops the entry and, when nothing is left deleting, resets the
    /// greatest end seqno to the open sentinel.
    pub fn complete_deletion(&mut self, cid: CollectionId) -> Result<()> {
        match self.entries.get(&cid) {
            Some(entry) if !entry.is_open() => {
                self.entries.remove(&cid);
                self.n_deleting -= 1;
                if self.n_deleting == 0 {
                    self.greatest_end_seqno = END_SEQNO_OPEN;
                }
                Ok(())
            }
            Some(_) => Err(EngineError::InvalidArgument(format!(
                "collection {cid} is not being deleted"
            ))),
            None => Err(EngineError::NotFound("collection")),
        }
    }

    /// True when `key` maps to an open collection.
    pub fn does_key_contain_valid_collection(&self, key: &DocKey) -> bool {
        if key.collection == CollectionId::DEFAULT {
            return self.default_exists;
        }
        self.entries
            .get(&key.collection)
            .is_some_and(ManifestEntry::is_open)
    }

    /// Hot-path gate for replayed items: is the document at `seqno`
    /// logically deleted?
    ///
    /// A key of a collection in deleting state is dead regardless of its
    /// seqno until `complete_deletion` purges the entry; a key of an open
    /// collection is dead only when it predates the current generation's
    /// begin event.
    pub fn is_logically_deleted(&self, key: &DocKey, seqno: u64) -> bool {
        match self.entries.get(&key.collection) {
            None => false,
            Some(entry) if entry.is_open() => seqno < entry.start_seqno,
            Some(_) => true,
        }
    }

    /// Serializes the manifest for the persisted vbucket state record.
    pub fn to_json(&self) -> Result<String> {
        let mut collections: Vec<PersistedEntry> = self
            .entries
            .iter()
            .map(|(&uid, &entry)| PersistedEntry { uid, entry })
            .collect();
        collections.sort_by_key(|e| e.uid);
        Ok(serde_json::to_string(&PersistedManifest {
            uid: self.uid,
            collections,
        })?)
    }

    /// Rebuilds a manifest from its persisted JSON, recomputing the
    /// derived fields.
    pub fn from_json(json: &str) -> Result<Self> {
        let persisted: PersistedManifest = serde_json::from_str(json)?;
        let mut entries = FxHashMap::default();
        let mut greatest = END_SEQNO_OPEN;
        let mut n_deleting = 0;
        for e in persisted.collections {
            if !e.entry.is_open() {
                n_deleting += 1;
                if greatest == END_SEQNO_OPEN || e.entry.end_seqno > greatest {
                    greatest = e.entry.end_seqno;
                }
            }
            entries.insert(e.uid, e.entry);
        }
        let default_exists = entries
            .get(&CollectionId::DEFAULT)
            .is_some_and(ManifestEntry::is_open);
        Ok(Self {
            uid: persisted.uid,
            entries,
            greatest_end_seqno: greatest,
            n_deleting,
            default_exists,
        })
    }

    /// Binary blob attached to a collection system event: the carried
    /// uid, every retained entry, a trailing copy of the just-changed
    /// entry, and a crc32 trailer.
    pub fn encode_event_blob(&self, changed: CollectionId, carried_uid: ManifestUid) -> Bytes {
        let changed_entry = self
            .entries
            .get(&changed)
            .copied()
            .unwrap_or(ManifestEntry {
                start_seqno: 0,
                end_seqno: 0,
            });
        let mut sorted: Vec<(CollectionId, ManifestEntry)> =
            self.entries.iter().map(|(&c, &e)| (c, e)).collect();
        sorted.sort_by_key(|(c, _)| *c);

        let mut buf = BytesMut::new();
        buf.put_u64(carried_uid.0);
        buf.put_u32(sorted.len() as u32);
        for (cid, entry) in &sorted {
            buf.put_u32(cid.0);
            buf.put_u64(entry.start_seqno);
            buf.put_u64(entry.end_seqno);
        }
        buf.put_u32(changed.0);
        buf.put_u64(changed_entry.start_seqno);
        buf.put_u64(changed_entry.end_seqno);
        let crc = crc32(&buf);
        buf.put_u32(crc);
        buf.freeze()
    }

    /// Decodes a system event blob back into `(uid, entries, changed)`.
    pub fn decode_event_blob(
        blob: &[u8],
    ) -> Result<(
        ManifestUid,
        Vec<(CollectionId, ManifestEntry)>,
        (CollectionId, ManifestEntry),
    )> {
        struct Reader<'a> {
            buf: &'a [u8],
        }
        impl<'a> Reader<'a> {
            fn take(&mut self, n: usize) -> Result<&'a [u8]> {
                if self.buf.len() < n {
                    return Err(EngineError::Serialization(
                        "collection event blob truncated".into(),
                    ));
                }
                let (head, rest) = self.buf.split_at(n);
                self.buf = rest;
                Ok(head)
            }
            fn read_u32(&mut self) -> Result<u32> {
                Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
            }
            fn read_u64(&mut self) -> Result<u64> {
                Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
            }
        }

        if blob.len() < 4 {
            return Err(EngineError::Serialization(
                "collection event blob truncated".into(),
            ));
        }
        let (payload, trailer) = blob.split_at(blob.len() - 4);
        let stored = u32::from_be_bytes(trailer.try_into().expect("four bytes"));
        if crc32(payload) != stored {
            return Err(EngineError::Serialization(
                "collection event blob crc mismatch".into(),
            ));
        }
        let mut reader = Reader { buf: payload };
        let uid = ManifestUid(reader.read_u64()?);
        let count = reader.read_u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let cid = CollectionId(reader.read_u32()?);
            let start_seqno = reader.read_u64()?;
            let end_seqno = reader.read_u64()?;
            entries.push((
                cid,
                ManifestEntry {
                    start_seqno,
                    end_seqno,
                },
            ));
        }
        let cid = CollectionId(reader.read_u32()?);
        let start_seqno = reader.read_u64()?;
        let end_seqno = reader.read_u64()?;
        Ok((
            uid,
            entries,
            (
                cid,
                ManifestEntry {
                    start_seqno,
                    end_seqno,
                },
            ),
        ))
    }
}

impl Default for VbucketManifest {
    fn default() -> Self {
        Self::new()
    }
}
