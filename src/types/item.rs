//! Caller-facing document representation moved through the mutation paths.

use bytes::Bytes;

use super::{datatype, Cas, DocKey};

/// Metadata of a stored document, as returned by `get_meta_data` and as
/// carried by replication (`*_with_meta`) operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemMeta {
    /// Version assigned by the originating node's HLC.
    pub cas: Cas,
    /// Per-key revision, monotone across mutations of the key.
    pub rev_seqno: u64,
    /// Caller-opaque flags stored with the value.
    pub flags: u32,
    /// Absolute expiry time in unix seconds; zero means never.
    pub exptime: u32,
    /// Whether the document is a tombstone.
    pub deleted: bool,
    /// Datatype bitset of the body.
    pub datatype: u8,
}

/// A full document: key, body, and metadata.
#[derive(Clone, Debug)]
pub struct Item {
    /// Qualified key.
    pub key: DocKey,
    /// Value body. Empty for tombstones without preserved xattrs.
    pub value: Bytes,
    /// Caller-opaque flags.
    pub flags: u32,
    /// Absolute expiry time in unix seconds; zero means never.
    pub exptime: u32,
    /// Datatype bitset of `value`.
    pub datatype: u8,
    /// Version; zero until assigned by the engine (or carried by meta ops).
    pub cas: Cas,
    /// Per-key revision; zero until assigned (or carried by meta ops).
    pub rev_seqno: u64,
    /// Sequence number within the owning vbucket; zero until queued.
    pub by_seqno: u64,
    /// Whether this item represents a deletion.
    pub deleted: bool,
}

impl Item {
    /// Builds a plain mutation item with raw datatype and no expiry.
    pub fn new(key: DocKey, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
            flags: 0,
            exptime: 0,
            datatype: datatype::RAW,
            cas: 0,
            rev_seqno: 0,
            by_seqno: 0,
            deleted: false,
        }
    }

    /// Sets the absolute expiry time.
    pub fn with_exptime(mut self, exptime: u32) -> Self {
        self.exptime = exptime;
        self
    }

    /// Sets caller flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the datatype bitset.
    pub fn with_datatype(mut self, dt: u8) -> Self {
        self.datatype = dt;
        self
    }

    /// Attaches external metadata, as carried by `*_with_meta` operations.
    pub fn with_meta(mut self, meta: ItemMeta) -> Self {
        self.cas = meta.cas;
        self.rev_seqno = meta.rev_seqno;
        self.flags = meta.flags;
        self.exptime = meta.exptime;
        self.deleted = meta.deleted;
        self.datatype = meta.datatype;
        self
    }

    /// Marks the item as a deletion.
    pub fn into_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Metadata view of this item.
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
}
