//! Core identifier and document types shared across the engine.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod item;

pub use item::{Item, ItemMeta};

/// Identifier of a virtual bucket (partition of the keyspace).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct Vbid(pub u16);

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb_{}", self.0)
    }
}

/// Identifier of a logical collection within the bucket keyspace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct CollectionId(pub u32);

impl CollectionId {
    /// The default collection, which exists from bucket creation.
    pub const DEFAULT: CollectionId = CollectionId(0);
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Monotone identifier of a bucket-level collections manifest revision.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct ManifestUid(pub u64);

impl fmt::Display for ManifestUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Opaque 64-bit version assigned to every stored value by the HLC.
pub type Cas = u64;

/// Document datatype bitset carried alongside every value.
pub mod datatype {
    /// Uninterpreted bytes.
    pub const RAW: u8 = 0x00;
    /// Body is valid JSON.
    pub const JSON: u8 = 0x01;
    /// Body is snappy-compressed.
    pub const SNAPPY: u8 = 0x02;
    /// Body carries a leading extended-attributes blob.
    pub const XATTR: u8 = 0x04;

    /// Returns true when the snappy bit is set.
    pub fn is_snappy(dt: u8) -> bool {
        dt & SNAPPY != 0
    }

    /// Returns true when the xattr bit is set.
    pub fn is_xattr(dt: u8) -> bool {
        dt & XATTR != 0
    }
}

/// Lifecycle state of a vbucket.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VBucketState {
    /// Serving reads and writes; owns expiry and lock semantics.
    Active,
    /// Receiving a replication stream; client locks are overridden.
    Replica,
    /// Mid-takeover; treated like a replica for mutation purposes.
    Pending,
    /// Not serving traffic; awaiting deletion or reassignment.
    Dead,
}

impl VBucketState {
    /// Short textual name used in stats output and persisted records.
    pub fn as_str(&self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document key qualified by the collection it belongs to.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DocKey {
    /// Owning collection.
    pub collection: CollectionId,
    /// Raw key bytes within the collection.
    pub name: Bytes,
}

impl DocKey {
    /// Builds a key in an explicit collection.
    pub fn new(collection: CollectionId, name: impl Into<Bytes>) -> Self {
        Self {
            collection,
            name: name.into(),
        }
    }

    /// Builds a key in the default collection.
    pub fn in_default(name: impl Into<Bytes>) -> Self {
        Self::new(CollectionId::DEFAULT, name)
    }

    /// Approximate heap footprint of the key, used by memory accounting.
    pub fn footprint(&self) -> usize {
        self.name.len() + std::mem::size_of::<CollectionId>()
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DocKey({:#x}:{})",
            self.collection.0,
            String::from_utf8_lossy(&self.name)
        )
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}:{}",
            self.collection.0,
            String::from_utf8_lossy(&self.name)
        )
    }
}
