//! # Riptide - VBucket-Partitioned Key/Value Engine Core
//!
//! Riptide is the in-memory core of a distributed document database
//! node: the keyspace is split into a fixed number of virtual buckets
//! (vbuckets), each independently replicated, checkpointed, and evicted.
//!
//! ## Quick Start
//!
//! ```rust
//! use riptide::{DocKey, Engine, EngineConfig, Item, VBucketState, Vbid};
//!
//! let engine = Engine::new(EngineConfig::small())?;
//! engine.set_vbucket_state(Vbid(0), VBucketState::Active)?;
//!
//! let outcome = engine.set(Vbid(0), Item::new(DocKey::in_default("beer"), "ipa"), 0);
//! assert!(outcome.status.is_success());
//!
//! let got = engine.get(Vbid(0), &DocKey::in_default("beer"));
//! assert!(got.status.is_success());
//! # Ok::<(), riptide::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! Riptide is layered around four interlocking subsystems:
//! - **Hash table + stored-value state machine**: striped-lock tables
//!   where every mutation, expiry, lock, and CAS decision is made.
//! - **Durability monitor**: tracks synchronous writes across the
//!   replication chain and commits or times them out.
//! - **Item pager**: frequency-histogram eviction keeping memory between
//!   the configured watermarks.
//! - **Collections manifest**: per-vbucket collection lifecycles and the
//!   logical-deletion gate for replayed items.
//!
//! Persistence, the replication wire protocol, and the front end are
//! external collaborators; riptide exposes the checkpoint, durability,
//! and control-surface interfaces they consume.

pub mod admin;
pub mod bloom;
pub mod checkpoint;
pub mod collections;
pub mod config;
pub mod durability;
pub mod engine;
pub mod error;
pub mod eviction;
pub mod failover;
pub mod hash_table;
pub mod hlc;
pub mod tasks;
pub mod types;
pub mod vbucket;

// Re-export the main public API
pub use crate::config::{ConflictResolutionMode, EngineConfig, EvictionPolicy, PagerAlgorithm};
pub use crate::durability::DurabilityLevel;
pub use crate::engine::Engine;
pub use crate::error::{EngineError, Result, Status};
pub use crate::types::{
    Cas, CollectionId, DocKey, Item, ItemMeta, ManifestUid, VBucketState, Vbid,
};
pub use crate::vbucket::{
    BgFetchResult, DurabilityRequirement, GetValue, MutationOutcome, QueueExpired, VBucket,
};
