//! Per-vbucket failover table.
//!
//! Each entry pairs a randomly generated vbucket UUID with the high seqno
//! at the moment the entry was created (a takeover or state change to
//! active). Replication consumers use the table to find a safe rollback
//! point after a failover.

use std::collections::VecDeque;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;

const MAX_ENTRIES: usize = 25;

/// One failover log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    /// Random UUID identifying this vbucket incarnation.
    pub id: u64,
    /// High seqno at entry creation.
    pub seq: u64,
}

/// Ordered failover log, newest entry first.
#[derive(Debug, Clone)]
pub struct FailoverTable {
    entries: VecDeque<FailoverEntry>,
}

impl FailoverTable {
    /// Creates a table with a single fresh entry at seqno 0.
    pub fn new() -> Self {
        let mut table = Self {
            entries: VecDeque::new(),
        };
        table.create_entry(0);
        table
    }

    /// Rebuilds a table from persisted JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<FailoverEntry> = serde_json::from_str(json)?;
        Ok(Self {
            entries: entries.into(),
        })
    }

    /// Serializes the table for the persisted vbucket state record.
    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<FailoverEntry> = self.entries.iter().copied().collect();
        Ok(serde_json::to_string(&entries)?)
    }

    /// Pushes a new incarnation entry at `high_seqno`, trimming the tail.
    pub fn create_entry(&mut self, high_seqno: u64) {
        // Entries past the new rollback point are superseded.
        while let Some(front) = self.entries.front() {
            if front.seq > high_seqno {
                self.entries.pop_front();
            } else {
                break;
            }
        }
        let id = rand::thread_rng().gen::<u64>() | 1;
        self.entries.push_front(FailoverEntry { id, seq: high_seqno });
        while self.entries.len() > MAX_ENTRIES {
            self.entries.pop_back();
        }
    }

    /// Most recent entry.
    pub fn latest_entry(&self) -> FailoverEntry {
        *self.entries.front().expect("failover table never empty")
    }

    /// Current vbucket UUID.
    pub fn latest_uuid(&self) -> u64 {
        self.latest_entry().id
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: the table retains at least one entry.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates entries newest first.
    pub fn entries(&self) -> impl Iterator<Item = &FailoverEntry> {
        self.entries.iter()
    }
}

impl Default for FailoverTable {
    fn default() -> Self {
        Self::new()
    }
}
