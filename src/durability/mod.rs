//! Per-vbucket durability monitor.
//!
//! Tracks synchronous writes until the replication chain has acknowledged
//! them at the required level, then commits them in seqno order; writes
//! whose timeout elapses are aborted. Tracked writes live in a
//! seqno-keyed ordered map so node positions can be re-anchored safely
//! across removals; the `End` sentinel is stable by construction.
//!
//! All state is guarded by one monitor lock owned by the vbucket: ack,
//! add, timeout and topology changes are mutually exclusive.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::types::Vbid;

/// Maximum nodes in a replication chain, active included.
pub const MAX_CHAIN_SIZE: usize = 4;

/// Requested durability level of a sync write.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DurabilityLevel {
    /// A majority of the chain holds the write in memory.
    Majority,
    /// Majority in memory and the active has persisted it.
    MajorityAndPersistOnMaster,
    /// A majority of the chain has persisted the write.
    PersistToMajority,
}

/// One tracked synchronous write.
#[derive(Clone, Debug)]
pub struct SyncWrite {
    /// Seqno the prepared write was assigned in the checkpoint.
    pub seqno: u64,
    /// Requested level.
    pub level: DurabilityLevel,
    /// Opaque client token surfaced on resolution.
    pub cookie: u64,
    timeout: Option<Duration>,
    created: Instant,
}

/// Where a node's iterator sits within the tracked sequence.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PositionIter {
    /// No tracked entry at or below the node's write seqno.
    Before,
    /// On the tracked entry with this seqno.
    At(u64),
    /// Past the last tracked entry; stable across removals.
    End,
}

#[derive(Copy, Clone, Debug)]
struct Position {
    iter: PositionIter,
    /// Seqno of the last tracked write this node has covered.
    write_seqno: u64,
    /// Last raw ack seqno received from the node.
    ack_seqno: u64,
}

impl Position {
    fn new() -> Self {
        Self {
            iter: PositionIter::Before,
            write_seqno: 0,
            ack_seqno: 0,
        }
    }
}

#[derive(Clone, Debug)]
struct NodeState {
    name: String,
    memory: Position,
    disk: Position,
}

impl NodeState {
    fn new(name: String) -> Self {
        Self {
            name,
            memory: Position::new(),
            disk: Position::new(),
        }
    }
}

/// Per-node view exposed through stats.
#[derive(Clone, Debug)]
pub struct NodePositions {
    pub name: String,
    pub memory_write_seqno: u64,
    pub memory_ack_seqno: u64,
    pub disk_write_seqno: u64,
    pub disk_ack_seqno: u64,
}

/// Monitor-wide snapshot rendered by the `durability-monitor` command.
#[derive(Clone, Debug, Default)]
pub struct DurabilityStats {
    pub num_tracked: usize,
    pub num_accepted: u64,
    pub num_committed: u64,
    pub num_aborted: u64,
    pub nodes: Vec<NodePositions>,
}

/// The durability monitor of one vbucket.
pub struct DurabilityMonitor {
    vbid: Vbid,
    chain: SmallVec<[NodeState; MAX_CHAIN_SIZE]>,
    tracked: BTreeMap<u64, SyncWrite>,
    last_tracked_seqno: u64,
    num_accepted: u64,
    num_committed: u64,
    num_aborted: u64,
}

impl DurabilityMonitor {
    pub fn new(vbid: Vbid) -> Self {
        Self {
            vbid,
            chain: SmallVec::new(),
            tracked: BTreeMap::new(),
            last_tracked_seqno: 0,
            num_accepted: 0,
            num_committed: 0,
            num_aborted: 0,
        }
    }

    /// Installs or replaces the replication chain. The first node is the
    /// active. Positions of nodes surviving the change are carried over
    /// and re-anchored onto the tracked sequence.
    pub fn set_replication_topology(&mut self, chain: &[&str]) -> Result<()> {
        if chain.is_empty() {
            return Err(EngineError::InvalidArgument(
                "replication chain must not be empty".into(),
            ));
        }
        if chain.len() > MAX_CHAIN_SIZE {
            return Err(EngineError::InvalidArgument(format!(
                "replication chain of {} exceeds the maximum of {MAX_CHAIN_SIZE}",
                chain.len()
            )));
        }
        for (i, name) in chain.iter().enumerate() {
            if chain[..i].contains(name) {
                return Err(EngineError::InvalidArgument(format!(
                    "duplicate node {name} in replication chain"
                )));
            }
        }

        let old: SmallVec<[NodeState; MAX_CHAIN_SIZE]> = std::mem::take(&mut self.chain);
        self.chain = chain
            .iter()
            .map(|&name| {
                old.iter()
                    .find(|n| n.name == name)
                    .cloned()
                    .unwrap_or_else(|| NodeState::new(name.to_owned()))
            })
            .collect();
        for node in &mut self.chain {
            reposition(&self.tracked, &mut node.memory);
            reposition(&self.tracked, &mut node.disk);
        }
        debug!(vbid = %self.vbid, chain = ?chain, "replication topology installed");
        Ok(())
    }

    /// True once a topology has been installed.
    pub fn has_topology(&self) -> bool {
        !self.chain.is_empty()
    }

    /// Number of writes still tracked.
    pub fn num_tracked(&self) -> usize {
        self.tracked.len()
    }

    /// Starts tracking a prepared write.
    ///
    /// Must be called after the write was queued in the checkpoint, so
    /// the active node has implicitly acknowledged its memory position.
    /// Returns writes committed as a side effect (single-node chains
    /// commit Majority writes immediately).
    pub fn add_sync_write(
        &mut self,
        seqno: u64,
        level: DurabilityLevel,
        timeout: Option<Duration>,
        cookie: u64,
        now: Instant,
    ) -> Result<Vec<SyncWrite>> {
        if !self.has_topology() {
            return Err(EngineError::Temporary("replication topology not set"));
        }
        assert!(
            seqno > self.last_tracked_seqno,
            "{}: sync write seqno {} not after last tracked {}",
            self.vbid,
            seqno,
            self.last_tracked_seqno
        );
        self.tracked.insert(
            seqno,
            SyncWrite {
                seqno,
                level,
                cookie,
                timeout,
                created: now,
            },
        );
        self.last_tracked_seqno = seqno;
        self.num_accepted += 1;

        // The active's own memory ack.
        let active = &mut self.chain[0];
        active.memory.iter = PositionIter::At(seqno);
        active.memory.write_seqno = seqno;
        active.memory.ack_seqno = seqno;
        Ok(self.process_commits())
    }

    /// Handles a seqno ack from `node`, returning the writes it commits.
    ///
    /// Per-node acks must be monotonically non-decreasing and satisfy
    /// `mem_seqno >= disk_seqno`; violations are fatal logic errors.
    pub fn seqno_ack_received(
        &mut self,
        node: &str,
        mem_seqno: u64,
        disk_seqno: u64,
    ) -> Result<Vec<SyncWrite>> {
        assert!(
            mem_seqno >= disk_seqno,
            "{}: node {node} acked memory {mem_seqno} below disk {disk_seqno}",
            self.vbid
        );
        let idx = self
            .chain
            .iter()
            .position(|n| n.name == node)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("node {node} not in replication chain"))
            })?;
        {
            let state = &mut self.chain[idx];
            assert!(
                mem_seqno >= state.memory.ack_seqno && disk_seqno >= state.disk.ack_seqno,
                "{}: node {node} ack regressed (mem {} -> {mem_seqno}, disk {} -> {disk_seqno})",
                self.vbid,
                state.memory.ack_seqno,
                state.disk.ack_seqno
            );
            advance(&self.tracked, &mut state.memory, mem_seqno);
            advance(&self.tracked, &mut state.disk, disk_seqno);
        }
        Ok(self.process_commits())
    }

    /// Advances the active's disk position to the vbucket's persistence
    /// seqno, returning newly committed writes.
    pub fn notify_local_persistence(&mut self, persisted_seqno: u64) -> Vec<SyncWrite> {
        if self.chain.is_empty() {
            return Vec::new();
        }
        advance(&self.tracked, &mut self.chain[0].disk, persisted_seqno);
        self.process_commits()
    }

    /// Aborts every tracked write whose timeout elapsed by `now`.
    /// Writes with no timeout never expire. No ordering is assumed.
    pub fn process_timeout(&mut self, now: Instant) -> Vec<SyncWrite> {
        let expired: Vec<u64> = self
            .tracked
            .values()
            .filter(|w| w.timeout.is_some_and(|t| w.created + t <= now))
            .map(|w| w.seqno)
            .collect();
        let mut aborted = Vec::with_capacity(expired.len());
        for seqno in expired {
            aborted.push(self.tracked.remove(&seqno).expect("collected above"));
        }
        if !aborted.is_empty() {
            self.reposition_all();
            self.num_aborted += aborted.len() as u64;
            debug!(
                vbid = %self.vbid,
                aborted = aborted.len(),
                "sync writes timed out"
            );
        }
        aborted
    }

    fn process_commits(&mut self) -> Vec<SyncWrite> {
        let majority = self.chain.len() / 2 + 1;
        let satisfied: Vec<u64> = self
            .tracked
            .values()
            .filter(|w| is_satisfied(&self.chain, majority, w))
            .map(|w| w.seqno)
            .collect();
        let mut committed = Vec::with_capacity(satisfied.len());
        for seqno in satisfied {
            committed.push(self.tracked.remove(&seqno).expect("collected above"));
        }
        if !committed.is_empty() {
            self.reposition_all();
            self.num_committed += committed.len() as u64;
        }
        committed
    }

    fn reposition_all(&mut self) {
        for node in &mut self.chain {
            reposition(&self.tracked, &mut node.memory);
            reposition(&self.tracked, &mut node.disk);
        }
    }

    /// Stats snapshot; nodes appear in chain order, active first.
    pub fn stats(&self) -> DurabilityStats {
        DurabilityStats {
            num_tracked: self.tracked.len(),
            num_accepted: self.num_accepted,
            num_committed: self.num_committed,
            num_aborted: self.num_aborted,
            nodes: self
                .chain
                .iter()
                .map(|n| NodePositions {
                    name: n.name.clone(),
                    memory_write_seqno: n.memory.write_seqno,
                    memory_ack_seqno: n.memory.ack_seqno,
                    disk_write_seqno: n.disk.write_seqno,
                    disk_ack_seqno: n.disk.ack_seqno,
                })
                .collect(),
        }
    }

    /// Iterator sentinel of `node`'s memory position (used by tests and
    /// invariant checks).
    pub fn memory_iter_of(&self, node: &str) -> Option<PositionIter> {
        self.chain
            .iter()
            .find(|n| n.name == node)
            .map(|n| n.memory.iter)
    }

    /// Asserts that no position dangles on a removed entry.
    pub fn assert_positions_anchored(&self) {
        for node in &self.chain {
            for pos in [&node.memory, &node.disk] {
                if let PositionIter::At(s) = pos.iter {
                    assert!(
                        self.tracked.contains_key(&s),
                        "{}: node {} iterator dangling on removed seqno {s}",
                        self.vbid,
                        node.name
                    );
                }
            }
        }
    }
}

fn is_satisfied(
    chain: &SmallVec<[NodeState; MAX_CHAIN_SIZE]>,
    majority: usize,
    write: &SyncWrite,
) -> bool {
    let s = write.seqno;
    let mem_count = chain.iter().filter(|n| n.memory.write_seqno >= s).count();
    let disk_count = chain.iter().filter(|n| n.disk.write_seqno >= s).count();
    match write.level {
        DurabilityLevel::Majority => mem_count >= majority,
        DurabilityLevel::MajorityAndPersistOnMaster => {
            mem_count >= majority && chain[0].disk.write_seqno >= s
        }
        DurabilityLevel::PersistToMajority => disk_count >= majority,
    }
}

/// Moves `pos` forward over every tracked entry with seqno <= `ack`.
/// Acks past the last tracked entry park the iterator at `End`.
fn advance(tracked: &BTreeMap<u64, SyncWrite>, pos: &mut Position, ack: u64) {
    pos.ack_seqno = pos.ack_seqno.max(ack);
    loop {
        let next = tracked
            .range((Excluded(pos.write_seqno), Unbounded))
            .next()
            .map(|(&s, _)| s);
        match next {
            Some(s) if s <= ack => {
                pos.write_seqno = s;
                pos.iter = PositionIter::At(s);
            }
            _ => break,
        }
    }
    let past_everything = match tracked.keys().next_back() {
        None => true,
        Some(&last) => pos.ack_seqno > last,
    };
    if past_everything {
        pos.iter = PositionIter::End;
    }
}

/// Re-seats a position whose entry was removed: to `End` when the node
/// already covered everything surviving, else onto the closest surviving
/// entry it has covered.
fn reposition(tracked: &BTreeMap<u64, SyncWrite>, pos: &mut Position) {
    match pos.iter {
        PositionIter::At(s) if !tracked.contains_key(&s) => {
            pos.iter = match tracked.keys().next_back() {
                None => PositionIter::End,
                Some(&last) if pos.write_seqno >= last => PositionIter::End,
                _ => match tracked.range(..=s).next_back() {
                    Some((&k, _)) => PositionIter::At(k),
                    None => PositionIter::Before,
                },
            };
        }
        _ => {}
    }
}
