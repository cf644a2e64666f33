//! Hybrid logical clock.
//!
//! Issues CAS values that are monotone per vbucket: the upper 48 bits come
//! from the wall clock (nanoseconds, truncated), the lower 16 bits are a
//! logical counter consumed when the wall clock fails to advance. Drift of
//! externally supplied CAS values against the local clock is counted for
//! observability only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const LOGICAL_BITS: u32 = 16;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Per-vbucket hybrid logical clock.
#[derive(Debug)]
pub struct Hlc {
    max_cas: AtomicU64,
    /// Seqno at which this vbucket started issuing HLC CAS values.
    epoch_seqno: AtomicU64,
    ahead_threshold_ns: u64,
    behind_threshold_ns: u64,
    ahead_exceptions: AtomicU64,
    behind_exceptions: AtomicU64,
}

/// Drift counters exposed through stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct HlcStats {
    /// Current max CAS issued or accepted.
    pub max_cas: u64,
    /// Number of accepted CAS values ahead of the local clock beyond the
    /// threshold.
    pub ahead_exceptions: u64,
    /// Number of accepted CAS values behind the local clock beyond the
    /// threshold.
    pub behind_exceptions: u64,
}

impl Hlc {
    /// Creates a clock seeded with `init_cas` (zero for a fresh vbucket).
    pub fn new(init_cas: u64) -> Self {
        Self {
            max_cas: AtomicU64::new(init_cas),
            epoch_seqno: AtomicU64::new(0),
            ahead_threshold_ns: 5_000_000_000,
            behind_threshold_ns: 5_000_000_000,
            ahead_exceptions: AtomicU64::new(0),
            behind_exceptions: AtomicU64::new(0),
        }
    }

    fn physical_now() -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        (now.as_nanos() as u64) & !LOGICAL_MASK
    }

    /// Issues the next CAS value. Monotone across concurrent callers.
    pub fn next_cas(&self) -> u64 {
        loop {
            let current = self.max_cas.load(Ordering::Acquire);
            let physical = Self::physical_now();
            let candidate = if physical > current {
                physical
            } else {
                current + 1
            };
            if self
                .max_cas
                .compare_exchange_weak(current, candidate, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return candidate;
            }
        }
    }

    /// Accepts an externally generated CAS (replication / `*_with_meta`),
    /// advancing the clock and recording drift beyond the thresholds.
    pub fn accept_cas(&self, cas: u64) {
        let physical = Self::physical_now();
        if cas > physical && cas - physical > self.ahead_threshold_ns {
            self.ahead_exceptions.fetch_add(1, Ordering::Relaxed);
        } else if physical > cas && physical - cas > self.behind_threshold_ns {
            self.behind_exceptions.fetch_add(1, Ordering::Relaxed);
        }
        self.max_cas.fetch_max(cas, Ordering::AcqRel);
    }

    /// Current max CAS issued or accepted.
    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::Acquire)
    }

    /// Forces the clock to at least `cas` (warmup).
    pub fn set_max_cas(&self, cas: u64) {
        self.max_cas.fetch_max(cas, Ordering::AcqRel);
    }

    /// Seqno at which HLC CAS issuance began for this vbucket.
    pub fn epoch_seqno(&self) -> u64 {
        self.epoch_seqno.load(Ordering::Relaxed)
    }

    /// Records the HLC epoch seqno (warmup / first issuance).
    pub fn set_epoch_seqno(&self, seqno: u64) {
        self.epoch_seqno.store(seqno, Ordering::Relaxed);
    }

    /// Snapshot for stats output.
    pub fn stats(&self) -> HlcStats {
        HlcStats {
            max_cas: self.max_cas(),
            ahead_exceptions: self.ahead_exceptions.load(Ordering::Relaxed),
            behind_exceptions: self.behind_exceptions.load(Ordering::Relaxed),
        }
    }
}

/// Wall clock in unix seconds, used for expiry and lock deadlines.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
