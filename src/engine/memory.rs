//! Engine-wide memory accounting.
//!
//! A single atomic counter is credited by every mutation and debited by
//! deletion and eviction. The item pager reads it against the watermarks;
//! the mutation paths read it for admission control.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Shared memory counter plus derived thresholds.
pub struct MemoryTracker {
    used: AtomicI64,
    quota: usize,
    high_wat: usize,
    low_wat: usize,
    mutation_threshold: usize,
    wake_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    num_rejections: AtomicU64,
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("used", &self.used())
            .field("quota", &self.quota)
            .field("high_wat", &self.high_wat)
            .field("low_wat", &self.low_wat)
            .finish()
    }
}

impl MemoryTracker {
    /// Builds a tracker for `quota` bytes with fractional watermarks.
    pub fn new(quota: usize, high_ratio: f64, low_ratio: f64, mutation_ratio: f64) -> Self {
        Self {
            used: AtomicI64::new(0),
            quota,
            high_wat: (quota as f64 * high_ratio) as usize,
            low_wat: (quota as f64 * low_ratio) as usize,
            mutation_threshold: (quota as f64 * mutation_ratio) as usize,
            wake_hook: Mutex::new(None),
            num_rejections: AtomicU64::new(0),
        }
    }

    /// Registers the hook invoked when usage crosses the high watermark.
    pub fn set_wake_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.wake_hook.lock() = Some(hook);
    }

    /// Adds `bytes` to the counter, firing the wake hook on crossing the
    /// high watermark.
    pub fn credit(&self, bytes: usize) {
        let before = self.used.fetch_add(bytes as i64, Ordering::AcqRel).max(0) as usize;
        let after = before + bytes;
        if before < self.high_wat && after >= self.high_wat {
            if let Some(hook) = self.wake_hook.lock().as_ref() {
                hook();
            }
        }
    }

    /// Subtracts `bytes` from the counter.
    pub fn debit(&self, bytes: usize) {
        self.used.fetch_sub(bytes as i64, Ordering::AcqRel);
    }

    /// Current usage in bytes (clamped at zero).
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire).max(0) as usize
    }

    /// Configured quota in bytes.
    pub fn quota(&self) -> usize {
        self.quota
    }

    /// High watermark in bytes.
    pub fn high_wat(&self) -> usize {
        self.high_wat
    }

    /// Low watermark in bytes.
    pub fn low_wat(&self) -> usize {
        self.low_wat
    }

    /// True while usage exceeds the high watermark.
    pub fn above_high_wat(&self) -> bool {
        self.used() > self.high_wat
    }

    /// True once usage has fallen to or below the low watermark.
    pub fn below_low_wat(&self) -> bool {
        self.used() <= self.low_wat
    }

    /// Admission check for an incoming mutation of `incoming` bytes.
    ///
    /// Replication-originated writes are throttled against the full quota
    /// rather than the front-end mutation threshold.
    pub fn has_headroom(&self, incoming: usize, replication: bool) -> bool {
        let ceiling = if replication {
            self.quota
        } else {
            self.mutation_threshold
        };
        let ok = self.used() + incoming <= ceiling;
        if !ok {
            self.num_rejections.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Mutations rejected for lack of headroom.
    pub fn num_rejections(&self) -> u64 {
        self.num_rejections.load(Ordering::Relaxed)
    }
}
