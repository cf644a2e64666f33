//! Frequency tracking for the statistical-counter eviction policy.
//!
//! Each stored value carries an 8-bit counter approximating a 16-bit one:
//! increments succeed with probability shrinking geometrically in the
//! current value, so the visible counter is monotone in access count with
//! diminishing resolution at the hot end.

use rand::Rng;

/// Saturating probabilistic counter over the u8 domain.
#[derive(Debug, Clone, Copy)]
pub struct ProbabilisticCounter {
    factor: f64,
}

impl ProbabilisticCounter {
    /// Builds a counter whose expected saturation point (value 255) is
    /// reached after roughly `saturation` increments.
    pub fn new(saturation: u32) -> Self {
        Self {
            factor: solve_growth_factor(f64::from(saturation.max(256))),
        }
    }

    /// Returns the possibly incremented counter value.
    pub fn increment(&self, current: u8, rng: &mut impl Rng) -> u8 {
        if current == u8::MAX {
            return current;
        }
        let p = self.factor.powi(-i32::from(current));
        if rng.gen::<f64>() < p {
            current + 1
        } else {
            current
        }
    }
}

/// Solves `sum_{i=0..254} f^i = saturation` for the growth factor by
/// bisection.
fn solve_growth_factor(saturation: f64) -> f64 {
    let expected = |f: f64| (f.powi(255) - 1.0) / (f - 1.0);
    let (mut lo, mut hi) = (1.0 + 1e-6, 1.5);
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        if expected(mid) < saturation {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

/// Histogram of the frequency counters sampled during one pager pass.
///
/// The counter domain is 8 bits, so a fixed 256-bucket value histogram is
/// exact; percentile lookups cost one pass over the buckets.
#[derive(Debug, Clone)]
pub struct FreqHistogram {
    buckets: [u64; 256],
    total: u64,
}

impl FreqHistogram {
    /// An empty histogram.
    pub fn new() -> Self {
        Self {
            buckets: [0; 256],
            total: 0,
        }
    }

    /// Records one counter sample.
    pub fn add(&mut self, value: u8) {
        self.buckets[usize::from(value)] += 1;
        self.total += 1;
    }

    /// Number of recorded samples.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Smallest counter value at or below which at least `pct` percent of
    /// samples fall. Returns 0 for an empty histogram.
    pub fn percentile(&self, pct: f64) -> u8 {
        if self.total == 0 {
            return 0;
        }
        let pct = pct.clamp(0.0, 100.0);
        let target = ((self.total as f64) * pct / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (value, count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return value as u8;
            }
        }
        u8::MAX
    }

    /// Forgets all samples.
    pub fn clear(&mut self) {
        self.buckets = [0; 256];
        self.total = 0;
    }
}

impl Default for FreqHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps an 8-bit frequency counter onto the legacy 4-level NRU scale used
/// in stats output: 0 is hottest, 3 is coldest.
pub fn freq_to_nru(freq: u8) -> u8 {
    match freq {
        192..=u8::MAX => 0,
        128..=191 => 1,
        64..=127 => 2,
        _ => 3,
    }
}
