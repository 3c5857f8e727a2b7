//! A small count-min-style frequency sketch backing the cache's admission
//! policy — a simplified stand-in for the TinyLFU sketch a Ristretto-class
//! cache uses to decide whether a new key is worth admitting when the cost
//! budget is full. Counters decay by halving once the total increment count
//! crosses the configured counter budget, so long-idle keys don't
//! permanently squat on a high estimate.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

const WIDTH: usize = 4096;
const DEPTH: usize = 4;

pub struct FrequencySketch {
    rows: Mutex<[[u8; WIDTH]; DEPTH]>,
    increments: AtomicU64,
    decay_threshold: u64,
}

impl FrequencySketch {
    pub fn new(counter_budget: u64) -> Self {
        FrequencySketch {
            rows: Mutex::new([[0u8; WIDTH]; DEPTH]),
            increments: AtomicU64::new(0),
            decay_threshold: counter_budget.max(16),
        }
    }

    fn indices(key_hash: u64) -> [usize; DEPTH] {
        let mut out = [0usize; DEPTH];
        for (i, slot) in out.iter_mut().enumerate() {
            let mixed = key_hash
                .wrapping_mul(0x9E3779B97F4A7C15)
                .wrapping_add(i as u64 * 0xBF58476D1CE4E5B9);
            *slot = (mixed as usize) % WIDTH;
        }
        out
    }

    pub fn increment(&self, key_hash: u64) {
        let mut rows = self.rows.lock();
        for (row, idx) in rows.iter_mut().zip(Self::indices(key_hash)) {
            if row[idx] < u8::MAX {
                row[idx] += 1;
            }
        }
        drop(rows);

        if self.increments.fetch_add(1, Ordering::Relaxed) + 1 >= self.decay_threshold {
            self.increments.store(0, Ordering::Relaxed);
            let mut rows = self.rows.lock();
            for row in rows.iter_mut() {
                for c in row.iter_mut() {
                    *c /= 2;
                }
            }
        }
    }

    pub fn estimate(&self, key_hash: u64) -> u8 {
        let rows = self.rows.lock();
        Self::indices(key_hash)
            .iter()
            .enumerate()
            .map(|(row, &idx)| rows[row][idx])
            .min()
            .unwrap_or(0)
    }

    /// Admission decision: a candidate is admitted over `victim_hash` if it
    /// has been observed at least as frequently (ties favor the incumbent
    /// victim, matching TinyLFU's conservative default).
    pub fn admit(&self, candidate_hash: u64, victim_hash: u64) -> bool {
        self.estimate(candidate_hash) > self.estimate(victim_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unobserved_key_estimates_zero() {
        let sketch = FrequencySketch::new(1_000_000);
        assert_eq!(sketch.estimate(42), 0);
    }

    #[test]
    fn increment_raises_estimate() {
        let sketch = FrequencySketch::new(1_000_000);
        sketch.increment(7);
        assert!(sketch.estimate(7) >= 1);
    }

    #[test]
    fn tie_does_not_admit_candidate_over_incumbent() {
        let sketch = FrequencySketch::new(1_000_000);
        assert!(!sketch.admit(1, 2));
    }

    #[test]
    fn hotter_candidate_is_admitted_over_colder_victim() {
        let sketch = FrequencySketch::new(1_000_000);
        for _ in 0..5 {
            sketch.increment(100);
        }
        assert!(sketch.admit(100, 200));
        assert!(!sketch.admit(200, 100));
    }

    #[test]
    fn counters_decay_after_crossing_budget() {
        let sketch = FrequencySketch::new(16);
        for _ in 0..16 {
            sketch.increment(1);
        }
        // Decay halves every counter once increments reach the budget;
        // estimate should drop back down rather than grow unbounded.
        assert!(sketch.estimate(1) <= 8);
    }
}
