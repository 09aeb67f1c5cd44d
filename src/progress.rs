//! Progress tracking for counting runs.
//!
//! Producers and the dumper update a shared [`ProgressTracker`]; callers can
//! poll [`ProgressTracker::snapshot`] from another thread or read the final
//! [`RunSummary`] when the run completes.
//!
//! # Example
//!
//! ```rust
//! use kmerspill::progress::ProgressTracker;
//!
//! let tracker = ProgressTracker::new();
//! tracker.record_batch(2, 150);
//! tracker.record_drain(40);
//!
//! let progress = tracker.snapshot();
//! assert_eq!(progress.sequences_processed, 2);
//! assert_eq!(progress.drains, 1);
//! ```

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

/// Progress snapshot during counting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    /// Sequences processed so far.
    pub sequences_processed: u64,
    /// K-mers counted so far.
    pub kmers_counted: u64,
    /// Increments that reached a saturated slot.
    pub overflowed: u64,
    /// Table drains completed.
    pub drains: u64,
    /// Records written to fragments.
    pub records_dumped: u64,
}

/// Thread-safe progress tracker using atomic counters.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    sequences: AtomicU64,
    kmers: AtomicU64,
    overflowed: AtomicU64,
    drains: AtomicU64,
    records: AtomicU64,
}

impl ProgressTracker {
    /// Create a new progress tracker with zero counts.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sequences: AtomicU64::new(0),
            kmers: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
            drains: AtomicU64::new(0),
            records: AtomicU64::new(0),
        }
    }

    /// Record a finished batch of `sequences` sequences holding `kmers` k-mers.
    pub fn record_batch(&self, sequences: u64, kmers: u64) {
        self.sequences.fetch_add(sequences, Ordering::Relaxed);
        self.kmers.fetch_add(kmers, Ordering::Relaxed);
    }

    /// Record increments that hit a saturated slot.
    pub fn record_overflow(&self, increments: u64) {
        self.overflowed.fetch_add(increments, Ordering::Relaxed);
    }

    /// Record a completed drain of `records` records.
    pub fn record_drain(&self, records: u64) {
        self.drains.fetch_add(1, Ordering::Relaxed);
        self.records.fetch_add(records, Ordering::Relaxed);
    }

    /// Get a snapshot of the current progress.
    pub fn snapshot(&self) -> Progress {
        Progress {
            sequences_processed: self.sequences.load(Ordering::Relaxed),
            kmers_counted: self.kmers.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            records_dumped: self.records.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        for counter in [
            &self.sequences,
            &self.kmers,
            &self.overflowed,
            &self.drains,
            &self.records,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// What a completed counting run did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    /// Final progress counters.
    pub progress: Progress,
    /// Fragment files created.
    pub files_written: usize,
    /// Increments dropped by the saturate policy.
    pub capped: u64,
    /// Time spent writing fragments.
    pub writing_time: Duration,
    /// Wall-clock time of the counting phase.
    pub elapsed: Duration,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_at_zero() {
        assert_eq!(ProgressTracker::new().snapshot(), Progress::default());
    }

    #[test]
    fn tracker_records() {
        let tracker = ProgressTracker::new();
        tracker.record_batch(3, 100);
        tracker.record_batch(1, 50);
        tracker.record_overflow(4);
        tracker.record_drain(20);
        tracker.record_drain(5);

        let progress = tracker.snapshot();
        assert_eq!(progress.sequences_processed, 4);
        assert_eq!(progress.kmers_counted, 150);
        assert_eq!(progress.overflowed, 4);
        assert_eq!(progress.drains, 2);
        assert_eq!(progress.records_dumped, 25);
    }

    #[test]
    fn tracker_reset() {
        let tracker = ProgressTracker::new();
        tracker.record_batch(1, 100);
        tracker.record_drain(3);
        tracker.reset();
        assert_eq!(tracker.snapshot(), Progress::default());
    }

    #[test]
    fn concurrent_updates() {
        let tracker = ProgressTracker::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        tracker.record_batch(1, 10);
                    }
                });
            }
        });
        assert_eq!(tracker.snapshot().kmers_counted, 40_000);
    }
}
