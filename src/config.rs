//! Run configuration.
//!
//! A [`CounterConfig`] is produced by
//! [`CounterBuilder`](crate::builder::CounterBuilder), which validates every
//! combination up front so the counting machinery never sees an unusable
//! layout.

use std::path::PathBuf;

use clap::ValueEnum;

use crate::kmer::KmerLength;

/// How producers are kept going while a full table is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DrainPolicy {
    /// Two tables: producers switch to the spare while the full one drains.
    #[default]
    Rotating,
    /// One table: producers wait until the drain completes.
    StopTheWorld,
}

impl DrainPolicy {
    /// Number of tables kept in memory.
    #[must_use]
    pub fn arenas(self) -> usize {
        match self {
            Self::Rotating => 2,
            Self::StopTheWorld => 1,
        }
    }
}

/// Where successive drains are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FileRotation {
    /// Every drain creates `<prefix>_<n>`.
    #[default]
    Numbered,
    /// Every drain appends a region to `<prefix>`.
    OneFile,
}

/// Order of the records inside a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FragmentOrder {
    /// Sorted by key; fragments are merged by streaming.
    #[default]
    Sorted,
    /// Slot order; fragments are aggregated in memory before merging.
    Unsorted,
}

/// What happens to increments beyond a slot's count field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OverflowPolicy {
    /// Keep exact counts in wide side counters.
    #[default]
    Wide,
    /// Cap the count at the field maximum and report how many were dropped.
    Saturate,
    /// Abort the run.
    Fail,
}

/// Validated settings for a counting run.
#[derive(Debug, Clone)]
pub struct CounterConfig {
    pub(crate) k: KmerLength,
    pub(crate) table_size: usize,
    pub(crate) counter_len: u8,
    pub(crate) max_reprobe: usize,
    pub(crate) threads: usize,
    pub(crate) canonical: bool,
    pub(crate) load_factor: f64,
    pub(crate) drain: DrainPolicy,
    pub(crate) rotation: FileRotation,
    pub(crate) order: FragmentOrder,
    pub(crate) overflow: OverflowPolicy,
    pub(crate) prefix: PathBuf,
    pub(crate) dump_residue: bool,
    pub(crate) merge_fan_in: usize,
}

impl CounterConfig {
    /// K-mer length.
    #[must_use]
    pub const fn k(&self) -> KmerLength {
        self.k
    }

    /// Slots per table (a power of two).
    #[must_use]
    pub const fn table_size(&self) -> usize {
        self.table_size
    }

    /// Bits of the in-slot counter.
    #[must_use]
    pub const fn counter_len(&self) -> u8 {
        self.counter_len
    }

    /// Reprobe limit before a key is reported as not fitting.
    #[must_use]
    pub const fn max_reprobe(&self) -> usize {
        self.max_reprobe
    }

    /// Producer threads.
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Whether a k-mer and its reverse complement are counted together.
    #[must_use]
    pub const fn canonical(&self) -> bool {
        self.canonical
    }

    /// Fraction of occupied slots that triggers a drain.
    #[must_use]
    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// Drain policy.
    #[must_use]
    pub const fn drain(&self) -> DrainPolicy {
        self.drain
    }

    /// Fragment file rotation.
    #[must_use]
    pub const fn rotation(&self) -> FileRotation {
        self.rotation
    }

    /// Fragment record order.
    #[must_use]
    pub const fn order(&self) -> FragmentOrder {
        self.order
    }

    /// Count overflow policy.
    #[must_use]
    pub const fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    /// Path prefix of fragment files.
    #[must_use]
    pub fn prefix(&self) -> &std::path::Path {
        &self.prefix
    }

    /// Whether the final table contents are written to a fragment as well.
    #[must_use]
    pub const fn dump_residue(&self) -> bool {
        self.dump_residue
    }

    /// Most fragment files a merge reads at once.
    #[must_use]
    pub const fn merge_fan_in(&self) -> usize {
        self.merge_fan_in
    }
}
