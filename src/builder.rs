//! Builder pattern API for configuring a counting run.
//!
//! # Example
//!
//! ```rust
//! use kmerspill::builder::CounterBuilder;
//! use kmerspill::config::FileRotation;
//!
//! let config = CounterBuilder::new()
//!     .k(21)?
//!     .table_size(1 << 20)
//!     .counter_len(7)
//!     .rotation(FileRotation::OneFile)
//!     .prefix("/tmp/counts")
//!     .build()?;
//!
//! assert_eq!(config.table_size(), 1 << 20);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::path::PathBuf;

use crate::{
    codec::SlotCodec,
    config::{CounterConfig, DrainPolicy, FileRotation, FragmentOrder, OverflowPolicy},
    error::{KmerLengthError, KmerSpillError},
    kmer::KmerLength,
    merge::DEFAULT_FAN_IN,
};

/// Largest accepted table size.
pub const MAX_TABLE_SIZE: usize = 1 << 40;

/// Default slots per table.
pub const DEFAULT_TABLE_SIZE: usize = 1 << 22;

/// Default in-slot counter width.
pub const DEFAULT_COUNTER_LEN: u8 = 7;

/// Default reprobe limit.
pub const DEFAULT_MAX_REPROBE: usize = 126;

/// Default drain threshold.
pub const DEFAULT_LOAD_FACTOR: f64 = 0.9;

/// A builder for [`CounterConfig`].
///
/// Only the k-mer length is mandatory. Defaults:
/// - `table_size`: 2^22 slots
/// - `counter_len`: 7 bits
/// - `max_reprobe`: 126
/// - `threads`: available parallelism
/// - `canonical`: true
/// - `load_factor`: 0.9
/// - drain, rotation, order and overflow: their enum defaults
/// - `prefix`: `mer_counts`
/// - `merge_fan_in`: 64 fragment files
#[derive(Debug, Clone)]
pub struct CounterBuilder {
    k: Option<KmerLength>,
    table_size: usize,
    counter_len: u8,
    max_reprobe: usize,
    threads: Option<usize>,
    canonical: bool,
    load_factor: f64,
    drain: DrainPolicy,
    rotation: FileRotation,
    order: FragmentOrder,
    overflow: OverflowPolicy,
    prefix: PathBuf,
    dump_residue: bool,
    merge_fan_in: usize,
}

impl Default for CounterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            k: None,
            table_size: DEFAULT_TABLE_SIZE,
            counter_len: DEFAULT_COUNTER_LEN,
            max_reprobe: DEFAULT_MAX_REPROBE,
            threads: None,
            canonical: true,
            load_factor: DEFAULT_LOAD_FACTOR,
            drain: DrainPolicy::default(),
            rotation: FileRotation::default(),
            order: FragmentOrder::default(),
            overflow: OverflowPolicy::default(),
            prefix: PathBuf::from("mer_counts"),
            dump_residue: false,
            merge_fan_in: DEFAULT_FAN_IN,
        }
    }

    /// Sets the k-mer length.
    ///
    /// # Errors
    ///
    /// Returns [`KmerLengthError`] if `k` is outside 1-32.
    pub fn k(mut self, k: usize) -> Result<Self, KmerLengthError> {
        self.k = Some(KmerLength::new(k)?);
        Ok(self)
    }

    /// Sets the k-mer length from a pre-validated `KmerLength`.
    #[must_use]
    pub fn k_validated(mut self, k: KmerLength) -> Self {
        self.k = Some(k);
        self
    }

    /// Sets the number of slots per table. Rounded up to a power of two.
    #[must_use]
    pub fn table_size(mut self, size: usize) -> Self {
        self.table_size = size;
        self
    }

    /// Sets the width in bits of the in-slot counter.
    #[must_use]
    pub fn counter_len(mut self, bits: u8) -> Self {
        self.counter_len = bits;
        self
    }

    /// Sets the reprobe limit.
    #[must_use]
    pub fn max_reprobe(mut self, max_reprobe: usize) -> Self {
        self.max_reprobe = max_reprobe;
        self
    }

    /// Sets the number of producer threads.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Counts k-mers and their reverse complements together (default) or apart.
    #[must_use]
    pub fn canonical(mut self, canonical: bool) -> Self {
        self.canonical = canonical;
        self
    }

    /// Sets the occupied fraction that triggers a drain.
    #[must_use]
    pub fn load_factor(mut self, load_factor: f64) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Sets the drain policy.
    #[must_use]
    pub fn drain(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    /// Sets the fragment file rotation.
    #[must_use]
    pub fn rotation(mut self, rotation: FileRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Sets the fragment record order.
    #[must_use]
    pub fn order(mut self, order: FragmentOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the count overflow policy.
    #[must_use]
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Sets the path prefix of fragment files.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Writes the final table contents to a fragment instead of merging them from memory.
    #[must_use]
    pub fn dump_residue(mut self, dump_residue: bool) -> Self {
        self.dump_residue = dump_residue;
        self
    }

    /// Sets how many fragment files a merge may read at once.
    #[must_use]
    pub fn merge_fan_in(mut self, fan_in: usize) -> Self {
        self.merge_fan_in = fan_in;
        self
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::Configuration`] if `k` was never set, the
    /// table size is out of range, the load factor is not in `(0, 1]`,
    /// `threads` is zero, the merge fan-in is below 2, or the slot layout
    /// does not fit in 64 bits.
    pub fn build(self) -> Result<CounterConfig, KmerSpillError> {
        let k = self
            .k
            .ok_or_else(|| KmerSpillError::configuration("k-mer length not set; call .k() first"))?;

        if self.table_size == 0 || self.table_size > MAX_TABLE_SIZE {
            return Err(KmerSpillError::configuration(format!(
                "table size {} must be between 1 and {MAX_TABLE_SIZE}",
                self.table_size
            )));
        }
        let table_size = self.table_size.next_power_of_two().max(2);

        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(KmerSpillError::configuration(format!(
                "load factor {} must be in (0, 1]",
                self.load_factor
            )));
        }

        let threads = match self.threads {
            Some(0) => {
                return Err(KmerSpillError::configuration(
                    "at least one producer thread is required",
                ))
            }
            Some(threads) => threads,
            None => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        };

        if self.merge_fan_in < 2 {
            return Err(KmerSpillError::configuration(format!(
                "merge fan-in {} must be at least 2",
                self.merge_fan_in
            )));
        }

        // surface layout problems now rather than at the first allocation
        SlotCodec::new(k, table_size, self.counter_len, self.max_reprobe)?;

        Ok(CounterConfig {
            k,
            table_size,
            counter_len: self.counter_len,
            max_reprobe: self.max_reprobe,
            threads,
            canonical: self.canonical,
            load_factor: self.load_factor,
            drain: self.drain,
            rotation: self.rotation,
            order: self.order,
            overflow: self.overflow,
            prefix: self.prefix,
            dump_residue: self.dump_residue,
            merge_fan_in: self.merge_fan_in,
        })
    }
}
