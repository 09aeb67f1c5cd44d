//! The lock-free counting hash table.
//!
//! An open-addressing array of [`AtomicU64`] slots laid out by a
//! [`SlotCodec`]. Producers insert and increment keys concurrently through
//! compare-and-swap on whole slots; nothing in this module takes a lock.
//!
//! Counts that outgrow a slot's count field are handled per
//! [`OverflowPolicy`]: kept exact in a side map of wide counters, or capped
//! and tallied.

use std::{
    hash::BuildHasherDefault,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};
use dashmap::DashMap;
use rustc_hash::FxHasher;

use crate::{
    codec::SlotCodec,
    config::OverflowPolicy,
    error::KmerSpillError,
    kmer::{canonical, KmerLength},
};

/// Wide counters for keys whose slot count saturated.
type WideCounts = DashMap<u64, u64, BuildHasherDefault<FxHasher>>;

/// Result of adding to a key's count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The key claimed a previously empty slot.
    Inserted,
    /// The key's existing slot was incremented.
    Incremented,
    /// The key's count field is saturated; the excess was routed per the
    /// table's [`OverflowPolicy`].
    Overflowed,
    /// Every slot of the key's reprobe sequence holds another key. Nothing
    /// was modified; the table needs draining.
    TableFull,
}

/// Result of [`try_claim_or_increment`] on one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The slot was empty and now holds the key. `excess` did not fit the count field.
    Inserted { excess: u64 },
    /// The slot already held the key and was incremented.
    Incremented { excess: u64 },
    /// The slot holds a different key.
    Occupied,
}

/// Claims `slot` for the entry `(tag, quotient)` or adds `delta` to it.
///
/// Every slot transition of the table goes through here so that all call
/// sites share the same memory orderings: the claiming CAS writes tag,
/// quotient and the initial count at once, with `AcqRel` on success and
/// `Acquire` on failure. Counts saturate at the codec's overflow sentinel;
/// whatever does not fit is returned as `excess`.
pub fn try_claim_or_increment(
    codec: &SlotCodec,
    slot: &AtomicU64,
    tag: u64,
    quotient: u64,
    delta: u64,
) -> Claim {
    let max = codec.count_max();
    let backoff = Backoff::new();
    let mut current = slot.load(Ordering::Acquire);
    loop {
        if current == SlotCodec::EMPTY {
            let initial = delta.min(max);
            let word = codec.pack(tag, quotient, initial);
            match slot.compare_exchange_weak(
                SlotCodec::EMPTY,
                word,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Claim::Inserted {
                        excess: delta - initial,
                    }
                }
                Err(actual) => {
                    // lost the race, or a spurious failure: look again
                    current = actual;
                    continue;
                }
            }
        }

        if codec.tag(current) != tag || codec.quotient(current) != quotient {
            return Claim::Occupied;
        }

        let count = codec.count(current);
        if count == max {
            return Claim::Incremented { excess: delta };
        }
        let updated = count.saturating_add(delta).min(max);
        match slot.compare_exchange_weak(
            current,
            codec.with_count(current, updated),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                return Claim::Incremented {
                    excess: delta - (updated - count),
                }
            }
            Err(actual) => {
                current = actual;
                backoff.spin();
            }
        }
    }
}

/// A fixed-size concurrent counting table.
pub struct CountingTable {
    codec: SlotCodec,
    slots: Box<[AtomicU64]>,
    canonical: bool,
    overflow: OverflowPolicy,
    wide: WideCounts,
    occupied: CachePadded<AtomicUsize>,
    capped: AtomicU64,
    full: AtomicBool,
}

impl CountingTable {
    /// Creates an empty table.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::Configuration`] if the layout is invalid; see
    /// [`SlotCodec::new`].
    pub fn new(
        k: KmerLength,
        size: usize,
        count_bits: u8,
        max_reprobe: usize,
        canonical: bool,
        overflow: OverflowPolicy,
    ) -> Result<Self, KmerSpillError> {
        let codec = SlotCodec::new(k, size, count_bits, max_reprobe)?;
        let slots = (0..size).map(|_| AtomicU64::new(SlotCodec::EMPTY)).collect();
        Ok(Self {
            codec,
            slots,
            canonical,
            overflow,
            wide: DashMap::with_hasher(BuildHasherDefault::<FxHasher>::default()),
            occupied: CachePadded::new(AtomicUsize::new(0)),
            capped: AtomicU64::new(0),
            full: AtomicBool::new(false),
        })
    }

    /// The slot layout.
    #[must_use]
    pub const fn codec(&self) -> &SlotCodec {
        &self.codec
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    /// Whether [`Outcome::TableFull`] was returned since the last clear.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    /// Increments dropped by the `Saturate` and `Fail` policies since the last clear.
    #[must_use]
    pub fn capped(&self) -> u64 {
        self.capped.load(Ordering::Relaxed)
    }

    /// The overflow policy of this table.
    #[must_use]
    pub const fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    /// The key as stored: masked to `2k` bits and canonicalized if enabled.
    #[must_use]
    pub fn stored_key(&self, key: u64) -> u64 {
        let k = self.codec.k();
        if self.canonical {
            canonical(key, k)
        } else {
            key & k.mask()
        }
    }

    /// Counts one occurrence of `key`.
    pub fn increment(&self, key: u64) -> Outcome {
        self.add(key, 1)
    }

    /// Counts `delta` occurrences of `key`.
    pub fn add(&self, key: u64, delta: u64) -> Outcome {
        let key = self.stored_key(key);
        let (home, quotient) = self.codec.home(key);

        for attempt in 0..=self.codec.max_reprobe() {
            let slot = &self.slots[self.codec.probe(home, attempt)];
            let tag = attempt as u64 + 1;
            match try_claim_or_increment(&self.codec, slot, tag, quotient, delta) {
                Claim::Inserted { excess } => {
                    self.occupied.fetch_add(1, Ordering::Relaxed);
                    return self.settle(key, excess, Outcome::Inserted);
                }
                Claim::Incremented { excess } => {
                    return self.settle(key, excess, Outcome::Incremented);
                }
                Claim::Occupied => {}
            }
        }

        self.full.store(true, Ordering::Relaxed);
        Outcome::TableFull
    }

    fn settle(&self, key: u64, excess: u64, outcome: Outcome) -> Outcome {
        if excess == 0 {
            return outcome;
        }
        match self.overflow {
            OverflowPolicy::Wide => {
                let mut wide = self.wide.entry(key).or_insert(0);
                *wide = wide.saturating_add(excess);
            }
            OverflowPolicy::Saturate | OverflowPolicy::Fail => {
                self.capped.fetch_add(excess, Ordering::Relaxed);
            }
        }
        Outcome::Overflowed
    }

    /// Looks up the current count of `key`, wide counter included.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<u64> {
        let key = self.stored_key(key);
        let (home, quotient) = self.codec.home(key);
        for attempt in 0..=self.codec.max_reprobe() {
            let word = self.slots[self.codec.probe(home, attempt)].load(Ordering::Acquire);
            if word == SlotCodec::EMPTY {
                return None;
            }
            if self.codec.tag(word) == attempt as u64 + 1 && self.codec.quotient(word) == quotient
            {
                return Some(self.total(key, word));
            }
        }
        None
    }

    fn total(&self, key: u64, word: u64) -> u64 {
        let count = self.codec.count(word);
        if self.codec.is_overflowed(word) {
            let wide = self.wide.get(&key).map_or(0, |w| *w);
            count.saturating_add(wide)
        } else {
            count
        }
    }

    /// Snapshot of every occupied slot as `(key, count)`, in slot order.
    ///
    /// Only exact while no producer is writing; the
    /// [`TableRing`](crate::controller::TableRing) guarantees that for the
    /// arena handed to the dumper.
    #[must_use]
    pub fn entries(&self) -> Vec<(u64, u64)> {
        let mut entries = Vec::with_capacity(self.occupied());
        for (position, slot) in self.slots.iter().enumerate() {
            let word = slot.load(Ordering::Acquire);
            if let Some(key) = self.codec.key_at(position, word) {
                entries.push((key, self.total(key, word)));
            }
        }
        entries
    }

    /// Resets every slot to empty and forgets wide counters and flags.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(SlotCodec::EMPTY, Ordering::Relaxed);
        }
        self.wide.clear();
        self.occupied.store(0, Ordering::Relaxed);
        self.capped.store(0, Ordering::Relaxed);
        self.full.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for CountingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingTable")
            .field("capacity", &self.capacity())
            .field("occupied", &self.occupied())
            .field("canonical", &self.canonical)
            .field("overflow", &self.overflow)
            .finish_non_exhaustive()
    }
}
