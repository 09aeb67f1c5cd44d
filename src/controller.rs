//! Deciding when to drain, and swapping tables while doing it.
//!
//! [`SpillController`] answers "should this table be drained now?".
//! [`TableRing`] owns the tables ("arenas") and a generation counter. The
//! arena accepting writes for generation `g` is `arenas[g % len]`; an arena
//! only accepts writes once it has been cleared for that generation.
//!
//! Producers [`pin`](TableRing::pin) the current arena for the duration of a
//! batch. A drain of generation `g` advances the generation, waits for the
//! writers still pinned to the old arena, hands it to the dumper, and finally
//! [`release`](DrainTicket::release)s it for generation `g + len`. With two
//! arenas (the rotating policy) producers move to the spare immediately; with
//! one (stop-the-world) they wait for the release.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::{config::CounterConfig, error::KmerSpillError, table::CountingTable};

#[cfg(feature = "tracing")]
use tracing::debug;

/// Decides when a table must be drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillController {
    load_limit: usize,
}

impl SpillController {
    /// A controller draining at `load_factor` of `capacity` occupied slots.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn new(capacity: usize, load_factor: f64) -> Self {
        let load_limit = ((capacity as f64) * load_factor).ceil() as usize;
        Self {
            load_limit: load_limit.clamp(1, capacity),
        }
    }

    /// A controller for the tables of `config`.
    #[must_use]
    pub fn from_config(config: &CounterConfig) -> Self {
        Self::new(config.table_size(), config.load_factor())
    }

    /// Occupied slots at which a drain is triggered.
    #[must_use]
    pub const fn load_limit(&self) -> usize {
        self.load_limit
    }

    /// True once the table is over its load limit or has refused a key.
    #[must_use]
    pub fn should_drain(&self, table: &CountingTable) -> bool {
        table.is_full() || table.occupied() >= self.load_limit
    }
}

struct Arena {
    table: CountingTable,
    serving: AtomicU64,
    writers: CachePadded<AtomicUsize>,
}

/// The set of tables producers write into, switched by generation.
pub struct TableRing {
    arenas: Vec<Arena>,
    current: CachePadded<AtomicU64>,
    requested: AtomicU64,
    aborted: AtomicBool,
}

impl TableRing {
    /// Allocates the arenas required by the configured drain policy.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::Configuration`] if the table layout is invalid.
    pub fn new(config: &CounterConfig) -> Result<Self, KmerSpillError> {
        let arenas = (0..config.drain().arenas())
            .map(|generation| {
                Ok(Arena {
                    table: CountingTable::new(
                        config.k(),
                        config.table_size(),
                        config.counter_len(),
                        config.max_reprobe(),
                        config.canonical(),
                        config.overflow(),
                    )?,
                    serving: AtomicU64::new(generation as u64),
                    writers: CachePadded::new(AtomicUsize::new(0)),
                })
            })
            .collect::<Result<Vec<_>, KmerSpillError>>()?;

        Ok(Self {
            arenas,
            current: CachePadded::new(AtomicU64::new(0)),
            requested: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn arena(&self, generation: u64) -> &Arena {
        &self.arenas[(generation % self.arenas.len() as u64) as usize]
    }

    /// The generation currently accepting writes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// The table of the current generation.
    ///
    /// Only meaningful once producers are done; use [`pin`](Self::pin) while
    /// they are running.
    #[must_use]
    pub fn current_table(&self) -> &CountingTable {
        &self.arena(self.generation()).table
    }

    /// Stops every producer waiting in or entering [`pin`](Self::pin).
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether [`abort`](Self::abort) was called.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn check_aborted(&self) -> Result<(), KmerSpillError> {
        if self.is_aborted() {
            Err(KmerSpillError::Aborted {
                details: "the counting table ring was shut down".into(),
            })
        } else {
            Ok(())
        }
    }

    /// Registers the caller as a writer of the current arena.
    ///
    /// Waits while the arena for the current generation is still being
    /// drained (stop-the-world, or both rotating arenas full).
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::Aborted`] once the ring has been aborted.
    pub fn pin(&self) -> Result<TableGuard<'_>, KmerSpillError> {
        let backoff = Backoff::new();
        loop {
            self.check_aborted()?;
            let generation = self.current.load(Ordering::SeqCst);
            let arena = self.arena(generation);
            if arena.serving.load(Ordering::Acquire) == generation {
                arena.writers.fetch_add(1, Ordering::SeqCst);
                // a drain may have advanced the generation before we registered
                if self.current.load(Ordering::SeqCst) == generation {
                    return Ok(TableGuard { arena, generation });
                }
                arena.writers.fetch_sub(1, Ordering::Release);
            }
            backoff.snooze();
        }
    }

    /// Waits until the ring has moved past `generation`.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::Aborted`] once the ring has been aborted.
    pub fn wait_past(&self, generation: u64) -> Result<(), KmerSpillError> {
        let backoff = Backoff::new();
        while self.current.load(Ordering::SeqCst) == generation {
            self.check_aborted()?;
            backoff.snooze();
        }
        Ok(())
    }

    /// Records a drain request for `generation`.
    ///
    /// Returns `true` for exactly one caller per generation: the one that
    /// should notify the dumper.
    pub fn request_drain(&self, generation: u64) -> bool {
        self.requested.fetch_max(generation + 1, Ordering::AcqRel) <= generation
    }

    /// Retires `generation` and hands its arena to the caller for draining.
    ///
    /// Returns `None` if the ring is already past `generation` (a stale
    /// request). Must only be called from the single draining thread.
    pub fn rotate(&self, generation: u64) -> Option<DrainTicket<'_>> {
        if self.current.load(Ordering::SeqCst) != generation {
            return None;
        }
        let arena = self.arena(generation);
        self.current.store(generation + 1, Ordering::SeqCst);

        let backoff = Backoff::new();
        while arena.writers.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }

        #[cfg(feature = "tracing")]
        debug!(
            generation,
            occupied = arena.table.occupied(),
            "Retired counting table"
        );

        Some(DrainTicket {
            ring: self,
            arena,
            generation,
        })
    }
}

/// A producer's registration on one arena. Dropping it unregisters.
pub struct TableGuard<'a> {
    arena: &'a Arena,
    generation: u64,
}

impl TableGuard<'_> {
    /// The pinned table.
    #[must_use]
    pub const fn table(&self) -> &CountingTable {
        &self.arena.table
    }

    /// The generation the table was pinned for.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        self.arena.writers.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive access to a retired arena until it is released.
pub struct DrainTicket<'a> {
    ring: &'a TableRing,
    arena: &'a Arena,
    generation: u64,
}

impl DrainTicket<'_> {
    /// The retired table. No producer writes to it while the ticket lives.
    #[must_use]
    pub const fn table(&self) -> &CountingTable {
        &self.arena.table
    }

    /// The retired generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Clears the table and makes it available to a later generation.
    ///
    /// Call only after its contents are durably written.
    pub fn release(self) {
        self.arena.table.clear();
        let next = self.generation + self.ring.arenas.len() as u64;
        self.arena.serving.store(next, Ordering::Release);
    }
}
