//! Counting runs.
//!
//! A [`Counter`] drives one run: a rayon pool of producers adds keys to the
//! current table of a [`TableRing`], a dedicated dumper thread drains full
//! tables to fragments, and the result is a [`CountOutcome`] holding the
//! fragments plus whatever was still in memory at the end.
//!
//! The `run_*` functions at the bottom implement the CLI subcommands.

use std::{
    fmt::Debug,
    fs::File,
    io::{stdout, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;

use crate::{
    config::{CounterConfig, OverflowPolicy},
    controller::{SpillController, TableGuard, TableRing},
    dumper::Dumper,
    error::KmerSpillError,
    fragment::{remove_fragments, scan_fragments, DumpFragment},
    histogram::{compute_histogram, count_stats, CountStats},
    kmer::{unpack_to_string, KmerLength, KmerWindows},
    merge::{merge_with_fan_in, CountRange, Merger},
    output::{write_counts, OutputFormat},
    progress::{ProgressTracker, RunSummary},
    reader::{SequenceChunks, DEFAULT_CHUNK_BASES},
    table::Outcome,
};

#[cfg(feature = "tracing")]
use crate::histogram::histogram_stats;

#[cfg(feature = "tracing")]
use tracing::{info, info_span, warn};

/// Requests a running counter to stop.
///
/// Producers check the flag between batches. A drain already in progress
/// completes, so fragments written before cancellation remain valid.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Asks the run to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Messages to the dumper thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainRequest {
    Drain(u64),
    Shutdown,
}

/// The result of a counting run.
#[derive(Debug)]
pub struct CountOutcome {
    k: KmerLength,
    fragments: Vec<DumpFragment>,
    residue: Vec<(u64, u64)>,
    summary: RunSummary,
    fan_in: usize,
}

impl CountOutcome {
    /// K-mer length of the run.
    #[must_use]
    pub const fn k(&self) -> KmerLength {
        self.k
    }

    /// Fragments written by drains, in write order.
    #[must_use]
    pub fn fragments(&self) -> &[DumpFragment] {
        &self.fragments
    }

    /// Table contents still in memory at the end, sorted by key.
    #[must_use]
    pub fn residue(&self) -> &[(u64, u64)] {
        &self.residue
    }

    /// Statistics of the run.
    #[must_use]
    pub const fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Merges the fragments and the residue, reading at most the configured
    /// merge fan-in of fragments at once.
    ///
    /// # Errors
    ///
    /// See [`merge_with_fan_in`].
    pub fn merge(&self, range: CountRange) -> Result<Merger, KmerSpillError> {
        merge_with_fan_in(&self.fragments, self.residue.clone(), range, self.fan_in)
    }

    /// Merges everything into a vector.
    ///
    /// # Errors
    ///
    /// See [`merge_with_fan_in`].
    pub fn merged(&self, range: CountRange) -> Result<Vec<(u64, u64)>, KmerSpillError> {
        self.merge(range)?.collect()
    }

    /// Deletes the fragment files of the run.
    ///
    /// # Errors
    ///
    /// See [`remove_fragments`].
    pub fn remove_fragments(&self) -> Result<(), KmerSpillError> {
        remove_fragments(&self.fragments)
    }
}

/// One producer's view of the ring for the duration of a batch.
struct Producer<'r> {
    ring: &'r TableRing,
    controller: SpillController,
    requests: &'r Sender<DrainRequest>,
    guard: Option<TableGuard<'r>>,
    overflow: OverflowPolicy,
    overflowed: u64,
}

impl<'r> Producer<'r> {
    fn new(
        ring: &'r TableRing,
        controller: SpillController,
        requests: &'r Sender<DrainRequest>,
        overflow: OverflowPolicy,
    ) -> Self {
        Self {
            ring,
            controller,
            requests,
            guard: None,
            overflow,
            overflowed: 0,
        }
    }

    fn request(&self, generation: u64) -> Result<(), KmerSpillError> {
        if self.ring.request_drain(generation) {
            self.requests
                .send(DrainRequest::Drain(generation))
                .map_err(|_| KmerSpillError::Aborted {
                    details: "the dumper thread stopped".into(),
                })?;
        }
        Ok(())
    }

    fn add(&mut self, key: u64) -> Result<(), KmerSpillError> {
        loop {
            let guard = match self.guard.take() {
                Some(guard) => guard,
                None => self.ring.pin()?,
            };
            match guard.table().increment(key) {
                Outcome::Inserted | Outcome::Incremented => {
                    self.guard = Some(guard);
                    return Ok(());
                }
                Outcome::Overflowed => {
                    self.overflowed += 1;
                    if self.overflow == OverflowPolicy::Fail {
                        let table = guard.table();
                        return Err(KmerSpillError::SlotOverflow {
                            kmer: unpack_to_string(table.stored_key(key), table.codec().k()),
                            count_bits: u8::try_from(table.codec().count_bits()).unwrap_or(u8::MAX),
                        });
                    }
                    self.guard = Some(guard);
                    return Ok(());
                }
                Outcome::TableFull => {
                    let generation = guard.generation();
                    drop(guard);
                    self.request(generation)?;
                    self.ring.wait_past(generation)?;
                }
            }
        }
    }

    /// Unpins the table, asking for a drain if it is over its load limit.
    fn finish_batch(&mut self) -> Result<(), KmerSpillError> {
        if let Some(guard) = self.guard.take() {
            if self.controller.should_drain(guard.table()) {
                let generation = guard.generation();
                drop(guard);
                self.request(generation)?;
            }
        }
        Ok(())
    }
}

/// What the dumper thread hands back.
struct Drained {
    fragments: Vec<DumpFragment>,
    capped: u64,
}

fn drain_loop(
    ring: &TableRing,
    dumper: &mut Dumper,
    requests: &Receiver<DrainRequest>,
    progress: &ProgressTracker,
) -> Result<Drained, KmerSpillError> {
    let mut drained = Drained {
        fragments: Vec::new(),
        capped: 0,
    };
    for request in requests {
        let generation = match request {
            DrainRequest::Drain(generation) => generation,
            DrainRequest::Shutdown => break,
        };
        let Some(ticket) = ring.rotate(generation) else {
            continue;
        };
        match dumper.drain(ticket.table()) {
            Ok(fragment) => {
                drained.capped += ticket.table().capped();
                progress.record_drain(fragment.as_ref().map_or(0, DumpFragment::records));
                drained.fragments.extend(fragment);
                ticket.release();
            }
            Err(err) => {
                ring.abort();
                return Err(err);
            }
        }
    }
    Ok(drained)
}

/// Drives counting runs for one configuration.
#[derive(Debug)]
pub struct Counter {
    config: CounterConfig,
    cancel: CancelHandle,
    progress: Arc<ProgressTracker>,
}

impl Counter {
    /// A counter for `config`.
    #[must_use]
    pub fn new(config: CounterConfig) -> Self {
        Self {
            config,
            cancel: CancelHandle::default(),
            progress: Arc::new(ProgressTracker::new()),
        }
    }

    /// The configuration of this counter.
    #[must_use]
    pub const fn config(&self) -> &CounterConfig {
        &self.config
    }

    /// A handle that cancels runs of this counter from any thread.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Live progress of the current run.
    #[must_use]
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Counts the k-mers of `sequences`. Each sequence is one producer batch.
    ///
    /// # Errors
    ///
    /// Returns the first producer or dumper error; see [`count_keys`](Self::count_keys).
    pub fn count_sequences(&self, sequences: &[Bytes]) -> Result<CountOutcome, KmerSpillError> {
        let k = self.config.k();
        self.count_with(sequences.par_iter(), |seq, producer| {
            Ok((1, add_windows(seq, k, producer)?))
        })
    }

    /// Counts the k-mers of sequence chunks pulled from `chunks` as producers
    /// become free. Each chunk is one producer batch.
    ///
    /// Only the chunks currently being counted are held in memory.
    ///
    /// # Errors
    ///
    /// Returns the first chunk error, or any error of
    /// [`count_keys`](Self::count_keys).
    pub fn count_chunks<I>(&self, chunks: I) -> Result<CountOutcome, KmerSpillError>
    where
        I: Iterator<Item = Result<Vec<Bytes>, KmerSpillError>> + Send,
    {
        let k = self.config.k();
        self.count_with(chunks.par_bridge(), |chunk, producer| {
            let chunk = chunk?;
            let mut kmers = 0;
            for seq in &chunk {
                kmers += add_windows(seq, k, producer)?;
            }
            Ok((chunk.len() as u64, kmers))
        })
    }

    /// Reads and counts every input file, streaming bounded chunks of
    /// sequences to the producers.
    ///
    /// # Errors
    ///
    /// Returns the first read error or counting error.
    pub fn count_files<P: AsRef<Path>>(&self, inputs: &[P]) -> Result<CountOutcome, KmerSpillError> {
        let paths = inputs.iter().map(|p| p.as_ref().to_path_buf()).collect();
        self.count_chunks(SequenceChunks::new(paths, DEFAULT_CHUNK_BASES))
    }

    /// Counts pre-encoded keys, one producer batch per inner vector.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::Cancelled`] if cancelled,
    /// [`KmerSpillError::SlotOverflow`] under the fail policy, or the first
    /// dumper error. Dumper errors take precedence over producer errors, and
    /// the error that stopped the run takes precedence over the aborts it
    /// caused in other producers.
    pub fn count_keys(&self, batches: &[Vec<u64>]) -> Result<CountOutcome, KmerSpillError> {
        self.count_with(batches.par_iter(), |batch, producer| {
            for &key in batch {
                producer.add(key)?;
            }
            Ok((1, batch.len() as u64))
        })
    }

    /// Runs `feed` over every batch. `feed` returns the number of sequences
    /// and k-mers it added.
    fn count_with<I, F>(&self, batches: I, feed: F) -> Result<CountOutcome, KmerSpillError>
    where
        I: ParallelIterator,
        F: Fn(I::Item, &mut Producer<'_>) -> Result<(u64, u64), KmerSpillError> + Sync,
    {
        let config = &self.config;

        #[cfg(feature = "tracing")]
        let _span = info_span!("count", k = config.k().get()).entered();
        #[cfg(feature = "tracing")]
        info!(
            table_size = config.table_size(),
            counter_len = config.counter_len(),
            threads = config.threads(),
            drain = ?config.drain(),
            rotation = ?config.rotation(),
            "Starting k-mer counting"
        );

        let start = Instant::now();
        self.progress.reset();
        let ring = TableRing::new(config)?;
        let controller = SpillController::from_config(config);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads())
            .build()?;
        let mut dumper = Dumper::new(config);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let progress = self.progress.as_ref();
        let failure = Mutex::new(None);

        let (produced, drained) = std::thread::scope(|scope| {
            let dumper_thread =
                scope.spawn(|| drain_loop(&ring, &mut dumper, &receiver, progress));

            let produced = pool.install(|| {
                batches.try_for_each(|batch| {
                    let result = if self.cancel.is_cancelled() {
                        Err(KmerSpillError::Cancelled)
                    } else if ring.is_aborted() {
                        Err(KmerSpillError::Aborted {
                            details: "another thread of the run failed".into(),
                        })
                    } else {
                        let mut producer =
                            Producer::new(&ring, controller, &sender, config.overflow());
                        let result = feed(batch, &mut producer).and_then(|(sequences, kmers)| {
                            producer.finish_batch()?;
                            progress.record_batch(sequences, kmers);
                            Ok(())
                        });
                        progress.record_overflow(producer.overflowed);
                        result
                    };
                    result.map_err(|err| {
                        ring.abort();
                        keep_root_cause(&failure, err);
                    })
                })
            });

            // a send error means the dumper already returned
            let _ = sender.send(DrainRequest::Shutdown);
            let drained = dumper_thread.join().unwrap_or_else(|_| {
                Err(KmerSpillError::Aborted {
                    details: "the dumper thread panicked".into(),
                })
            });
            (produced, drained)
        });

        let drained = drained?;
        if produced.is_err() {
            return Err(failure
                .into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| KmerSpillError::Aborted {
                    details: "a producer failed without reporting why".into(),
                }));
        }

        let table = ring.current_table();
        let mut fragments = drained.fragments;
        let capped = drained.capped + table.capped();
        let residue = if config.dump_residue() {
            if let Some(fragment) = dumper.drain(table)? {
                progress.record_drain(fragment.records());
                fragments.push(fragment);
            }
            Vec::new()
        } else {
            let mut entries = table.entries();
            entries.sort_unstable_by_key(|&(key, _)| key);
            entries
        };

        let summary = RunSummary {
            progress: progress.snapshot(),
            files_written: dumper.files_written(),
            capped,
            writing_time: dumper.writing_time(),
            elapsed: start.elapsed(),
        };

        #[cfg(feature = "tracing")]
        {
            if capped > 0 {
                warn!(capped, "Counts were capped at the counter field maximum");
            }
            info!(
                kmers = summary.progress.kmers_counted,
                drains = summary.progress.drains,
                fragments = fragments.len(),
                residue = residue.len(),
                elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
                "K-mer counting complete"
            );
        }

        Ok(CountOutcome {
            k: config.k(),
            fragments,
            residue,
            summary,
            fan_in: config.merge_fan_in(),
        })
    }
}

fn add_windows(seq: &[u8], k: KmerLength, producer: &mut Producer<'_>) -> Result<u64, KmerSpillError> {
    let mut kmers = 0;
    for key in KmerWindows::new(seq, k) {
        producer.add(key)?;
        kmers += 1;
    }
    Ok(kmers)
}

/// Records `err` unless an earlier error already explains the failure.
///
/// An abort is only a consequence of another failure, so any other error
/// replaces it.
fn keep_root_cause(slot: &Mutex<Option<KmerSpillError>>, err: KmerSpillError) {
    let Ok(mut slot) = slot.lock() else {
        return;
    };
    let replace = match slot.as_ref() {
        None => true,
        Some(KmerSpillError::Aborted { .. }) => !matches!(err, KmerSpillError::Aborted { .. }),
        Some(_) => false,
    };
    if replace {
        *slot = Some(err);
    }
}

/// Reads and counts every input file.
///
/// # Errors
///
/// Returns the first read error or counting error.
pub fn count_files<P>(config: CounterConfig, inputs: &[P]) -> Result<CountOutcome, KmerSpillError>
where
    P: AsRef<Path> + Debug,
{
    Counter::new(config).count_files(inputs)
}

fn open_output(output: Option<&Path>) -> Result<Box<dyn Write>, KmerSpillError> {
    Ok(match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).map_err(|source| KmerSpillError::WriteError { source })?,
        )),
        None => Box::new(BufWriter::new(stdout())),
    })
}

/// Collects the regions of every fragment file in `paths`.
///
/// Every region is decoded and its checksum checked here, so a damaged file
/// is rejected before anything is written from it.
///
/// # Errors
///
/// Returns the first scan or verification error.
pub fn scan_all<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<DumpFragment>, KmerSpillError> {
    let mut fragments = Vec::new();
    for path in paths {
        fragments.extend(scan_fragments(path)?);
    }
    for fragment in &fragments {
        fragment.verify()?;
    }
    Ok(fragments)
}

fn fragments_k(fragments: &[DumpFragment], paths: &[PathBuf]) -> Result<KmerLength, KmerSpillError> {
    fragments.first().map(DumpFragment::k).ok_or_else(|| {
        KmerSpillError::invalid_fragment(
            "no regions found",
            paths.first().cloned().unwrap_or_default(),
        )
    })
}

/// Options of `kmerspill count`.
#[derive(Debug, Clone)]
pub struct CountOptions {
    /// Sequence files to count.
    pub inputs: Vec<PathBuf>,
    /// Counts emitted.
    pub range: CountRange,
    /// Output format.
    pub format: OutputFormat,
    /// Output file; stdout when `None`.
    pub output: Option<PathBuf>,
    /// Keep fragment files after merging.
    pub keep_fragments: bool,
}

/// Counts, merges and writes the counts of `options.inputs`.
///
/// # Errors
///
/// Returns the first read, count, merge or write error.
pub fn run_count(config: CounterConfig, options: &CountOptions) -> Result<RunSummary, KmerSpillError> {
    let outcome = count_files(config, &options.inputs)?;
    let mut out = open_output(options.output.as_deref())?;
    write_counts(
        &mut out,
        outcome.merge(options.range)?,
        outcome.k(),
        options.format,
    )?;
    if !options.keep_fragments {
        outcome.remove_fragments()?;
    }
    Ok(outcome.summary().clone())
}

/// Merges existing fragment files and writes the counts.
///
/// The output is only opened once every fragment has been verified.
///
/// # Errors
///
/// Returns the first scan, merge or write error.
pub fn run_dump(
    paths: &[PathBuf],
    range: CountRange,
    fan_in: usize,
    format: OutputFormat,
    output: Option<&Path>,
) -> Result<u64, KmerSpillError> {
    let fragments = scan_all(paths)?;
    let k = fragments_k(&fragments, paths)?;
    let merger = merge_with_fan_in(&fragments, Vec::new(), range, fan_in)?;
    let mut out = open_output(output)?;
    write_counts(&mut out, merger, k, format)
}

/// Computes statistics over existing fragment files.
///
/// # Errors
///
/// Returns the first scan or merge error.
pub fn run_stats(
    paths: &[PathBuf],
    range: CountRange,
    fan_in: usize,
) -> Result<CountStats, KmerSpillError> {
    let fragments = scan_all(paths)?;
    count_stats(merge_with_fan_in(&fragments, Vec::new(), range, fan_in)?)
}

/// Writes statistics in text or JSON form.
///
/// # Errors
///
/// Returns [`KmerSpillError::WriteError`] or [`KmerSpillError::JsonError`].
pub fn write_stats<W: Write>(
    writer: &mut W,
    stats: &CountStats,
    json: bool,
) -> Result<(), KmerSpillError> {
    if json {
        serde_json::to_writer_pretty(&mut *writer, stats)?;
        writeln!(writer)?;
    } else {
        writeln!(writer, "Unique:    {}", stats.unique)?;
        writeln!(writer, "Distinct:  {}", stats.distinct)?;
        writeln!(writer, "Total:     {}", stats.total)?;
        writeln!(writer, "Max_count: {}", stats.max_count)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the count-of-counts histogram of existing fragment files.
///
/// One `count frequency` line per count, ascending.
///
/// # Errors
///
/// Returns the first scan, merge or write error.
pub fn run_histo(
    paths: &[PathBuf],
    range: CountRange,
    fan_in: usize,
    output: Option<&Path>,
) -> Result<(), KmerSpillError> {
    let fragments = scan_all(paths)?;
    let histogram = compute_histogram(merge_with_fan_in(&fragments, Vec::new(), range, fan_in)?)?;

    #[cfg(feature = "tracing")]
    {
        let shape = histogram_stats(&histogram);
        info!(
            mode = shape.mode_count,
            mode_frequency = shape.mode_frequency,
            mean = shape.mean_count,
            "Computed histogram"
        );
    }

    let mut out = open_output(output)?;
    for (count, frequency) in &histogram {
        writeln!(out, "{count} {frequency}")?;
    }
    out.flush()?;
    Ok(())
}

/// Plain-text citation of the lock-free parallel k-mer counting paper.
pub const CITATION: &str = "\
A fast, lock-free approach for efficient parallel counting of occurrences of k-mers
Guillaume Marcais; Carl Kingsford
Bioinformatics (2011) 27(6): 764-770
first published online January 7, 2011 doi:10.1093/bioinformatics/btr011
";

/// [`CITATION`] as a bibtex entry.
pub const CITATION_BIBTEX: &str = "\
@article{Jellyfish,
  author = {Mar\\c{c}ais, Guillaume and Kingsford, Carl},
  title = {A fast, lock-free approach for efficient parallel counting of occurrences of k-mers},
  volume = {27},
  number = {6},
  pages = {764-770},
  year = {2011},
  doi = {10.1093/bioinformatics/btr011},
  URL = {http://bioinformatics.oxfordjournals.org/content/27/6/764.abstract},
  eprint = {http://bioinformatics.oxfordjournals.org/content/27/6/764.full.pdf+html},
  journal = {Bioinformatics}
}
";

/// Writes the citation, in bibtex form if asked.
///
/// # Errors
///
/// Returns [`KmerSpillError::WriteError`] if the output cannot be written.
pub fn run_cite(bibtex: bool, output: Option<&Path>) -> Result<(), KmerSpillError> {
    let mut out = open_output(output)?;
    out.write_all(if bibtex { CITATION_BIBTEX } else { CITATION }.as_bytes())?;
    out.flush()?;
    Ok(())
}
