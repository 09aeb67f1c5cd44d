//! Sequence input.
//!
//! FASTA and FASTQ parsing is delegated to `bio`; this module only picks the
//! parser and hands back raw sequences. Files are read lazily, record by
//! record, and [`SequenceChunks`] groups records into bounded batches so a
//! counting run never holds more than a few chunks of input at once.

use std::{
    ffi::OsStr,
    fmt::Debug,
    path::{Path, PathBuf},
};

use bytes::Bytes;

use crate::error::KmerSpillError;

#[cfg(feature = "tracing")]
use tracing::{debug, info_span};

/// Default number of bases gathered into one chunk.
pub const DEFAULT_CHUNK_BASES: usize = 1 << 20;

/// Owned sequences of one file, read on demand.
pub type SequenceRecords = Box<dyn Iterator<Item = Result<Bytes, KmerSpillError>> + Send>;

/// Trait for extracting sequence data from records.
trait SequenceRecord {
    fn seq(&self) -> &[u8];
}

impl SequenceRecord for bio::io::fasta::Record {
    fn seq(&self) -> &[u8] {
        bio::io::fasta::Record::seq(self)
    }
}

impl SequenceRecord for bio::io::fastq::Record {
    fn seq(&self) -> &[u8] {
        bio::io::fastq::Record::seq(self)
    }
}

fn to_bytes<R: SequenceRecord>(record: &R) -> Bytes {
    Bytes::copy_from_slice(record.seq())
}

/// Whether `path` names a FASTQ file (`.fq` / `.fastq`); everything else is read as FASTA.
#[must_use]
pub fn is_fastq(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("fq") || ext.eq_ignore_ascii_case("fastq"))
}

fn sequence_error(path: &Path, err: impl std::fmt::Display) -> KmerSpillError {
    KmerSpillError::SequenceRead {
        details: err.to_string(),
        path: path.to_path_buf(),
    }
}

/// Opens a FASTA or FASTQ file and streams its sequences.
///
/// # Errors
///
/// Returns [`KmerSpillError::SequenceRead`] if the file cannot be opened.
/// A malformed record surfaces as an error item.
pub fn sequence_records<P: AsRef<Path>>(path: P) -> Result<SequenceRecords, KmerSpillError> {
    let path = path.as_ref().to_path_buf();

    #[cfg(feature = "tracing")]
    debug!(path = %path.display(), fastq = is_fastq(&path), "Opening sequence file");

    if is_fastq(&path) {
        let records = bio::io::fastq::Reader::from_file(&path)
            .map_err(|e| sequence_error(&path, e))?
            .records();
        Ok(Box::new(records.map(move |record| {
            record
                .map(|record| to_bytes(&record))
                .map_err(|e| sequence_error(&path, e))
        })))
    } else {
        let records = bio::io::fasta::Reader::from_file(&path)
            .map_err(|e| sequence_error(&path, e))?
            .records();
        Ok(Box::new(records.map(move |record| {
            record
                .map(|record| to_bytes(&record))
                .map_err(|e| sequence_error(&path, e))
        })))
    }
}

/// Reads every sequence of a FASTA or FASTQ file.
///
/// # Errors
///
/// Returns [`KmerSpillError::SequenceRead`] if the file cannot be opened or
/// holds a malformed record.
pub fn read_sequences<P: AsRef<Path> + Debug>(path: P) -> Result<Vec<Bytes>, KmerSpillError> {
    #[cfg(feature = "tracing")]
    let _read_span = info_span!("read_sequences", path = ?path).entered();

    let sequences = sequence_records(path)?.collect::<Result<Vec<_>, _>>()?;

    #[cfg(feature = "tracing")]
    debug!(sequences = sequences.len(), "Read sequences from file");

    Ok(sequences)
}

/// Batches of sequences read lazily from a list of files.
///
/// Each chunk holds whole sequences totalling at least `max_bases` bases,
/// except the last. A sequence longer than `max_bases` forms a chunk on its
/// own. Files are opened one at a time, in order. After the first error the
/// iterator is exhausted.
pub struct SequenceChunks {
    paths: std::vec::IntoIter<PathBuf>,
    current: Option<SequenceRecords>,
    max_bases: usize,
    failed: bool,
}

impl SequenceChunks {
    /// Chunks over `paths` of about `max_bases` bases each.
    #[must_use]
    pub fn new(paths: Vec<PathBuf>, max_bases: usize) -> Self {
        Self {
            paths: paths.into_iter(),
            current: None,
            max_bases: max_bases.max(1),
            failed: false,
        }
    }

    fn fail(&mut self, err: KmerSpillError) -> Option<Result<Vec<Bytes>, KmerSpillError>> {
        self.failed = true;
        self.current = None;
        Some(Err(err))
    }
}

impl Debug for SequenceChunks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceChunks")
            .field("pending_files", &self.paths.len())
            .field("reading", &self.current.is_some())
            .field("max_bases", &self.max_bases)
            .finish()
    }
}

impl Iterator for SequenceChunks {
    type Item = Result<Vec<Bytes>, KmerSpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut chunk = Vec::new();
        let mut bases = 0usize;
        while bases < self.max_bases {
            if self.current.is_none() {
                let Some(path) = self.paths.next() else {
                    break;
                };
                match sequence_records(&path) {
                    Ok(records) => self.current = Some(records),
                    Err(e) => return self.fail(e),
                }
            }
            match self.current.as_mut().and_then(Iterator::next) {
                Some(Ok(sequence)) => {
                    bases += sequence.len();
                    chunk.push(sequence);
                }
                Some(Err(e)) => return self.fail(e),
                None => self.current = None,
            }
        }
        (!chunk.is_empty()).then_some(Ok(chunk))
    }
}
