//! Error types for kmerspill.
//!
//! Expected conditions such as a saturated table never show up here: they are
//! reported through [`Outcome`](crate::table::Outcome) and handled by draining.
//! Everything in this module is fatal to the run it happens in.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in kmerspill operations.
#[derive(Debug, Error)]
pub enum KmerSpillError {
    /// K-mer length is outside the valid range (1-32).
    #[error("invalid k-mer length {k}: must be between {min} and {max}")]
    InvalidKmerLength { k: usize, min: u8, max: u8 },

    /// The requested table layout or run settings cannot work together.
    #[error("invalid configuration: {details}")]
    Configuration { details: String },

    /// A slot's count field saturated while running with `OverflowPolicy::Fail`.
    #[error("count for k-mer {kmer} overflowed its {count_bits}-bit counter field")]
    SlotOverflow { kmer: String, count_bits: u8 },

    /// Failed to write a dump fragment.
    #[error("failed to write dump fragment '{path}': {source}")]
    DumpWrite {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to read a dump fragment.
    #[error("failed to read dump fragment '{path}': {source}")]
    DumpRead {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Invalid, truncated or corrupted dump fragment.
    #[error("invalid dump fragment '{path}': {details}")]
    InvalidFragment { details: String, path: PathBuf },

    /// Failed to read sequence file.
    #[error("failed to read sequence file '{path}': {details}")]
    SequenceRead { details: String, path: PathBuf },

    /// Failed to write output.
    #[error("failed to write output: {source}")]
    WriteError {
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize JSON output.
    #[error("failed to serialize JSON: {source}")]
    JsonError {
        #[source]
        source: serde_json::Error,
    },

    /// Failed to start the producer thread pool.
    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The run was cancelled through a [`CancelHandle`](crate::run::CancelHandle).
    #[error("counting was cancelled")]
    Cancelled,

    /// Another thread of the run failed and the run was torn down.
    #[error("counting was aborted: {details}")]
    Aborted { details: String },
}

/// Error for invalid k-mer length.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("k-mer length {k} is out of range: must be between {min} and {max}")]
pub struct KmerLengthError {
    /// The invalid k value that was provided.
    pub k: usize,
    /// Minimum valid k-mer length.
    pub min: u8,
    /// Maximum valid k-mer length.
    pub max: u8,
}

impl KmerSpillError {
    pub(crate) fn configuration(details: impl Into<String>) -> Self {
        Self::Configuration {
            details: details.into(),
        }
    }

    pub(crate) fn dump_write(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::DumpWrite {
            source,
            path: path.into(),
        }
    }

    pub(crate) fn dump_read(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::DumpRead {
            source,
            path: path.into(),
        }
    }

    pub(crate) fn invalid_fragment(details: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::InvalidFragment {
            details: details.into(),
            path: path.into(),
        }
    }
}

impl From<std::io::Error> for KmerSpillError {
    fn from(source: std::io::Error) -> Self {
        Self::WriteError { source }
    }
}

impl From<serde_json::Error> for KmerSpillError {
    fn from(source: serde_json::Error) -> Self {
        Self::JsonError { source }
    }
}

impl From<KmerLengthError> for KmerSpillError {
    fn from(err: KmerLengthError) -> Self {
        Self::InvalidKmerLength {
            k: err.k,
            min: err.min,
            max: err.max,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kmer_length_error_display() {
        let err = KmerLengthError {
            k: 50,
            min: 1,
            max: 32,
        };
        assert_eq!(
            err.to_string(),
            "k-mer length 50 is out of range: must be between 1 and 32"
        );
    }

    #[test]
    fn kmerspill_error_from_kmer_length_error() {
        let err: KmerSpillError = KmerLengthError {
            k: 0,
            min: 1,
            max: 32,
        }
        .into();
        assert!(matches!(err, KmerSpillError::InvalidKmerLength { k: 0, .. }));
    }

    #[test]
    fn dump_write_names_the_file() {
        let err = KmerSpillError::dump_write(
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            "counts_3",
        );
        assert_eq!(
            err.to_string(),
            "failed to write dump fragment 'counts_3': disk full"
        );
    }

    #[test]
    fn slot_overflow_display() {
        let err = KmerSpillError::SlotOverflow {
            kmer: "ACGT".to_string(),
            count_bits: 1,
        };
        assert_eq!(
            err.to_string(),
            "count for k-mer ACGT overflowed its 1-bit counter field"
        );
    }
}
