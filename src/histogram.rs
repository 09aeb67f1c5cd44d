//! Count-of-counts histograms and summary statistics.
//!
//! Both are computed in one pass over a merged stream, so they work on runs
//! far larger than memory.
//!
//! # Example
//!
//! ```rust
//! use kmerspill::histogram::{compute_histogram, CountStats};
//!
//! let merged = vec![Ok((1, 1)), Ok((2, 1)), Ok((3, 2)), Ok((4, 5))];
//! let histogram = compute_histogram(merged)?;
//!
//! assert_eq!(histogram.get(&1), Some(&2));
//! assert_eq!(CountStats::from_histogram(&histogram).total, 9);
//! # Ok::<(), kmerspill::error::KmerSpillError>(())
//! ```

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::KmerSpillError;

/// Maps count -> number of distinct k-mers with that count, in ascending count order.
pub type KmerHistogram = BTreeMap<u64, u64>;

/// Totals over a set of counts, as reported by `kmerspill stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountStats {
    /// K-mers seen exactly once.
    pub unique: u64,
    /// Distinct k-mers.
    pub distinct: u64,
    /// Total occurrences.
    pub total: u64,
    /// Largest count.
    pub max_count: u64,
}

impl CountStats {
    /// Adds one k-mer with `count` occurrences.
    pub fn record(&mut self, count: u64) {
        if count == 1 {
            self.unique += 1;
        }
        self.distinct += 1;
        self.total = self.total.saturating_add(count);
        self.max_count = self.max_count.max(count);
    }

    /// Statistics described by a histogram.
    #[must_use]
    pub fn from_histogram(histogram: &KmerHistogram) -> Self {
        Self {
            unique: histogram.get(&1).copied().unwrap_or(0),
            distinct: histogram.values().sum(),
            total: histogram
                .iter()
                .fold(0u64, |total, (c, f)| total.saturating_add(c.saturating_mul(*f))),
            max_count: histogram.keys().next_back().copied().unwrap_or(0),
        }
    }
}

/// Shape of a histogram.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramStats {
    /// The count value shared by the most k-mers.
    pub mode_count: u64,
    /// Number of k-mers with the mode count.
    pub mode_frequency: u64,
    /// Average count per distinct k-mer.
    pub mean_count: f64,
}

/// Builds a histogram from a merged stream.
///
/// # Errors
///
/// Returns the first error from `counts`.
pub fn compute_histogram<I>(counts: I) -> Result<KmerHistogram, KmerSpillError>
where
    I: IntoIterator<Item = Result<(u64, u64), KmerSpillError>>,
{
    let mut histogram = KmerHistogram::new();
    for record in counts {
        let (_, count) = record?;
        *histogram.entry(count).or_insert(0) += 1;
    }
    Ok(histogram)
}

/// Computes [`CountStats`] from a merged stream.
///
/// # Errors
///
/// Returns the first error from `counts`.
pub fn count_stats<I>(counts: I) -> Result<CountStats, KmerSpillError>
where
    I: IntoIterator<Item = Result<(u64, u64), KmerSpillError>>,
{
    let mut stats = CountStats::default();
    for record in counts {
        let (_, count) = record?;
        stats.record(count);
    }
    Ok(stats)
}

/// Mode and mean of a histogram. Ties for the mode go to the smaller count.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn histogram_stats(histogram: &KmerHistogram) -> HistogramStats {
    let stats = CountStats::from_histogram(histogram);

    let (mode_count, mode_frequency) = histogram
        .iter()
        .fold((0, 0), |best, (&c, &f)| if f > best.1 { (c, f) } else { best });

    HistogramStats {
        mode_count,
        mode_frequency,
        mean_count: if stats.distinct > 0 {
            stats.total as f64 / stats.distinct as f64
        } else {
            0.0
        },
    }
}
