//! K-way merge of dump fragments.
//!
//! Every source yields `(key, count)` in ascending key order. The [`Merger`]
//! keeps one head per source in a min-heap, sums all heads sharing the
//! smallest key and yields the total if it falls in the requested
//! [`CountRange`]. Output keys are strictly increasing.
//!
//! Sorted fragments are streamed from disk. Unsorted fragments cannot be
//! streamed in order, so they are aggregated in memory first.
//!
//! At most `fan_in` sorted fragments are open at once. When a run left more
//! than that, groups of `fan_in` are first merged into intermediate fragments
//! next to the originals, pass after pass, until the rest fit. Intermediate
//! files are deleted when the final [`Merger`] is dropped.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fmt,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use rustc_hash::FxHashMap;

use crate::{
    error::KmerSpillError,
    fragment::{DumpFragment, FragmentReader, RegionWriter},
    kmer::KmerLength,
};

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

/// Default maximum number of sorted fragments read at once.
pub const DEFAULT_FAN_IN: usize = 64;

/// Inclusive bounds on the counts a merge emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountRange {
    /// Smallest count emitted.
    pub lower: u64,
    /// Largest count emitted.
    pub upper: u64,
}

impl Default for CountRange {
    fn default() -> Self {
        Self::ALL
    }
}

impl CountRange {
    /// Every count.
    pub const ALL: Self = Self {
        lower: 0,
        upper: u64::MAX,
    };

    /// A range from optional bounds; a missing bound is unbounded.
    #[must_use]
    pub fn new(lower: Option<u64>, upper: Option<u64>) -> Self {
        Self {
            lower: lower.unwrap_or(0),
            upper: upper.unwrap_or(u64::MAX),
        }
    }

    /// Whether `count` lies within the range.
    #[must_use]
    pub fn contains(&self, count: u64) -> bool {
        (self.lower..=self.upper).contains(&count)
    }
}

/// One ordered input of a merge.
pub enum MergeSource {
    /// A sorted fragment streamed from disk.
    Fragment(FragmentReader, PathBuf),
    /// Sorted records held in memory.
    Memory(std::vec::IntoIter<(u64, u64)>),
}

impl MergeSource {
    /// Streams a fragment, which must be sorted.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::InvalidFragment`] for an unsorted fragment,
    /// or any error opening it.
    pub fn fragment(fragment: &DumpFragment) -> Result<Self, KmerSpillError> {
        if !fragment.sorted() {
            return Err(KmerSpillError::invalid_fragment(
                "unsorted fragments must be aggregated before merging",
                fragment.path(),
            ));
        }
        Ok(Self::Fragment(
            fragment.reader()?,
            fragment.path().to_path_buf(),
        ))
    }

    /// Holds `entries` in memory, sorting them by key.
    #[must_use]
    pub fn memory(mut entries: Vec<(u64, u64)>) -> Self {
        entries.sort_unstable_by_key(|&(key, _)| key);
        Self::Memory(entries.into_iter())
    }

    /// Reads unsorted fragments completely and sums their counts per key.
    ///
    /// # Errors
    ///
    /// Returns the first read error.
    pub fn aggregate(fragments: &[&DumpFragment]) -> Result<Self, KmerSpillError> {
        let mut counts: FxHashMap<u64, u64> = FxHashMap::default();
        for fragment in fragments {
            for record in fragment.reader()? {
                let (key, count) = record?;
                let total = counts.entry(key).or_insert(0);
                *total = total.saturating_add(count);
            }
        }
        #[cfg(feature = "tracing")]
        debug!(
            fragments = fragments.len(),
            distinct = counts.len(),
            "Aggregated unsorted fragments"
        );
        Ok(Self::memory(counts.into_iter().collect()))
    }

    fn label(&self) -> &Path {
        match self {
            Self::Fragment(_, path) => path,
            Self::Memory(_) => Path::new("<memory>"),
        }
    }
}

impl Iterator for MergeSource {
    type Item = Result<(u64, u64), KmerSpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Fragment(reader, _) => reader.next(),
            Self::Memory(entries) => entries.next().map(Ok),
        }
    }
}

impl fmt::Debug for MergeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fragment(reader, path) => f
                .debug_struct("Fragment")
                .field("path", path)
                .field("remaining", &reader.remaining())
                .finish(),
            Self::Memory(entries) => f
                .debug_struct("Memory")
                .field("remaining", &entries.len())
                .finish(),
        }
    }
}

/// Streaming k-way merge yielding `(key, total count)` in ascending key order.
#[derive(Debug)]
pub struct Merger {
    sources: Vec<MergeSource>,
    heads: Vec<u64>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    range: CountRange,
    failed: bool,
    scratch: ScratchFiles,
}

impl Merger {
    /// Starts a merge over `sources`.
    ///
    /// # Errors
    ///
    /// Returns the first error reading the head of a source.
    pub fn new(sources: Vec<MergeSource>, range: CountRange) -> Result<Self, KmerSpillError> {
        let mut merger = Self {
            heads: vec![0; sources.len()],
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            range,
            failed: false,
            scratch: ScratchFiles::default(),
        };
        for index in 0..merger.sources.len() {
            merger.advance(index, None)?;
        }
        Ok(merger)
    }

    /// Number of sources being merged.
    #[must_use]
    pub fn sources(&self) -> usize {
        self.sources.len()
    }

    /// Intermediate files this merge deletes when dropped.
    #[must_use]
    pub fn scratch_files(&self) -> &[PathBuf] {
        &self.scratch.0
    }

    /// Pulls the next record of source `index` onto the heap.
    fn advance(&mut self, index: usize, previous: Option<u64>) -> Result<(), KmerSpillError> {
        let source = &mut self.sources[index];
        match source.next() {
            None => Ok(()),
            Some(Err(e)) => Err(e),
            Some(Ok((key, count))) => {
                if let Some(previous) = previous {
                    if key < previous {
                        return Err(KmerSpillError::invalid_fragment(
                            format!("source goes backwards ({key:#x} after {previous:#x})"),
                            source.label(),
                        ));
                    }
                }
                self.heads[index] = count;
                self.heap.push(Reverse((key, index)));
                Ok(())
            }
        }
    }

    fn next_total(&mut self) -> Result<Option<(u64, u64)>, KmerSpillError> {
        while let Some(Reverse((key, index))) = self.heap.pop() {
            let mut total = self.heads[index];
            self.advance(index, Some(key))?;
            while let Some(&Reverse((next, other))) = self.heap.peek() {
                if next != key {
                    break;
                }
                self.heap.pop();
                total = total.saturating_add(self.heads[other]);
                self.advance(other, Some(key))?;
            }
            if self.range.contains(total) {
                return Ok(Some((key, total)));
            }
        }
        Ok(None)
    }
}

impl Iterator for Merger {
    type Item = Result<(u64, u64), KmerSpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_total() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Intermediate fragment files, removed on drop.
#[derive(Debug, Default)]
struct ScratchFiles(Vec<PathBuf>);

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in self.0.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                #[cfg(feature = "tracing")]
                warn!(path = %path.display(), error = %e, "Failed to remove intermediate fragment");
                #[cfg(not(feature = "tracing"))]
                drop(e);
            }
        }
    }
}

fn scratch_path(first: &Path, pass: usize, group: usize) -> PathBuf {
    let mut name = first.as_os_str().to_owned();
    name.push(format!(".merge{pass}_{group}"));
    PathBuf::from(name)
}

/// Merges `group` into one sorted fragment at `path`.
fn merge_group(
    group: &[DumpFragment],
    k: KmerLength,
    path: &Path,
) -> Result<DumpFragment, KmerSpillError> {
    let sources = group
        .iter()
        .map(MergeSource::fragment)
        .collect::<Result<Vec<_>, _>>()?;
    let merger = Merger::new(sources, CountRange::ALL)?;

    let file = File::create(path).map_err(|e| KmerSpillError::dump_write(e, path))?;
    let mut writer = BufWriter::new(file);
    let mut region =
        RegionWriter::new(&mut writer, k, true).map_err(|e| KmerSpillError::dump_write(e, path))?;
    for record in merger {
        let (key, count) = record?;
        region
            .push(key, count)
            .map_err(|e| KmerSpillError::dump_write(e, path))?;
    }
    let records = region.records();
    let len = region
        .finish()
        .map_err(|e| KmerSpillError::dump_write(e, path))?;
    writer
        .flush()
        .map_err(|e| KmerSpillError::dump_write(e, path))?;

    Ok(DumpFragment::new(path.to_path_buf(), 0, len, records, true, k))
}

/// Merges sorted fragments in groups of `fan_in` until at most `fan_in` remain.
///
/// Returns the remaining fragments and the intermediate files still in use.
fn reduce_fan_in(
    mut fragments: Vec<DumpFragment>,
    fan_in: usize,
) -> Result<(Vec<DumpFragment>, ScratchFiles), KmerSpillError> {
    let mut scratch = ScratchFiles::default();
    let mut pass = 0;
    while fragments.len() > fan_in {
        pass += 1;
        let mut written = ScratchFiles::default();
        let mut next = Vec::with_capacity(fragments.len().div_ceil(fan_in));
        for (index, group) in fragments.chunks(fan_in).enumerate() {
            if let [single] = group {
                next.push(single.clone());
                continue;
            }
            let path = scratch_path(group[0].path(), pass, index);
            written.0.push(path.clone());
            next.push(merge_group(group, group[0].k(), &path)?);
        }

        #[cfg(feature = "tracing")]
        info!(
            pass,
            inputs = fragments.len(),
            outputs = next.len(),
            "Merged fragments into intermediate fragments"
        );

        // the previous pass's files are fully consumed; a lone carried-over
        // fragment keeps its file alive into the next pass
        let carried: Vec<PathBuf> = scratch
            .0
            .iter()
            .filter(|path| next.iter().any(|f| f.path() == path.as_path()))
            .cloned()
            .collect();
        scratch.0.retain(|path| !carried.contains(path));
        drop(scratch);
        written.0.extend(carried);
        scratch = written;
        fragments = next;
    }
    Ok((fragments, scratch))
}

/// Merges `fragments` and the in-memory `residue` into one ordered stream.
///
/// Sorted fragments are streamed; unsorted ones are aggregated in memory
/// first. All fragments must share one k-mer length. At most
/// [`DEFAULT_FAN_IN`] fragment files are open at once; see
/// [`merge_with_fan_in`].
///
/// # Errors
///
/// Returns [`KmerSpillError::InvalidFragment`] if fragments disagree on the
/// k-mer length, or the first error opening or reading a fragment.
pub fn merge(
    fragments: &[DumpFragment],
    residue: Vec<(u64, u64)>,
    range: CountRange,
) -> Result<Merger, KmerSpillError> {
    merge_with_fan_in(fragments, residue, range, DEFAULT_FAN_IN)
}

/// Like [`merge`], opening at most `fan_in` sorted fragments at once.
///
/// Extra fragments are first merged into intermediate files named
/// `<fragment>.merge<pass>_<group>` beside the first fragment of each group.
///
/// # Errors
///
/// Returns [`KmerSpillError::Configuration`] if `fan_in` is below 2,
/// [`KmerSpillError::DumpWrite`] if an intermediate file cannot be written,
/// or any error of [`merge`].
pub fn merge_with_fan_in(
    fragments: &[DumpFragment],
    residue: Vec<(u64, u64)>,
    range: CountRange,
    fan_in: usize,
) -> Result<Merger, KmerSpillError> {
    if fan_in < 2 {
        return Err(KmerSpillError::configuration(format!(
            "merge fan-in {fan_in} must be at least 2"
        )));
    }
    if let Some(first) = fragments.first() {
        if let Some(other) = fragments.iter().find(|f| f.k() != first.k()) {
            return Err(KmerSpillError::invalid_fragment(
                format!(
                    "k-mer length {} differs from {} in '{}'",
                    other.k(),
                    first.k(),
                    first.path().display()
                ),
                other.path(),
            ));
        }
    }

    let (sorted, unsorted): (Vec<DumpFragment>, Vec<DumpFragment>) =
        fragments.iter().cloned().partition(DumpFragment::sorted);
    let (sorted, scratch) = reduce_fan_in(sorted, fan_in)?;

    let mut sources = sorted
        .iter()
        .map(MergeSource::fragment)
        .collect::<Result<Vec<_>, _>>()?;
    if !unsorted.is_empty() {
        let unsorted: Vec<&DumpFragment> = unsorted.iter().collect();
        sources.push(MergeSource::aggregate(&unsorted)?);
    }
    if !residue.is_empty() {
        sources.push(MergeSource::memory(residue));
    }

    #[cfg(feature = "tracing")]
    debug!(
        fragments = fragments.len(),
        sources = sources.len(),
        intermediate = scratch.0.len(),
        lower = range.lower,
        upper = range.upper,
        "Merging fragments"
    );

    let mut merger = Merger::new(sources, range)?;
    merger.scratch = scratch;
    Ok(merger)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        fragment::{scan_fragments, write_region},
        kmer::{encode, KmerLength},
    };
    use std::collections::BTreeMap;
    use tempfile::{NamedTempFile, TempDir};

    fn fragment(k: usize, sorted: bool, entries: &[(u64, u64)]) -> (NamedTempFile, DumpFragment) {
        let mut tmp = NamedTempFile::new().unwrap();
        write_region(
            tmp.as_file_mut(),
            KmerLength::new(k).unwrap(),
            sorted,
            entries,
        )
        .unwrap();
        let fragment = scan_fragments(tmp.path()).unwrap().remove(0);
        (tmp, fragment)
    }

    fn collect(merger: Merger) -> Vec<(u64, u64)> {
        merger.collect::<Result<Vec<_>, _>>().unwrap()
    }

    fn abc() -> (u64, u64, u64) {
        (
            encode(b"AAAC").unwrap(),
            encode(b"AACA").unwrap(),
            encode(b"ACAA").unwrap(),
        )
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let range = CountRange::new(Some(2), Some(5));
        assert!(!range.contains(1));
        assert!(range.contains(2));
        assert!(range.contains(5));
        assert!(!range.contains(6));
        assert_eq!(CountRange::new(None, None), CountRange::ALL);
    }

    #[test]
    fn sums_counts_across_fragments() {
        let (a, b, c) = abc();
        let (_t1, f1) = fragment(4, true, &[(a, 3), (b, 2)]);
        let (_t2, f2) = fragment(4, true, &[(a, 4), (c, 1)]);
        let merged = collect(merge(&[f1, f2], vec![], CountRange::ALL).unwrap());
        assert_eq!(merged, vec![(a, 7), (b, 2), (c, 1)]);
    }

    #[test]
    fn filter_excludes_out_of_range_counts() {
        let (a, b, c) = abc();
        let (_t1, f1) = fragment(4, true, &[(a, 3), (b, 2)]);
        let (_t2, f2) = fragment(4, true, &[(a, 4), (c, 1)]);
        let fragments = [f1, f2];

        let two_to_five = CountRange::new(Some(2), Some(5));
        let merged = collect(merge(&fragments, vec![], two_to_five).unwrap());
        assert_eq!(merged, vec![(b, 2)]);

        let one_to_five = CountRange::new(Some(1), Some(5));
        let merged = collect(merge(&fragments, vec![], one_to_five).unwrap());
        assert_eq!(merged, vec![(b, 2), (c, 1)]);
    }

    #[test]
    fn single_fragment_is_reproduced() {
        let entries = vec![(1, 5), (2, 1), (40, 300), (41, 2)];
        let (_t, f) = fragment(8, true, &entries);
        let merged = collect(merge(std::slice::from_ref(&f), vec![], CountRange::ALL).unwrap());
        assert_eq!(merged, entries);
    }

    #[test]
    fn unsorted_fragments_and_residue() {
        let (_t1, f1) = fragment(8, false, &[(9, 1), (3, 2), (7, 1)]);
        let (_t2, f2) = fragment(8, false, &[(3, 1), (1, 1)]);
        let (_t3, f3) = fragment(8, true, &[(2, 2), (9, 4)]);
        let residue = vec![(7, 10), (4, 1)];
        let merged = collect(merge(&[f1, f2, f3], residue, CountRange::ALL).unwrap());
        assert_eq!(merged, vec![(1, 1), (2, 2), (3, 3), (4, 1), (7, 11), (9, 5)]);
    }

    #[test]
    fn duplicate_keys_within_one_source_are_summed() {
        let sources = vec![
            MergeSource::memory(vec![(5, 1), (5, 2), (6, 1)]),
            MergeSource::memory(vec![(5, 4)]),
        ];
        let merged = collect(Merger::new(sources, CountRange::ALL).unwrap());
        assert_eq!(merged, vec![(5, 7), (6, 1)]);
    }

    #[test]
    fn sums_saturate() {
        let sources = vec![
            MergeSource::memory(vec![(1, u64::MAX)]),
            MergeSource::memory(vec![(1, 10)]),
        ];
        let merged = collect(Merger::new(sources, CountRange::ALL).unwrap());
        assert_eq!(merged, vec![(1, u64::MAX)]);
    }

    #[test]
    fn no_sources_yield_nothing() {
        assert!(collect(merge(&[], vec![], CountRange::ALL).unwrap()).is_empty());
    }

    #[test]
    fn mixed_k_is_rejected() {
        let (_t1, f1) = fragment(4, true, &[(1, 1)]);
        let (_t2, f2) = fragment(5, true, &[(1, 1)]);
        let err = merge(&[f1, f2], vec![], CountRange::ALL).unwrap_err();
        assert!(err.to_string().contains("differs"));
    }

    /// Writes `n` overlapping sorted fragments into `dir` and the summed reference.
    fn many_fragments(dir: &TempDir, n: u64) -> (Vec<DumpFragment>, BTreeMap<u64, u64>) {
        let mut reference = BTreeMap::new();
        let mut fragments = Vec::new();
        for i in 0..n {
            let entries: Vec<(u64, u64)> = (0..50).map(|j| (j * (i % 3 + 1), i + 1)).collect();
            let mut sorted = entries.clone();
            sorted.sort_unstable();
            for &(key, count) in &sorted {
                *reference.entry(key).or_insert(0) += count;
            }
            let path = dir.path().join(format!("mer_{i}"));
            let mut file = std::fs::File::create(&path).unwrap();
            write_region(&mut file, KmerLength::new(8).unwrap(), true, &sorted).unwrap();
            fragments.extend(scan_fragments(&path).unwrap());
        }
        (fragments, reference)
    }

    #[test]
    fn merges_more_fragments_than_the_fan_in() {
        let dir = TempDir::new().unwrap();
        let (fragments, reference) = many_fragments(&dir, 23);

        let merger = merge_with_fan_in(&fragments, vec![], CountRange::ALL, 4).unwrap();
        assert!(merger.sources() <= 4, "{} sources open", merger.sources());
        let scratch = merger.scratch_files().to_vec();
        assert!(!scratch.is_empty());
        assert!(scratch.iter().all(|path| path.exists()));

        let merged = collect(merger);
        assert_eq!(merged, reference.into_iter().collect::<Vec<_>>());
        assert!(scratch.iter().all(|path| !path.exists()));
        // only the original fragments remain
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 23);
    }

    #[test]
    fn bounded_fan_in_filters_only_final_totals() {
        let dir = TempDir::new().unwrap();
        let (fragments, reference) = many_fragments(&dir, 9);
        let range = CountRange::new(Some(20), Some(30));
        let residue = vec![(0, 1)];

        let merged = collect(merge_with_fan_in(&fragments, residue.clone(), range, 2).unwrap());
        let mut expected = reference;
        *expected.entry(0).or_insert(0) += 1;
        let expected: Vec<_> = expected.into_iter().filter(|&(_, c)| range.contains(c)).collect();
        assert_eq!(merged, expected);
        assert_eq!(merged, collect(merge(&fragments, residue, range).unwrap()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 9);
    }

    #[test]
    fn fan_in_below_two_is_rejected() {
        let err = merge_with_fan_in(&[], vec![], CountRange::ALL, 1).unwrap_err();
        assert!(matches!(err, KmerSpillError::Configuration { .. }));
    }

    #[test]
    fn corrupted_fragment_surfaces_as_error() {
        let (t, f) = fragment(8, true, &[(1, 1), (2, 2), (3, 3)]);
        let mut bytes = std::fs::read(t.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(t.path(), &bytes).unwrap();

        let results: Vec<_> = merge(&[f], vec![], CountRange::ALL).unwrap().collect();
        assert!(results.iter().any(Result::is_err));
        assert!(results.last().unwrap().is_err());
    }
}
