//! Writing table snapshots to disk.
//!
//! A [`Dumper`] turns the contents of a retired table into one fragment
//! region. It owns the naming and rotation of fragment files and makes every
//! region durable before returning, so the caller may clear the table as soon
//! as [`Dumper::drain`] succeeds.

use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{
    config::{CounterConfig, FileRotation, FragmentOrder},
    error::KmerSpillError,
    fragment::{write_region, DumpFragment},
    kmer::KmerLength,
    table::CountingTable,
};

#[cfg(feature = "tracing")]
use tracing::{debug, info, warn};

/// Path of the `index`-th numbered fragment for `prefix`: `<prefix>_<index>`.
#[must_use]
pub fn numbered_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(format!("_{index}"));
    PathBuf::from(name)
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Deletes a temporary file left by a failed write, if there is one.
fn remove_temporary(tmp: &Path) {
    match fs::remove_file(tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            #[cfg(feature = "tracing")]
            warn!(path = %tmp.display(), error = %e, "Failed to remove temporary dump file");
            #[cfg(not(feature = "tracing"))]
            drop(e);
        }
    }
}

/// The append target of a one-file run.
#[derive(Debug)]
struct SharedFile {
    file: File,
    committed: u64,
}

/// Writes drained tables as fragment regions.
#[derive(Debug)]
pub struct Dumper {
    k: KmerLength,
    prefix: PathBuf,
    rotation: FileRotation,
    order: FragmentOrder,
    next_index: usize,
    shared: Option<SharedFile>,
    writing_time: Duration,
    files_written: usize,
    regions_written: usize,
}

impl Dumper {
    /// A dumper using the prefix, rotation and order of `config`.
    #[must_use]
    pub fn new(config: &CounterConfig) -> Self {
        Self::with_settings(
            config.k(),
            config.prefix(),
            config.rotation(),
            config.order(),
        )
    }

    /// A dumper with explicit settings.
    #[must_use]
    pub fn with_settings(
        k: KmerLength,
        prefix: impl Into<PathBuf>,
        rotation: FileRotation,
        order: FragmentOrder,
    ) -> Self {
        Self {
            k,
            prefix: prefix.into(),
            rotation,
            order,
            next_index: 0,
            shared: None,
            writing_time: Duration::ZERO,
            files_written: 0,
            regions_written: 0,
        }
    }

    /// Total time spent encoding and writing regions.
    #[must_use]
    pub const fn writing_time(&self) -> Duration {
        self.writing_time
    }

    /// Number of files created so far.
    #[must_use]
    pub const fn files_written(&self) -> usize {
        self.files_written
    }

    /// Number of regions written so far.
    #[must_use]
    pub const fn regions_written(&self) -> usize {
        self.regions_written
    }

    /// Writes the occupied entries of `table` as one region.
    ///
    /// Returns `None` without touching the filesystem when the table is empty.
    /// The table itself is not cleared.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::DumpWrite`] if the region cannot be written
    /// and synced. No partial region is left behind.
    pub fn drain(&mut self, table: &CountingTable) -> Result<Option<DumpFragment>, KmerSpillError> {
        self.write_entries(table.entries())
    }

    /// Writes `entries` as one region, sorting them first if configured.
    ///
    /// # Errors
    ///
    /// See [`drain`](Self::drain).
    pub fn write_entries(
        &mut self,
        mut entries: Vec<(u64, u64)>,
    ) -> Result<Option<DumpFragment>, KmerSpillError> {
        if entries.is_empty() {
            return Ok(None);
        }
        let start = Instant::now();
        let sorted = self.order == FragmentOrder::Sorted;
        if sorted {
            entries.sort_unstable_by_key(|&(key, _)| key);
        }

        let fragment = match self.rotation {
            FileRotation::Numbered => self.write_numbered(&entries, sorted)?,
            FileRotation::OneFile => self.append_shared(&entries, sorted)?,
        };
        self.regions_written += 1;

        let elapsed = start.elapsed();
        self.writing_time += elapsed;

        #[cfg(feature = "tracing")]
        info!(
            path = ?fragment.path(),
            offset = fragment.offset(),
            records = fragment.records(),
            bytes = fragment.len(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Wrote dump fragment"
        );

        Ok(Some(fragment))
    }

    fn write_numbered(
        &mut self,
        entries: &[(u64, u64)],
        sorted: bool,
    ) -> Result<DumpFragment, KmerSpillError> {
        let path = numbered_path(&self.prefix, self.next_index);
        let tmp = temporary_path(&path);

        let result = write_synced(&tmp, self.k, sorted, entries)
            .and_then(|len| {
                fs::rename(&tmp, &path).map_err(|e| KmerSpillError::dump_write(e, &path))?;
                Ok(len)
            });
        let len = match result {
            Ok(len) => len,
            Err(err) => {
                remove_temporary(&tmp);
                return Err(err);
            }
        };

        self.next_index += 1;
        self.files_written += 1;
        Ok(DumpFragment::new(
            path,
            0,
            len,
            entries.len() as u64,
            sorted,
            self.k,
        ))
    }

    fn append_shared(
        &mut self,
        entries: &[(u64, u64)],
        sorted: bool,
    ) -> Result<DumpFragment, KmerSpillError> {
        let path = self.prefix.clone();
        if self.shared.is_none() {
            // first drain of the run truncates whatever an earlier run left
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
                .map_err(|e| KmerSpillError::dump_write(e, &path))?;
            self.shared = Some(SharedFile { file, committed: 0 });
            self.files_written += 1;
            #[cfg(feature = "tracing")]
            debug!(path = ?path, "Opened one-file dump target");
        }
        let Some(shared) = self.shared.as_mut() else {
            return Err(KmerSpillError::configuration("one-file dump target missing"));
        };

        let offset = shared.committed;
        let result = append_region(&mut shared.file, offset, self.k, sorted, entries);
        match result {
            Ok(len) => {
                shared.committed += len;
                Ok(DumpFragment::new(
                    path,
                    offset,
                    len,
                    entries.len() as u64,
                    sorted,
                    self.k,
                ))
            }
            Err(source) => {
                // roll back to the last complete region
                if let Err(rollback) = shared.file.set_len(offset) {
                    #[cfg(feature = "tracing")]
                    warn!(
                        path = %path.display(),
                        offset,
                        error = %rollback,
                        "Failed to truncate partial region; the file ends in garbage"
                    );
                    #[cfg(not(feature = "tracing"))]
                    drop(rollback);
                }
                Err(KmerSpillError::dump_write(source, path))
            }
        }
    }
}

fn write_synced(
    path: &Path,
    k: KmerLength,
    sorted: bool,
    entries: &[(u64, u64)],
) -> Result<u64, KmerSpillError> {
    let file = File::create(path).map_err(|e| KmerSpillError::dump_write(e, path))?;
    let mut writer = BufWriter::new(file);
    let len = write_region(&mut writer, k, sorted, entries)
        .map_err(|e| KmerSpillError::dump_write(e, path))?;
    let file = writer
        .into_inner()
        .map_err(|e| KmerSpillError::dump_write(e.into_error(), path))?;
    file.sync_data()
        .map_err(|e| KmerSpillError::dump_write(e, path))?;
    Ok(len)
}

fn append_region(
    file: &mut File,
    offset: u64,
    k: KmerLength,
    sorted: bool,
    entries: &[(u64, u64)],
) -> std::io::Result<u64> {
    file.seek(SeekFrom::Start(offset))?;
    let mut writer = BufWriter::new(&mut *file);
    let len = write_region(&mut writer, k, sorted, entries)?;
    writer.flush()?;
    drop(writer);
    file.sync_data()?;
    Ok(len)
}
