//! On-disk dump fragments.
//!
//! Every drain writes one region. Numbered files hold a single region; a
//! one-file run appends regions back to back, so a file is a sequence of:
//!
//! ```text
//! +-------+---------+------+-------+---------+-------------+-----------+-------+
//! | MAGIC | VERSION |  K   | FLAGS | RECORDS | PAYLOAD_LEN |  PAYLOAD  | CRC32 |
//! |   4   |    1    |  1   |   1   |    8    |      8      |  (varies) |   4   |
//! +-------+---------+------+-------+---------+-------------+-----------+-------+
//!
//! MAGIC:       "KMSF"
//! FLAGS:       bit 0 set when records are sorted by key
//! RECORDS:     record count (little-endian u64)
//! PAYLOAD_LEN: payload size in bytes (little-endian u64)
//! PAYLOAD:     per record, the key in ceil(2k / 8) little-endian bytes
//!              followed by the count as an LEB128 varint
//! CRC32:       IEEE CRC32 of payload then header (little-endian)
//! ```
//!
//! The checksum covers the header last so a [`RegionWriter`] can stream the
//! payload and patch the header once the record count is known.
//!
//! A [`FragmentReader`] yields records as it decodes them and reports a bad
//! checksum as its final item. Callers that must not act on a damaged region
//! before seeing the error run [`DumpFragment::verify`] first.

use std::{
    collections::BTreeSet,
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{error::KmerSpillError, kmer::KmerLength};

/// Magic bytes opening every region.
pub const MAGIC: &[u8; 4] = b"KMSF";

/// Current format version.
pub const VERSION: u8 = 1;

/// Size of a region header in bytes.
pub const HEADER_LEN: usize = 4 + 1 + 1 + 1 + 8 + 8;

const CRC_LEN: usize = 4;
const FLAG_SORTED: u8 = 1;
const MAX_VARINT_LEN: usize = 10;

/// One region of a fragment file: the output of a single drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpFragment {
    path: PathBuf,
    offset: u64,
    len: u64,
    records: u64,
    sorted: bool,
    k: KmerLength,
}

impl DumpFragment {
    pub(crate) const fn new(
        path: PathBuf,
        offset: u64,
        len: u64,
        records: u64,
        sorted: bool,
        k: KmerLength,
    ) -> Self {
        Self {
            path,
            offset,
            len,
            records,
            sorted,
            k,
        }
    }

    /// File holding the region.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the region within the file.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Region size in bytes, header and checksum included.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the region holds no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Number of `(key, count)` records.
    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }

    /// Whether records are in ascending key order.
    #[must_use]
    pub const fn sorted(&self) -> bool {
        self.sorted
    }

    /// K-mer length of the keys.
    #[must_use]
    pub const fn k(&self) -> KmerLength {
        self.k
    }

    /// Opens a streaming reader over the records.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the header is invalid.
    pub fn reader(&self) -> Result<FragmentReader, KmerSpillError> {
        FragmentReader::open(&self.path, self.offset)
    }

    /// Reads every record, verifying the checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot be read or is corrupted.
    pub fn read_all(&self) -> Result<Vec<(u64, u64)>, KmerSpillError> {
        self.reader()?.collect()
    }

    /// Decodes the whole region and checks its checksum without keeping the records.
    ///
    /// # Errors
    ///
    /// Returns the first decoding error or a checksum mismatch.
    pub fn verify(&self) -> Result<(), KmerSpillError> {
        for record in self.reader()? {
            record?;
        }
        Ok(())
    }
}

/// CRC32 (IEEE polynomial) lookup table.
#[allow(clippy::cast_possible_truncation)]
const CRC_TABLE: [u32; 256] = {
    const POLYNOMIAL: u32 = 0xEDB8_8320;
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Incremental CRC32.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Crc32(u32);

impl Crc32 {
    pub(crate) const fn new() -> Self {
        Self(!0)
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.0 = CRC_TABLE[((self.0 ^ u32::from(byte)) & 0xFF) as usize] ^ (self.0 >> 8);
        }
    }

    pub(crate) const fn finish(self) -> u32 {
        !self.0
    }
}

/// CRC32 of `data`.
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finish()
}

fn key_bytes(k: KmerLength) -> usize {
    (usize::from(k.as_u8()) * 2).div_ceil(8)
}

#[allow(clippy::cast_possible_truncation)]
fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn encode_header(k: KmerLength, sorted: bool, records: u64, payload_len: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(MAGIC);
    header[4] = VERSION;
    header[5] = k.as_u8();
    header[6] = if sorted { FLAG_SORTED } else { 0 };
    header[7..15].copy_from_slice(&records.to_le_bytes());
    header[15..23].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Encodes `entries` as one region and writes it to `writer`.
///
/// Returns the number of bytes written. Nothing is flushed or synced.
///
/// # Errors
///
/// Propagates write errors from `writer`.
pub fn write_region<W: Write>(
    writer: &mut W,
    k: KmerLength,
    sorted: bool,
    entries: &[(u64, u64)],
) -> io::Result<u64> {
    let width = key_bytes(k);
    let mut payload = Vec::with_capacity(entries.len() * (width + 2));
    for &(key, count) in entries {
        payload.extend_from_slice(&key.to_le_bytes()[..width]);
        put_varint(&mut payload, count);
    }
    let header = encode_header(k, sorted, entries.len() as u64, payload.len() as u64);

    let mut crc = Crc32::new();
    crc.update(&payload);
    crc.update(&header);

    writer.write_all(&header)?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.finish().to_le_bytes())?;

    Ok((HEADER_LEN + payload.len() + CRC_LEN) as u64)
}

/// Streams one region to a seekable writer.
///
/// A zeroed header is written up front and patched by
/// [`finish`](Self::finish), so the records never have to be held in memory.
/// A region abandoned before `finish` is left with an invalid header.
#[derive(Debug)]
pub struct RegionWriter<W: Write + Seek> {
    writer: W,
    start: u64,
    k: KmerLength,
    sorted: bool,
    width: usize,
    records: u64,
    payload_len: u64,
    crc: Crc32,
    record: Vec<u8>,
}

impl<W: Write + Seek> RegionWriter<W> {
    /// Starts a region at the current position of `writer`.
    ///
    /// # Errors
    ///
    /// Propagates seek and write errors.
    pub fn new(mut writer: W, k: KmerLength, sorted: bool) -> io::Result<Self> {
        let start = writer.stream_position()?;
        writer.write_all(&[0u8; HEADER_LEN])?;
        Ok(Self {
            writer,
            start,
            k,
            sorted,
            width: key_bytes(k),
            records: 0,
            payload_len: 0,
            crc: Crc32::new(),
            record: Vec::with_capacity(8 + MAX_VARINT_LEN),
        })
    }

    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Propagates write errors.
    pub fn push(&mut self, key: u64, count: u64) -> io::Result<()> {
        self.record.clear();
        self.record.extend_from_slice(&key.to_le_bytes()[..self.width]);
        put_varint(&mut self.record, count);
        self.writer.write_all(&self.record)?;
        self.crc.update(&self.record);
        self.records += 1;
        self.payload_len += self.record.len() as u64;
        Ok(())
    }

    /// Records pushed so far.
    #[must_use]
    pub const fn records(&self) -> u64 {
        self.records
    }

    /// Writes the checksum, patches the header and returns the region length.
    ///
    /// The writer is left positioned at the end of the region.
    ///
    /// # Errors
    ///
    /// Propagates seek and write errors.
    pub fn finish(mut self) -> io::Result<u64> {
        let header = encode_header(self.k, self.sorted, self.records, self.payload_len);
        let mut crc = self.crc;
        crc.update(&header);
        self.writer.write_all(&crc.finish().to_le_bytes())?;
        let end = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(self.start))?;
        self.writer.write_all(&header)?;
        self.writer.seek(SeekFrom::Start(end))?;
        Ok(end - self.start)
    }
}

#[derive(Debug, Clone, Copy)]
struct RegionHeader {
    k: KmerLength,
    sorted: bool,
    records: u64,
    payload_len: u64,
}

impl RegionHeader {
    fn parse(bytes: &[u8; HEADER_LEN], path: &Path) -> Result<Self, KmerSpillError> {
        if &bytes[..4] != MAGIC {
            return Err(KmerSpillError::invalid_fragment(
                "invalid magic bytes (not a kmerspill fragment)",
                path,
            ));
        }
        if bytes[4] != VERSION {
            return Err(KmerSpillError::invalid_fragment(
                format!("unsupported version {}", bytes[4]),
                path,
            ));
        }
        let k = KmerLength::new(usize::from(bytes[5])).map_err(|e| {
            KmerSpillError::invalid_fragment(format!("invalid k-mer length: {e}"), path)
        })?;
        let flags = bytes[6];
        if flags & !FLAG_SORTED != 0 {
            return Err(KmerSpillError::invalid_fragment(
                format!("unknown flags {flags:#04x}"),
                path,
            ));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[7..15]);
        let records = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[15..23]);
        let payload_len = u64::from_le_bytes(word);

        // every record takes at least its key bytes and one count byte
        let min_payload = records.saturating_mul(key_bytes(k) as u64 + 1);
        if payload_len < min_payload {
            return Err(KmerSpillError::invalid_fragment(
                format!("{records} records cannot fit in {payload_len} payload bytes"),
                path,
            ));
        }

        Ok(Self {
            k,
            sorted: flags & FLAG_SORTED != 0,
            records,
            payload_len,
        })
    }

    const fn region_len(&self) -> u64 {
        (HEADER_LEN + CRC_LEN) as u64 + self.payload_len
    }
}

fn read_error(err: io::Error, path: &Path) -> KmerSpillError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        KmerSpillError::invalid_fragment("truncated region", path)
    } else {
        KmerSpillError::dump_read(err, path)
    }
}

/// Lists the regions of a fragment file.
///
/// Only headers and sizes are checked here; checksums are verified when the
/// records are read.
///
/// # Errors
///
/// Returns an error if the file cannot be read, a header is invalid, or the
/// last region is truncated.
pub fn scan_fragments<P: AsRef<Path>>(path: P) -> Result<Vec<DumpFragment>, KmerSpillError> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| KmerSpillError::dump_read(e, path))?;
    let file_len = file
        .metadata()
        .map_err(|e| KmerSpillError::dump_read(e, path))?
        .len();

    let mut fragments = Vec::new();
    let mut offset = 0u64;
    while offset < file_len {
        if file_len - offset < (HEADER_LEN + CRC_LEN) as u64 {
            return Err(KmerSpillError::invalid_fragment(
                format!("truncated region at offset {offset}"),
                path,
            ));
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| KmerSpillError::dump_read(e, path))?;
        let mut bytes = [0u8; HEADER_LEN];
        file.read_exact(&mut bytes)
            .map_err(|e| read_error(e, path))?;
        let header = RegionHeader::parse(&bytes, path)?;

        let len = header.region_len();
        if len > file_len - offset {
            return Err(KmerSpillError::invalid_fragment(
                format!("truncated region at offset {offset}"),
                path,
            ));
        }
        fragments.push(DumpFragment::new(
            path.to_path_buf(),
            offset,
            len,
            header.records,
            header.sorted,
            header.k,
        ));
        offset += len;
    }
    Ok(fragments)
}

/// Deletes the files holding `fragments`, each at most once.
///
/// # Errors
///
/// Returns the first removal failure; missing files are not an error.
pub fn remove_fragments(fragments: &[DumpFragment]) -> Result<(), KmerSpillError> {
    let paths: BTreeSet<&Path> = fragments.iter().map(DumpFragment::path).collect();
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(KmerSpillError::dump_write(e, path)),
        }
    }
    Ok(())
}

/// Streams the records of one region, verifying the checksum at the end.
///
/// The final item is an error if the checksum does not match, so a caller
/// that consumes the whole iterator never silently accepts a damaged region.
/// A region flagged as sorted must have non-decreasing keys.
pub struct FragmentReader {
    reader: BufReader<File>,
    path: PathBuf,
    header: RegionHeader,
    header_bytes: [u8; HEADER_LEN],
    key_bytes: usize,
    key_mask: u64,
    remaining: u64,
    consumed: u64,
    crc: Crc32,
    last_key: Option<u64>,
    done: bool,
}

impl FragmentReader {
    /// Opens the region starting at `offset` in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the header is invalid.
    pub fn open<P: AsRef<Path>>(path: P, offset: u64) -> Result<Self, KmerSpillError> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| KmerSpillError::dump_read(e, path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| KmerSpillError::dump_read(e, path))?;
        let mut reader = BufReader::new(file);

        let mut bytes = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut bytes)
            .map_err(|e| read_error(e, path))?;
        let header = RegionHeader::parse(&bytes, path)?;

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            key_bytes: key_bytes(header.k),
            key_mask: header.k.mask(),
            remaining: header.records,
            header,
            header_bytes: bytes,
            consumed: 0,
            crc: Crc32::new(),
            last_key: None,
            done: false,
        })
    }

    /// K-mer length of the keys.
    #[must_use]
    pub const fn k(&self) -> KmerLength {
        self.header.k
    }

    /// Whether the region is flagged as sorted.
    #[must_use]
    pub const fn sorted(&self) -> bool {
        self.header.sorted
    }

    /// Records not yet yielded.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }

    fn read_payload(&mut self, buf: &mut [u8]) -> Result<(), KmerSpillError> {
        self.consumed += buf.len() as u64;
        if self.consumed > self.header.payload_len {
            return Err(KmerSpillError::invalid_fragment(
                "record runs past the end of the payload",
                &self.path,
            ));
        }
        self.reader
            .read_exact(buf)
            .map_err(|e| read_error(e, &self.path))?;
        self.crc.update(buf);
        Ok(())
    }

    fn read_varint(&mut self) -> Result<u64, KmerSpillError> {
        let mut value = 0u64;
        for i in 0..MAX_VARINT_LEN {
            let mut byte = [0u8; 1];
            self.read_payload(&mut byte)?;
            let bits = u64::from(byte[0] & 0x7F);
            if i == MAX_VARINT_LEN - 1 && bits > 1 {
                break;
            }
            value |= bits << (7 * i);
            if byte[0] & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(KmerSpillError::invalid_fragment(
            "count does not fit in 64 bits",
            &self.path,
        ))
    }

    fn read_record(&mut self) -> Result<(u64, u64), KmerSpillError> {
        let mut key_buf = [0u8; 8];
        let width = self.key_bytes;
        self.read_payload(&mut key_buf[..width])?;
        let key = u64::from_le_bytes(key_buf);
        if key & !self.key_mask != 0 {
            return Err(KmerSpillError::invalid_fragment(
                format!("key {key:#x} is wider than {} bases", self.header.k),
                &self.path,
            ));
        }
        let count = self.read_varint()?;

        if self.header.sorted {
            if let Some(last) = self.last_key {
                if key < last {
                    return Err(KmerSpillError::invalid_fragment(
                        format!("sorted region goes backwards ({key:#x} after {last:#x})"),
                        &self.path,
                    ));
                }
            }
            self.last_key = Some(key);
        }
        Ok((key, count))
    }

    fn verify(&mut self) -> Result<(), KmerSpillError> {
        if self.consumed != self.header.payload_len {
            return Err(KmerSpillError::invalid_fragment(
                format!(
                    "payload length mismatch (header says {}, records use {})",
                    self.header.payload_len, self.consumed
                ),
                &self.path,
            ));
        }
        let mut stored = [0u8; CRC_LEN];
        self.reader
            .read_exact(&mut stored)
            .map_err(|e| read_error(e, &self.path))?;
        let stored = u32::from_le_bytes(stored);
        let mut crc = self.crc;
        crc.update(&self.header_bytes);
        let computed = crc.finish();
        if stored != computed {
            return Err(KmerSpillError::invalid_fragment(
                format!("checksum mismatch (expected {stored:#x}, got {computed:#x})"),
                &self.path,
            ));
        }
        Ok(())
    }
}

impl Iterator for FragmentReader {
    type Item = Result<(u64, u64), KmerSpillError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.remaining == 0 {
            self.done = true;
            return self.verify().err().map(Err);
        }
        match self.read_record() {
            Ok(record) => {
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    fn k(k: usize) -> KmerLength {
        KmerLength::new(k).unwrap()
    }

    fn write_file(regions: &[(KmerLength, bool, Vec<(u64, u64)>)]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        for (k, sorted, entries) in regions {
            write_region(tmp.as_file_mut(), *k, *sorted, entries).unwrap();
        }
        tmp
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn region_roundtrip() {
        let entries = vec![(0, 1), (5, 300), (0xFFFF, u64::MAX)];
        let tmp = write_file(&[(k(8), true, entries.clone())]);

        let fragments = scan_fragments(tmp.path()).unwrap();
        assert_eq!(fragments.len(), 1);
        let fragment = &fragments[0];
        assert_eq!(fragment.offset(), 0);
        assert_eq!(fragment.records(), 3);
        assert!(fragment.sorted());
        assert_eq!(fragment.k(), k(8));
        assert_eq!(fragment.read_all().unwrap(), entries);
    }

    #[test]
    fn full_width_keys() {
        let entries = vec![(1, 2), (u64::MAX, 7)];
        let tmp = write_file(&[(k(32), true, entries.clone())]);
        let fragments = scan_fragments(tmp.path()).unwrap();
        assert_eq!(fragments[0].read_all().unwrap(), entries);
    }

    #[test]
    fn written_length_matches_scan() {
        let mut buf = Cursor::new(Vec::new());
        let written = write_region(&mut buf, k(5), false, &[(3, 4), (1, 1)]).unwrap();
        assert_eq!(written as usize, buf.get_ref().len());
        // 2 key bytes + 1 count byte per record
        assert_eq!(written as usize, HEADER_LEN + 6 + 4);
    }

    #[test]
    fn streamed_region_matches_buffered_region() {
        let entries = [(1, 1), (2, 200), (0xABCD, u64::MAX)];
        let mut buffered = Vec::new();
        write_region(&mut buffered, k(8), true, &entries).unwrap();

        let mut streamed = Cursor::new(b"prefix".to_vec());
        streamed.seek(SeekFrom::End(0)).unwrap();
        let mut region = RegionWriter::new(&mut streamed, k(8), true).unwrap();
        for &(key, count) in &entries {
            region.push(key, count).unwrap();
        }
        assert_eq!(region.records(), 3);
        let len = region.finish().unwrap();

        assert_eq!(len as usize, buffered.len());
        assert_eq!(&streamed.get_ref()[6..], buffered.as_slice());
        assert_eq!(streamed.position() as usize, 6 + buffered.len());
    }

    #[test]
    fn verify_rejects_damage_up_front() {
        let tmp = write_file(&[(k(8), true, vec![(10, 1), (20, 2), (30, 3)])]);
        let fragments = scan_fragments(tmp.path()).unwrap();
        fragments[0].verify().unwrap();

        let mut bytes = std::fs::read(tmp.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x10;
        std::fs::write(tmp.path(), &bytes).unwrap();

        // the reader still decodes records before reporting the mismatch
        let mut reader = fragments[0].reader().unwrap();
        assert_eq!(reader.next().unwrap().unwrap(), (10, 1));
        let err = fragments[0].verify().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{err}");
    }

    #[test]
    fn several_regions_in_one_file() {
        let tmp = write_file(&[
            (k(4), true, vec![(1, 1), (2, 2)]),
            (k(4), false, vec![(9, 1), (3, 5), (7, 2)]),
            (k(4), true, vec![]),
        ]);
        let fragments = scan_fragments(tmp.path()).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[1].offset(), fragments[0].len());
        assert!(!fragments[1].sorted());
        assert_eq!(
            fragments[1].read_all().unwrap(),
            vec![(9, 1), (3, 5), (7, 2)]
        );
        assert!(fragments[2].is_empty());
        assert!(fragments[2].read_all().unwrap().is_empty());
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let tmp = write_file(&[(k(8), false, vec![(10, 1), (20, 2), (30, 3)])]);
        let mut bytes = std::fs::read(tmp.path()).unwrap();
        bytes[HEADER_LEN + 2] ^= 0x01;
        std::fs::write(tmp.path(), &bytes).unwrap();

        let fragments = scan_fragments(tmp.path()).unwrap();
        let err = fragments[0].read_all().unwrap_err();
        assert!(
            err.to_string().contains("checksum mismatch"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn truncated_region_is_rejected() {
        let tmp = write_file(&[
            (k(8), true, vec![(1, 1)]),
            (k(8), true, vec![(2, 2), (3, 3)]),
        ]);
        let bytes = std::fs::read(tmp.path()).unwrap();
        std::fs::write(tmp.path(), &bytes[..bytes.len() - 3]).unwrap();

        let err = scan_fragments(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("truncated"), "unexpected error: {err}");
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"NOT A FRAGMENT AT ALL, SORRY").unwrap();
        let err = scan_fragments(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn sorted_region_going_backwards_is_rejected() {
        let tmp = write_file(&[(k(8), true, vec![(5, 1), (4, 1)])]);
        let fragments = scan_fragments(tmp.path()).unwrap();
        let err = fragments[0].read_all().unwrap_err();
        assert!(err.to_string().contains("goes backwards"));
    }

    #[test]
    fn empty_file_has_no_regions() {
        let tmp = NamedTempFile::new().unwrap();
        assert!(scan_fragments(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = scan_fragments("/nonexistent/fragment").unwrap_err();
        assert!(matches!(err, KmerSpillError::DumpRead { .. }));
    }

    #[test]
    fn remove_fragments_deletes_each_file_once() {
        let tmp = write_file(&[(k(4), true, vec![(1, 1)]), (k(4), true, vec![(2, 1)])]);
        let path = tmp.path().to_path_buf();
        let fragments = scan_fragments(&path).unwrap();
        let tmp_path = tmp.into_temp_path();
        remove_fragments(&fragments).unwrap();
        assert!(!path.exists());
        // already gone
        remove_fragments(&fragments).unwrap();
        drop(tmp_path);
    }
}
