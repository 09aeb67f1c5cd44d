//! Packed k-mer keys.
//!
//! A k-mer of length `k` (1-32) is packed into the low `2k` bits of a `u64`,
//! two bits per base with the first base in the most significant position:
//!
//! | Base | Bits |
//! |------|------|
//! | A    | 00   |
//! | C    | 01   |
//! | G    | 10   |
//! | T    | 11   |
//!
//! With this encoding, integer order on packed keys is the lexicographic order
//! of the k-mer strings, and the complement of a base is `3 - base`.

use crate::error::KmerLengthError;

/// A validated k-mer length (1-32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KmerLength(u8);

impl KmerLength {
    /// Smallest supported k.
    pub const MIN: u8 = 1;
    /// Largest supported k (64 bits / 2 bits per base).
    pub const MAX: u8 = 32;

    /// Validates `k`.
    ///
    /// # Errors
    ///
    /// Returns [`KmerLengthError`] if `k` is not in `1..=32`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use kmerspill::kmer::KmerLength;
    ///
    /// assert!(KmerLength::new(21).is_ok());
    /// assert!(KmerLength::new(0).is_err());
    /// assert!(KmerLength::new(33).is_err());
    /// ```
    pub fn new(k: usize) -> Result<Self, KmerLengthError> {
        match u8::try_from(k) {
            Ok(byte) if (Self::MIN..=Self::MAX).contains(&byte) => Ok(Self(byte)),
            _ => Err(KmerLengthError {
                k,
                min: Self::MIN,
                max: Self::MAX,
            }),
        }
    }

    /// Returns k.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0 as usize
    }

    /// Returns k as a byte, as stored in fragment headers.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Number of significant bits in a packed key.
    #[must_use]
    pub const fn bits(self) -> u32 {
        2 * self.0 as u32
    }

    /// Mask selecting the significant bits of a packed key.
    #[must_use]
    pub const fn mask(self) -> u64 {
        if self.0 == Self::MAX {
            u64::MAX
        } else {
            (1u64 << self.bits()) - 1
        }
    }
}

impl std::fmt::Display for KmerLength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn base_bits(byte: u8) -> Option<u64> {
    match byte {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];

/// Packs a k-mer string. Soft-masked (lowercase) bases are accepted.
///
/// Returns `None` if `sub` is empty, longer than 32 bases or contains anything
/// other than `ACGT`.
///
/// # Example
///
/// ```rust
/// use kmerspill::kmer::encode;
///
/// assert_eq!(encode(b"ACGT"), Some(0b00_01_10_11));
/// assert_eq!(encode(b"ACNT"), None);
/// ```
#[must_use]
pub fn encode(sub: &[u8]) -> Option<u64> {
    if sub.is_empty() || sub.len() > usize::from(KmerLength::MAX) {
        return None;
    }
    sub.iter()
        .try_fold(0u64, |acc, &b| base_bits(b).map(|bits| (acc << 2) | bits))
}

/// Reverse complement of a packed key.
#[must_use]
pub fn reverse_complement(bits: u64, k: KmerLength) -> u64 {
    // complement every base, then reverse the order of the 2-bit groups
    let mut x = !bits;
    x = ((x >> 2) & 0x3333_3333_3333_3333) | ((x & 0x3333_3333_3333_3333) << 2);
    x = ((x >> 4) & 0x0F0F_0F0F_0F0F_0F0F) | ((x & 0x0F0F_0F0F_0F0F_0F0F) << 4);
    x = x.swap_bytes();
    x >> (64 - k.bits())
}

/// The canonical form of a packed key: the smaller of the key and its reverse
/// complement.
#[must_use]
pub fn canonical(bits: u64, k: KmerLength) -> u64 {
    let bits = bits & k.mask();
    bits.min(reverse_complement(bits, k))
}

/// Unpacks a key to its bases.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn unpack_to_bytes(bits: u64, k: KmerLength) -> Vec<u8> {
    (0..k.get())
        .rev()
        .map(|i| BASES[((bits >> (2 * i)) & 0b11) as usize])
        .collect()
}

/// Unpacks a key to a DNA string.
///
/// # Example
///
/// ```rust
/// use kmerspill::kmer::{unpack_to_string, KmerLength};
///
/// let k = KmerLength::new(4)?;
/// assert_eq!(unpack_to_string(0b00_01_10_11, k), "ACGT");
/// # Ok::<(), kmerspill::error::KmerLengthError>(())
/// ```
#[must_use]
pub fn unpack_to_string(bits: u64, k: KmerLength) -> String {
    // Only ACGT bytes are produced, so this is always valid UTF-8.
    String::from_utf8_lossy(&unpack_to_bytes(bits, k)).into_owned()
}

/// Iterator over the packed keys of every valid window of a sequence.
///
/// Windows containing a base other than `ACGT` are skipped: the encoder
/// restarts after the offending base.
pub struct KmerWindows<'a> {
    seq: &'a [u8],
    pos: usize,
    k: KmerLength,
    current: u64,
    filled: usize,
}

impl<'a> KmerWindows<'a> {
    /// Creates an iterator over the k-mers of `seq`.
    #[must_use]
    pub fn new(seq: &'a [u8], k: KmerLength) -> Self {
        Self {
            seq,
            pos: 0,
            k,
            current: 0,
            filled: 0,
        }
    }
}

impl Iterator for KmerWindows<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let k = self.k.get();
        while self.pos < self.seq.len() {
            let byte = self.seq[self.pos];
            self.pos += 1;
            match base_bits(byte) {
                Some(bits) => {
                    self.current = ((self.current << 2) | bits) & self.k.mask();
                    self.filled = (self.filled + 1).min(k);
                    if self.filled == k {
                        return Some(self.current);
                    }
                }
                None => {
                    self.current = 0;
                    self.filled = 0;
                }
            }
        }
        None
    }
}
