//! Slot encoding for the counting table.
//!
//! Every slot is a single `u64`. From the least significant bit:
//!
//! ```text
//! +-----------+-------------+-----------+
//! | tag (R)   | quotient (Q)| count (C) |
//! +-----------+-------------+-----------+
//! ```
//!
//! - `tag` is the reprobe attempt at which the key was placed, plus one. A tag
//!   of zero (the all-zero word) marks an empty slot; occupied slots always
//!   carry a non-zero tag, so the status can never alias a stored entry.
//! - `quotient` holds the bits of the hashed key that are not implied by the
//!   key's home slot. The hash is a bijection on `2k` bits, so the key is
//!   recovered from `(position, tag, quotient)` alone.
//! - `count` saturates at its all-ones value, the overflow sentinel.

use crate::{error::KmerSpillError, kmer::KmerLength};

/// Odd multiplier of the key mixer.
const MIX: u64 = 0x9E37_79B9_7F4A_7C15;
/// Inverse of [`MIX`] modulo 2^64 (and therefore modulo every smaller power of two).
const MIX_INV: u64 = mul_inverse(MIX);

/// Multiplicative inverse of an odd number modulo 2^64 by Newton iteration.
const fn mul_inverse(a: u64) -> u64 {
    // a * a == 1 (mod 8), each step doubles the number of correct low bits
    let mut x = a;
    let mut i = 0;
    while i < 5 {
        x = x.wrapping_mul(2u64.wrapping_sub(a.wrapping_mul(x)));
        i += 1;
    }
    x
}

const fn xorshift(x: u64, shift: u32) -> u64 {
    x ^ (x >> shift)
}

const fn unxorshift(y: u64, shift: u32) -> u64 {
    let mut x = y;
    let mut t = y >> shift;
    while t != 0 {
        x ^= t;
        t >>= shift;
    }
    x
}

const fn field_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Offset of reprobe attempt `i` from the home slot (triangular numbers).
#[inline]
pub(crate) const fn reprobe_offset(attempt: usize) -> usize {
    attempt.wrapping_mul(attempt.wrapping_add(1)) / 2
}

/// The decoded fields of an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotFields {
    /// Reprobe attempt plus one; never zero for an occupied slot.
    pub tag: u64,
    /// High bits of the hashed key.
    pub quotient: u64,
    /// Saturating count.
    pub count: u64,
}

/// Bit layout of the slots of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCodec {
    k: KmerLength,
    size_log: u32,
    max_reprobe: usize,
    tag_bits: u32,
    quotient_bits: u32,
    count_bits: u32,
    shift: u32,
}

impl SlotCodec {
    /// The all-zero word of an empty slot.
    pub const EMPTY: u64 = 0;

    /// Computes the layout for a table of `size` slots (a power of two).
    ///
    /// `max_reprobe` is clamped to `size - 1`: triangular probing has already
    /// visited every slot of a power-of-two table after `size` attempts.
    ///
    /// # Errors
    ///
    /// Returns [`KmerSpillError::Configuration`] if `size` is not a power of
    /// two, if `count_bits` is zero, or if tag, quotient and count do not fit
    /// in 64 bits together.
    pub fn new(
        k: KmerLength,
        size: usize,
        count_bits: u8,
        max_reprobe: usize,
    ) -> Result<Self, KmerSpillError> {
        if size < 2 || !size.is_power_of_two() {
            return Err(KmerSpillError::configuration(format!(
                "table size {size} must be a power of two of at least 2"
            )));
        }
        if count_bits == 0 {
            return Err(KmerSpillError::configuration(
                "counter length must be at least 1 bit",
            ));
        }
        let size_log = size.trailing_zeros();
        let max_reprobe = max_reprobe.min(size - 1);
        let tag_bits = u64::BITS - ((max_reprobe as u64) + 1).leading_zeros();
        let quotient_bits = k.bits().saturating_sub(size_log);
        let count_bits = u32::from(count_bits);
        let total = tag_bits + quotient_bits + count_bits;
        if total > u64::BITS {
            return Err(KmerSpillError::configuration(format!(
                "k={k} with {size} slots needs {tag_bits} reprobe bits and {quotient_bits} key bits \
                 per slot, leaving no room for a {count_bits}-bit counter \
                 (use a larger table or a smaller counter)"
            )));
        }
        Ok(Self {
            k,
            size_log,
            max_reprobe,
            tag_bits,
            quotient_bits,
            count_bits,
            shift: (k.bits() / 2).max(1),
        })
    }

    /// The k-mer length this layout encodes.
    #[must_use]
    pub const fn k(&self) -> KmerLength {
        self.k
    }

    /// Number of slots.
    #[must_use]
    pub const fn size(&self) -> usize {
        1 << self.size_log
    }

    /// Highest reprobe attempt index (inclusive).
    #[must_use]
    pub const fn max_reprobe(&self) -> usize {
        self.max_reprobe
    }

    /// Width of the count field.
    #[must_use]
    pub const fn count_bits(&self) -> u32 {
        self.count_bits
    }

    /// Largest value the count field holds; reaching it marks the slot overflowed.
    #[must_use]
    pub const fn count_max(&self) -> u64 {
        field_mask(self.count_bits)
    }

    const fn size_mask(&self) -> usize {
        self.size() - 1
    }

    const fn quotient_shift(&self) -> u32 {
        self.tag_bits
    }

    const fn count_shift(&self) -> u32 {
        self.tag_bits + self.quotient_bits
    }

    /// Bijective mix of the `2k` key bits.
    #[must_use]
    pub const fn hash(&self, key: u64) -> u64 {
        let mask = self.k.mask();
        let x = xorshift(key & mask, self.shift);
        let x = x.wrapping_mul(MIX) & mask;
        xorshift(x, self.shift)
    }

    /// Inverse of [`hash`](Self::hash).
    #[must_use]
    pub const fn unhash(&self, hash: u64) -> u64 {
        let mask = self.k.mask();
        let x = unxorshift(hash & mask, self.shift);
        let x = x.wrapping_mul(MIX_INV) & mask;
        unxorshift(x, self.shift)
    }

    /// Home slot and stored quotient of a key.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn home(&self, key: u64) -> (usize, u64) {
        let h = self.hash(key);
        let home = (h as usize) & self.size_mask();
        let quotient = if self.quotient_bits == 0 {
            0
        } else {
            h >> self.size_log
        };
        (home, quotient)
    }

    /// Slot index probed at `attempt` for a key whose home is `home`.
    #[must_use]
    pub const fn probe(&self, home: usize, attempt: usize) -> usize {
        home.wrapping_add(reprobe_offset(attempt)) & self.size_mask()
    }

    /// Packs an occupied slot. `tag` must be non-zero.
    #[must_use]
    pub const fn pack(&self, tag: u64, quotient: u64, count: u64) -> u64 {
        debug_assert!(tag != 0 && tag <= field_mask(self.tag_bits));
        debug_assert!(quotient <= field_mask(self.quotient_bits));
        debug_assert!(count <= self.count_max());
        tag | (quotient << self.quotient_shift()) | (count << self.count_shift())
    }

    /// Unpacks a slot, or `None` for an empty one.
    #[must_use]
    pub const fn unpack(&self, word: u64) -> Option<SlotFields> {
        let tag = self.tag(word);
        if tag == 0 {
            return None;
        }
        Some(SlotFields {
            tag,
            quotient: self.quotient(word),
            count: self.count(word),
        })
    }

    /// The tag field; zero means empty.
    #[must_use]
    pub const fn tag(&self, word: u64) -> u64 {
        word & field_mask(self.tag_bits)
    }

    /// The quotient field.
    #[must_use]
    pub const fn quotient(&self, word: u64) -> u64 {
        if self.quotient_bits == 0 {
            return 0;
        }
        (word >> self.quotient_shift()) & field_mask(self.quotient_bits)
    }

    /// The count field.
    #[must_use]
    pub const fn count(&self, word: u64) -> u64 {
        (word >> self.count_shift()) & self.count_max()
    }

    /// Replaces the count field of an occupied word.
    #[must_use]
    pub const fn with_count(&self, word: u64, count: u64) -> u64 {
        let cleared = word & !(self.count_max() << self.count_shift());
        cleared | (count << self.count_shift())
    }

    /// Whether the count field holds the overflow sentinel.
    #[must_use]
    pub const fn is_overflowed(&self, word: u64) -> bool {
        self.tag(word) != 0 && self.count(word) == self.count_max()
    }

    /// Recovers the key stored in an occupied slot at `position`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn key_at(&self, position: usize, word: u64) -> Option<u64> {
        let tag = self.tag(word);
        if tag == 0 {
            return None;
        }
        let attempt = (tag - 1) as usize;
        let home = position.wrapping_sub(reprobe_offset(attempt)) & self.size_mask();
        let mut h = home as u64;
        if self.quotient_bits > 0 {
            h |= self.quotient(word) << self.size_log;
        }
        Some(self.unhash(h))
    }
}
