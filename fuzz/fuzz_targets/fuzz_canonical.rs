//! Fuzz target for canonical k-mer computation.
//!
//! A k-mer and its reverse complement share one canonical key, canonical
//! form is idempotent, and it never exceeds either orientation.

#![no_main]

use kmerspill::kmer::{canonical, encode, reverse_complement, unpack_to_bytes, KmerLength};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > 32 {
        return;
    }
    let Some(bits) = encode(data) else {
        return;
    };
    let Ok(k) = KmerLength::new(data.len()) else {
        return;
    };

    assert_eq!(
        unpack_to_bytes(bits, k),
        data.to_ascii_uppercase(),
        "pack/unpack mismatch"
    );

    let rc = reverse_complement(bits, k);
    let canon = canonical(bits, k);
    assert_eq!(canon, canonical(rc, k), "k-mer and RC have different canonical forms");
    assert_eq!(canonical(canon, k), canon, "Canonical is not idempotent");
    assert!(canon <= bits && canon <= rc);
});
