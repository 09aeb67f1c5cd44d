//! Fuzz target for the slot layout.
//!
//! Every key placed at any reprobe attempt must be recoverable from its slot
//! position and word, and the count field must not disturb tag or quotient.

#![no_main]

use kmerspill::{codec::SlotCodec, kmer::KmerLength};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (u8, u8, u8, u8, u64, u64)| {
    let (k, size_log, count_bits, attempt, key, count) = input;
    let Ok(k) = KmerLength::new(usize::from(k % 32) + 1) else {
        return;
    };
    let size = 1usize << (size_log % 24).max(1);
    let Ok(codec) = SlotCodec::new(k, size, count_bits % 16, 126) else {
        return;
    };

    let key = key & k.mask();
    assert_eq!(codec.unhash(codec.hash(key)), key, "hash is not invertible");

    let attempt = usize::from(attempt) % (codec.max_reprobe() + 1);
    let (home, quotient) = codec.home(key);
    let position = codec.probe(home, attempt);
    let count = count & codec.count_max();
    let word = codec.pack(attempt as u64 + 1, quotient, count);

    assert_ne!(word, SlotCodec::EMPTY);
    assert_eq!(codec.key_at(position, word), Some(key));
    assert_eq!(codec.count(word), count);

    let bumped = codec.with_count(word, codec.count_max());
    assert_eq!(codec.tag(bumped), attempt as u64 + 1);
    assert_eq!(codec.quotient(bumped), quotient);
    assert!(codec.is_overflowed(bumped));
});
