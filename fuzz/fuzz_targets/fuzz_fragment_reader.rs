//! Fuzz target for fragment parsing.
//!
//! Arbitrary bytes on disk must produce errors, never panics or unbounded
//! allocations.

#![no_main]

use std::io::Write;

use kmerspill::fragment::scan_fragments;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(mut file) = tempfile::NamedTempFile::new() else {
        return;
    };
    if file.write_all(data).is_err() {
        return;
    }

    if let Ok(fragments) = scan_fragments(file.path()) {
        for fragment in fragments {
            let _ = fragment.read_all();
        }
    }
});
