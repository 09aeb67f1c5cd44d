//! Property-based tests.

use std::collections::BTreeMap;

use kmerspill::{
    builder::CounterBuilder,
    codec::SlotCodec,
    config::{DrainPolicy, FileRotation, FragmentOrder},
    fragment::write_region,
    kmer::{canonical, encode, reverse_complement, unpack_to_bytes, KmerLength},
    merge::{CountRange, MergeSource, Merger},
    run::Counter,
};
use proptest::prelude::*;
use tempfile::TempDir;

fn dna(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(b"ACGT".to_vec()), 1..=max_len)
}

proptest! {
    #[test]
    fn encode_unpack_roundtrip(seq in dna(32)) {
        let k = KmerLength::new(seq.len()).unwrap();
        let bits = encode(&seq).unwrap();
        prop_assert_eq!(unpack_to_bytes(bits, k), seq);
    }

    #[test]
    fn canonical_is_orientation_independent(seq in dna(32)) {
        let k = KmerLength::new(seq.len()).unwrap();
        let bits = encode(&seq).unwrap();
        let rc = reverse_complement(bits, k);
        prop_assert_eq!(reverse_complement(rc, k), bits);
        prop_assert_eq!(canonical(bits, k), canonical(rc, k));
        prop_assert!(canonical(bits, k) <= bits);
    }

    #[test]
    fn hash_is_invertible(k in 1usize..=32, size_log in 1u32..20, key: u64) {
        let k = KmerLength::new(k).unwrap();
        let Ok(codec) = SlotCodec::new(k, 1 << size_log, 4, 126) else {
            return Ok(());
        };
        let key = key & k.mask();
        let (home, quotient) = codec.home(key);
        let word = codec.pack(1, quotient, 1);
        prop_assert_eq!(codec.key_at(home, word), Some(key));
    }

    #[test]
    fn merger_equals_summed_map(
        sources in prop::collection::vec(
            prop::collection::btree_map(0u64..64, 1u64..1000, 0..20),
            0..5,
        ),
        lower in 1u64..200,
        width in 0u64..2000,
    ) {
        let mut expected: BTreeMap<u64, u64> = BTreeMap::new();
        for source in &sources {
            for (&key, &count) in source {
                *expected.entry(key).or_insert(0) += count;
            }
        }
        let range = CountRange::new(Some(lower), Some(lower + width));
        let expected: Vec<(u64, u64)> = expected
            .into_iter()
            .filter(|&(_, count)| range.contains(count))
            .collect();

        let merger = Merger::new(
            sources
                .into_iter()
                .map(|s| MergeSource::memory(s.into_iter().collect()))
                .collect(),
            range,
        )
        .unwrap();
        let merged: Vec<(u64, u64)> = merger.collect::<Result<_, _>>().unwrap();
        prop_assert_eq!(merged, expected);
    }

    #[test]
    fn region_length_is_reported_exactly(
        entries in prop::collection::vec((0u64..1 << 22, any::<u64>()), 0..50),
    ) {
        let k = KmerLength::new(11).unwrap();
        let mut out = Vec::new();
        let written = write_region(&mut out, k, false, &entries).unwrap();
        prop_assert_eq!(written, out.len() as u64);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn spilling_counter_matches_reference(
        batches in prop::collection::vec(prop::collection::vec(0u64..1024, 0..200), 1..6),
        rotating in any::<bool>(),
        one_file in any::<bool>(),
        sorted in any::<bool>(),
    ) {
        let dir = TempDir::new().unwrap();
        let k = KmerLength::new(5).unwrap();
        let config = CounterBuilder::new()
            .k(5)
            .unwrap()
            .table_size(32)
            .load_factor(0.5)
            .threads(3)
            .drain(if rotating { DrainPolicy::Rotating } else { DrainPolicy::StopTheWorld })
            .rotation(if one_file { FileRotation::OneFile } else { FileRotation::Numbered })
            .order(if sorted { FragmentOrder::Sorted } else { FragmentOrder::Unsorted })
            .prefix(dir.path().join("mer"))
            .build()
            .unwrap();

        let mut reference: BTreeMap<u64, u64> = BTreeMap::new();
        for &key in batches.iter().flatten() {
            *reference.entry(canonical(key, k)).or_insert(0) += 1;
        }

        let outcome = Counter::new(config).count_keys(&batches).unwrap();
        let merged = outcome.merged(CountRange::ALL).unwrap();
        prop_assert_eq!(merged, reference.into_iter().collect::<Vec<_>>());
    }
}
