//! End-to-end tests of the library API over sequence files.

use std::{fs, io::Write, path::PathBuf};

use kmerspill::{
    builder::CounterBuilder,
    config::FileRotation,
    error::KmerSpillError,
    kmer::{encode, KmerLength},
    merge::{CountRange, DEFAULT_FAN_IN},
    output::OutputFormat,
    run::{count_files, run_count, run_dump, run_histo, run_stats, scan_all, CountOptions},
};
use tempfile::TempDir;

fn write_fasta(dir: &TempDir, name: &str, records: &[&str]) -> PathBuf {
    let path = dir.path().join(name);
    let mut file = fs::File::create(&path).unwrap();
    for (i, seq) in records.iter().enumerate() {
        writeln!(file, ">seq{i}\n{seq}").unwrap();
    }
    path
}

#[test]
fn counts_two_files_with_spills() {
    let dir = TempDir::new().unwrap();
    let a = write_fasta(&dir, "a.fa", &["ACGTACGTAC", "GGGGCCCC"]);
    let b = write_fasta(&dir, "b.fa", &["ACGTNACGT"]);

    let config = CounterBuilder::new()
        .k(3)
        .unwrap()
        .table_size(8)
        .load_factor(0.5)
        .threads(2)
        .prefix(dir.path().join("mer"))
        .build()
        .unwrap();
    let outcome = count_files(config, &[a, b]).unwrap();

    let k = KmerLength::new(3).unwrap();
    let merged = outcome.merged(CountRange::ALL).unwrap();
    let total: u64 = merged.iter().map(|(_, c)| c).sum();
    // 8 + 6 windows in the first file, 2 + 2 in the second
    assert_eq!(total, 18);
    assert_eq!(outcome.summary().progress.kmers_counted, 18);
    assert_eq!(outcome.summary().progress.sequences_processed, 3);
    // ACG and its reverse complement CGT share one canonical key
    let acg = encode(b"ACG").unwrap();
    assert_eq!(merged.iter().find(|(key, _)| *key == acg).map(|e| e.1), Some(8));
    assert!(merged.iter().all(|&(key, _)| key <= k.mask()));

    outcome.remove_fragments().unwrap();
    for fragment in outcome.fragments() {
        assert!(!fragment.path().exists());
    }
}

#[test]
fn run_count_then_reread_kept_fragments() {
    let dir = TempDir::new().unwrap();
    let input = write_fasta(&dir, "reads.fa", &["AAAAAAAACCCCGGGTTA", "TTTTTTTT"]);
    let output = dir.path().join("counts.txt");

    let config = CounterBuilder::new()
        .k(4)
        .unwrap()
        .table_size(16)
        .rotation(FileRotation::OneFile)
        .dump_residue(true)
        .prefix(dir.path().join("kept"))
        .build()
        .unwrap();
    let options = CountOptions {
        inputs: vec![input],
        range: CountRange::ALL,
        format: OutputFormat::Column,
        output: Some(output.clone()),
        keep_fragments: true,
    };
    let summary = run_count(config, &options).unwrap();
    assert_eq!(summary.files_written, 1);

    let counted = fs::read_to_string(&output).unwrap();
    assert!(counted.lines().any(|line| line == "AAAA 10"), "{counted}");

    // the kept file reproduces the same output
    let kept = vec![dir.path().join("kept")];
    let redumped = dir.path().join("redump.txt");
    let written = run_dump(
        &kept,
        CountRange::ALL,
        DEFAULT_FAN_IN,
        OutputFormat::Column,
        Some(&redumped),
    ).unwrap();
    assert_eq!(fs::read_to_string(&redumped).unwrap(), counted);
    assert_eq!(written as usize, counted.lines().count());

    let stats = run_stats(&kept, CountRange::ALL, DEFAULT_FAN_IN).unwrap();
    assert_eq!(stats.total, 15 + 5);
    assert_eq!(stats.max_count, 10);

    let histo = dir.path().join("histo.txt");
    run_histo(&kept, CountRange::new(Some(2), None), 2, Some(&histo)).unwrap();
    let histo = fs::read_to_string(histo).unwrap();
    assert!(histo.lines().all(|line| !line.starts_with("1 ")));
    assert!(histo.ends_with("10 1\n"), "{histo}");
}

#[test]
fn many_drains_merge_through_a_small_fan_in() {
    let dir = TempDir::new().unwrap();
    let reads: Vec<String> = (0..40u64)
        .map(|i| {
            let mut x = 0x9E37_79B9 + i;
            (0..30)
                .map(|_| {
                    x = x
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1_442_695_040_888_963_407);
                    ['A', 'C', 'G', 'T'][(x >> 62) as usize]
                })
                .collect()
        })
        .collect();
    let records: Vec<&str> = reads.iter().map(String::as_str).collect();
    let input = write_fasta(&dir, "reads.fa", &records);

    let counted = |fan_in: usize, prefix: &str| {
        let config = CounterBuilder::new()
            .k(6)
            .unwrap()
            .table_size(16)
            .load_factor(0.5)
            .threads(4)
            .merge_fan_in(fan_in)
            .prefix(dir.path().join(prefix))
            .build()
            .unwrap();
        let outcome = count_files(config, std::slice::from_ref(&input)).unwrap();
        let merged = outcome.merged(CountRange::ALL).unwrap();
        (outcome, merged)
    };

    let (narrow, narrow_counts) = counted(3, "narrow");
    let (_wide, wide_counts) = counted(DEFAULT_FAN_IN, "wide");
    assert!(narrow.fragments().len() > 3, "{} fragments", narrow.fragments().len());
    assert_eq!(narrow_counts, wide_counts);
    let total: u64 = narrow_counts.iter().map(|(_, c)| c).sum();
    assert_eq!(total, 40 * 25);
}

#[test]
fn damaged_fragment_writes_no_output() {
    let dir = TempDir::new().unwrap();
    let input = write_fasta(&dir, "reads.fa", &["AAAAAAAACCCCGGGTTA"]);
    let config = CounterBuilder::new()
        .k(4)
        .unwrap()
        .table_size(64)
        .dump_residue(true)
        .prefix(dir.path().join("kept"))
        .build()
        .unwrap();
    let outcome = count_files(config, &[input]).unwrap();
    let path = outcome.fragments()[0].path().to_path_buf();

    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let output = dir.path().join("dump.txt");
    let err = run_dump(
        &[path],
        CountRange::ALL,
        DEFAULT_FAN_IN,
        OutputFormat::Tab,
        Some(&output),
    )
    .unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"), "{err}");
    assert!(!output.exists());
}

#[test]
fn missing_input_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = CounterBuilder::new()
        .k(5)
        .unwrap()
        .prefix(dir.path().join("mer"))
        .build()
        .unwrap();
    let err = count_files(config, &[dir.path().join("absent.fa")]).unwrap_err();
    assert!(matches!(err, KmerSpillError::SequenceRead { .. }));
}

#[test]
fn scanning_a_non_fragment_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_fasta(&dir, "reads.fa", &["ACGTACGTACGTACGTACGTACGTACGT"]);
    let err = scan_all(&[path]).unwrap_err();
    assert!(matches!(err, KmerSpillError::InvalidFragment { .. }), "got {err}");
}

#[test]
fn builder_rejects_invalid_settings() {
    assert!(CounterBuilder::new().k(0).is_err());
    assert!(CounterBuilder::new().k(33).is_err());
    assert!(CounterBuilder::new().k(21).unwrap().threads(0).build().is_err());
    assert!(CounterBuilder::new()
        .k(21)
        .unwrap()
        .load_factor(1.5)
        .build()
        .is_err());
    assert!(CounterBuilder::new()
        .k(21)
        .unwrap()
        .counter_len(0)
        .build()
        .is_err());
}
