use std::{fs, path::Path, process::Command};

use tempfile::TempDir;

fn kmerspill_cmd() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kmerspill"))
}

fn write_reads(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("reads.fa");
    fs::write(&path, ">r1\nAAAAAAAACCCCGGGTTA\n>r2\nTTTTTTTT\n").unwrap();
    path
}

#[test]
fn cli_help_flag() {
    let output = kmerspill_cmd()
        .arg("--help")
        .output()
        .expect("Failed to execute");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("kmerspill"));
    assert!(stdout.contains("count"));
    assert!(stdout.contains("histo"));
}

#[test]
fn cli_version_flag() {
    let output = kmerspill_cmd()
        .arg("--version")
        .output()
        .expect("Failed to execute");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn cli_missing_subcommand() {
    let output = kmerspill_cmd().output().expect("Failed to execute");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"));
}

#[test]
fn cli_k_out_of_range() {
    let dir = TempDir::new().unwrap();
    let reads = write_reads(dir.path());
    for k in ["0", "33", "abc"] {
        let output = kmerspill_cmd()
            .args(["count", "-m", k])
            .arg(&reads)
            .output()
            .expect("Failed to execute");
        assert!(!output.status.success(), "k = {k}");
    }
}

#[test]
fn cli_count_column_output() {
    let dir = TempDir::new().unwrap();
    let reads = write_reads(dir.path());
    let output = kmerspill_cmd()
        .current_dir(dir.path())
        .args(["count", "-m", "4", "-s", "16", "-f", "column", "-L", "2"])
        .arg(&reads)
        .output()
        .expect("Failed to execute");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["AAAA 10", "AACC 2", "ACCC 2", "CCCG 2"]);
    // fragments are removed unless kept
    assert!(!dir.path().join("mer_counts_0").exists());
}

#[test]
fn cli_count_keep_then_dump_stats_histo() {
    let dir = TempDir::new().unwrap();
    let reads = write_reads(dir.path());
    let prefix = dir.path().join("kept");

    let count = kmerspill_cmd()
        .args(["count", "-m", "4", "-k", "--rotation", "one-file", "-o"])
        .arg(dir.path().join("counts.fa"))
        .arg("--prefix")
        .arg(&prefix)
        .arg(&reads)
        .output()
        .expect("Failed to execute");
    assert!(count.status.success(), "{}", String::from_utf8_lossy(&count.stderr));
    let counted = fs::read_to_string(dir.path().join("counts.fa")).unwrap();
    assert!(counted.starts_with(">10\nAAAA\n"), "{counted}");

    let dump = kmerspill_cmd()
        .args(["dump", "-t", "-U", "1"])
        .arg(&prefix)
        .output()
        .expect("Failed to execute");
    assert!(dump.status.success());
    let dumped = String::from_utf8_lossy(&dump.stdout);
    assert_eq!(dumped.lines().count(), 4);
    assert!(dumped.lines().all(|line| line.ends_with("\t1")));

    let stats = kmerspill_cmd()
        .args(["stats", "--json"])
        .arg(&prefix)
        .output()
        .expect("Failed to execute");
    assert!(stats.status.success());
    let json: serde_json::Value = serde_json::from_slice(&stats.stdout).unwrap();
    assert_eq!(json["unique"], 4);
    assert_eq!(json["distinct"], 8);
    assert_eq!(json["total"], 20);
    assert_eq!(json["max_count"], 10);

    let histo = kmerspill_cmd()
        .arg("histo")
        .arg(&prefix)
        .output()
        .expect("Failed to execute");
    assert!(histo.status.success());
    assert_eq!(String::from_utf8_lossy(&histo.stdout), "1 4\n2 3\n10 1\n");
}

#[test]
fn cli_dump_of_garbage_reports_error() {
    let dir = TempDir::new().unwrap();
    let reads = write_reads(dir.path());
    let output = kmerspill_cmd()
        .arg("dump")
        .arg(&reads)
        .output()
        .expect("Failed to execute");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Application error"));
}

#[test]
fn cli_count_with_small_fan_in_matches_default() {
    let dir = TempDir::new().unwrap();
    let reads = write_reads(dir.path());
    let run = |fan_in: &str| {
        let output = kmerspill_cmd()
            .current_dir(dir.path())
            .args(["count", "-m", "3", "-s", "8", "--load-factor", "0.5"])
            .args(["--fan-in", fan_in, "-f", "column"])
            .arg(&reads)
            .output()
            .expect("Failed to execute");
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    assert_eq!(run("2"), run("64"));
    // intermediate fragments are cleaned up along with the rest
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("mer_counts"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn cli_cite_prints_citation() {
    let text = kmerspill_cmd()
        .arg("cite")
        .output()
        .expect("Failed to execute");
    assert!(text.status.success());
    assert!(String::from_utf8_lossy(&text.stdout).contains("Kingsford"));

    let bibtex = kmerspill_cmd()
        .args(["cite", "--bibtex"])
        .output()
        .expect("Failed to execute");
    assert!(bibtex.status.success());
    assert!(String::from_utf8_lossy(&bibtex.stdout).starts_with("@article{"));
}

#[test]
fn cli_dump_of_damaged_fragment_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let reads = write_reads(dir.path());
    let prefix = dir.path().join("kept");
    let count = kmerspill_cmd()
        .args(["count", "-m", "4", "-k", "--rotation", "one-file", "-o"])
        .arg(dir.path().join("counts.txt"))
        .arg("--prefix")
        .arg(&prefix)
        .arg(&reads)
        .output()
        .expect("Failed to execute");
    assert!(count.status.success());

    let mut bytes = fs::read(&prefix).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&prefix, &bytes).unwrap();

    let dump = kmerspill_cmd()
        .args(["dump", "-t"])
        .arg(&prefix)
        .output()
        .expect("Failed to execute");
    assert!(!dump.status.success());
    assert!(dump.stdout.is_empty());
    assert!(String::from_utf8_lossy(&dump.stderr).contains("checksum mismatch"));
}
