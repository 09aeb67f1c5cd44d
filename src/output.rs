//! Rendering merged counts.

use std::io::Write;

use clap::ValueEnum;
use serde::Serialize;

use crate::{
    error::KmerSpillError,
    kmer::{unpack_to_string, KmerLength},
};

/// Output format for k-mer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// FASTA-like records (`>{count}\n{kmer}`)
    #[default]
    Fasta,
    /// Space separated columns (`{kmer} {count}`)
    Column,
    /// Tab separated columns (`{kmer}\t{count}`)
    Tab,
    /// JSON array of `{"kmer": .., "count": ..}` objects
    Json,
}

#[derive(Serialize)]
struct KmerCount<'a> {
    kmer: &'a str,
    count: u64,
}

/// Writes `counts` to `writer` in `format`, returning the number of records.
///
/// Records are written as they arrive, so a merge is never collected in
/// memory. The first error from `counts` stops the output.
///
/// # Errors
///
/// Returns the first error from `counts`, or [`KmerSpillError::WriteError`] /
/// [`KmerSpillError::JsonError`] if writing fails.
pub fn write_counts<W, I>(
    writer: &mut W,
    counts: I,
    k: KmerLength,
    format: OutputFormat,
) -> Result<u64, KmerSpillError>
where
    W: Write,
    I: IntoIterator<Item = Result<(u64, u64), KmerSpillError>>,
{
    let mut written = 0u64;
    if format == OutputFormat::Json {
        writer.write_all(b"[")?;
    }
    for record in counts {
        let (key, count) = record?;
        let kmer = unpack_to_string(key, k);
        match format {
            OutputFormat::Fasta => writeln!(writer, ">{count}\n{kmer}")?,
            OutputFormat::Column => writeln!(writer, "{kmer} {count}")?,
            OutputFormat::Tab => writeln!(writer, "{kmer}\t{count}")?,
            OutputFormat::Json => {
                let separator: &[u8] = if written == 0 { b"\n  " } else { b",\n  " };
                writer.write_all(separator)?;
                serde_json::to_writer(&mut *writer, &KmerCount { kmer: &kmer, count })?;
            }
        }
        written += 1;
    }
    if format == OutputFormat::Json {
        if written > 0 {
            writer.write_all(b"\n")?;
        }
        writer.write_all(b"]\n")?;
    }
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::kmer::encode;

    fn render(format: OutputFormat) -> String {
        let k = KmerLength::new(3).unwrap();
        let counts = vec![
            Ok((encode(b"AAC").unwrap(), 7)),
            Ok((encode(b"GTA").unwrap(), 1)),
        ];
        let mut out = Vec::new();
        let written = write_counts(&mut out, counts, k, format).unwrap();
        assert_eq!(written, 2);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn fasta_format() {
        insta::assert_snapshot!(render(OutputFormat::Fasta), @r###"
        >7
        AAC
        >1
        GTA
        "###);
    }

    #[test]
    fn column_format() {
        insta::assert_snapshot!(render(OutputFormat::Column), @r###"
        AAC 7
        GTA 1
        "###);
    }

    #[test]
    fn tab_format() {
        assert_eq!(render(OutputFormat::Tab), "AAC\t7\nGTA\t1\n");
    }

    #[test]
    fn json_format() {
        insta::assert_snapshot!(render(OutputFormat::Json), @r###"
        [
          {"kmer":"AAC","count":7},
          {"kmer":"GTA","count":1}
        ]
        "###);
        let parsed: serde_json::Value =
            serde_json::from_str(&render(OutputFormat::Json)).unwrap();
        assert_eq!(parsed[0]["count"], 7);
    }

    #[test]
    fn empty_json_is_an_empty_array() {
        let mut out = Vec::new();
        let written = write_counts(
            &mut out,
            std::iter::empty(),
            KmerLength::new(3).unwrap(),
            OutputFormat::Json,
        )
        .unwrap();
        assert_eq!(written, 0);
        assert_eq!(String::from_utf8(out).unwrap(), "[]\n");
    }

    #[test]
    fn source_error_stops_output() {
        let counts = vec![
            Ok((0, 1)),
            Err(KmerSpillError::Cancelled),
            Ok((1, 1)),
        ];
        let mut out = Vec::new();
        let err = write_counts(
            &mut out,
            counts,
            KmerLength::new(2).unwrap(),
            OutputFormat::Column,
        )
        .unwrap_err();
        assert!(matches!(err, KmerSpillError::Cancelled));
        assert_eq!(String::from_utf8(out).unwrap(), "AA 1\n");
    }
}
