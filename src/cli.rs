//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{
    builder::{
        CounterBuilder, DEFAULT_COUNTER_LEN, DEFAULT_LOAD_FACTOR, DEFAULT_MAX_REPROBE,
        DEFAULT_TABLE_SIZE,
    },
    config::{CounterConfig, DrainPolicy, FileRotation, FragmentOrder, OverflowPolicy},
    error::KmerSpillError,
    merge::{CountRange, DEFAULT_FAN_IN},
    output::OutputFormat,
    run::CountOptions,
};

/// Bounded-memory parallel k-mer counting with spill-to-disk and merge.
#[derive(Parser, Debug)]
#[command(name = "kmerspill")]
#[command(version, author, about, long_about = None)]
pub struct Cli {
    /// Log progress to stderr (`RUST_LOG` takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Count k-mers in FASTA/FASTQ files and print the merged counts
    Count(CountArgs),
    /// Merge existing fragment files and print the counts
    Dump(DumpArgs),
    /// Print summary statistics of fragment files
    Stats(StatsArgs),
    /// Print the count-of-counts histogram of fragment files
    Histo(HistoArgs),
    /// Print how to cite the lock-free k-mer counting paper
    Cite(CiteArgs),
}

/// Inclusive count bounds shared by the reading subcommands.
#[derive(Args, Debug, Clone, Copy)]
pub struct RangeArgs {
    /// Don't output k-mers with count < lower
    #[arg(short = 'L', long)]
    pub lower: Option<u64>,

    /// Don't output k-mers with count > upper
    #[arg(short = 'U', long)]
    pub upper: Option<u64>,
}

impl RangeArgs {
    /// The bounds as a [`CountRange`].
    #[must_use]
    pub fn range(self) -> CountRange {
        CountRange::new(self.lower, self.upper)
    }
}

/// Merge settings shared by every subcommand that merges fragments.
#[derive(Args, Debug, Clone, Copy)]
pub struct MergeArgs {
    /// Most fragment files read at once; more are merged in several passes
    #[arg(long, default_value_t = DEFAULT_FAN_IN, value_parser = parse_fan_in)]
    pub fan_in: usize,
}

/// Arguments of `kmerspill count`.
#[derive(Args, Debug)]
pub struct CountArgs {
    /// K-mer length (1-32)
    #[arg(short = 'm', long = "mer-len", value_parser = parse_k)]
    pub k: usize,

    /// Slots per counting table (rounded up to a power of two)
    #[arg(short = 's', long, default_value_t = DEFAULT_TABLE_SIZE)]
    pub size: usize,

    /// Bits of the in-slot counter
    #[arg(short = 'c', long, default_value_t = DEFAULT_COUNTER_LEN)]
    pub counter_len: u8,

    /// Maximum reprobes before a table counts as full
    #[arg(short = 'p', long, default_value_t = DEFAULT_MAX_REPROBE)]
    pub reprobes: usize,

    /// Producer threads (defaults to the available parallelism)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Count k-mers and their reverse complements separately
    #[arg(long)]
    pub no_canonical: bool,

    /// Occupied fraction of a table that triggers a drain
    #[arg(long, default_value_t = DEFAULT_LOAD_FACTOR)]
    pub load_factor: f64,

    /// How producers keep going while a table drains
    #[arg(long, value_enum, default_value_t)]
    pub drain: DrainPolicy,

    /// Where successive drains are written
    #[arg(long, value_enum, default_value_t)]
    pub rotation: FileRotation,

    /// Record order inside fragments
    #[arg(long, value_enum, default_value_t)]
    pub order: FragmentOrder,

    /// What happens to counts that outgrow the in-slot counter
    #[arg(long, value_enum, default_value_t)]
    pub overflow: OverflowPolicy,

    /// Path prefix of fragment files
    #[arg(long, default_value = "mer_counts")]
    pub prefix: PathBuf,

    /// Keep fragment files after merging (the final table is dumped too)
    #[arg(short, long)]
    pub keep: bool,

    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub merge: MergeArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// FASTA/FASTQ input files
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,
}

impl CountArgs {
    /// Validated counter configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid combination of options.
    pub fn config(&self) -> Result<CounterConfig, KmerSpillError> {
        let mut builder = CounterBuilder::new()
            .k(self.k)?
            .table_size(self.size)
            .counter_len(self.counter_len)
            .max_reprobe(self.reprobes)
            .canonical(!self.no_canonical)
            .load_factor(self.load_factor)
            .drain(self.drain)
            .rotation(self.rotation)
            .order(self.order)
            .overflow(self.overflow)
            .prefix(&self.prefix)
            .dump_residue(self.keep)
            .merge_fan_in(self.merge.fan_in);
        if let Some(threads) = self.threads {
            builder = builder.threads(threads);
        }
        builder.build()
    }

    /// Output options.
    #[must_use]
    pub fn options(&self) -> CountOptions {
        CountOptions {
            inputs: self.inputs.clone(),
            range: self.range.range(),
            format: self.format,
            output: self.output.clone(),
            keep_fragments: self.keep,
        }
    }
}

/// Arguments of `kmerspill dump`.
#[derive(Args, Debug)]
pub struct DumpArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub merge: MergeArgs,

    /// Output format
    #[arg(short, long, value_enum, default_value_t)]
    pub format: OutputFormat,

    /// Column format (same as --format column)
    #[arg(short = 'c', long, conflicts_with_all = ["format", "tab"])]
    pub column: bool,

    /// Tab separator (same as --format tab)
    #[arg(short = 't', long, conflicts_with = "format")]
    pub tab: bool,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Fragment files
    #[arg(required = true)]
    pub fragments: Vec<PathBuf>,
}

impl DumpArgs {
    /// The effective output format.
    #[must_use]
    pub fn format(&self) -> OutputFormat {
        if self.column {
            OutputFormat::Column
        } else if self.tab {
            OutputFormat::Tab
        } else {
            self.format
        }
    }
}

/// Arguments of `kmerspill stats`.
#[derive(Args, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub merge: MergeArgs,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,

    /// Fragment files
    #[arg(required = true)]
    pub fragments: Vec<PathBuf>,
}

/// Arguments of `kmerspill histo`.
#[derive(Args, Debug)]
pub struct HistoArgs {
    #[command(flatten)]
    pub range: RangeArgs,

    #[command(flatten)]
    pub merge: MergeArgs,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Fragment files
    #[arg(required = true)]
    pub fragments: Vec<PathBuf>,
}

/// Arguments of `kmerspill cite`.
#[derive(Args, Debug)]
pub struct CiteArgs {
    /// Bibtex format
    #[arg(short, long)]
    pub bibtex: bool,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

fn parse_k(s: &str) -> Result<usize, String> {
    let k: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if k == 0 {
        return Err("k-mer length must be at least 1".to_string());
    }
    if k > 32 {
        return Err("k-mer length must be at most 32".to_string());
    }
    Ok(k)
}

fn parse_fan_in(s: &str) -> Result<usize, String> {
    let fan_in: usize = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if fan_in < 2 {
        return Err("a merge needs a fan-in of at least 2".to_string());
    }
    Ok(fan_in)
}
