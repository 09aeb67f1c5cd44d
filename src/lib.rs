//! # kmerspill
//!
//! Bounded-memory, parallel k-mer counting.
//!
//! Producers count k-mers into a lock-free hash table whose slots pack a
//! reprobe tag, part of the key and a small counter into one atomic word.
//! When a table fills up it is drained to an on-disk fragment and counting
//! continues in a fresh table; at the end every fragment and the remaining
//! in-memory counts are merged into one sorted, filtered stream.
//!
//! ## Library usage
//!
//! ```rust,no_run
//! use kmerspill::{builder::CounterBuilder, merge::CountRange, run::count_files};
//!
//! let config = CounterBuilder::new()
//!     .k(21)?
//!     .table_size(1 << 20)
//!     .prefix("/tmp/mer_counts")
//!     .build()?;
//!
//! let outcome = count_files(config, &["genome.fa"])?;
//! for record in outcome.merge(CountRange::new(Some(2), None))? {
//!     let (key, count) = record?;
//!     println!("{key:#x}\t{count}");
//! }
//! outcome.remove_fragments()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Features
//!
//! - `tracing` (default): structured logging through the `tracing` crate

pub mod builder;
pub mod cli;
pub mod codec;
pub mod config;
pub mod controller;
pub mod dumper;
pub mod error;
pub mod fragment;
pub mod histogram;
pub mod kmer;
pub mod merge;
pub mod output;
pub mod progress;
pub mod reader;
pub mod run;
pub mod table;
