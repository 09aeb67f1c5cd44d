use std::{io::stdout, process};

use clap::Parser;
use colored::Colorize;
use kmerspill::{
    cli::{Cli, Command},
    error::KmerSpillError,
    run,
};

#[cfg(feature = "tracing")]
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn execute(cli: Cli) -> Result<(), KmerSpillError> {
    match cli.command {
        Command::Count(args) => {
            let config = args.config()?;
            let summary = run::run_count(config, &args.options())?;
            if cli.verbose {
                eprintln!(
                    "{}: {} k-mers, {} drains, {} files",
                    "counted".bold(),
                    summary.progress.kmers_counted.to_string().blue().bold(),
                    summary.progress.drains,
                    summary.files_written
                );
            }
        }
        Command::Dump(args) => {
            run::run_dump(
                &args.fragments,
                args.range.range(),
                args.merge.fan_in,
                args.format(),
                args.output.as_deref(),
            )?;
        }
        Command::Stats(args) => {
            let stats = run::run_stats(&args.fragments, args.range.range(), args.merge.fan_in)?;
            run::write_stats(&mut stdout().lock(), &stats, args.json)?;
        }
        Command::Histo(args) => {
            run::run_histo(
                &args.fragments,
                args.range.range(),
                args.merge.fan_in,
                args.output.as_deref(),
            )?;
        }
        Command::Cite(args) => {
            run::run_cite(args.bibtex, args.output.as_deref())?;
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    #[cfg(feature = "tracing")]
    init_tracing(cli.verbose);

    if let Err(e) = execute(cli) {
        eprintln!(
            "{}\n {}",
            "Application error:".blue().bold(),
            e.to_string().blue()
        );
        process::exit(1);
    }
}
