//! CLI entry point: converts a skiplistdb file between the legacy and
//! current on-disk formats.

use clap::{Parser, ValueEnum};
use skiplistdb_convert::{convert, Error};
use skiplistdb_core::FormatVersion;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Target on-disk format for the destination file.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum TargetFormat {
    /// 32-bit offsets, no per-record CRC, no header CRC.
    Legacy,
    /// 64-bit offsets, per-record CRC, header CRC.
    Current,
}

impl From<TargetFormat> for FormatVersion {
    fn from(value: TargetFormat) -> Self {
        match value {
            TargetFormat::Legacy => FormatVersion::Legacy,
            TargetFormat::Current => FormatVersion::Current,
        }
    }
}

/// Converts a skiplistdb file between the legacy and current on-disk formats.
#[derive(Parser, Debug)]
#[command(name = "skiplistdb-convert", version, about)]
struct Cli {
    /// Path to the source store file (opened read-only, any supported format).
    source: PathBuf,

    /// Path the converted store is written to. Must not already exist
    /// unless `--force` is given.
    dest: PathBuf,

    /// On-disk format to write the destination in.
    #[arg(long, value_enum, default_value = "current")]
    to: TargetFormat,

    /// Overwrite `dest` if it already exists.
    #[arg(long)]
    force: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match convert(&cli.source, &cli.dest, cli.to.into(), cli.force) {
        Ok(stats) => {
            println!("converted {} records", stats.records);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("skiplistdb-convert: {err}");
            if matches!(err, Error::DestinationExists(_)) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
