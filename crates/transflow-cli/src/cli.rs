use clap::{Parser, Subcommand, ValueHint};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "transflow", author, version, about, long_about = None)]
pub struct Cli {
    /// Set the logging level
    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate a vector document and summarize it
    Check {
        /// Path to the JSON document
        #[arg(value_hint = ValueHint::FilePath)]
        document: PathBuf,
        /// Number of values per time node
        #[arg(long)]
        inner_length: usize,
    },
    /// Resample a vector document onto a regular grid
    Resample {
        /// Path to the JSON document
        #[arg(value_hint = ValueHint::FilePath)]
        document: PathBuf,
        /// Number of values per time node
        #[arg(long)]
        inner_length: usize,
        /// First grid time
        #[arg(long, allow_negative_numbers = true)]
        start: f64,
        /// Last grid time
        #[arg(long, allow_negative_numbers = true)]
        end: f64,
        /// Desired spacing, shrunk so that the grid ends exactly at `end`
        #[arg(long)]
        delta: f64,
        /// Write the document here instead of stdout
        #[arg(short, long, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
    },
}
