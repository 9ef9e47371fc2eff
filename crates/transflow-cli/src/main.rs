use anyhow::Result;
use clap::Parser;
use std::io;
use tracing::error;
use transflow_cli::cli::{Cli, Commands};
use transflow_cli::commands;
use transflow_core::GridSpec;

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(cli.log_level.into()),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(err) = run(cli.command) {
        error!("{err:#}");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Check {
            document,
            inner_length,
        } => {
            let loaded = commands::check(&document, inner_length)?;
            println!("{}", loaded.summary());
        }
        Commands::Resample {
            document,
            inner_length,
            start,
            end,
            delta,
            output,
        } => {
            let grid = GridSpec {
                start,
                end,
                desired_delta: delta,
            };
            let resampled = commands::resample(&document, inner_length, &grid)?;
            if let Some(text) = commands::emit(&resampled, output.as_deref())? {
                println!("{text}");
            }
        }
    }
    Ok(())
}
