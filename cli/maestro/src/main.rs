//! maestro - deploy versioned spot fleets
//!
//! Reconciles the stacks of a new version, gates promotion on a canary
//! health check and marks superseded fleets inactive. Works against the
//! local state file backend.

use anyhow::Result;
use clap::Parser;

mod commands;
mod config;
mod error;
mod output;
mod params;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
