//! CLI commands.

mod cleanup;
mod deploy;
mod pipeline;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use maestro_deployer::config::DEFAULT_STATE_FILE;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::output::OutputFormat;

/// maestro CLI - Deploy versioned spot fleets behind a health gate.
#[derive(Debug, Parser)]
#[command(name = "maestro")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (text or json).
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Local backend state file.
    #[arg(long, global = true, env = "MAESTRO_STATE_FILE", default_value = DEFAULT_STATE_FILE)]
    state_file: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, global = true, env = "MAESTRO_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile, probe and promote a new version.
    Deploy(deploy::DeployCommand),

    /// Create or update the deployment pipeline stack.
    PutPipeline(pipeline::PutPipelineCommand),

    /// Delete stacks whose cleanup was requested by the scaler.
    Cleanup(cleanup::CleanupCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        // Logs go to stderr so stdout stays parseable with --format json
        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| self.log_level.clone().into()))
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();

        let ctx = CommandContext {
            format: self.format,
            state_file: self.state_file,
        };

        match self.command {
            Commands::Deploy(cmd) => cmd.run(ctx).await,
            Commands::PutPipeline(cmd) => cmd.run(ctx).await,
            Commands::Cleanup(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("maestro {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub state_file: PathBuf,
}
