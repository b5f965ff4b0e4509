//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use maestro_deployer::orchestrator::PromotionState;
use maestro_id::Version;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No version given and `git rev-parse HEAD` failed: {0}")]
    NoVersion(String),

    #[error("Template not found: {}", .0.display())]
    MissingTemplate(PathBuf),

    #[error("Invalid parameters file {}: {reason}", .path.display())]
    InvalidParameters { path: PathBuf, reason: String },

    #[error("Deploy of {version} ended {state}: {reason}")]
    DeployFailed {
        version: Version,
        state: PromotionState,
        reason: String,
    },

    #[error("{failed} cleanup request(s) failed")]
    CleanupFailed { failed: u64 },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NoVersion(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Pass --version or set VERSION when not inside a git checkout.".yellow()
                );
            }
            CliError::MissingTemplate(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: --templates must point at a directory containing fleet.json.".yellow()
                );
            }
            CliError::InvalidParameters { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Use a JSON object of scalars or a list of {\"ParameterKey\", \"ParameterValue\"} pairs."
                        .yellow()
                );
            }
            CliError::DeployFailed {
                state: PromotionState::RolledBack,
                ..
            } => {
                eprintln!(
                    "\n{}",
                    "Hint: The previous version is still active. Its fleet was not touched.".yellow()
                );
            }
            CliError::CleanupFailed { .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Failed requests were dropped; the next scaler tick requests them again."
                        .yellow()
                );
            }
            _ => {}
        }
    }
}
