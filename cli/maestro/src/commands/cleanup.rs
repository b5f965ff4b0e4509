//! Cleanup command (drain queued stack deletion requests).

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use maestro_deployer::cleanup::{CleanupWorker, CleanupWorkerConfig};
use maestro_reconcile::SystemClock;
use serde_json::json;

use crate::config::{open_backend, save_backend};
use crate::error::CliError;
use crate::output::{print_info, print_json, print_success, OutputFormat};

use super::CommandContext;

/// Cleanup command - run the cleanup worker over queued requests.
#[derive(Debug, Args)]
pub struct CleanupCommand {
    /// List queued requests without deleting anything.
    #[arg(long)]
    dry_run: bool,
}

impl CleanupCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let backend = open_backend(&ctx.state_file).await?;

        if self.dry_run {
            let queued = backend.cleanup_requests().await;
            let stacks: Vec<&str> = queued.iter().map(|r| r.request.stack.as_str()).collect();
            match ctx.format {
                OutputFormat::Json => print_json(&json!({ "queued": stacks })),
                OutputFormat::Text if stacks.is_empty() => print_info("No cleanup requests queued."),
                OutputFormat::Text => {
                    for stack in stacks {
                        println!("{stack}");
                    }
                }
            }
            return Ok(());
        }

        let requests: Vec<_> = backend
            .take_cleanup_requests()
            .await
            .into_iter()
            .map(|record| record.request)
            .collect();

        let worker = CleanupWorker::new(backend.clone(), Arc::new(SystemClock), CleanupWorkerConfig::default());
        let pass = worker.run_pass(&requests).await;
        save_backend(&backend).await?;

        match ctx.format {
            OutputFormat::Json => print_json(&json!({
                "deleted": pass.deleted,
                "failed": pass.failed,
            })),
            OutputFormat::Text => {
                print_success(&format!("Deleted {} stack(s)", pass.deleted));
            }
        }

        if pass.failed > 0 {
            return Err(CliError::CleanupFailed { failed: pass.failed }.into());
        }
        Ok(())
    }
}
