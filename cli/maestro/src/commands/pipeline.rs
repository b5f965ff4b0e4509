//! Put-pipeline command (reconcile the deployment pipeline stack).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use maestro_deployer::backend::Backends;
use maestro_deployer::orchestrator::Orchestrator;
use maestro_id::{ClusterName, StackName};
use maestro_reconcile::SystemClock;
use serde_json::json;

use crate::config::{open_backend, save_backend};
use crate::output::{outcome_str, print_json, print_success, OutputFormat};
use crate::params;

use super::CommandContext;

/// Put-pipeline command - create or update `{cluster}-pipeline`.
#[derive(Debug, Args)]
pub struct PutPipelineCommand {
    /// Cluster the pipeline deploys.
    #[arg(long, env = "CLUSTER_NAME")]
    cluster: ClusterName,

    /// Pipeline template file.
    #[arg(long)]
    template: PathBuf,

    /// JSON file of pipeline stack parameters.
    #[arg(long)]
    parameters: Option<PathBuf>,
}

impl PutPipelineCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let template = tokio::fs::read_to_string(&self.template)
            .await
            .with_context(|| format!("Failed to read template {:?}", self.template))?;
        let parameters = params::load_optional(self.parameters.as_deref()).await?;

        let backend = open_backend(&ctx.state_file).await?;
        let orchestrator = Orchestrator::new(&Backends::from_memory(backend.clone()), Arc::new(SystemClock));

        let result = orchestrator
            .put_pipeline(&self.cluster, &template, &parameters)
            .await;
        save_backend(&backend).await?;
        let outcome = result?;

        let stack = StackName::for_pipeline(&self.cluster);
        match ctx.format {
            OutputFormat::Json => print_json(&json!({
                "stack": stack.as_str(),
                "outcome": outcome_str(outcome),
            })),
            OutputFormat::Text => {
                print_success(&format!("Pipeline {} {}", stack, outcome_str(outcome)));
            }
        }

        Ok(())
    }
}
