//! Deploy command (reconcile, probe, promote).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use maestro_deployer::backend::{
    Backends, StackParameters, PARAM_SPOT_CAPACITY, PARAM_SPOT_MAX_WEIGHT, PARAM_SPOT_MIN_WEIGHT,
    PARAM_SPOT_THRESHOLD_IN, PARAM_SPOT_THRESHOLD_OUT,
};
use maestro_deployer::orchestrator::{DeployRequest, DeployTemplates, Orchestrator};
use maestro_id::{ClusterName, Version};
use maestro_reconcile::SystemClock;

use crate::config::{open_backend, resolve_version, save_backend};
use crate::error::CliError;
use crate::output::print_report;
use crate::params;

use super::CommandContext;

const FLEET_TEMPLATE: &str = "fleet.json";
const CLUSTER_TEMPLATE: &str = "cluster.json";
const HEALTH_TASK_TEMPLATE: &str = "health-task.json";

/// Deploy command - roll out a new version of a cluster's fleet.
#[derive(Debug, Args)]
pub struct DeployCommand {
    /// Cluster to deploy to.
    #[arg(long, env = "CLUSTER_NAME")]
    cluster: ClusterName,

    /// Version to deploy. Defaults to the current git commit.
    #[arg(long, env = "VERSION")]
    version: Option<Version>,

    /// Directory holding fleet.json and, optionally, cluster.json and
    /// health-task.json.
    #[arg(long, default_value = "templates")]
    templates: PathBuf,

    /// JSON file of fleet stack parameters.
    #[arg(long)]
    parameters: Option<PathBuf>,

    /// Initial fleet capacity.
    #[arg(long)]
    spot_capacity: Option<u32>,

    /// Lower bound the scaler keeps the fleet at.
    #[arg(long)]
    min_weight: Option<u32>,

    /// Upper bound the scaler keeps the fleet at.
    #[arg(long)]
    max_weight: Option<u32>,

    /// Metric value above which the scaler scales in.
    #[arg(long)]
    threshold_in: Option<f64>,

    /// Metric value below which the scaler scales out.
    #[arg(long)]
    threshold_out: Option<f64>,
}

impl DeployCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let version = resolve_version(self.version.clone()).await?;
        let templates = self.load_templates().await?;
        let fleet_parameters = self.fleet_parameters().await?;

        let backend = open_backend(&ctx.state_file).await?;
        let orchestrator = Orchestrator::new(&Backends::from_memory(backend.clone()), Arc::new(SystemClock));

        let request = DeployRequest {
            cluster: self.cluster,
            version,
            templates,
            fleet_parameters,
        };
        let report = orchestrator.deploy(&request).await;

        save_backend(&backend).await?;
        print_report(&report, ctx.format);

        if report.exit_code() != 0 {
            let reason = report
                .failure
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown failure".to_string());
            return Err(CliError::DeployFailed {
                version: report.version.clone(),
                state: report.state,
                reason,
            }
            .into());
        }

        Ok(())
    }

    async fn load_templates(&self) -> Result<DeployTemplates> {
        let fleet_path = self.templates.join(FLEET_TEMPLATE);
        let fleet = read_template(&fleet_path)
            .await?
            .ok_or(CliError::MissingTemplate(fleet_path))?;

        Ok(DeployTemplates {
            cluster: read_template(&self.templates.join(CLUSTER_TEMPLATE)).await?,
            fleet,
            health_task: read_template(&self.templates.join(HEALTH_TASK_TEMPLATE)).await?,
        })
    }

    /// The parameters file overlaid with any scaling flags.
    async fn fleet_parameters(&self) -> Result<StackParameters> {
        let mut parameters = params::load_optional(self.parameters.as_deref()).await?;

        if let Some(v) = self.spot_capacity {
            parameters.insert(PARAM_SPOT_CAPACITY, v);
        }
        if let Some(v) = self.min_weight {
            parameters.insert(PARAM_SPOT_MIN_WEIGHT, v);
        }
        if let Some(v) = self.max_weight {
            parameters.insert(PARAM_SPOT_MAX_WEIGHT, v);
        }
        if let Some(v) = self.threshold_in {
            parameters.insert(PARAM_SPOT_THRESHOLD_IN, v);
        }
        if let Some(v) = self.threshold_out {
            parameters.insert(PARAM_SPOT_THRESHOLD_OUT, v);
        }

        Ok(parameters)
    }
}

/// Read a template file; `None` if it does not exist.
async fn read_template(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(body) => Ok(Some(body)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read template {:?}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(templates: PathBuf) -> DeployCommand {
        DeployCommand {
            cluster: "kloudcover".parse().unwrap(),
            version: Some("39d7327".parse().unwrap()),
            templates,
            parameters: None,
            spot_capacity: None,
            min_weight: Some(2),
            max_weight: None,
            threshold_in: Some(6.5),
            threshold_out: None,
        }
    }

    #[tokio::test]
    async fn test_fleet_template_is_required() {
        let dir = tempfile::tempdir().unwrap();
        let err = command(dir.path().to_path_buf())
            .load_templates()
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::MissingTemplate(_))
        ));
    }

    #[tokio::test]
    async fn test_optional_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FLEET_TEMPLATE), "{\"fleet\":1}").unwrap();
        std::fs::write(dir.path().join(HEALTH_TASK_TEMPLATE), "{\"health\":1}").unwrap();

        let templates = command(dir.path().to_path_buf())
            .load_templates()
            .await
            .unwrap();
        assert_eq!(templates.fleet, "{\"fleet\":1}");
        assert_eq!(templates.cluster, None);
        assert_eq!(templates.health_task.as_deref(), Some("{\"health\":1}"));
    }

    #[tokio::test]
    async fn test_flags_override_parameters_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("params.json");
        std::fs::write(&file, r#"{"SpotMinWeight": 1, "KeyName": "ops"}"#).unwrap();

        let mut cmd = command(dir.path().to_path_buf());
        cmd.parameters = Some(file);
        let params = cmd.fleet_parameters().await.unwrap();

        assert_eq!(params.get(PARAM_SPOT_MIN_WEIGHT), Some("2"));
        assert_eq!(params.get(PARAM_SPOT_THRESHOLD_IN), Some("6.5"));
        assert_eq!(params.get("KeyName"), Some("ops"));
    }
}
