//! Deploy orchestration.
//!
//! One deploy invocation walks `Reconciling -> Probing -> {Promoted,
//! RolledBack}` exactly once:
//! - every stack of the new version is reconciled; any failure rolls back
//! - the health gate probes the new version once
//! - healthy: every older fleet stack of the cluster is marked inactive
//! - unhealthy: the new fleet stack is marked inactive instead
//!
//! Inactive fleets are drained and deleted by their own capacity
//! controller ticks, so neither outcome deletes anything here.

use std::fmt;
use std::sync::Arc;

use maestro_id::{ClusterName, DeployId, StackName, Version};
use maestro_reconcile::{Clock, Poller};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::backend::{
    Backends, Lookup, RoleStatus, StackBackend, StackParameters, StackStatus, UpdateOutcome,
    PARAM_STATUS, PARAM_VERSION,
};
use crate::health::{HealthGate, HealthGateConfig, HealthVerdict};
use crate::reconciler::{ReconcileOutcome, StackError, StackReconciler};

/// Statuses of fleet stacks considered for deactivation after a promotion.
const SETTLED_STATUSES: [StackStatus; 3] = [
    StackStatus::CreateComplete,
    StackStatus::UpdateComplete,
    StackStatus::RollbackComplete,
];

/// Templates for the stacks of one deploy. Only the fleet template is
/// required; the cluster and health-task stacks are reconciled when given.
#[derive(Debug, Clone, Default)]
pub struct DeployTemplates {
    pub cluster: Option<String>,
    pub fleet: String,
    pub health_task: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub cluster: ClusterName,
    pub version: Version,
    pub templates: DeployTemplates,

    /// Scaling parameters of the fleet stack. `Version` and `Status` are
    /// always overridden.
    pub fleet_parameters: StackParameters,
}

/// Promotion state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionState {
    Reconciling,
    Probing,
    Promoted,
    RolledBack,
}

impl PromotionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Promoted | Self::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reconciling => "reconciling",
            Self::Probing => "probing",
            Self::Promoted => "promoted",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for PromotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a deploy rolled back.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Reconcile(#[from] StackError),

    #[error("version {version} failed its health check ({hits} running sightings in {attempts} checks)")]
    Unhealthy {
        version: Version,
        hits: u32,
        attempts: u32,
    },
}

/// A stack touched by a deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledStack {
    pub stack: StackName,
    pub outcome: ReconcileOutcome,
}

/// Everything a deploy did.
#[derive(Debug)]
pub struct DeployReport {
    pub deploy_id: DeployId,
    pub cluster: ClusterName,
    pub version: Version,
    pub state: PromotionState,
    pub reconciled: Vec<ReconciledStack>,
    pub verdict: Option<HealthVerdict>,

    /// Stacks marked inactive by this deploy.
    pub deactivated: Vec<StackName>,

    pub failure: Option<DeployError>,
}

impl DeployReport {
    /// Process exit code: zero only for a promoted version.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            PromotionState::Promoted => 0,
            _ => 1,
        }
    }
}

/// Sequences reconciliation, probing and promotion.
pub struct Orchestrator {
    stacks: Arc<dyn StackBackend>,
    reconciler: StackReconciler,
    gate: HealthGate,
}

impl Orchestrator {
    pub fn new(backends: &Backends, clock: Arc<dyn Clock>) -> Self {
        Self {
            stacks: backends.stacks.clone(),
            reconciler: StackReconciler::new(backends.stacks.clone(), clock.clone()),
            gate: HealthGate::new(backends.cluster.clone(), clock, HealthGateConfig::default()),
        }
    }

    /// Override the stack poll schedule.
    pub fn with_stack_poller(mut self, poller: Poller) -> Self {
        self.reconciler = self.reconciler.with_poller(poller);
        self
    }

    /// Override the health gate, for example to change its schedule.
    pub fn with_health_gate(mut self, gate: HealthGate) -> Self {
        self.gate = gate;
        self
    }

    /// Run one deploy to a terminal state.
    pub async fn deploy(&self, request: &DeployRequest) -> DeployReport {
        let deploy_id = DeployId::new();
        let span = info_span!(
            "deploy",
            %deploy_id,
            cluster = %request.cluster,
            version = %request.version
        );

        self.run(deploy_id, request).instrument(span).await
    }

    async fn run(&self, deploy_id: DeployId, request: &DeployRequest) -> DeployReport {
        let mut report = DeployReport {
            deploy_id,
            cluster: request.cluster.clone(),
            version: request.version.clone(),
            state: PromotionState::Reconciling,
            reconciled: Vec::new(),
            verdict: None,
            deactivated: Vec::new(),
            failure: None,
        };
        info!(state = %report.state, "deploy started");

        if let Err(e) = self.reconcile_all(request, &mut report.reconciled).await {
            error!(error = %e, "reconcile failed, rolling back");
            report.state = PromotionState::RolledBack;
            report.failure = Some(e.into());
            return report;
        }

        report.state = PromotionState::Probing;
        info!(state = %report.state, "stacks reconciled, probing new version");

        let verdict = self.gate.probe(&request.cluster, &request.version).await;
        report.verdict = Some(verdict);

        if verdict.healthy {
            report.deactivated = self.deactivate_old(&request.cluster, &request.version).await;
            report.state = PromotionState::Promoted;
            info!(
                state = %report.state,
                deactivated = report.deactivated.len(),
                "version promoted"
            );
        } else {
            let stack = StackName::for_fleet(&request.cluster, &request.version);
            if self.deactivate(&stack).await {
                report.deactivated.push(stack);
            }
            report.state = PromotionState::RolledBack;
            report.failure = Some(DeployError::Unhealthy {
                version: request.version.clone(),
                hits: verdict.hits,
                attempts: verdict.attempts,
            });
            error!(state = %report.state, hits = verdict.hits, "health check failed, new version deactivated");
        }

        report
    }

    async fn reconcile_all(
        &self,
        request: &DeployRequest,
        reconciled: &mut Vec<ReconciledStack>,
    ) -> Result<(), StackError> {
        let cluster = &request.cluster;

        if let Some(template) = &request.templates.cluster {
            let stack = StackName::for_cluster(cluster);
            let outcome = self
                .reconciler
                .reconcile(&stack, template, &StackParameters::new())
                .await?;
            reconciled.push(ReconciledStack { stack, outcome });
        }

        let fleet_parameters = request
            .fleet_parameters
            .clone()
            .with(PARAM_VERSION, &request.version)
            .with(PARAM_STATUS, RoleStatus::Active);
        let stack = StackName::for_fleet(cluster, &request.version);
        let outcome = self
            .reconciler
            .reconcile(&stack, &request.templates.fleet, &fleet_parameters)
            .await?;
        reconciled.push(ReconciledStack { stack, outcome });

        if let Some(template) = &request.templates.health_task {
            let stack = StackName::for_health_task(cluster);
            let outcome = self
                .reconciler
                .reconcile(&stack, template, &StackParameters::new())
                .await?;
            reconciled.push(ReconciledStack { stack, outcome });
        }

        Ok(())
    }

    /// Mark every settled fleet stack of `cluster` other than `version`
    /// inactive. Per-stack failures are logged and skipped.
    async fn deactivate_old(&self, cluster: &ClusterName, version: &Version) -> Vec<StackName> {
        let summaries = match self.stacks.list_stacks(&SETTLED_STATUSES).await {
            Ok(summaries) => summaries,
            Err(e) => {
                warn!(error = %e, "failed to list stacks, old versions stay active");
                return Vec::new();
            }
        };

        let mut deactivated = Vec::new();
        for summary in summaries {
            let old = match summary.name.fleet_version(cluster) {
                Some(v) if &v != version => v,
                _ => continue,
            };
            if !self.owns(&summary.name, &old).await {
                continue;
            }
            if self.deactivate(&summary.name).await {
                deactivated.push(summary.name);
            }
        }
        deactivated
    }

    /// Whether a fleet stack matched by name was deployed as `version` of
    /// this cluster. The name alone is ambiguous once a cluster name
    /// contains `-fleet-`, so the stack's `Version` parameter must agree
    /// with the parsed suffix.
    async fn owns(&self, stack: &StackName, version: &Version) -> bool {
        match self.stacks.describe_stack(stack).await {
            Ok(Lookup::Found(description)) => {
                let owned = description.parameters.version() == Some(version.as_str());
                if !owned {
                    info!(
                        %stack,
                        parameter = description.parameters.version().unwrap_or("<unset>"),
                        "fleet stack belongs to another cluster, skipping"
                    );
                }
                owned
            }
            Ok(Lookup::Absent) => false,
            Err(e) => {
                warn!(%stack, error = %e, "failed to read fleet stack, leaving it active");
                false
            }
        }
    }

    /// Set `Status=inactive` on `stack`, keeping its template. Returns true
    /// if the stack changed.
    async fn deactivate(&self, stack: &StackName) -> bool {
        let overrides = StackParameters::new().with(PARAM_STATUS, RoleStatus::Inactive);

        match self.reconciler.override_parameters(stack, &overrides).await {
            Ok(UpdateOutcome::Updated) => {
                info!(%stack, "marked stack inactive");
                true
            }
            Ok(UpdateOutcome::NoChange) => {
                info!(%stack, "stack already inactive");
                false
            }
            Err(e) => {
                warn!(%stack, error = %e, "failed to mark stack inactive");
                false
            }
        }
    }

    /// Reconcile the deployment pipeline stack of `cluster`.
    pub async fn put_pipeline(
        &self,
        cluster: &ClusterName,
        template: &str,
        parameters: &StackParameters,
    ) -> Result<ReconcileOutcome, StackError> {
        let stack = StackName::for_pipeline(cluster);
        self.reconciler.reconcile(&stack, template, parameters).await
    }
}
