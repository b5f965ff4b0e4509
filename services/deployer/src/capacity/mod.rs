//! Spot fleet capacity control.
//!
//! One [`CapacityController::tick`] runs per fleet per schedule, each in a
//! fresh process. A tick either adjusts the fleet once or does nothing; the
//! persisted cooldown record keeps consecutive ticks from piling up
//! mutations.
//!
//! A tick follows the first matching rule:
//! 1. The fleet stack is marked inactive: drain it one step at a time, and
//!    once it is empty and no member of the version remains, request
//!    deletion of the stack
//! 2. The cooldown is active: do nothing
//! 3. The metric is above `threshold_in`: scale in
//! 4. The metric is below `threshold_out`: scale out
//! 5. Otherwise do nothing

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use maestro_id::{ClusterName, FleetId, StackName, Version};
use maestro_reconcile::Clock;
use tracing::{info, instrument, warn};

use crate::backend::{
    BackendError, Backends, ClusterBackend, FleetBackend, Lookup, MetricsSource, RoleStatus,
    StackBackend,
};
use crate::lifecycle::{DispatchOutcome, LifecycleCleaner};

mod cooldown;
mod policy;

pub use cooldown::{cooldown_key, CooldownStore};
pub use policy::{clamp_target, ScalingPolicy};

/// Metric scaled on unless configured otherwise.
pub const DEFAULT_SCALE_METRIC: &str = "Schedulable Cluster Tasks";

/// Trailing window the metric is averaged over.
pub const DEFAULT_METRIC_WINDOW: Duration = Duration::from_secs(240);

/// Capacity controller settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacityConfig {
    pub policy: ScalingPolicy,

    /// When false only the deactivation path runs.
    pub enabled: bool,

    /// Role status assumed when the fleet stack cannot be read.
    pub fallback_status: RoleStatus,

    pub metric: String,
    pub metric_window: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            policy: ScalingPolicy::default(),
            enabled: true,
            fallback_status: RoleStatus::Active,
            metric: DEFAULT_SCALE_METRIC.to_string(),
            metric_window: DEFAULT_METRIC_WINDOW,
        }
    }
}

/// Why a tick did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoActionReason {
    CooldownActive,
    WithinThresholds,
    ClampedToCurrent,
    RunningTasksVeto,
    Disabled,
    NoMetric,
    /// The fleet is drained but members of the version are still active.
    MembersRemaining,
    /// The deletion request could not be delivered; the next tick retries.
    DeletionDropped,
}

impl fmt::Display for NoActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CooldownActive => "cooldown active",
            Self::WithinThresholds => "metric within thresholds",
            Self::ClampedToCurrent => "target clamped to current capacity",
            Self::RunningTasksVeto => "running tasks veto scale to zero",
            Self::Disabled => "scaling disabled",
            Self::NoMetric => "no metric datapoint",
            Self::MembersRemaining => "version still has active members",
            Self::DeletionDropped => "deletion request dropped",
        };
        f.write_str(s)
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    NoAction(NoActionReason),

    /// Capacity changed by the threshold policy.
    Scaled { from: u32, to: u32 },

    /// Capacity reduced by one drain step of an inactive fleet.
    Drained { from: u32, to: u32 },

    /// Deletion of the fleet stack was handed to the cleanup worker.
    DeletionRequested(StackName),
}

impl TickOutcome {
    /// Returns true if the tick changed anything.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::NoAction(_))
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAction(reason) => write!(f, "no action ({reason})"),
            Self::Scaled { from, to } => write!(f, "scaled {from} -> {to}"),
            Self::Drained { from, to } => write!(f, "drained {from} -> {to}"),
            Self::DeletionRequested(stack) => write!(f, "deletion of {stack} requested"),
        }
    }
}

/// Scales one weighted fleet against scheduling pressure.
pub struct CapacityController {
    stacks: Arc<dyn StackBackend>,
    fleets: Arc<dyn FleetBackend>,
    cluster: Arc<dyn ClusterBackend>,
    metrics: Arc<dyn MetricsSource>,
    cooldown: CooldownStore,
    cleaner: LifecycleCleaner,
    config: CapacityConfig,
}

impl CapacityController {
    pub fn new(backends: &Backends, clock: Arc<dyn Clock>, config: CapacityConfig) -> Self {
        Self {
            stacks: backends.stacks.clone(),
            fleets: backends.fleets.clone(),
            cluster: backends.cluster.clone(),
            metrics: backends.metrics.clone(),
            cooldown: CooldownStore::new(backends.parameters.clone(), clock),
            cleaner: LifecycleCleaner::new(backends.cluster.clone(), backends.cleanup.clone()),
            config,
        }
    }

    pub fn config(&self) -> &CapacityConfig {
        &self.config
    }

    /// Run one control step for the fleet of `(cluster, version)`.
    #[instrument(skip_all, fields(%fleet, %cluster, %version))]
    pub async fn tick(
        &self,
        fleet: &FleetId,
        cluster: &ClusterName,
        version: &Version,
    ) -> Result<TickOutcome, BackendError> {
        let outcome = match self.role_status(cluster, version).await {
            RoleStatus::Inactive => self.deactivate(fleet, cluster, version).await?,
            RoleStatus::Active => self.scale(fleet, cluster, version).await?,
        };

        info!(%outcome, "tick complete");
        Ok(outcome)
    }

    /// The fleet stack's `Status` parameter, or the configured fallback.
    async fn role_status(&self, cluster: &ClusterName, version: &Version) -> RoleStatus {
        let stack = StackName::for_fleet(cluster, version);
        let fallback = self.config.fallback_status;

        match self.stacks.describe_stack(&stack).await {
            Ok(Lookup::Found(description)) => match description.parameters.status() {
                Ok(status) => status,
                Err(e) => {
                    warn!(%stack, error = %e, %fallback, "bad Status parameter, using fallback");
                    fallback
                }
            },
            Ok(Lookup::Absent) => {
                warn!(%stack, %fallback, "fleet stack not found, using fallback status");
                fallback
            }
            Err(e) => {
                warn!(%stack, error = %e, %fallback, "failed to read fleet stack, using fallback status");
                fallback
            }
        }
    }

    async fn deactivate(
        &self,
        fleet: &FleetId,
        cluster: &ClusterName,
        version: &Version,
    ) -> Result<TickOutcome, BackendError> {
        info!("fleet is inactive, running deactivation");

        if self.cooldown.is_active(cluster, version).await {
            return Ok(TickOutcome::NoAction(NoActionReason::CooldownActive));
        }

        let current = match self.fleets.describe_fleet(fleet).await? {
            Lookup::Found(state) => state.target_capacity,
            Lookup::Absent => {
                warn!("fleet not found, treating as drained");
                0
            }
        };

        if current > 0 {
            let to = current.saturating_sub(self.config.policy.scale_in_amount);
            self.fleets.set_target_capacity(fleet, to).await?;
            self.cooldown
                .arm(cluster, version, self.config.policy.cooldown)
                .await?;
            info!(from = current, to, "drained fleet one step");
            return Ok(TickOutcome::Drained { from: current, to });
        }

        if !self.cleaner.is_version_empty(cluster, version).await? {
            return Ok(TickOutcome::NoAction(NoActionReason::MembersRemaining));
        }

        let stack = StackName::for_fleet(cluster, version);
        match self.cleaner.request_deletion(cluster, &stack).await {
            DispatchOutcome::Dispatched => {
                self.cooldown
                    .arm(cluster, version, self.config.policy.cooldown)
                    .await?;
                Ok(TickOutcome::DeletionRequested(stack))
            }
            DispatchOutcome::Dropped(_) => {
                Ok(TickOutcome::NoAction(NoActionReason::DeletionDropped))
            }
        }
    }

    async fn scale(
        &self,
        fleet: &FleetId,
        cluster: &ClusterName,
        version: &Version,
    ) -> Result<TickOutcome, BackendError> {
        if !self.config.enabled {
            info!("scaling not enabled");
            return Ok(TickOutcome::NoAction(NoActionReason::Disabled));
        }

        if self.cooldown.is_active(cluster, version).await {
            info!("cooldown in effect");
            return Ok(TickOutcome::NoAction(NoActionReason::CooldownActive));
        }

        let metric = match self
            .metrics
            .windowed_average(cluster, &self.config.metric, self.config.metric_window)
            .await?
        {
            Lookup::Found(value) => value,
            Lookup::Absent => {
                warn!(metric = %self.config.metric, "no datapoint in window");
                return Ok(TickOutcome::NoAction(NoActionReason::NoMetric));
            }
        };
        info!(metric, "read scaling metric");

        let Some(delta) = self.config.policy.decide(metric) else {
            return Ok(TickOutcome::NoAction(NoActionReason::WithinThresholds));
        };

        let current = match self.fleets.describe_fleet(fleet).await? {
            Lookup::Found(state) => state.target_capacity,
            Lookup::Absent => {
                return Err(BackendError::terminal(format!("fleet {fleet} not found")));
            }
        };

        let target = self.config.policy.clamp_target(current, delta);
        if target == current {
            info!(current, delta, "not scaling, target size is at the min / max");
            return Ok(TickOutcome::NoAction(NoActionReason::ClampedToCurrent));
        }

        if target == 0 && self.cluster.has_running_tasks(cluster).await? {
            info!("not scaling to zero, cluster still has running tasks");
            return Ok(TickOutcome::NoAction(NoActionReason::RunningTasksVeto));
        }

        self.fleets.set_target_capacity(fleet, target).await?;
        self.cooldown
            .arm(cluster, version, self.config.policy.cooldown)
            .await?;
        info!(from = current, to = target, delta, "scaled fleet");

        Ok(TickOutcome::Scaled {
            from: current,
            to: target,
        })
    }
}
