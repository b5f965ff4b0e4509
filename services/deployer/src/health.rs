//! Canary health probe gating promotion of a new version.
//!
//! One health-check task is launched on members of the new version and its
//! status is polled. The version is healthy once enough `RUNNING`
//! sightings accumulate; sightings need not be consecutive, and other
//! statuses (including the task briefly not being found) neither count nor
//! reset the tally.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_id::{ClusterName, Version};
use maestro_reconcile::{Check, Clock, PollError, PollStep, Poller};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::backend::{
    BackendError, ClusterBackend, Lookup, Placement, RunTaskOutcome, TaskStatus, VERSION_ATTRIBUTE,
};

/// Tag identifying tasks launched by the probe.
pub const HEALTH_CHECK_STARTED_BY: &str = "cluster-health-check";

/// Reason recorded when the probe stops its task.
pub const HEALTH_CHECK_STOP_REASON: &str = "health check complete";

/// Task definition family of the health-check workload of `cluster`.
pub fn health_task_family(cluster: &ClusterName) -> String {
    format!("{cluster}-cluster-health-task")
}

/// Probe schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthGateConfig {
    pub max_attempts: u32,

    /// Sightings that must be exceeded before the probe passes.
    pub required_sightings: u32,

    pub poll_interval: Duration,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            required_sightings: 4,
            poll_interval: Duration::from_secs(4),
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthVerdict {
    /// `RUNNING` sightings counted.
    pub hits: u32,

    /// Status reads performed.
    pub attempts: u32,

    pub healthy: bool,
}

impl HealthVerdict {
    fn unhealthy() -> Self {
        Self {
            hits: 0,
            attempts: 0,
            healthy: false,
        }
    }
}

/// Counts `RUNNING` sightings of one task.
struct RunningTally<'a> {
    cluster_backend: &'a dyn ClusterBackend,
    cluster: &'a ClusterName,
    task: &'a str,
    required: u32,
    hits: u32,
    attempts: u32,
}

#[async_trait]
impl Check for RunningTally<'_> {
    type Output = ();
    type Error = BackendError;

    async fn check(&mut self, attempt: u32) -> Result<PollStep<()>, BackendError> {
        self.attempts = attempt;

        let status = self.cluster_backend.describe_task(self.cluster, self.task).await?;
        match status {
            Lookup::Found(TaskStatus::Running) => {
                self.hits += 1;
                info!(task = self.task, hits = self.hits, attempt, "task running");
                if self.hits > self.required {
                    return Ok(PollStep::Ready(()));
                }
            }
            Lookup::Found(other) => {
                info!(task = self.task, status = %other, attempt, "task not running");
            }
            Lookup::Absent => {
                info!(task = self.task, attempt, "task MISSING");
            }
        }
        Ok(PollStep::Pending)
    }
}

/// Decides whether a freshly reconciled version can serve traffic.
pub struct HealthGate {
    cluster: Arc<dyn ClusterBackend>,
    clock: Arc<dyn Clock>,
    config: HealthGateConfig,
}

impl HealthGate {
    pub fn new(cluster: Arc<dyn ClusterBackend>, clock: Arc<dyn Clock>, config: HealthGateConfig) -> Self {
        Self {
            cluster,
            clock,
            config,
        }
    }

    /// Launch the canary on `version` and poll it. Never fails: every
    /// backend problem yields an unhealthy verdict.
    #[instrument(skip_all, fields(%cluster, %version))]
    pub async fn probe(&self, cluster: &ClusterName, version: &Version) -> HealthVerdict {
        let family = health_task_family(cluster);

        let task_definition = match self.cluster.resolve_task_definition(&family).await {
            Ok(Lookup::Found(arn)) => arn,
            Ok(Lookup::Absent) => {
                warn!(%family, "health task definition not found");
                return HealthVerdict::unhealthy();
            }
            Err(e) => {
                warn!(%family, error = %e, "failed to resolve health task definition");
                return HealthVerdict::unhealthy();
            }
        };

        let placement = Placement::member_of(VERSION_ATTRIBUTE, version.as_str());
        let task = match self
            .cluster
            .run_task(cluster, &task_definition, &placement, HEALTH_CHECK_STARTED_BY)
            .await
        {
            Ok(RunTaskOutcome::Started(task)) => task,
            Ok(RunTaskOutcome::NotPlaced(reason)) => {
                warn!(%reason, "health task could not be placed");
                return HealthVerdict::unhealthy();
            }
            Err(e) => {
                warn!(error = %e, "failed to launch health task");
                return HealthVerdict::unhealthy();
            }
        };
        info!(%task, %task_definition, "launched health task");

        let verdict = self.watch(cluster, &task).await;

        if let Err(e) = self
            .cluster
            .stop_task(cluster, &task, HEALTH_CHECK_STOP_REASON)
            .await
        {
            warn!(%task, error = %e, "failed to stop health task");
        }

        info!(
            hits = verdict.hits,
            attempts = verdict.attempts,
            healthy = verdict.healthy,
            "health probe finished"
        );
        verdict
    }

    async fn watch(&self, cluster: &ClusterName, task: &str) -> HealthVerdict {
        let required = self.config.required_sightings;
        let poller = Poller::new(self.config.poll_interval, self.config.max_attempts);
        let mut tally = RunningTally {
            cluster_backend: self.cluster.as_ref(),
            cluster,
            task,
            required,
            hits: 0,
            attempts: 0,
        };

        match poller.poll_until(self.clock.as_ref(), &mut tally).await {
            Ok(()) => {}
            Err(PollError::Timeout { attempts, .. }) => {
                warn!(hits = tally.hits, attempts, "health task never reached enough sightings");
            }
            Err(PollError::Failed(e)) => {
                warn!(error = %e, "health task status unavailable");
            }
        }

        HealthVerdict {
            hits: tally.hits,
            attempts: tally.attempts,
            healthy: tally.hits == required.saturating_add(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use maestro_reconcile::ManualClock;

    use super::*;
    use crate::backend::{MemoryBackend, Operation};

    const ARN: &str = "arn:aws:ecs:us-west-2:123456789012:task-definition/kloudcover-cluster-health-task:3";

    struct Fixture {
        backend: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        gate: HealthGate,
        cluster: ClusterName,
        version: Version,
    }

    async fn fixture(with_member: bool) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::starting_now());
        let gate = HealthGate::new(backend.clone(), clock.clone(), HealthGateConfig::default());
        let cluster: ClusterName = "kloudcover".parse().unwrap();
        let version: Version = "abc123".parse().unwrap();

        backend
            .register_task_definition(&health_task_family(&cluster), ARN)
            .await;
        if with_member {
            backend.add_member(&cluster, &version, "i-1").await;
        }

        Fixture {
            backend,
            clock,
            gate,
            cluster,
            version,
        }
    }

    fn running() -> Option<TaskStatus> {
        Some(TaskStatus::Running)
    }

    #[tokio::test]
    async fn test_five_running_sightings_pass_early() {
        let f = fixture(true).await;
        f.backend.script_next_task(vec![running(); 5]).await;

        let verdict = f.gate.probe(&f.cluster, &f.version).await;

        assert_eq!(
            verdict,
            HealthVerdict {
                hits: 5,
                attempts: 5,
                healthy: true
            }
        );
        assert_eq!(f.clock.sleeps().len(), 4);
        assert_eq!(f.backend.stopped_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sightings_need_not_be_consecutive() {
        let f = fixture(true).await;
        f.backend
            .script_next_task(vec![
                running(),
                Some(TaskStatus::Pending),
                running(),
                None,
                running(),
                running(),
                Some(TaskStatus::Stopped),
                running(),
            ])
            .await;

        let verdict = f.gate.probe(&f.cluster, &f.version).await;

        assert!(verdict.healthy);
        assert_eq!(verdict.attempts, 8);
    }

    #[tokio::test]
    async fn test_too_few_sightings_is_unhealthy() {
        let f = fixture(true).await;
        let mut script = vec![running(), None, running(), running()];
        script.extend(std::iter::repeat(None).take(100));
        f.backend.script_next_task(script).await;

        let verdict = f.gate.probe(&f.cluster, &f.version).await;

        assert_eq!(
            verdict,
            HealthVerdict {
                hits: 3,
                attempts: 60,
                healthy: false
            }
        );
        assert_eq!(f.clock.total_slept(), Duration::from_secs(4 * 59));
        assert_eq!(f.backend.stopped_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_required_sightings_passes_on_first_running() {
        let f = fixture(true).await;
        let gate = HealthGate::new(
            f.backend.clone(),
            f.clock.clone(),
            HealthGateConfig {
                required_sightings: 0,
                ..HealthGateConfig::default()
            },
        );
        let mut script = vec![running()];
        script.extend(std::iter::repeat(Some(TaskStatus::Stopped)).take(100));
        f.backend.script_next_task(script).await;

        let verdict = gate.probe(&f.cluster, &f.version).await;

        assert_eq!(
            verdict,
            HealthVerdict {
                hits: 1,
                attempts: 1,
                healthy: true
            }
        );
        assert!(f.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_unplaceable_task_fails_without_polling() {
        let f = fixture(false).await;

        let verdict = f.gate.probe(&f.cluster, &f.version).await;

        assert!(!verdict.healthy);
        assert_eq!(verdict.attempts, 0);
        assert!(f.clock.sleeps().is_empty());
        assert_eq!(f.backend.calls(Operation::DescribeTask).await, 0);
    }

    #[tokio::test]
    async fn test_launch_error_is_unhealthy() {
        let f = fixture(true).await;
        f.backend
            .fail_next(Operation::RunTask, BackendError::terminal("ClusterNotFoundException"))
            .await;

        assert!(!f.gate.probe(&f.cluster, &f.version).await.healthy);
    }

    #[tokio::test]
    async fn test_transient_describe_errors_consume_attempts() {
        let f = fixture(true).await;
        f.backend
            .fail_next(Operation::DescribeTask, BackendError::transient("Throttling"))
            .await;
        f.backend.script_next_task(vec![running(); 5]).await;

        let verdict = f.gate.probe(&f.cluster, &f.version).await;

        assert!(verdict.healthy);
        assert_eq!(verdict.attempts, 6);
    }

    #[tokio::test]
    async fn test_stop_failure_does_not_change_verdict() {
        let f = fixture(true).await;
        f.backend.script_next_task(vec![running(); 5]).await;
        f.backend
            .fail_next(Operation::StopTask, BackendError::terminal("InvalidParameterException"))
            .await;

        assert!(f.gate.probe(&f.cluster, &f.version).await.healthy);
    }
}
