//! Stack reconciliation.
//!
//! Drives one named stack to `CREATE_COMPLETE` or `UPDATE_COMPLETE`:
//! absent stacks are created (a failed create deletes itself), present
//! stacks are updated, and an update with nothing to change is a success.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_id::StackName;
use maestro_reconcile::{
    retry_transient, Check, Clock, PollError, PollStep, Poller, DEFAULT_RETRY_DELAY,
};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::backend::{
    BackendError, Lookup, OnFailure, StackAction, StackBackend, StackEvent, StackParameters,
    StackStatus, TemplateSource, UpdateOutcome,
};

/// Default interval between stack status reads.
pub const STACK_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default cap on stack status reads (about two hours at the default interval).
pub const STACK_POLL_ATTEMPTS: u32 = 240;

/// Event reason that marks an update cancelled by the backend.
const UPDATE_CANCELLED: &str = "Resource update cancelled";

/// What a successful reconcile did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    NoChange,
}

/// Stack reconciliation errors.
#[derive(Debug, Error)]
pub enum StackError {
    /// The stack settled in a status other than the expected completion.
    #[error("stack {stack} ended in {status}: {reason}")]
    Failed {
        stack: StackName,
        status: StackStatus,
        reason: String,
    },

    /// The stack disappeared while being waited on (a failed create that
    /// cleaned up after itself).
    #[error("stack {stack} disappeared while waiting: {reason}")]
    Vanished { stack: StackName, reason: String },

    /// The status never reached the expected completion.
    #[error("timed out waiting for stack {stack} to reach {expected} after {attempts} checks")]
    Timeout {
        stack: StackName,
        expected: StackStatus,
        attempts: u32,
    },

    /// A backend call failed.
    #[error("stack {stack}: {source}")]
    Backend {
        stack: StackName,
        #[source]
        source: BackendError,
    },
}

impl StackError {
    /// Returns true if the wait ran out of attempts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Chooses the most specific failure reason from an event history.
///
/// An explicit update cancellation wins; otherwise the longest reason is
/// taken as the most descriptive, ties going to the newest event.
pub fn select_failure_reason(events: &[StackEvent]) -> Option<String> {
    let reasons = || {
        events
            .iter()
            .filter_map(|e| e.reason.as_deref())
            .filter(|r| !r.is_empty())
    };

    if let Some(cancelled) = reasons().find(|r| r.contains(UPDATE_CANCELLED)) {
        return Some(cancelled.to_string());
    }

    reasons()
        .fold(None::<&str>, |best, r| match best {
            Some(b) if b.len() >= r.len() => Some(b),
            _ => Some(r),
        })
        .map(str::to_string)
}

/// Waits for a stack to leave the in-progress statuses of one action.
struct CompletionCheck<'a> {
    stacks: &'a dyn StackBackend,
    name: &'a StackName,
    action: StackAction,
}

/// Terminal observations of a completion wait.
enum Settled {
    Complete,
    Other(StackStatus),
    Vanished,
}

#[async_trait]
impl Check for CompletionCheck<'_> {
    type Output = Settled;
    type Error = BackendError;

    async fn check(&mut self, attempt: u32) -> Result<PollStep<Settled>, BackendError> {
        let status = match self.stacks.describe_stack(self.name).await? {
            Lookup::Found(description) => description.status,
            Lookup::Absent => return Ok(PollStep::Ready(Settled::Vanished)),
        };

        if status == self.action.complete() {
            return Ok(PollStep::Ready(Settled::Complete));
        }
        if status == self.action.in_progress()
            || status == StackStatus::UpdateCompleteCleanupInProgress
        {
            info!(stack = %self.name, %status, attempt, "waiting for stack");
            return Ok(PollStep::Pending);
        }
        Ok(PollStep::Ready(Settled::Other(status)))
    }
}

/// Waits for a stack left mid-operation by an earlier run to settle.
struct SettleCheck<'a> {
    stacks: &'a dyn StackBackend,
    name: &'a StackName,
}

#[async_trait]
impl Check for SettleCheck<'_> {
    type Output = Option<StackStatus>;
    type Error = BackendError;

    async fn check(&mut self, attempt: u32) -> Result<PollStep<Option<StackStatus>>, BackendError> {
        match self.stacks.describe_stack(self.name).await? {
            Lookup::Absent => Ok(PollStep::Ready(None)),
            Lookup::Found(d) if d.status.is_in_progress() => {
                info!(stack = %self.name, status = %d.status, attempt, "waiting for in-flight operation to settle");
                Ok(PollStep::Pending)
            }
            Lookup::Found(d) => Ok(PollStep::Ready(Some(d.status))),
        }
    }
}

/// Drives named stacks to their desired template and parameters.
pub struct StackReconciler {
    stacks: Arc<dyn StackBackend>,
    clock: Arc<dyn Clock>,
    poller: Poller,
}

impl StackReconciler {
    pub fn new(stacks: Arc<dyn StackBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            stacks,
            clock,
            poller: Poller::new(STACK_POLL_INTERVAL, STACK_POLL_ATTEMPTS),
        }
    }

    /// Override the poll schedule.
    pub fn with_poller(mut self, poller: Poller) -> Self {
        self.poller = poller;
        self
    }

    /// Create or update `name` and wait for the backend to finish.
    #[instrument(skip_all, fields(stack = %name))]
    pub async fn reconcile(
        &self,
        name: &StackName,
        template: &str,
        parameters: &StackParameters,
    ) -> Result<ReconcileOutcome, StackError> {
        let present = self.current_status(name).await?;

        let present = match present {
            Some(status) if status.is_in_progress() => self.settle(name).await?.is_some(),
            other => other.is_some(),
        };

        if !present {
            info!("stack not found, creating");
            self.create(name, template, parameters).await?;
            self.wait_for(name, StackAction::Create).await?;
            info!("stack created");
            return Ok(ReconcileOutcome::Created);
        }

        info!("stack exists, updating");
        match self
            .update(name, TemplateSource::Body(template), parameters)
            .await?
        {
            UpdateOutcome::NoChange => {
                info!("no updates are to be performed");
                Ok(ReconcileOutcome::NoChange)
            }
            UpdateOutcome::Updated => {
                self.wait_for(name, StackAction::Update).await?;
                info!("stack updated");
                Ok(ReconcileOutcome::Updated)
            }
        }
    }

    /// Update parameters of an existing stack, keeping its template, without
    /// waiting for completion.
    pub async fn override_parameters(
        &self,
        name: &StackName,
        overrides: &StackParameters,
    ) -> Result<UpdateOutcome, StackError> {
        self.update(name, TemplateSource::UsePrevious, overrides).await
    }

    async fn current_status(&self, name: &StackName) -> Result<Option<StackStatus>, StackError> {
        let stacks = self.stacks.as_ref();
        let found = retry_transient(self.clock.as_ref(), DEFAULT_RETRY_DELAY, move || {
            stacks.describe_stack(name)
        })
        .await
        .map_err(|source| backend_error(name, source))?;

        Ok(found.found().map(|d| d.status))
    }

    async fn create(
        &self,
        name: &StackName,
        template: &str,
        parameters: &StackParameters,
    ) -> Result<(), StackError> {
        let stacks = self.stacks.as_ref();
        retry_transient(self.clock.as_ref(), DEFAULT_RETRY_DELAY, move || {
            stacks.create_stack(name, template, parameters, OnFailure::Delete)
        })
        .await
        .map_err(|source| backend_error(name, source))
    }

    async fn update(
        &self,
        name: &StackName,
        template: TemplateSource<'_>,
        overrides: &StackParameters,
    ) -> Result<UpdateOutcome, StackError> {
        let stacks = self.stacks.as_ref();
        retry_transient(self.clock.as_ref(), DEFAULT_RETRY_DELAY, move || {
            stacks.update_stack(name, template, overrides)
        })
        .await
        .map_err(|source| backend_error(name, source))
    }

    async fn settle(&self, name: &StackName) -> Result<Option<StackStatus>, StackError> {
        let mut check = SettleCheck {
            stacks: self.stacks.as_ref(),
            name,
        };

        self.poller
            .poll_until(self.clock.as_ref(), &mut check)
            .await
            .map_err(|e| match e {
                PollError::Timeout { attempts, .. } => StackError::Timeout {
                    stack: name.clone(),
                    expected: StackStatus::UpdateComplete,
                    attempts,
                },
                PollError::Failed(source) => backend_error(name, source),
            })
    }

    async fn wait_for(&self, name: &StackName, action: StackAction) -> Result<(), StackError> {
        let mut check = CompletionCheck {
            stacks: self.stacks.as_ref(),
            name,
            action,
        };

        let settled = self
            .poller
            .poll_until(self.clock.as_ref(), &mut check)
            .await
            .map_err(|e| match e {
                PollError::Timeout { attempts, waited } => {
                    warn!(stack = %name, attempts, waited_secs = waited.as_secs(), "gave up waiting for stack");
                    StackError::Timeout {
                        stack: name.clone(),
                        expected: action.complete(),
                        attempts,
                    }
                }
                PollError::Failed(source) => backend_error(name, source),
            })?;

        match settled {
            Settled::Complete => Ok(()),
            Settled::Other(status) => {
                let reason = self.failure_reason(name).await;
                warn!(stack = %name, %status, %reason, "stack {action} failed");
                Err(StackError::Failed {
                    stack: name.clone(),
                    status,
                    reason,
                })
            }
            Settled::Vanished => {
                let reason = self.failure_reason(name).await;
                warn!(stack = %name, %reason, "stack disappeared during {action}");
                Err(StackError::Vanished {
                    stack: name.clone(),
                    reason,
                })
            }
        }
    }

    /// Best-effort lookup of why a stack failed.
    async fn failure_reason(&self, name: &StackName) -> String {
        match self.stacks.list_stack_events(name).await {
            Ok(events) => select_failure_reason(&events)
                .unwrap_or_else(|| "no failure reason reported".to_string()),
            Err(e) => {
                warn!(stack = %name, error = %e, "failed to read stack events");
                format!("failure reason unavailable: {e}")
            }
        }
    }
}

fn backend_error(stack: &StackName, source: BackendError) -> StackError {
    StackError::Backend {
        stack: stack.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use maestro_reconcile::ManualClock;

    use super::*;
    use crate::backend::{MemoryBackend, Operation};

    fn event(reason: Option<&str>) -> StackEvent {
        StackEvent {
            reason: reason.map(str::to_string),
            timestamp: Utc::now(),
        }
    }

    fn stack(s: &str) -> StackName {
        s.parse().unwrap()
    }

    fn setup() -> (Arc<MemoryBackend>, Arc<ManualClock>, StackReconciler) {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::starting_now());
        let reconciler = StackReconciler::new(backend.clone(), clock.clone());
        (backend, clock, reconciler)
    }

    #[test]
    fn test_cancelled_reason_beats_longer_reason() {
        let events = vec![
            event(Some("The following resource(s) failed to update: [LaunchTemplate, AutoScalingGroup, SpotFleet]")),
            event(Some("Resource update cancelled")),
            event(None),
        ];
        assert_eq!(
            select_failure_reason(&events).as_deref(),
            Some("Resource update cancelled")
        );
    }

    #[test]
    fn test_longest_reason_otherwise() {
        let events = vec![
            event(Some("short")),
            event(Some("a much longer explanation")),
            event(Some("")),
        ];
        assert_eq!(
            select_failure_reason(&events).as_deref(),
            Some("a much longer explanation")
        );
        assert_eq!(select_failure_reason(&[event(None)]), None);
    }

    #[tokio::test]
    async fn test_absent_stack_is_created() {
        let (backend, clock, reconciler) = setup();
        let name = stack("kloudcover-cluster");
        backend
            .script_stack_statuses(
                &name,
                vec![StackStatus::CreateInProgress, StackStatus::CreateInProgress],
            )
            .await;

        let outcome = reconciler
            .reconcile(&name, "{}", &StackParameters::new())
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Created);
        assert_eq!(backend.stack_status(&name).await, Some(StackStatus::CreateComplete));
        assert_eq!(clock.sleeps(), vec![STACK_POLL_INTERVAL, STACK_POLL_INTERVAL]);
    }

    #[tokio::test]
    async fn test_failed_create_that_deleted_itself_reports_reason() {
        let (backend, _clock, reconciler) = setup();
        let name = stack("kloudcover-fleet-v2");
        backend
            .script_create_events(
                &name,
                vec![
                    Some("User Initiated"),
                    Some("The following resource(s) failed to create: [SpotFleet]"),
                    None,
                ],
            )
            .await;
        backend
            .script_stack_statuses(
                &name,
                vec![StackStatus::CreateInProgress, StackStatus::DeleteComplete],
            )
            .await;

        let err = reconciler
            .reconcile(&name, "{}", &StackParameters::new())
            .await
            .unwrap_err();

        match err {
            StackError::Vanished { reason, .. } => {
                assert_eq!(reason, "The following resource(s) failed to create: [SpotFleet]");
            }
            other => panic!("expected Vanished, got {other:?}"),
        }
        assert_eq!(backend.stack_status(&name).await, None);
    }

    #[tokio::test]
    async fn test_unchanged_update_is_no_change() {
        let (_backend, clock, reconciler) = setup();
        let name = stack("kloudcover-cluster");
        reconciler
            .reconcile(&name, "{}", &StackParameters::new())
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(&name, "{}", &StackParameters::new())
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::NoChange);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_changed_update_waits_through_cleanup() {
        let (backend, _clock, reconciler) = setup();
        let name = stack("kloudcover-cluster");
        backend
            .put_stack(&name, StackStatus::CreateComplete, StackParameters::new())
            .await;
        backend
            .script_stack_statuses(
                &name,
                vec![
                    StackStatus::CreateComplete,
                    StackStatus::UpdateInProgress,
                    StackStatus::UpdateCompleteCleanupInProgress,
                    StackStatus::UpdateComplete,
                ],
            )
            .await;

        let outcome = reconciler
            .reconcile(&name, "{}", &StackParameters::new().with("Status", "active"))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated);
    }

    #[tokio::test]
    async fn test_rollback_reports_failure_reason() {
        let (backend, _clock, reconciler) = setup();
        let name = stack("kloudcover-cluster");
        backend
            .put_stack(&name, StackStatus::CreateComplete, StackParameters::new())
            .await;
        backend
            .push_stack_event(&name, Some("Resource update cancelled"))
            .await;
        backend
            .push_stack_event(&name, Some("Instance i-0abc failed to stabilize in time"))
            .await;
        backend
            .script_stack_statuses(
                &name,
                vec![
                    StackStatus::CreateComplete,
                    StackStatus::UpdateRollbackInProgress,
                ],
            )
            .await;

        let err = reconciler
            .reconcile(&name, "{}", &StackParameters::new().with("Version", "v2"))
            .await
            .unwrap_err();

        match err {
            StackError::Failed { status, reason, .. } => {
                assert_eq!(status, StackStatus::UpdateRollbackInProgress);
                assert_eq!(reason, "Resource update cancelled");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_distinctly() {
        let (backend, _clock, reconciler) = setup();
        let reconciler = reconciler.with_poller(Poller::new(Duration::from_secs(30), 3));
        let name = stack("kloudcover-cluster");
        backend
            .script_stack_statuses(&name, vec![StackStatus::CreateInProgress; 10])
            .await;

        let err = reconciler
            .reconcile(&name, "{}", &StackParameters::new())
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(err, StackError::Timeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_transient_describe_is_retried_once() {
        let (backend, _clock, reconciler) = setup();
        let name = stack("kloudcover-cluster");
        backend
            .fail_next(Operation::DescribeStack, BackendError::transient("Rate exceeded"))
            .await;

        let outcome = reconciler
            .reconcile(&name, "{}", &StackParameters::new())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Created);
    }

    #[tokio::test]
    async fn test_terminal_update_error_surfaces() {
        let (backend, _clock, reconciler) = setup();
        let name = stack("kloudcover-cluster");
        backend
            .put_stack(&name, StackStatus::CreateComplete, StackParameters::new())
            .await;
        backend
            .fail_next(Operation::UpdateStack, BackendError::terminal("Template format error"))
            .await;

        let err = reconciler
            .reconcile(&name, "{}", &StackParameters::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StackError::Backend {
                source: BackendError::Terminal(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_in_flight_stack_settles_before_update() {
        let (backend, _clock, reconciler) = setup();
        let name = stack("kloudcover-cluster");
        backend
            .put_stack(&name, StackStatus::UpdateInProgress, StackParameters::new())
            .await;
        backend
            .script_stack_statuses(
                &name,
                vec![
                    StackStatus::UpdateInProgress,
                    StackStatus::UpdateInProgress,
                    StackStatus::UpdateComplete,
                ],
            )
            .await;

        let outcome = reconciler
            .reconcile(&name, "{}", &StackParameters::new().with("Version", "v3"))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Updated);
        assert_eq!(backend.calls(Operation::UpdateStack).await, 1);
    }
}
