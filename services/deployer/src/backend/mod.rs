//! Backend interfaces.
//!
//! Every external system the deployer talks to sits behind one of the traits
//! in this module:
//! - [`StackBackend`]: declarative-infrastructure stacks
//! - [`FleetBackend`]: weighted fleet capacity
//! - [`ClusterBackend`]: cluster members and tasks
//! - [`MetricsSource`]: windowed metric averages
//! - [`ParameterStore`]: small durable key/value records
//! - [`CleanupDispatcher`]: asynchronous stack deletion
//!
//! Absence is modelled explicitly with [`Lookup`] rather than as an error, so
//! callers never have to inspect error strings to tell "not there" from
//! "broken".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use maestro_events::DeleteRequest;
use maestro_id::{ClusterName, FleetId, StackName, Version};
use maestro_reconcile::Transient;
use thiserror::Error;

mod memory;
mod types;

pub use memory::{CleanupRecord, MemoryBackend, MemoryError, Operation};
pub use types::*;

/// Result of a read that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    Absent,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Self::Found(value) => Lookup::Found(f(value)),
            Self::Absent => Lookup::Absent,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Self::Found(value),
            None => Self::Absent,
        }
    }
}

/// Backend call errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Throttling, network failure or similar; the same call may succeed.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The backend rejected the request.
    #[error("backend error: {0}")]
    Terminal(String),
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }
}

impl Transient for BackendError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Declarative-infrastructure stacks.
#[async_trait]
pub trait StackBackend: Send + Sync {
    async fn describe_stack(&self, name: &StackName) -> BackendResult<Lookup<StackDescription>>;

    async fn create_stack(
        &self,
        name: &StackName,
        template: &str,
        parameters: &StackParameters,
        on_failure: OnFailure,
    ) -> BackendResult<()>;

    /// Update a stack. Parameters not named in `overrides` keep their
    /// previous values.
    async fn update_stack(
        &self,
        name: &StackName,
        template: TemplateSource<'_>,
        overrides: &StackParameters,
    ) -> BackendResult<UpdateOutcome>;

    /// Delete a stack. Deleting an absent stack succeeds.
    async fn delete_stack(&self, name: &StackName) -> BackendResult<()>;

    /// Event history, newest first.
    async fn list_stack_events(&self, name: &StackName) -> BackendResult<Vec<StackEvent>>;

    /// Stacks whose status is one of `statuses`.
    async fn list_stacks(&self, statuses: &[StackStatus]) -> BackendResult<Vec<StackSummary>>;
}

/// Weighted compute fleets.
#[async_trait]
pub trait FleetBackend: Send + Sync {
    async fn describe_fleet(&self, fleet: &FleetId) -> BackendResult<Lookup<FleetState>>;

    async fn set_target_capacity(&self, fleet: &FleetId, capacity: u32) -> BackendResult<()>;
}

/// Cluster membership and tasks.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Active members of `cluster` tagged with `version`.
    async fn list_active_members(
        &self,
        cluster: &ClusterName,
        version: &Version,
    ) -> BackendResult<Vec<String>>;

    /// Whether any workload task is running anywhere in the cluster.
    async fn has_running_tasks(&self, cluster: &ClusterName) -> BackendResult<bool>;

    /// Latest task definition registered for `family`.
    async fn resolve_task_definition(&self, family: &str) -> BackendResult<Lookup<String>>;

    async fn run_task(
        &self,
        cluster: &ClusterName,
        task_definition: &str,
        placement: &Placement,
        started_by: &str,
    ) -> BackendResult<RunTaskOutcome>;

    /// Last reported status of a task; `Absent` once the backend has
    /// forgotten it.
    async fn describe_task(&self, cluster: &ClusterName, task: &str)
        -> BackendResult<Lookup<TaskStatus>>;

    async fn stop_task(&self, cluster: &ClusterName, task: &str, reason: &str) -> BackendResult<()>;
}

/// Windowed metric averages.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Average of `metric` for `cluster` over the trailing `window`, or
    /// `Absent` when no datapoint falls inside it.
    async fn windowed_average(
        &self,
        cluster: &ClusterName,
        metric: &str,
        window: Duration,
    ) -> BackendResult<Lookup<f64>>;
}

/// Durable string parameters.
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_parameter(&self, key: &str) -> BackendResult<Lookup<String>>;

    /// Write `value`, overwriting any previous one.
    async fn put_parameter(&self, key: &str, value: &str) -> BackendResult<()>;
}

/// Fire-and-forget delivery of stack deletion requests.
#[async_trait]
pub trait CleanupDispatcher: Send + Sync {
    async fn dispatch(&self, function: &str, request: &DeleteRequest) -> BackendResult<()>;
}

/// The full set of backends one deployer process talks to.
#[derive(Clone)]
pub struct Backends {
    pub stacks: Arc<dyn StackBackend>,
    pub fleets: Arc<dyn FleetBackend>,
    pub cluster: Arc<dyn ClusterBackend>,
    pub metrics: Arc<dyn MetricsSource>,
    pub parameters: Arc<dyn ParameterStore>,
    pub cleanup: Arc<dyn CleanupDispatcher>,
}

impl Backends {
    /// Serve every interface from one in-memory backend.
    pub fn from_memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            stacks: backend.clone(),
            fleets: backend.clone(),
            cluster: backend.clone(),
            metrics: backend.clone(),
            parameters: backend.clone(),
            cleanup: backend,
        }
    }
}
