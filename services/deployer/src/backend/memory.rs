//! In-memory backend with optional JSON persistence.
//!
//! Serves every backend interface from one shared state. Used by the tests,
//! and by the binaries as a local development backend whose state survives
//! between invocations in a JSON file.
//!
//! Behaviour that differs from a cloud backend is limited to timing: stacks
//! enter `*_IN_PROGRESS` on create/update and settle to `*_COMPLETE` on the
//! next describe, unless a script queued with [`MemoryBackend::script_stack_statuses`]
//! says otherwise.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use maestro_events::DeleteRequest;
use maestro_id::{ClusterName, FleetId, StackName, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    BackendError, BackendResult, CleanupDispatcher, ClusterBackend, FleetBackend, FleetState,
    Lookup, MetricsSource, OnFailure, ParameterStore, Placement, RunTaskOutcome, StackBackend,
    StackDescription, StackEvent, StackParameters, StackStatus, StackSummary, TaskStatus,
    TemplateSource, UpdateOutcome, VERSION_ATTRIBUTE,
};

/// Errors loading or saving the state file.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("state file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Backend calls that can be made to fail with [`MemoryBackend::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeStack,
    CreateStack,
    UpdateStack,
    DeleteStack,
    ListStackEvents,
    ListStacks,
    DescribeFleet,
    SetTargetCapacity,
    ListActiveMembers,
    HasRunningTasks,
    ResolveTaskDefinition,
    RunTask,
    DescribeTask,
    StopTask,
    WindowedAverage,
    GetParameter,
    PutParameter,
    Dispatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredStack {
    status: StackStatus,
    template: String,
    parameters: StackParameters,
    #[serde(default)]
    events: Vec<StackEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Member {
    id: String,
    cluster: String,
    active: bool,
    attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTask {
    cluster: String,
    task_definition: String,
    started_by: String,
    status: TaskStatus,
}

/// A queued cleanup dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub function: String,
    pub request: DeleteRequest,
}

/// Everything that is persisted to the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    #[serde(default)]
    stacks: BTreeMap<String, StoredStack>,
    /// Event history of deleted stacks, still listable by name.
    #[serde(default)]
    deleted_events: BTreeMap<String, Vec<StackEvent>>,
    #[serde(default)]
    fleets: BTreeMap<String, u32>,
    #[serde(default)]
    members: Vec<Member>,
    #[serde(default)]
    workload_tasks: BTreeMap<String, u32>,
    #[serde(default)]
    task_definitions: BTreeMap<String, String>,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
    #[serde(default)]
    tasks: BTreeMap<String, StoredTask>,
    #[serde(default)]
    stopped_tasks: Vec<String>,
    #[serde(default)]
    cleanup_queue: Vec<CleanupRecord>,
    #[serde(default)]
    next_task: u64,
}

/// Test scripts. Never persisted.
#[derive(Debug, Default)]
struct Scripts {
    stack_statuses: HashMap<String, VecDeque<StackStatus>>,
    create_events: HashMap<String, Vec<Option<String>>>,
    next_task_statuses: Option<VecDeque<Option<TaskStatus>>>,
    task_statuses: HashMap<String, VecDeque<Option<TaskStatus>>>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    calls: HashMap<Operation, u32>,
}

#[derive(Debug, Default)]
struct Inner {
    state: MemoryState,
    scripts: Scripts,
}

impl Inner {
    /// Count the call and pop a queued failure for it, if any.
    fn enter(&mut self, op: Operation) -> BackendResult<()> {
        *self.scripts.calls.entry(op).or_default() += 1;
        match self.scripts.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Remove a stack, keeping its events. Returns false if it was absent.
    fn retire_stack(&mut self, name: &StackName) -> bool {
        match self.state.stacks.remove(name.as_str()) {
            Some(stack) => {
                self.state
                    .deleted_events
                    .insert(name.to_string(), stack.events);
                true
            }
            None => false,
        }
    }
}

fn metric_key(cluster: &str, metric: &str) -> String {
    format!("{cluster}/{metric}")
}

/// In-memory implementation of every backend interface.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl MemoryBackend {
    /// Create an empty backend that is never persisted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load state from `path`, or start empty if the file does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let path = path.as_ref().to_path_buf();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| MemoryError::Json {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "state file not found, starting empty");
                MemoryState::default()
            }
            Err(source) => return Err(MemoryError::Io { path, source }),
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                scripts: Scripts::default(),
            }),
            path: Some(path),
        })
    }

    /// Write the current state back to the file it was opened from.
    pub async fn persist(&self) -> Result<(), MemoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = {
            let inner = self.inner.lock().await;
            serde_json::to_vec_pretty(&inner.state).map_err(|source| MemoryError::Json {
                path: path.clone(),
                source,
            })?
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| MemoryError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(path, json)
            .await
            .map_err(|source| MemoryError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "persisted backend state");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    /// Insert or replace a stack.
    pub async fn put_stack(&self, name: &StackName, status: StackStatus, parameters: StackParameters) {
        let mut inner = self.inner.lock().await;
        inner.state.stacks.insert(
            name.to_string(),
            StoredStack {
                status,
                template: String::new(),
                parameters,
                events: Vec::new(),
            },
        );
    }

    pub async fn put_fleet(&self, fleet: &FleetId, target_capacity: u32) {
        let mut inner = self.inner.lock().await;
        inner.state.fleets.insert(fleet.to_string(), target_capacity);
    }

    /// Register an active member of `cluster` launched from `version`.
    pub async fn add_member(&self, cluster: &ClusterName, version: &Version, id: &str) {
        let mut inner = self.inner.lock().await;
        let mut attributes = BTreeMap::new();
        attributes.insert(VERSION_ATTRIBUTE.to_string(), version.to_string());
        inner.state.members.push(Member {
            id: id.to_string(),
            cluster: cluster.to_string(),
            active: true,
            attributes,
        });
    }

    /// Mark a member as draining; it no longer counts as active.
    pub async fn deactivate_member(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        for member in inner.state.members.iter_mut().filter(|m| m.id == id) {
            member.active = false;
        }
    }

    pub async fn set_metric(&self, cluster: &ClusterName, metric: &str, value: f64) {
        let mut inner = self.inner.lock().await;
        inner.state.metrics.insert(metric_key(cluster.as_str(), metric), value);
    }

    pub async fn clear_metric(&self, cluster: &ClusterName, metric: &str) {
        let mut inner = self.inner.lock().await;
        inner.state.metrics.remove(&metric_key(cluster.as_str(), metric));
    }

    pub async fn register_task_definition(&self, family: &str, arn: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .state
            .task_definitions
            .insert(family.to_string(), arn.to_string());
    }

    /// Set how many workload tasks are running in `cluster`.
    pub async fn set_workload_tasks(&self, cluster: &ClusterName, running: u32) {
        let mut inner = self.inner.lock().await;
        inner.state.workload_tasks.insert(cluster.to_string(), running);
    }

    // -------------------------------------------------------------------------
    // Scripting
    // -------------------------------------------------------------------------

    /// Statuses returned by the next describes of `name`, one per call.
    ///
    /// Once the script is exhausted the stack settles normally.
    pub async fn script_stack_statuses(&self, name: &StackName, statuses: Vec<StackStatus>) {
        let mut inner = self.inner.lock().await;
        inner
            .scripts
            .stack_statuses
            .entry(name.to_string())
            .or_default()
            .extend(statuses);
    }

    /// Append an event to the history of `name`.
    pub async fn push_stack_event(&self, name: &StackName, reason: Option<&str>) {
        let mut inner = self.inner.lock().await;
        if let Some(stack) = inner.state.stacks.get_mut(name.as_str()) {
            stack.events.push(StackEvent {
                reason: reason.map(str::to_string),
                timestamp: Utc::now(),
            });
        }
    }

    /// Events the next create of `name` records, oldest first.
    pub async fn script_create_events(&self, name: &StackName, reasons: Vec<Option<&str>>) {
        let mut inner = self.inner.lock().await;
        inner.scripts.create_events.insert(
            name.to_string(),
            reasons.into_iter().map(|r| r.map(str::to_string)).collect(),
        );
    }

    /// Observations returned by describes of the next started task.
    ///
    /// `None` means the task is not found. After the script is exhausted the
    /// task keeps reporting its last known status.
    pub async fn script_next_task(&self, observations: Vec<Option<TaskStatus>>) {
        let mut inner = self.inner.lock().await;
        inner.scripts.next_task_statuses = Some(observations.into());
    }

    /// Make the next call of `op` fail with `err`. Calls queue up.
    pub async fn fail_next(&self, op: Operation, err: BackendError) {
        let mut inner = self.inner.lock().await;
        inner.scripts.failures.entry(op).or_default().push_back(err);
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub async fn calls(&self, op: Operation) -> u32 {
        let inner = self.inner.lock().await;
        inner.scripts.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn stack_status(&self, name: &StackName) -> Option<StackStatus> {
        let inner = self.inner.lock().await;
        inner.state.stacks.get(name.as_str()).map(|s| s.status.clone())
    }

    pub async fn stack_parameters(&self, name: &StackName) -> Option<StackParameters> {
        let inner = self.inner.lock().await;
        inner
            .state
            .stacks
            .get(name.as_str())
            .map(|s| s.parameters.clone())
    }

    pub async fn target_capacity(&self, fleet: &FleetId) -> Option<u32> {
        let inner = self.inner.lock().await;
        inner.state.fleets.get(fleet.as_str()).copied()
    }

    pub async fn parameter(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.state.parameters.get(key).cloned()
    }

    pub async fn stopped_tasks(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.state.stopped_tasks.clone()
    }

    /// Cleanup requests dispatched so far, oldest first.
    pub async fn cleanup_requests(&self) -> Vec<CleanupRecord> {
        let inner = self.inner.lock().await;
        inner.state.cleanup_queue.clone()
    }

    /// Remove and return every queued cleanup request.
    pub async fn take_cleanup_requests(&self) -> Vec<CleanupRecord> {
        let mut inner = self.inner.lock().await;
        std::mem::take(&mut inner.state.cleanup_queue)
    }
}

#[async_trait]
impl StackBackend for MemoryBackend {
    async fn describe_stack(&self, name: &StackName) -> BackendResult<Lookup<StackDescription>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DescribeStack)?;

        if !inner.state.stacks.contains_key(name.as_str()) {
            return Ok(Lookup::Absent);
        }

        let scripted = inner
            .scripts
            .stack_statuses
            .get_mut(name.as_str())
            .and_then(VecDeque::pop_front);

        // A scripted DELETE_COMPLETE is a failed create rolled back by deletion.
        if scripted == Some(StackStatus::DeleteComplete) {
            inner.retire_stack(name);
            return Ok(Lookup::Absent);
        }

        let Some(stack) = inner.state.stacks.get_mut(name.as_str()) else {
            return Ok(Lookup::Absent);
        };

        stack.status = match scripted {
            Some(status) => status,
            None => match &stack.status {
                StackStatus::CreateInProgress => StackStatus::CreateComplete,
                StackStatus::UpdateInProgress | StackStatus::UpdateCompleteCleanupInProgress => {
                    StackStatus::UpdateComplete
                }
                other => other.clone(),
            },
        };

        Ok(Lookup::Found(StackDescription {
            name: name.clone(),
            status: stack.status.clone(),
            parameters: stack.parameters.clone(),
        }))
    }

    async fn create_stack(
        &self,
        name: &StackName,
        template: &str,
        parameters: &StackParameters,
        on_failure: OnFailure,
    ) -> BackendResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::CreateStack)?;

        if inner.state.stacks.contains_key(name.as_str()) {
            return Err(BackendError::terminal(format!("Stack [{name}] already exists")));
        }

        debug!(stack = %name, ?on_failure, "creating stack");
        inner.state.deleted_events.remove(name.as_str());
        let events = inner
            .scripts
            .create_events
            .remove(name.as_str())
            .unwrap_or_default()
            .into_iter()
            .map(|reason| StackEvent {
                reason,
                timestamp: Utc::now(),
            })
            .collect();
        inner.state.stacks.insert(
            name.to_string(),
            StoredStack {
                status: StackStatus::CreateInProgress,
                template: template.to_string(),
                parameters: parameters.clone(),
                events,
            },
        );
        Ok(())
    }

    async fn update_stack(
        &self,
        name: &StackName,
        template: TemplateSource<'_>,
        overrides: &StackParameters,
    ) -> BackendResult<UpdateOutcome> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::UpdateStack)?;

        let Some(stack) = inner.state.stacks.get_mut(name.as_str()) else {
            return Err(BackendError::terminal(format!(
                "Stack with id {name} does not exist"
            )));
        };

        if stack.status.is_in_progress() {
            return Err(BackendError::terminal(format!(
                "Stack:{name} is in {} state and can not be updated.",
                stack.status
            )));
        }

        let merged = stack.parameters.merged(overrides);
        let template = match template {
            TemplateSource::Body(body) => body.to_string(),
            TemplateSource::UsePrevious => stack.template.clone(),
        };

        if merged == stack.parameters && template == stack.template {
            return Ok(UpdateOutcome::NoChange);
        }

        stack.parameters = merged;
        stack.template = template;
        stack.status = StackStatus::UpdateInProgress;
        Ok(UpdateOutcome::Updated)
    }

    async fn delete_stack(&self, name: &StackName) -> BackendResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DeleteStack)?;

        if inner.retire_stack(name) {
            info!(stack = %name, "deleted stack");
        }
        Ok(())
    }

    async fn list_stack_events(&self, name: &StackName) -> BackendResult<Vec<StackEvent>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::ListStackEvents)?;

        let events = match inner.state.stacks.get(name.as_str()) {
            Some(stack) => &stack.events,
            None => inner
                .state
                .deleted_events
                .get(name.as_str())
                .ok_or_else(|| BackendError::terminal(format!("Stack [{name}] does not exist")))?,
        };
        Ok(events.iter().rev().cloned().collect())
    }

    async fn list_stacks(&self, statuses: &[StackStatus]) -> BackendResult<Vec<StackSummary>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::ListStacks)?;

        let mut summaries = Vec::new();
        for (name, stack) in &inner.state.stacks {
            if !statuses.contains(&stack.status) {
                continue;
            }
            let name = StackName::parse(name)
                .map_err(|e| BackendError::terminal(format!("stored stack name: {e}")))?;
            summaries.push(StackSummary {
                name,
                status: stack.status.clone(),
            });
        }
        Ok(summaries)
    }
}

#[async_trait]
impl FleetBackend for MemoryBackend {
    async fn describe_fleet(&self, fleet: &FleetId) -> BackendResult<Lookup<FleetState>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DescribeFleet)?;

        Ok(inner
            .state
            .fleets
            .get(fleet.as_str())
            .map(|&target_capacity| FleetState {
                fleet_id: fleet.clone(),
                target_capacity,
            })
            .into())
    }

    async fn set_target_capacity(&self, fleet: &FleetId, capacity: u32) -> BackendResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::SetTargetCapacity)?;

        match inner.state.fleets.get_mut(fleet.as_str()) {
            Some(current) => {
                *current = capacity;
                Ok(())
            }
            None => Err(BackendError::terminal(format!(
                "fleet request {fleet} does not exist"
            ))),
        }
    }
}

#[async_trait]
impl ClusterBackend for MemoryBackend {
    async fn list_active_members(
        &self,
        cluster: &ClusterName,
        version: &Version,
    ) -> BackendResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::ListActiveMembers)?;

        Ok(inner
            .state
            .members
            .iter()
            .filter(|m| m.active && m.cluster == cluster.as_str())
            .filter(|m| m.attributes.get(VERSION_ATTRIBUTE).map(String::as_str) == Some(version.as_str()))
            .map(|m| m.id.clone())
            .collect())
    }

    async fn has_running_tasks(&self, cluster: &ClusterName) -> BackendResult<bool> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::HasRunningTasks)?;

        Ok(inner
            .state
            .workload_tasks
            .get(cluster.as_str())
            .is_some_and(|&n| n > 0))
    }

    async fn resolve_task_definition(&self, family: &str) -> BackendResult<Lookup<String>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::ResolveTaskDefinition)?;

        Ok(inner.state.task_definitions.get(family).cloned().into())
    }

    async fn run_task(
        &self,
        cluster: &ClusterName,
        task_definition: &str,
        placement: &Placement,
        started_by: &str,
    ) -> BackendResult<RunTaskOutcome> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::RunTask)?;

        let placeable = inner.state.members.iter().any(|m| {
            m.active
                && m.cluster == cluster.as_str()
                && m.attributes.get(&placement.attribute) == Some(&placement.value)
        });
        if !placeable {
            return Ok(RunTaskOutcome::NotPlaced(format!(
                "no container instance met all of its requirements ({})",
                placement.expression()
            )));
        }

        inner.state.next_task += 1;
        let task = format!("task-{:08}", inner.state.next_task);
        inner.state.tasks.insert(
            task.clone(),
            StoredTask {
                cluster: cluster.to_string(),
                task_definition: task_definition.to_string(),
                started_by: started_by.to_string(),
                status: TaskStatus::Running,
            },
        );
        if let Some(script) = inner.scripts.next_task_statuses.take() {
            inner.scripts.task_statuses.insert(task.clone(), script);
        }

        Ok(RunTaskOutcome::Started(task))
    }

    async fn describe_task(
        &self,
        cluster: &ClusterName,
        task: &str,
    ) -> BackendResult<Lookup<TaskStatus>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DescribeTask)?;

        let scripted = inner
            .scripts
            .task_statuses
            .get_mut(task)
            .and_then(VecDeque::pop_front);

        let Some(stored) = inner
            .state
            .tasks
            .get_mut(task)
            .filter(|t| t.cluster == cluster.as_str())
        else {
            return Ok(Lookup::Absent);
        };

        match scripted {
            Some(None) => Ok(Lookup::Absent),
            Some(Some(status)) => {
                stored.status = status.clone();
                Ok(Lookup::Found(status))
            }
            None => Ok(Lookup::Found(stored.status.clone())),
        }
    }

    async fn stop_task(&self, cluster: &ClusterName, task: &str, reason: &str) -> BackendResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::StopTask)?;

        let Some(stored) = inner
            .state
            .tasks
            .get_mut(task)
            .filter(|t| t.cluster == cluster.as_str())
        else {
            return Err(BackendError::terminal(format!("task {task} not found")));
        };

        debug!(
            task,
            task_definition = %stored.task_definition,
            started_by = %stored.started_by,
            reason,
            "stopping task"
        );
        stored.status = TaskStatus::Stopped;
        inner.state.stopped_tasks.push(task.to_string());
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for MemoryBackend {
    async fn windowed_average(
        &self,
        cluster: &ClusterName,
        metric: &str,
        _window: Duration,
    ) -> BackendResult<Lookup<f64>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::WindowedAverage)?;

        Ok(inner
            .state
            .metrics
            .get(&metric_key(cluster.as_str(), metric))
            .copied()
            .into())
    }
}

#[async_trait]
impl ParameterStore for MemoryBackend {
    async fn get_parameter(&self, key: &str) -> BackendResult<Lookup<String>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::GetParameter)?;

        Ok(inner.state.parameters.get(key).cloned().into())
    }

    async fn put_parameter(&self, key: &str, value: &str) -> BackendResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::PutParameter)?;

        inner
            .state
            .parameters
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[async_trait]
impl CleanupDispatcher for MemoryBackend {
    async fn dispatch(&self, function: &str, request: &DeleteRequest) -> BackendResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::Dispatch)?;

        inner.state.cleanup_queue.push(CleanupRecord {
            function: function.to_string(),
            request: request.clone(),
        });
        Ok(())
    }
}
