//! Values exchanged with the backends.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use maestro_id::{FleetId, StackName};
use serde::{Deserialize, Serialize};

// =============================================================================
// Stack status
// =============================================================================

/// Status of a declarative-infrastructure stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StackStatus {
    CreateInProgress,
    CreateFailed,
    CreateComplete,
    RollbackInProgress,
    RollbackFailed,
    RollbackComplete,
    DeleteInProgress,
    DeleteFailed,
    DeleteComplete,
    UpdateInProgress,
    UpdateCompleteCleanupInProgress,
    UpdateComplete,
    UpdateFailed,
    UpdateRollbackInProgress,
    UpdateRollbackFailed,
    UpdateRollbackCompleteCleanupInProgress,
    UpdateRollbackComplete,
    /// A status this build does not know about.
    Other(String),
}

impl StackStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CreateInProgress => "CREATE_IN_PROGRESS",
            Self::CreateFailed => "CREATE_FAILED",
            Self::CreateComplete => "CREATE_COMPLETE",
            Self::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            Self::RollbackFailed => "ROLLBACK_FAILED",
            Self::RollbackComplete => "ROLLBACK_COMPLETE",
            Self::DeleteInProgress => "DELETE_IN_PROGRESS",
            Self::DeleteFailed => "DELETE_FAILED",
            Self::DeleteComplete => "DELETE_COMPLETE",
            Self::UpdateInProgress => "UPDATE_IN_PROGRESS",
            Self::UpdateCompleteCleanupInProgress => "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            Self::UpdateComplete => "UPDATE_COMPLETE",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::UpdateRollbackInProgress => "UPDATE_ROLLBACK_IN_PROGRESS",
            Self::UpdateRollbackFailed => "UPDATE_ROLLBACK_FAILED",
            Self::UpdateRollbackCompleteCleanupInProgress => {
                "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS"
            }
            Self::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
            Self::Other(s) => s,
        }
    }

    /// Returns true while the backend is still working on the stack.
    pub fn is_in_progress(&self) -> bool {
        self.as_str().ends_with("_IN_PROGRESS")
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for StackStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "CREATE_IN_PROGRESS" => Self::CreateInProgress,
            "CREATE_FAILED" => Self::CreateFailed,
            "CREATE_COMPLETE" => Self::CreateComplete,
            "ROLLBACK_IN_PROGRESS" => Self::RollbackInProgress,
            "ROLLBACK_FAILED" => Self::RollbackFailed,
            "ROLLBACK_COMPLETE" => Self::RollbackComplete,
            "DELETE_IN_PROGRESS" => Self::DeleteInProgress,
            "DELETE_FAILED" => Self::DeleteFailed,
            "DELETE_COMPLETE" => Self::DeleteComplete,
            "UPDATE_IN_PROGRESS" => Self::UpdateInProgress,
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS" => Self::UpdateCompleteCleanupInProgress,
            "UPDATE_COMPLETE" => Self::UpdateComplete,
            "UPDATE_FAILED" => Self::UpdateFailed,
            "UPDATE_ROLLBACK_IN_PROGRESS" => Self::UpdateRollbackInProgress,
            "UPDATE_ROLLBACK_FAILED" => Self::UpdateRollbackFailed,
            "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS" => {
                Self::UpdateRollbackCompleteCleanupInProgress
            }
            "UPDATE_ROLLBACK_COMPLETE" => Self::UpdateRollbackComplete,
            _ => Self::Other(s),
        }
    }
}

impl From<StackStatus> for String {
    fn from(status: StackStatus) -> Self {
        status.as_str().to_string()
    }
}

impl FromStr for StackStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

/// The mutating action whose completion a reconcile waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackAction {
    Create,
    Update,
}

impl StackAction {
    /// `<ACTION>_IN_PROGRESS`.
    pub fn in_progress(self) -> StackStatus {
        match self {
            Self::Create => StackStatus::CreateInProgress,
            Self::Update => StackStatus::UpdateInProgress,
        }
    }

    /// `<ACTION>_COMPLETE`.
    pub fn complete(self) -> StackStatus {
        match self {
            Self::Create => StackStatus::CreateComplete,
            Self::Update => StackStatus::UpdateComplete,
        }
    }
}

impl fmt::Display for StackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

// =============================================================================
// Stack parameters
// =============================================================================

/// Name of the parameter marking a stack active or inactive.
pub const PARAM_STATUS: &str = "Status";

/// Name of the parameter carrying the version identifier.
pub const PARAM_VERSION: &str = "Version";

/// Scaling parameters accepted by fleet stacks.
pub const PARAM_SPOT_CAPACITY: &str = "SpotCapacity";
pub const PARAM_SPOT_MIN_WEIGHT: &str = "SpotMinWeight";
pub const PARAM_SPOT_MAX_WEIGHT: &str = "SpotMaxWeight";
pub const PARAM_SPOT_THRESHOLD_IN: &str = "SpotTaskThresholdIn";
pub const PARAM_SPOT_THRESHOLD_OUT: &str = "SpotTaskThresholdOut";

/// Whether a versioned stack is serving or being decommissioned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleStatus {
    #[default]
    Active,
    Inactive,
}

impl RoleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for RoleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown status {other:?}, expected active or inactive")),
        }
    }
}

/// Named stack parameter values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackParameters(BTreeMap<String, String>);

impl StackParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The `Status` parameter; an absent parameter means active.
    ///
    /// An unparseable value is reported as an error so callers can decide
    /// how to treat it.
    pub fn status(&self) -> Result<RoleStatus, String> {
        match self.get(PARAM_STATUS) {
            Some(raw) => raw.parse(),
            None => Ok(RoleStatus::default()),
        }
    }

    pub fn version(&self) -> Option<&str> {
        self.get(PARAM_VERSION)
    }

    /// Returns a copy of `self` with every key of `overrides` replaced.
    pub fn merged(&self, overrides: &StackParameters) -> StackParameters {
        let mut merged = self.clone();
        for (key, value) in &overrides.0 {
            merged.0.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for StackParameters {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// =============================================================================
// Stack requests and responses
// =============================================================================

/// What the backend does with a stack whose creation fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnFailure {
    /// Delete everything the failed create made.
    #[default]
    Delete,

    /// Roll back and leave the stack in `ROLLBACK_COMPLETE`.
    Rollback,
}

/// Template to use for an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSource<'a> {
    Body(&'a str),
    UsePrevious,
}

/// Result of an update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The backend found nothing to change.
    NoChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDescription {
    pub name: StackName,
    pub status: StackStatus,
    pub parameters: StackParameters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    pub name: StackName,
    pub status: StackStatus,
}

/// One entry of a stack's event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEvent {
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Fleet and tasks
// =============================================================================

/// Current state of a weighted compute fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetState {
    pub fleet_id: FleetId,
    pub target_capacity: u32,
}

/// Last reported status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskStatus {
    Provisioning,
    Pending,
    Activating,
    Running,
    Deactivating,
    Stopping,
    Deprovisioning,
    Stopped,
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Pending => "PENDING",
            Self::Activating => "ACTIVATING",
            Self::Running => "RUNNING",
            Self::Deactivating => "DEACTIVATING",
            Self::Stopping => "STOPPING",
            Self::Deprovisioning => "DEPROVISIONING",
            Self::Stopped => "STOPPED",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "PROVISIONING" => Self::Provisioning,
            "PENDING" => Self::Pending,
            "ACTIVATING" => Self::Activating,
            "RUNNING" => Self::Running,
            "DEACTIVATING" => Self::Deactivating,
            "STOPPING" => Self::Stopping,
            "DEPROVISIONING" => Self::Deprovisioning,
            "STOPPED" => Self::Stopped,
            _ => Self::Other(s),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

/// Member attribute carrying the fleet version a member was launched from.
pub const VERSION_ATTRIBUTE: &str = "fleet_version";

/// Member-of placement constraint: only members whose `attribute` equals
/// `value` may host the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub attribute: String,
    pub value: String,
}

impl Placement {
    pub fn member_of(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Constraint expression in the container platform's query language.
    pub fn expression(&self) -> String {
        format!("attribute:{} == {}", self.attribute, self.value)
    }
}

/// Result of a task launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTaskOutcome {
    /// The task was accepted; carries the task identifier.
    Started(String),

    /// No member satisfied the placement (for example no capacity yet).
    NotPlaced(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_status_round_trip_through_string() {
        for raw in [
            "CREATE_IN_PROGRESS",
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            "UPDATE_ROLLBACK_COMPLETE",
            "IMPORT_IN_PROGRESS",
        ] {
            let status = StackStatus::from(raw.to_string());
            assert_eq!(status.as_str(), raw);
        }
        assert_eq!(
            StackStatus::from("IMPORT_IN_PROGRESS".to_string()),
            StackStatus::Other("IMPORT_IN_PROGRESS".to_string())
        );
    }

    #[test]
    fn test_in_progress_detection() {
        assert!(StackStatus::CreateInProgress.is_in_progress());
        assert!(StackStatus::UpdateCompleteCleanupInProgress.is_in_progress());
        assert!(StackStatus::Other("IMPORT_IN_PROGRESS".into()).is_in_progress());
        assert!(!StackStatus::UpdateComplete.is_in_progress());
        assert!(!StackStatus::RollbackComplete.is_in_progress());
    }

    #[test]
    fn test_stack_action_statuses() {
        assert_eq!(StackAction::Create.in_progress(), StackStatus::CreateInProgress);
        assert_eq!(StackAction::Update.complete(), StackStatus::UpdateComplete);
    }

    #[test]
    fn test_parameters_status_defaults_to_active() {
        let params = StackParameters::new();
        assert_eq!(params.status(), Ok(RoleStatus::Active));

        let params = params.with(PARAM_STATUS, RoleStatus::Inactive);
        assert_eq!(params.status(), Ok(RoleStatus::Inactive));

        let params = StackParameters::new().with(PARAM_STATUS, "paused");
        assert!(params.status().is_err());
    }

    #[test]
    fn test_parameters_merge_overrides_only_named_keys() {
        let previous = StackParameters::new()
            .with(PARAM_VERSION, "v1")
            .with(PARAM_STATUS, "active")
            .with(PARAM_SPOT_MAX_WEIGHT, 10);
        let overrides = StackParameters::new().with(PARAM_STATUS, "inactive");

        let merged = previous.merged(&overrides);
        assert_eq!(merged.get(PARAM_STATUS), Some("inactive"));
        assert_eq!(merged.get(PARAM_VERSION), Some("v1"));
        assert_eq!(merged.get(PARAM_SPOT_MAX_WEIGHT), Some("10"));
    }

    #[test]
    fn test_placement_expression() {
        let placement = Placement::member_of("fleet_version", "abc123");
        assert_eq!(placement.expression(), "attribute:fleet_version == abc123");
    }
}
