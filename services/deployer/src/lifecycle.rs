//! Reclaiming stacks of abandoned versions.
//!
//! Deletion is never done in-process: the stack may own the very roles this
//! process runs under. Instead a [`DeleteRequest`] is handed to the cleanup
//! worker, which deletes the stack after the current invocation has exited.

use std::sync::Arc;

use maestro_events::DeleteRequest;
use maestro_id::{ClusterName, StackName, Version};
use tracing::{info, instrument, warn};

use crate::backend::{BackendError, BackendResult, CleanupDispatcher, ClusterBackend};

/// Suffix of the cleanup worker's function name.
const CLEANUP_FUNCTION_SUFFIX: &str = "FleetCleanup";

/// Name the cleanup worker for `cluster` is invoked by.
pub fn cleanup_function_name(cluster: &ClusterName) -> String {
    format!("{}{CLEANUP_FUNCTION_SUFFIX}", cluster.pascal_case())
}

/// Result of a deletion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The request reached the worker.
    Dispatched,

    /// The request was lost; the next tick that sees the same condition
    /// asks again.
    Dropped(BackendError),
}

pub struct LifecycleCleaner {
    cluster: Arc<dyn ClusterBackend>,
    dispatcher: Arc<dyn CleanupDispatcher>,
}

impl LifecycleCleaner {
    pub fn new(cluster: Arc<dyn ClusterBackend>, dispatcher: Arc<dyn CleanupDispatcher>) -> Self {
        Self {
            cluster,
            dispatcher,
        }
    }

    /// True iff no active member of `cluster` was launched from `version`.
    pub async fn is_version_empty(
        &self,
        cluster: &ClusterName,
        version: &Version,
    ) -> BackendResult<bool> {
        let members = self.cluster.list_active_members(cluster, version).await?;
        if !members.is_empty() {
            info!(%cluster, %version, members = members.len(), "version still has active members");
        }
        Ok(members.is_empty())
    }

    /// Ask the cleanup worker to delete `stack`. Failures are logged and
    /// reported, never raised.
    #[instrument(skip_all, fields(%cluster, %stack))]
    pub async fn request_deletion(&self, cluster: &ClusterName, stack: &StackName) -> DispatchOutcome {
        let function = cleanup_function_name(cluster);
        let request = DeleteRequest::new(stack.clone());

        match self.dispatcher.dispatch(&function, &request).await {
            Ok(()) => {
                info!(%function, "requested stack deletion");
                DispatchOutcome::Dispatched
            }
            Err(e) => {
                warn!(%function, error = %e, "failed to request stack deletion");
                DispatchOutcome::Dropped(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::backend::{MemoryBackend, Operation};

    fn setup() -> (Arc<MemoryBackend>, LifecycleCleaner) {
        let backend = Arc::new(MemoryBackend::new());
        let cleaner = LifecycleCleaner::new(backend.clone(), backend.clone());
        (backend, cleaner)
    }

    #[rstest]
    #[case("kloudcover", "KloudcoverFleetCleanup")]
    #[case("scaling-kloudcover", "ScalingKloudcoverFleetCleanup")]
    fn test_cleanup_function_name(#[case] cluster: &str, #[case] expected: &str) {
        let cluster: ClusterName = cluster.parse().unwrap();
        assert_eq!(cleanup_function_name(&cluster), expected);
    }

    #[rstest]
    #[case(0, true)]
    #[case(1, false)]
    #[case(3, false)]
    #[tokio::test]
    async fn test_is_version_empty(#[case] members: usize, #[case] expected: bool) {
        let (backend, cleaner) = setup();
        let cluster: ClusterName = "kloudcover".parse().unwrap();
        let version: Version = "v1".parse().unwrap();
        let other: Version = "v2".parse().unwrap();

        backend.add_member(&cluster, &other, "i-other").await;
        for i in 0..members {
            backend.add_member(&cluster, &version, &format!("i-{i}")).await;
        }

        assert_eq!(cleaner.is_version_empty(&cluster, &version).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_request_deletion_queues_payload() {
        let (backend, cleaner) = setup();
        let cluster: ClusterName = "kloudcover".parse().unwrap();
        let stack: StackName = "kloudcover-fleet-v1".parse().unwrap();

        let outcome = cleaner.request_deletion(&cluster, &stack).await;

        assert_eq!(outcome, DispatchOutcome::Dispatched);
        let queued = backend.cleanup_requests().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].function, "KloudcoverFleetCleanup");
        assert_eq!(queued[0].request.stack, stack);
    }

    #[tokio::test]
    async fn test_request_deletion_swallows_failure() {
        let (backend, cleaner) = setup();
        let cluster: ClusterName = "kloudcover".parse().unwrap();
        let stack: StackName = "kloudcover-fleet-v1".parse().unwrap();
        backend
            .fail_next(Operation::Dispatch, BackendError::terminal("AccessDenied"))
            .await;

        let outcome = cleaner.request_deletion(&cluster, &stack).await;

        assert!(matches!(outcome, DispatchOutcome::Dropped(_)));
        assert!(backend.cleanup_requests().await.is_empty());
    }
}
