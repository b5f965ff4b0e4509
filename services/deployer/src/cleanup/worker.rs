use std::sync::Arc;
use std::time::Duration;

use maestro_events::{DeleteRequest, EventError};
use maestro_reconcile::{retry_transient, Clock, DEFAULT_RETRY_DELAY};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::backend::{BackendError, StackBackend};

#[derive(Debug, Error)]
pub enum CleanupError {
    /// The payload was not a deletion request.
    #[error("invalid cleanup payload: {0}")]
    Payload(#[from] EventError),

    #[error("failed to delete stack: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Delay before the single retry of a transient delete failure.
    pub retry_delay: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Totals of one pass over a batch of requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupPass {
    pub deleted: u64,
    pub failed: u64,
}

/// Deletes stacks named by [`DeleteRequest`]s.
pub struct CleanupWorker {
    stacks: Arc<dyn StackBackend>,
    clock: Arc<dyn Clock>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(stacks: Arc<dyn StackBackend>, clock: Arc<dyn Clock>, config: CleanupWorkerConfig) -> Self {
        Self {
            stacks,
            clock,
            config,
        }
    }

    /// Delete the requested stack. A stack that is already gone counts as
    /// deleted.
    #[instrument(skip_all, fields(stack = %request.stack))]
    pub async fn handle(&self, request: &DeleteRequest) -> Result<(), CleanupError> {
        let stacks = self.stacks.as_ref();
        let stack = &request.stack;

        retry_transient(self.clock.as_ref(), self.config.retry_delay, move || {
            stacks.delete_stack(stack)
        })
        .await?;

        info!("stack deletion issued");
        Ok(())
    }

    /// Decode a raw invocation payload and handle it.
    pub async fn handle_payload(&self, payload: &[u8]) -> Result<(), CleanupError> {
        let request = DeleteRequest::from_payload(payload)?;
        self.handle(&request).await
    }

    /// Handle every request, continuing past failures.
    pub async fn run_pass(&self, requests: &[DeleteRequest]) -> CleanupPass {
        let mut pass = CleanupPass::default();

        for request in requests {
            match self.handle(request).await {
                Ok(()) => pass.deleted += 1,
                Err(e) => {
                    error!(stack = %request.stack, error = %e, "Failed to delete stack");
                    pass.failed += 1;
                }
            }
        }

        if pass.failed > 0 {
            warn!(deleted = pass.deleted, failed = pass.failed, "Cleanup pass had failures");
        } else if pass.deleted > 0 {
            info!(deleted = pass.deleted, "Cleanup pass complete");
        }
        pass
    }
}
