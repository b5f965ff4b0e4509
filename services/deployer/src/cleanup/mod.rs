//! Worker side of stack deletion requests.

mod worker;

pub use worker::{CleanupError, CleanupPass, CleanupWorker, CleanupWorkerConfig};
