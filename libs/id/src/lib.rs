//! # maestro-id
//!
//! Resource names and invocation IDs for the maestro fleet deployer.
//!
//! ## Design Principles
//!
//! - Names are user-controlled labels that end up inside stack names, so
//!   every name is restricted to the stack-name alphabet `[A-Za-z0-9-]`
//! - Names have strict parsing and a canonical string form
//! - Names are typed so a cluster can never be passed where a version is expected
//!
//! ## Stack naming
//!
//! Every managed stack is derived from a cluster name and, for fleet stacks,
//! a version:
//!
//! - `{cluster}-cluster`
//! - `{cluster}-fleet-{version}`
//! - `{cluster}-cluster-health-task`
//! - `{cluster}-pipeline`
//!
//! ## Deploy IDs
//!
//! Each deploy invocation gets a `DeployId` in the prefixed format
//! `dep_{ulid}` so its log lines can be correlated.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
