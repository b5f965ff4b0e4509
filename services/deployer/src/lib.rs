//! maestro deployer library.
//!
//! The deployer manages versioned compute fleets behind a container cluster:
//! it reconciles version-tagged stacks, gates promotion of a new version
//! behind a canary probe, and right-sizes each fleet against scheduling
//! pressure. The crate ships the `scaler` binary (one capacity tick per
//! invocation) and exposes its components for the `maestro` CLI and for
//! integration testing.

pub mod backend;
pub mod capacity;
pub mod cleanup;
pub mod config;
pub mod health;
pub mod lifecycle;
pub mod orchestrator;
pub mod reconciler;
