//! # maestro-events
//!
//! One-way messages the deployer hands off to asynchronous workers.
//!
//! ## Design Principles
//!
//! - Messages are fire-and-forget; the sender never waits on the outcome
//! - Payloads are plain JSON with a fixed shape so workers written against
//!   any runtime can consume them
//! - Messages carry names, never credentials or template bodies
//!
//! ## Messages
//!
//! - [`DeleteRequest`]: ask the cleanup worker to delete a named stack

mod delete;
mod error;

pub use delete::DeleteRequest;
pub use error::EventError;
