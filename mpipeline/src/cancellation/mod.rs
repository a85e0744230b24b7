//! Cooperative shutdown for pipeline runs.
//!
//! This module provides:
//! - ForceExit, the run-scoped stop signal shared with every slot
//! - ForceExitProbe, its read side inside worker processes
//! - RunState, the lifecycle driven by the failure coordinator

mod coordinator;
mod token;

pub(crate) use coordinator::FailureCoordinator;
pub use coordinator::RunState;
pub use token::{ForceExit, ForceExitProbe};
