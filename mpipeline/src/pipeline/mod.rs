//! Pipeline building and execution.
//!
//! This module provides:
//! - The typed [`Pipeline`] definition with fluent and `|` composition
//! - [`PipelineRun`], the output stream of a running pipeline
//! - Run teardown that releases every worker on every exit path

mod builder;
mod run;


pub use builder::Pipeline;
pub use run::PipelineRun;
