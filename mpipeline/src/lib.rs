//! # mpipeline
//!
//! A multi-stage pipeline executor over thread and process worker pools.
//!
//! A pipeline is an ordered chain of stages. Each stage runs a fixed number
//! of worker slots, either as threads in this process or as separate worker
//! processes, and every item flows through the stages in order:
//!
//! - **Typed stages**: consecutive stages must agree on item types at compile time
//! - **Ordered or unordered output**: outputs follow input order unless asked not to
//! - **Fail fast**: the first worker failure stops every stage and surfaces with its input
//! - **Exactly-once lifecycle**: each slot builds its worker lazily and disposes it once
//! - **Progress**: optional per-stage or whole-run reporting
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mpipeline::prelude::*;
//! use mpipeline::testing::{AddOne, Doubler, ToText};
//!
//! let pipeline = Pipeline::new(Stage::thread(4, || Ok(Doubler)))
//!     | Stage::thread(2, || Ok(AddOne::default()))
//!     | Stage::thread(1, || Ok(ToText));
//!
//! let outputs = pipeline
//!     .run(vec![1, 2, 3], RunOptions::default())?
//!     .collect_all()
//!     .await?;
//! assert_eq!(outputs, vec!["3", "5", "7"]);
//! ```
//!
//! Process stages name a worker registered in a worker-host binary, which
//! calls [`process::serve_if_worker_process`] first thing in `main`.

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod observability;
pub mod pipeline;
mod pool;
pub mod process;
pub mod progress;
pub mod stages;
pub mod testing;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::{ForceExit, RunState};
    pub use crate::config::{ProgressMode, RunOptions};
    pub use crate::errors::{
        ConfigurationError, FailureKind, OffendingInput, PipelineError, WorkerError,
    };
    pub use crate::pipeline::{Pipeline, PipelineRun};
    pub use crate::progress::{LoggingProgress, NoOpProgress, ProgressReporter};
    pub use crate::stages::{ExecutionMode, Stage, StageDescriptor, StartMethod};
    pub use crate::worker::{Payload, Worker, WorkerRegistry};
    pub use futures::{StreamExt, TryStreamExt};
}
