//! Worker host for process stages.
//!
//! Started by a pipeline run with the worker name and its arguments in the
//! environment. Requests arrive on stdin and responses leave on stdout, so
//! logs go to stderr.

use mpipeline::observability::{init_tracing, LoggingConfig};
use mpipeline::process::serve_if_worker_process;
use mpipeline::testing::demo_registry;
use std::process::ExitCode;

fn main() -> ExitCode {
    init_tracing(&LoggingConfig::default());

    let registry = demo_registry();
    match serve_if_worker_process(&registry) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            eprintln!("mpipeline-worker hosts process-stage workers and is started by a pipeline run.");
            eprintln!("Available workers: {}", registry.names().join(", "));
            ExitCode::from(2)
        }
        Err(err) => {
            tracing::error!(error = %err, "Worker host failed");
            ExitCode::FAILURE
        }
    }
}
