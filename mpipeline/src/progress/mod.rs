//! Progress reporting.
//!
//! A run notifies its [`ProgressReporter`] after every successful stage item,
//! once per item leaving the last stage, and once at teardown.

mod reporter;
mod tracker;

pub use reporter::{CollectingProgress, LoggingProgress, NoOpProgress, ProgressEvent, ProgressReporter};
pub use tracker::{format_mm_ss, format_rate, ProgressTracker, StageSnapshot};

use crate::config::{ProgressMode, RunOptions};
use std::sync::Arc;

/// Builds the reporter selected by `options.progress`.
#[must_use]
pub fn reporter_for(options: &RunOptions) -> Arc<dyn ProgressReporter> {
    match options.progress {
        ProgressMode::None => Arc::new(NoOpProgress),
        mode => Arc::new(LoggingProgress::new(mode, options.progress_window)),
    }
}
