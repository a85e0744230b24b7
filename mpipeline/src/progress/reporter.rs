//! Progress reporter trait and implementations.

use super::tracker::ProgressTracker;
use crate::config::ProgressMode;
use crate::stages::StageDescriptor;
use parking_lot::{Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Receives progress notifications from a run.
///
/// Callbacks arrive from the run's link tasks and must not block.
pub trait ProgressReporter: Send + Sync {
    /// Called once before any item is processed.
    fn on_run_start(&self, _stages: &[StageDescriptor], _total: Option<u64>) {}

    /// Called after a stage finished an item successfully.
    fn on_stage_item_done(&self, stage_index: usize, elapsed: Duration);

    /// Called once for every item leaving the last stage.
    fn on_total_item_done(&self);

    /// Called exactly once during teardown.
    fn on_run_end(&self);
}

/// A reporter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgress;

impl ProgressReporter for NoOpProgress {
    fn on_stage_item_done(&self, _stage_index: usize, _elapsed: Duration) {}

    fn on_total_item_done(&self) {}

    fn on_run_end(&self) {}
}

struct LoggingState {
    tracker: ProgressTracker,
    stage_names: Vec<String>,
}

/// A reporter that logs progress through `tracing`.
///
/// Per-item updates go to `debug`, the run summary to `info`.
pub struct LoggingProgress {
    mode: ProgressMode,
    window: usize,
    state: Mutex<LoggingState>,
}

impl LoggingProgress {
    /// Creates a logging reporter.
    #[must_use]
    pub fn new(mode: ProgressMode, window: usize) -> Self {
        Self {
            mode,
            window,
            state: Mutex::new(LoggingState {
                tracker: ProgressTracker::new(0, None, window),
                stage_names: Vec::new(),
            }),
        }
    }

    /// Returns the reporting mode.
    #[must_use]
    pub fn mode(&self) -> ProgressMode {
        self.mode
    }
}

impl std::fmt::Debug for LoggingProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingProgress")
            .field("mode", &self.mode)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl ProgressReporter for LoggingProgress {
    fn on_run_start(&self, stages: &[StageDescriptor], total: Option<u64>) {
        let mut state = self.state.lock();
        state.tracker = ProgressTracker::new(stages.len(), total, self.window);
        state.stage_names = stages
            .iter()
            .map(|s| format!("Stage {} ({})", s.index + 1, s.worker_type))
            .collect();
        debug!(stages = stages.len(), total = ?total, "Progress started");
    }

    fn on_stage_item_done(&self, stage_index: usize, elapsed: Duration) {
        let mut state = self.state.lock();
        let Some(snapshot) = state.tracker.record_stage(stage_index, elapsed) else {
            return;
        };
        if self.mode == ProgressMode::Stage {
            let name = state
                .stage_names
                .get(stage_index)
                .map_or("Stage", String::as_str);
            debug!(
                stage = stage_index,
                processed = snapshot.processed,
                "{}: {} {}",
                name,
                snapshot.processed,
                snapshot.postfix()
            );
        }
    }

    fn on_total_item_done(&self) {
        let mut state = self.state.lock();
        let done = state.tracker.record_completed();
        if self.mode != ProgressMode::None {
            match state.tracker.total() {
                Some(total) => debug!(done, total, "Total Progress: {}/{}", done, total),
                None => debug!(done, "Total Progress: {}", done),
            }
        }
    }

    fn on_run_end(&self) {
        let state = self.state.lock();
        if self.mode == ProgressMode::None {
            return;
        }
        info!(
            completed = state.tracker.completed(),
            total = ?state.tracker.total(),
            "Pipeline progress closed"
        );
        if self.mode == ProgressMode::Stage {
            for snapshot in state.tracker.snapshots() {
                info!(
                    stage = snapshot.stage_index,
                    processed = snapshot.processed,
                    rate = %snapshot.rate(),
                    "Stage summary: {}",
                    snapshot.postfix()
                );
            }
        }
    }
}

/// A recorded progress notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// `on_run_start`.
    RunStart {
        /// Number of stages.
        stages: usize,
        /// Expected item count.
        total: Option<u64>,
    },
    /// `on_stage_item_done`.
    StageItem {
        /// Stage position.
        stage_index: usize,
    },
    /// `on_total_item_done`.
    TotalItem,
    /// `on_run_end`.
    RunEnd,
}

/// A reporter that records every call, for tests.
#[derive(Debug, Default)]
pub struct CollectingProgress {
    events: RwLock<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Counts recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&ProgressEvent) -> bool) -> usize {
        self.events.read().iter().filter(|e| predicate(e)).count()
    }

    /// Number of `on_stage_item_done` calls for a stage.
    #[must_use]
    pub fn stage_items(&self, stage_index: usize) -> usize {
        self.count(|e| matches!(e, ProgressEvent::StageItem { stage_index: i } if *i == stage_index))
    }

    /// Number of `on_total_item_done` calls.
    #[must_use]
    pub fn total_items(&self) -> usize {
        self.count(|e| *e == ProgressEvent::TotalItem)
    }

    /// Number of `on_run_end` calls.
    #[must_use]
    pub fn run_ends(&self) -> usize {
        self.count(|e| *e == ProgressEvent::RunEnd)
    }
}

impl ProgressReporter for CollectingProgress {
    fn on_run_start(&self, stages: &[StageDescriptor], total: Option<u64>) {
        self.events.write().push(ProgressEvent::RunStart {
            stages: stages.len(),
            total,
        });
    }

    fn on_stage_item_done(&self, stage_index: usize, _elapsed: Duration) {
        self.events
            .write()
            .push(ProgressEvent::StageItem { stage_index });
    }

    fn on_total_item_done(&self) {
        self.events.write().push(ProgressEvent::TotalItem);
    }

    fn on_run_end(&self) {
        self.events.write().push(ProgressEvent::RunEnd);
    }
}
