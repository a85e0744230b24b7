//! First-failure-wins coordination for a single run.

use super::ForceExit;
use crate::errors::PipelineError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Every stage accepts new items.
    Running,
    /// A failure or abandonment was observed; intake is stopped.
    Draining,
    /// All pools are torn down.
    Stopped,
}

/// Collects failures from every stage and drives the run state.
///
/// The first genuine failure becomes the run's outcome. Forced-shutdown
/// sentinels are dropped, later genuine failures are only logged.
pub(crate) struct FailureCoordinator {
    force_exit: Arc<ForceExit>,
    state: watch::Sender<RunState>,
    first_error: Mutex<Option<PipelineError>>,
}

impl FailureCoordinator {
    pub(crate) fn new(force_exit: Arc<ForceExit>) -> Self {
        let (state, _) = watch::channel(RunState::Running);
        Self {
            force_exit,
            state,
            first_error: Mutex::new(None),
        }
    }

    pub(crate) fn force_exit(&self) -> &Arc<ForceExit> {
        &self.force_exit
    }

    /// Records a failure and starts draining.
    pub(crate) fn report(&self, error: PipelineError) {
        if error.is_forced_shutdown() {
            debug!("Discarding forced-shutdown sentinel: {}", error);
            self.drain("forced shutdown observed");
            return;
        }

        let reason = error.to_string();
        {
            let mut first = self.first_error.lock();
            if first.is_some() {
                warn!("Ignoring failure after the run already failed: {}", reason);
                return;
            }
            *first = Some(error);
        }
        self.drain(reason);
    }

    /// Moves `Running` to `Draining` and trips the force-exit signal.
    pub(crate) fn drain(&self, reason: impl Into<String>) {
        self.force_exit.trip(reason);
        self.state.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Draining;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.send_replace(RunState::Stopped);
    }

    pub(crate) fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    pub(crate) fn has_error(&self) -> bool {
        self.first_error.lock().is_some()
    }

    pub(crate) fn take_error(&self) -> Option<PipelineError> {
        self.first_error.lock().take()
    }
}

impl std::fmt::Debug for FailureCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureCoordinator")
            .field("state", &self.state())
            .field("force_exit", &self.force_exit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{OffendingInput, WorkerError};

    fn coordinator() -> FailureCoordinator {
        FailureCoordinator::new(Arc::new(ForceExit::new()))
    }

    fn failure(worker: &str) -> PipelineError {
        WorkerError::processing(worker, 0, "boom", OffendingInput::new(1_u32)).into()
    }

    #[test]
    fn test_starts_running() {
        let coordinator = coordinator();
        assert_eq!(coordinator.state(), RunState::Running);
        assert!(!coordinator.force_exit().is_set());
    }

    #[test]
    fn test_first_failure_wins() {
        let coordinator = coordinator();
        coordinator.report(failure("First"));
        coordinator.report(failure("Second"));

        assert_eq!(coordinator.state(), RunState::Draining);
        assert!(coordinator.force_exit().is_set());

        let err = coordinator.take_error().unwrap();
        assert_eq!(err.worker_error().unwrap().worker_type(), "First");
        assert!(coordinator.take_error().is_none());
    }

    #[test]
    fn test_sentinel_is_not_recorded() {
        let coordinator = coordinator();
        coordinator.report(WorkerError::forced_shutdown("Doubler", 1).into());

        assert_eq!(coordinator.state(), RunState::Draining);
        assert!(coordinator.take_error().is_none());
    }

    #[test]
    fn test_stopped_is_terminal() {
        let coordinator = coordinator();
        coordinator.mark_stopped();
        coordinator.drain("late");
        assert_eq!(coordinator.state(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_subscribers_see_draining() {
        let coordinator = coordinator();
        let mut rx = coordinator.subscribe();
        coordinator.drain("caller stopped");

        let state = *rx.wait_for(|s| *s != RunState::Running).await.unwrap();
        assert_eq!(state, RunState::Draining);
    }
}
