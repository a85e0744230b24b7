//! Per-slot worker lifecycle: lazy construction, guarded calls, single disposal.

use super::Worker;
use crate::errors::{BoxError, FailureKind};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Constructor shared by every slot of a stage.
pub(crate) type WorkerFactory<W> = Arc<dyn Fn() -> anyhow::Result<W> + Send + Sync>;

/// Result of running one item through a slot.
#[derive(Debug)]
pub(crate) enum SlotOutcome<O> {
    Success { value: O, elapsed: Duration },
    Failure { kind: FailureKind, error: BoxError },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DisposeOutcome {
    NotConstructed,
    Disposed,
    Failed(String),
}

enum SlotState<W> {
    Empty,
    Ready(W),
    Broken(String),
    Disposed,
}

/// The worker owned by one slot.
pub(crate) struct LazyWorker<W: Worker> {
    factory: WorkerFactory<W>,
    state: SlotState<W>,
}

impl<W: Worker> LazyWorker<W> {
    pub(crate) fn new(factory: WorkerFactory<W>) -> Self {
        Self {
            factory,
            state: SlotState::Empty,
        }
    }

    pub(crate) fn is_constructed(&self) -> bool {
        matches!(self.state, SlotState::Ready(_) | SlotState::Disposed)
    }

    /// Runs `input` through the worker, constructing it first if needed.
    pub(crate) fn process(&mut self, input: &W::Input) -> SlotOutcome<W::Output> {
        if let Err(error) = self.ensure_ready() {
            return SlotOutcome::Failure {
                kind: FailureKind::Initialization,
                error,
            };
        }
        let SlotState::Ready(worker) = &mut self.state else {
            return SlotOutcome::Failure {
                kind: FailureKind::Initialization,
                error: "worker slot is already disposed".into(),
            };
        };

        let start = Instant::now();
        match guarded(|| worker.process(input)) {
            Ok(value) => SlotOutcome::Success {
                value,
                elapsed: start.elapsed(),
            },
            Err(error) => SlotOutcome::Failure {
                kind: FailureKind::Processing,
                error,
            },
        }
    }

    /// Disposes the worker if it was constructed. Later calls are no-ops.
    pub(crate) fn dispose(&mut self) -> DisposeOutcome {
        match std::mem::replace(&mut self.state, SlotState::Disposed) {
            SlotState::Ready(mut worker) => match guarded(|| worker.dispose()) {
                Ok(()) => DisposeOutcome::Disposed,
                Err(e) => DisposeOutcome::Failed(e.to_string()),
            },
            SlotState::Disposed => DisposeOutcome::NotConstructed,
            previous @ (SlotState::Empty | SlotState::Broken(_)) => {
                self.state = previous;
                DisposeOutcome::NotConstructed
            }
        }
    }

    fn ensure_ready(&mut self) -> Result<(), BoxError> {
        match &self.state {
            SlotState::Ready(_) => return Ok(()),
            SlotState::Broken(message) => return Err(message.clone().into()),
            SlotState::Disposed => return Err("worker slot is already disposed".into()),
            SlotState::Empty => {}
        }

        let factory = self.factory.clone();
        let mut worker = match guarded(|| factory()) {
            Ok(worker) => worker,
            Err(e) => {
                self.state = SlotState::Broken(e.to_string());
                return Err(e);
            }
        };
        if let Err(e) = guarded(|| worker.local_init()) {
            // The worker exists, so it still gets its single dispose.
            if let Err(dispose_error) = guarded(|| worker.dispose()) {
                warn!("Worker dispose after failed local_init failed: {}", dispose_error);
            }
            self.state = SlotState::Broken(e.to_string());
            return Err(e);
        }
        self.state = SlotState::Ready(worker);
        Ok(())
    }
}

/// Calls `f`, turning both errors and panics into a boxed error.
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, BoxError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.into()),
        Err(panic) => Err(format!("worker panicked: {}", panic_message(panic.as_ref())).into()),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
