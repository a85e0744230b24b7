//! Worker pools: the running form of a stage.
//!
//! A pool owns `worker_count` slots. All slots of a stage pull
//! [`WorkItem`]s from one shared input channel and push [`SlotResult`]s to
//! one results channel, which the stage's link task merges and forwards.

mod merge;
mod process;
mod thread;

pub(crate) use merge::Merge;

use crate::cancellation::{ForceExit, RunState};
use crate::errors::{BoxError, ConfigurationError, FailureKind, OffendingInput, PipelineError, WorkerError};
use crate::stages::{ExecutionMode, ProcessLauncher, Stage, StageDescriptor, StageKind, StartMethod};
use crate::worker::Payload;
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};

/// A type-erased item travelling between stages.
pub(crate) type AnyPayload = Box<dyn Any + Send + Sync>;

/// An item tagged with its ingestion sequence number.
pub(crate) struct WorkItem {
    pub(crate) seq: u64,
    pub(crate) payload: AnyPayload,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").field("seq", &self.seq).finish_non_exhaustive()
    }
}

/// What a slot produced for one item.
#[derive(Debug)]
pub(crate) enum SlotResult {
    Success {
        seq: u64,
        value: AnyPayload,
        elapsed: Duration,
    },
    Failure {
        seq: u64,
        error: PipelineError,
    },
}

impl SlotResult {
    pub(crate) fn seq(&self) -> u64 {
        match self {
            Self::Success { seq, .. } | Self::Failure { seq, .. } => *seq,
        }
    }
}

/// Input channel shared by every slot of a stage.
pub(crate) type SharedInput = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

/// Everything a pool needs to start its slots.
pub(crate) struct LaunchContext {
    pub(crate) stage_index: usize,
    pub(crate) worker_type: String,
    pub(crate) worker_count: usize,
    pub(crate) input: SharedInput,
    pub(crate) results: mpsc::Sender<SlotResult>,
    pub(crate) force_exit: Arc<ForceExit>,
    pub(crate) run_state: watch::Receiver<RunState>,
    pub(crate) launcher: Option<Arc<ProcessLauncher>>,
    pub(crate) grace: Duration,
    pub(crate) handle: Handle,
}

/// A started pool.
#[async_trait]
pub(crate) trait WorkerPool: Send {
    fn stage_index(&self) -> usize;

    fn mode(&self) -> ExecutionMode;

    /// Waits for every slot to dispose its worker and exit, terminating
    /// slots that overrun `grace`. Errors are logged.
    async fn shutdown(&mut self, grace: Duration);

    /// Abandons the slots without waiting.
    fn abort(&mut self);
}

/// A stage with its item types erased.
pub(crate) trait StageRunner: Send + Sync {
    fn descriptor(&self, index: usize) -> StageDescriptor;

    fn validate(&self, index: usize) -> Result<(), ConfigurationError>;

    fn start_method(&self) -> Option<&StartMethod>;

    fn launch(&self, ctx: LaunchContext) -> Box<dyn WorkerPool>;
}

impl<I: Payload, O: Payload> StageRunner for Stage<I, O> {
    fn descriptor(&self, index: usize) -> StageDescriptor {
        Stage::descriptor(self, index)
    }

    fn validate(&self, index: usize) -> Result<(), ConfigurationError> {
        Stage::validate(self, index)
    }

    fn start_method(&self) -> Option<&StartMethod> {
        Stage::start_method(self)
    }

    fn launch(&self, ctx: LaunchContext) -> Box<dyn WorkerPool> {
        match &self.kind {
            StageKind::Thread(factory) => Box::new(thread::ThreadPool::launch(factory.clone(), ctx)),
            StageKind::Process(spec) => Box::new(process::ProcessPool::launch(spec.clone(), ctx)),
        }
    }
}

/// Waits until the run leaves `Running`.
pub(crate) async fn until_stopping(state: &mut watch::Receiver<RunState>) {
    let _ = state.wait_for(|s| *s != RunState::Running).await;
}

/// Takes the next item unless the run is stopping first.
pub(crate) async fn next_item(
    input: &SharedInput,
    state: &mut watch::Receiver<RunState>,
) -> Option<WorkItem> {
    tokio::select! {
        biased;
        () = until_stopping(state) => None,
        item = async { input.lock().await.recv().await } => item,
    }
}

/// Wraps a slot failure with the stage's details.
pub(crate) fn slot_failure<I: Payload>(
    kind: FailureKind,
    worker_type: &str,
    stage_index: usize,
    source: BoxError,
    input: I,
) -> PipelineError {
    let error = match kind {
        FailureKind::Initialization => WorkerError::initialization(worker_type, stage_index, source),
        FailureKind::Processing => {
            WorkerError::processing(worker_type, stage_index, source, OffendingInput::new(input))
        }
        FailureKind::ForcedShutdown => WorkerError::forced_shutdown(worker_type, stage_index),
    };
    error.into()
}

pub(crate) fn type_mismatch(stage_index: usize) -> PipelineError {
    PipelineError::runtime(format!(
        "stage {stage_index} received an item of an unexpected type"
    ))
}

/// Forwards a stage's merged results downstream.
///
/// Successes go to `downstream`, failures to the coordinator. The link
/// stops at the first failure or when either side closes.
pub(crate) struct Link {
    pub(crate) stage_index: usize,
    pub(crate) is_last: bool,
    pub(crate) merge: Merge<SlotResult>,
    pub(crate) results: mpsc::Receiver<SlotResult>,
    pub(crate) downstream: mpsc::Sender<WorkItem>,
    pub(crate) coordinator: Arc<crate::cancellation::FailureCoordinator>,
    pub(crate) progress: Arc<dyn crate::progress::ProgressReporter>,
}

impl Link {
    pub(crate) async fn run(mut self) {
        while let Some(result) = self.results.recv().await {
            let seq = result.seq();
            for ready in self.merge.push(seq, result) {
                match ready {
                    SlotResult::Success { seq, value, elapsed } => {
                        self.progress.on_stage_item_done(self.stage_index, elapsed);
                        let item = WorkItem { seq, payload: value };
                        if self.downstream.send(item).await.is_err() {
                            tracing::debug!(stage = self.stage_index, "Downstream closed; link stopping");
                            return;
                        }
                        if self.is_last {
                            self.progress.on_total_item_done();
                        }
                    }
                    SlotResult::Failure { error, .. } => {
                        self.coordinator.report(error);
                        return;
                    }
                }
            }
        }
        if self.merge.pending() > 0 {
            tracing::debug!(
                stage = self.stage_index,
                pending = self.merge.pending(),
                "Link closed with results still waiting for earlier items"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::FailureCoordinator;
    use crate::progress::CollectingProgress;

    fn success(seq: u64, value: i64) -> SlotResult {
        SlotResult::Success {
            seq,
            value: Box::new(value),
            elapsed: Duration::from_millis(1),
        }
    }

    fn link(
        ordered: bool,
        progress: Arc<CollectingProgress>,
        coordinator: Arc<FailureCoordinator>,
    ) -> (mpsc::Sender<SlotResult>, mpsc::Receiver<WorkItem>, Link) {
        let (results_tx, results) = mpsc::channel(16);
        let (downstream, out) = mpsc::channel(16);
        let link = Link {
            stage_index: 0,
            is_last: true,
            merge: Merge::new(ordered),
            results,
            downstream,
            coordinator,
            progress,
        };
        (results_tx, out, link)
    }

    fn values(out: &mut mpsc::Receiver<WorkItem>) -> Vec<i64> {
        let mut values = Vec::new();
        while let Ok(item) = out.try_recv() {
            values.push(*item.payload.downcast::<i64>().unwrap());
        }
        values
    }

    #[tokio::test]
    async fn test_ordered_link_reorders() {
        let progress = Arc::new(CollectingProgress::new());
        let coordinator = Arc::new(FailureCoordinator::new(Arc::new(ForceExit::new())));
        let (tx, mut out, link) = link(true, progress.clone(), coordinator);

        for (seq, value) in [(2, 20), (0, 0), (1, 10)] {
            tx.send(success(seq, value)).await.unwrap();
        }
        drop(tx);
        link.run().await;

        assert_eq!(values(&mut out), vec![0, 10, 20]);
        assert_eq!(progress.stage_items(0), 3);
        assert_eq!(progress.total_items(), 3);
    }

    #[tokio::test]
    async fn test_failure_surfaces_at_its_position() {
        let progress = Arc::new(CollectingProgress::new());
        let coordinator = Arc::new(FailureCoordinator::new(Arc::new(ForceExit::new())));
        let (tx, mut out, link) = link(true, progress, coordinator.clone());

        tx.send(SlotResult::Failure {
            seq: 1,
            error: WorkerError::initialization("Broken", 0, "boom").into(),
        })
        .await
        .unwrap();
        tx.send(success(2, 2)).await.unwrap();
        tx.send(success(0, 0)).await.unwrap();
        drop(tx);
        link.run().await;

        assert_eq!(values(&mut out), vec![0]);
        assert_eq!(coordinator.state(), RunState::Draining);
        let err = coordinator.take_error().unwrap();
        assert_eq!(err.worker_error().unwrap().worker_type(), "Broken");
    }

    #[tokio::test]
    async fn test_next_item_stops_on_drain() {
        let coordinator = FailureCoordinator::new(Arc::new(ForceExit::new()));
        let (_tx, rx) = mpsc::channel::<WorkItem>(1);
        let input: SharedInput = Arc::new(Mutex::new(rx));
        let mut state = coordinator.subscribe();

        coordinator.drain("stop");
        assert!(next_item(&input, &mut state).await.is_none());
    }

    #[test]
    fn test_until_stopping_wakes_on_drain() {
        let coordinator = FailureCoordinator::new(Arc::new(ForceExit::new()));
        let mut state = coordinator.subscribe();
        let mut waiting = tokio_test::task::spawn(until_stopping(&mut state));

        tokio_test::assert_pending!(waiting.poll());
        coordinator.drain("stop");
        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
    }

    #[test]
    fn test_slot_failure_kinds() {
        let err = slot_failure(FailureKind::Processing, "AddOne", 1, "bad".into(), 5_i64);
        let worker = err.worker_error().unwrap();
        assert_eq!(worker.input_as::<i64>(), Some(&5));

        let err = slot_failure(FailureKind::Initialization, "AddOne", 1, "bad".into(), 5_i64);
        assert!(err.worker_error().unwrap().input().is_none());

        let err = slot_failure(FailureKind::ForcedShutdown, "AddOne", 1, "bad".into(), 5_i64);
        assert!(err.is_forced_shutdown());
    }
}
