//! Driving a started pipeline.
//!
//! A run is a chain of pools connected by bounded channels:
//!
//! ```text
//! feeder -> [stage 0 slots] -> link 0 -> [stage 1 slots] -> link 1 -> ... -> output
//! ```
//!
//! The feeder pulls caller inputs on a blocking thread. Each link merges its
//! stage's results (in sequence order when the run is ordered) and forwards
//! successes downstream; the first failure goes to the coordinator, which
//! trips the force-exit signal and moves the run to `Draining`. Teardown runs
//! once, on whichever exit path comes first.

use super::builder::has_process_stage;
use crate::cancellation::{FailureCoordinator, ForceExit, RunState};
use crate::config::RunOptions;
use crate::errors::PipelineError;
use crate::pool::{type_mismatch, until_stopping, LaunchContext, Link, Merge, StageRunner, WorkItem, WorkerPool};
use crate::progress::ProgressReporter;
use crate::stages::{ProcessLauncher, StageDescriptor};
use crate::worker::{panic_message, Payload};
use futures::stream::{self, BoxStream, Stream, StreamExt, TryStreamExt};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(crate) struct RunPlan<'a> {
    pub(crate) stages: &'a [Arc<dyn StageRunner>],
    pub(crate) descriptors: Vec<StageDescriptor>,
    pub(crate) launchers: Vec<Option<Arc<ProcessLauncher>>>,
    pub(crate) options: RunOptions,
    pub(crate) progress: Arc<dyn ProgressReporter>,
    pub(crate) handle: Handle,
}

/// Live resources of a run, released by teardown.
struct Resources {
    pools: Vec<Box<dyn WorkerPool>>,
    links: Vec<JoinHandle<()>>,
    feeder: JoinHandle<()>,
}

struct RunShared {
    coordinator: Arc<FailureCoordinator>,
    progress: Arc<dyn ProgressReporter>,
    grace: Duration,
    started: Instant,
    last_stage: usize,
    resources: Mutex<Option<Resources>>,
}

impl RunShared {
    /// Releases every pool. Later calls return immediately.
    async fn teardown(&self) {
        let Some(mut resources) = self.resources.lock().await.take() else {
            return;
        };
        self.coordinator.force_exit().trip("run finished");

        for link in &resources.links {
            link.abort();
        }
        for pool in &mut resources.pools {
            debug!(stage = pool.stage_index(), mode = %pool.mode(), "Shutting down pool");
            pool.shutdown(self.grace).await;
        }
        if !resources.feeder.is_finished() {
            debug!("Input iterator is still running; detaching it");
        }
        self.finish();
    }

    /// Teardown without a runtime: slots are abandoned, not joined.
    fn teardown_now(&self) {
        let Ok(mut guard) = self.resources.try_lock() else {
            return;
        };
        let Some(mut resources) = guard.take() else {
            return;
        };
        self.coordinator.force_exit().trip("run abandoned");
        for link in &resources.links {
            link.abort();
        }
        for pool in &mut resources.pools {
            pool.abort();
        }
        resources.feeder.abort();
        warn!("Pipeline run torn down without a runtime; slots were abandoned");
        self.finish();
    }

    fn finish(&self) {
        self.progress.on_run_end();
        self.coordinator.mark_stopped();
        info!(
            elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            failed = self.coordinator.has_error(),
            "Pipeline run stopped"
        );
    }
}

/// Starts every pool and returns the output stream.
pub(crate) fn start<O, It>(plan: RunPlan<'_>, inputs: It) -> Result<PipelineRun<O>, PipelineError>
where
    O: Payload,
    It: Iterator + Send + 'static,
    It::Item: Payload,
{
    let RunPlan {
        stages,
        descriptors,
        launchers,
        options,
        progress,
        handle,
    } = plan;
    let started = Instant::now();

    let force_exit = if has_process_stage(&descriptors) {
        ForceExit::with_process_marker()?
    } else {
        ForceExit::new()
    };
    let coordinator = Arc::new(FailureCoordinator::new(Arc::new(force_exit)));

    let total = match inputs.size_hint() {
        (lower, Some(upper)) if lower == upper => u64::try_from(lower).ok(),
        _ => None,
    };
    progress.on_run_start(&descriptors, total);
    info!(
        stages = descriptors.len(),
        ordered = options.ordered,
        total = ?total,
        "Pipeline run started"
    );

    let capacity = |index: usize| {
        let workers = descriptors.get(index).map_or(1, |d| d.worker_count);
        options.capacity_for(workers)
    };
    let last_stage = descriptors.len().saturating_sub(1);

    let (feed_tx, mut upstream) = mpsc::channel(capacity(0));
    let mut pools = Vec::with_capacity(stages.len());
    let mut links = Vec::with_capacity(stages.len());

    for (index, stage) in stages.iter().enumerate() {
        let descriptor = &descriptors[index];
        let (results_tx, results_rx) = mpsc::channel(capacity(index));
        pools.push(stage.launch(LaunchContext {
            stage_index: index,
            worker_type: descriptor.worker_type.clone(),
            worker_count: descriptor.worker_count,
            input: Arc::new(Mutex::new(upstream)),
            results: results_tx,
            force_exit: coordinator.force_exit().clone(),
            run_state: coordinator.subscribe(),
            launcher: launchers.get(index).cloned().flatten(),
            grace: options.shutdown_grace(),
            handle: handle.clone(),
        }));

        let next_capacity = if index == last_stage {
            capacity(index)
        } else {
            capacity(index + 1)
        };
        let (downstream, next) = mpsc::channel(next_capacity);
        let link = Link {
            stage_index: index,
            is_last: index == last_stage,
            merge: Merge::new(options.ordered),
            results: results_rx,
            downstream,
            coordinator: coordinator.clone(),
            progress: progress.clone(),
        };
        links.push(handle.spawn(link.run()));
        upstream = next;
    }

    let feeder = {
        let coordinator = coordinator.clone();
        handle.spawn_blocking(move || feed(inputs, &feed_tx, &coordinator))
    };

    let shared = Arc::new(RunShared {
        coordinator: coordinator.clone(),
        progress,
        grace: options.shutdown_grace(),
        started,
        last_stage,
        resources: Mutex::new(Some(Resources { pools, links, feeder })),
    });
    Ok(PipelineRun::new(shared, upstream))
}

/// Pulls caller inputs into the first stage until they run out, the stage
/// closes, or the run is stopping.
fn feed<It>(mut inputs: It, tx: &mpsc::Sender<WorkItem>, coordinator: &FailureCoordinator)
where
    It: Iterator,
    It::Item: Payload,
{
    let mut seq = 0_u64;
    loop {
        if coordinator.force_exit().is_set() {
            debug!(fed = seq, "Force exit set; input feeding stopped");
            return;
        }
        let item = match catch_unwind(AssertUnwindSafe(|| inputs.next())) {
            Ok(Some(item)) => item,
            Ok(None) => {
                debug!(fed = seq, "Inputs exhausted");
                return;
            }
            Err(panic) => {
                coordinator.report(PipelineError::runtime(format!(
                    "input iterator panicked: {}",
                    panic_message(panic.as_ref())
                )));
                return;
            }
        };
        let item = WorkItem {
            seq,
            payload: Box::new(item),
        };
        if tx.blocking_send(item).is_err() {
            debug!(fed = seq, "First stage closed; input feeding stopped");
            return;
        }
        seq += 1;
    }
}

struct Cursor {
    output: mpsc::Receiver<WorkItem>,
    state: watch::Receiver<RunState>,
    shared: Arc<RunShared>,
}

fn output_stream<O: Payload>(cursor: Cursor) -> BoxStream<'static, Result<O, PipelineError>> {
    stream::unfold(Some(cursor), |cursor| async move {
        let mut cursor = cursor?;
        let next = tokio::select! {
            biased;
            item = cursor.output.recv() => item,
            () = until_stopping(&mut cursor.state) => None,
        };

        if let Some(item) = next {
            return match item.payload.downcast::<O>() {
                Ok(value) => Some((Ok(*value), Some(cursor))),
                Err(_) => {
                    let error = type_mismatch(cursor.shared.last_stage + 1);
                    cursor.shared.coordinator.drain(error.to_string());
                    cursor.shared.teardown().await;
                    Some((Err(error), None))
                }
            };
        }

        cursor.shared.teardown().await;
        cursor
            .shared
            .coordinator
            .take_error()
            .map(|error| (Err(error), None))
    })
    .fuse()
    .boxed()
}

/// A running pipeline: a lazy, single-pass stream of outputs.
///
/// Outputs arrive in input order when the run is ordered, otherwise as they
/// complete. The first genuine worker failure ends the stream with an
/// `Err`. Dropping the run before it ends stops every stage and releases
/// its workers in the background.
pub struct PipelineRun<O: Payload> {
    stream: BoxStream<'static, Result<O, PipelineError>>,
    shared: Arc<RunShared>,
    _output: PhantomData<fn() -> O>,
}

impl<O: Payload> PipelineRun<O> {
    fn new(shared: Arc<RunShared>, output: mpsc::Receiver<WorkItem>) -> Self {
        let cursor = Cursor {
            output,
            state: shared.coordinator.subscribe(),
            shared: shared.clone(),
        };
        Self {
            stream: output_stream(cursor),
            shared,
            _output: PhantomData,
        }
    }

    /// Returns the run's current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.shared.coordinator.state()
    }

    /// Collects every output, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns the run's first genuine failure.
    pub async fn collect_all(self) -> Result<Vec<O>, PipelineError> {
        self.try_collect().await
    }

    /// Stops the run and waits until every worker is released.
    pub async fn shutdown(self) {
        self.shared.coordinator.drain("run shut down by caller");
        self.shared.teardown().await;
    }
}

impl<O: Payload> Stream for PipelineRun<O> {
    type Item = Result<O, PipelineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl<O: Payload> Drop for PipelineRun<O> {
    fn drop(&mut self) {
        if self.shared.coordinator.state() == RunState::Stopped {
            return;
        }
        self.shared.coordinator.drain("run abandoned");
        let shared = self.shared.clone();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.teardown().await });
            }
            Err(_) => shared.teardown_now(),
        }
    }
}

impl<O: Payload> std::fmt::Debug for PipelineRun<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRun")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
