//! Thread slots.

use super::{next_item, slot_failure, type_mismatch, LaunchContext, SharedInput, SlotResult, WorkerPool};
use crate::cancellation::{ForceExit, RunState};
use crate::errors::WorkerError;
use crate::stages::{ExecutionMode, ThreadFactory};
use crate::worker::{DisposeOutcome, LazyWorker, Payload, SlotOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) struct ThreadPool {
    stage_index: usize,
    slots: Vec<JoinHandle<()>>,
}

struct ThreadSlot<I: Payload, O: Payload> {
    stage_index: usize,
    slot_index: usize,
    worker_type: String,
    worker: LazyWorker<crate::worker::BoxedWorker<I, O>>,
    input: SharedInput,
    results: mpsc::Sender<SlotResult>,
    force_exit: Arc<ForceExit>,
    run_state: watch::Receiver<RunState>,
    handle: Handle,
}

impl ThreadPool {
    pub(crate) fn launch<I: Payload, O: Payload>(factory: ThreadFactory<I, O>, ctx: LaunchContext) -> Self {
        debug!(
            stage = ctx.stage_index,
            worker_type = %ctx.worker_type,
            slots = ctx.worker_count,
            "Starting thread pool"
        );
        let slots = (0..ctx.worker_count)
            .map(|slot_index| {
                let slot = ThreadSlot::<I, O> {
                    stage_index: ctx.stage_index,
                    slot_index,
                    worker_type: ctx.worker_type.clone(),
                    worker: LazyWorker::new(factory.clone()),
                    input: ctx.input.clone(),
                    results: ctx.results.clone(),
                    force_exit: ctx.force_exit.clone(),
                    run_state: ctx.run_state.clone(),
                    handle: ctx.handle.clone(),
                };
                ctx.handle.spawn_blocking(move || slot.run())
            })
            .collect();

        Self {
            stage_index: ctx.stage_index,
            slots,
        }
    }
}

impl<I: Payload, O: Payload> ThreadSlot<I, O> {
    fn run(mut self) {
        loop {
            let handle = self.handle.clone();
            let Some(item) = handle.block_on(next_item(&self.input, &mut self.run_state)) else {
                break;
            };
            let result = self.process(item.seq, item.payload);
            if self.results.blocking_send(result).is_err() {
                debug!(stage = self.stage_index, slot = self.slot_index, "Results closed; slot stopping");
                break;
            }
        }

        match self.worker.dispose() {
            DisposeOutcome::Disposed => {
                debug!(stage = self.stage_index, slot = self.slot_index, "Worker disposed");
            }
            DisposeOutcome::Failed(e) => warn!(
                stage = self.stage_index,
                slot = self.slot_index,
                worker_type = %self.worker_type,
                "Worker dispose failed: {}",
                e
            ),
            DisposeOutcome::NotConstructed => {}
        }
    }

    fn process(&mut self, seq: u64, payload: super::AnyPayload) -> SlotResult {
        if self.force_exit.is_set() {
            return SlotResult::Failure {
                seq,
                error: WorkerError::forced_shutdown(&self.worker_type, self.stage_index).into(),
            };
        }
        let Ok(input) = payload.downcast::<I>() else {
            return SlotResult::Failure {
                seq,
                error: type_mismatch(self.stage_index),
            };
        };

        match self.worker.process(&input) {
            SlotOutcome::Success { value, elapsed } => SlotResult::Success {
                seq,
                value: Box::new(value),
                elapsed,
            },
            SlotOutcome::Failure { kind, error } => SlotResult::Failure {
                seq,
                error: slot_failure(kind, &self.worker_type, self.stage_index, error, *input),
            },
        }
    }
}

#[async_trait]
impl WorkerPool for ThreadPool {
    fn stage_index(&self) -> usize {
        self.stage_index
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Thread
    }

    async fn shutdown(&mut self, grace: Duration) {
        for (slot_index, mut slot) in self.slots.drain(..).enumerate() {
            let mut joined = false;
            for attempt in 1..=2 {
                match tokio::time::timeout(grace, &mut slot).await {
                    Ok(Ok(())) => {
                        joined = true;
                        break;
                    }
                    Ok(Err(e)) => {
                        warn!(stage = self.stage_index, slot = slot_index, "Thread slot failed: {}", e);
                        joined = true;
                        break;
                    }
                    Err(_) => debug!(
                        stage = self.stage_index,
                        slot = slot_index,
                        attempt,
                        "Thread slot still running after grace period"
                    ),
                }
            }
            if !joined {
                warn!(
                    stage = self.stage_index,
                    slot = slot_index,
                    "Thread slot did not exit; detaching it"
                );
            }
        }
    }

    fn abort(&mut self) {
        // Blocking tasks cannot be interrupted; dropping the handles detaches them.
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::FailureCoordinator;
    use crate::errors::FailureKind;
    use crate::pool::WorkItem;
    use crate::worker::{BoxedWorker, Worker};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct Tripler {
        disposed: Arc<AtomicUsize>,
    }

    impl Worker for Tripler {
        type Input = i64;
        type Output = i64;

        fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
            anyhow::ensure!(*input != 7, "seven is not allowed");
            Ok(input * 3)
        }

        fn dispose(&mut self) -> anyhow::Result<()> {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        pool: ThreadPool,
        items: mpsc::Sender<WorkItem>,
        results: mpsc::Receiver<SlotResult>,
        coordinator: FailureCoordinator,
        disposed: Arc<AtomicUsize>,
    }

    fn harness(worker_count: usize) -> Harness {
        let disposed = Arc::new(AtomicUsize::new(0));
        let disposed_clone = disposed.clone();
        let factory: ThreadFactory<i64, i64> = Arc::new(move || -> anyhow::Result<BoxedWorker<i64, i64>> {
            Ok(Box::new(Tripler {
                disposed: disposed_clone.clone(),
            }))
        });

        let force_exit = Arc::new(ForceExit::new());
        let coordinator = FailureCoordinator::new(force_exit.clone());
        let (items, input) = mpsc::channel(8);
        let (results_tx, results) = mpsc::channel(8);
        let ctx = LaunchContext {
            stage_index: 1,
            worker_type: "Tripler".to_string(),
            worker_count,
            input: Arc::new(Mutex::new(input)),
            results: results_tx,
            force_exit,
            run_state: coordinator.subscribe(),
            launcher: None,
            grace: Duration::from_secs(1),
            handle: Handle::current(),
        };

        Harness {
            pool: ThreadPool::launch(factory, ctx),
            items,
            results,
            coordinator,
            disposed,
        }
    }

    fn item(seq: u64, value: i64) -> WorkItem {
        WorkItem {
            seq,
            payload: Box::new(value),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_processes_and_disposes_each_slot_once() {
        let mut h = harness(2);
        for seq in 0..4 {
            h.items.send(item(seq, i64::try_from(seq).unwrap())).await.unwrap();
        }
        drop(h.items);

        let mut values = Vec::new();
        while let Some(result) = h.results.recv().await {
            match result {
                SlotResult::Success { value, .. } => values.push(*value.downcast::<i64>().unwrap()),
                SlotResult::Failure { error, .. } => panic!("unexpected failure {error}"),
            }
        }
        values.sort_unstable();
        assert_eq!(values, vec![0, 3, 6, 9]);

        h.pool.shutdown(Duration::from_secs(1)).await;
        assert!(h.disposed.load(Ordering::SeqCst) <= 2);
        assert!(h.disposed.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_carries_input() {
        let mut h = harness(1);
        h.items.send(item(0, 7)).await.unwrap();

        match h.results.recv().await.unwrap() {
            SlotResult::Failure { seq, error } => {
                assert_eq!(seq, 0);
                let worker = error.worker_error().unwrap();
                assert_eq!(worker.kind(), FailureKind::Processing);
                assert_eq!(worker.worker_type(), "Tripler");
                assert_eq!(worker.stage_index(), 1);
                assert_eq!(worker.input_as::<i64>(), Some(&7));
            }
            SlotResult::Success { .. } => panic!("expected failure"),
        }

        drop(h.items);
        h.pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.disposed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_force_exit_yields_sentinel() {
        let mut h = harness(1);
        h.coordinator.force_exit().trip("test");
        h.items.send(item(0, 1)).await.unwrap();

        match h.results.recv().await.unwrap() {
            SlotResult::Failure { error, .. } => assert!(error.is_forced_shutdown()),
            SlotResult::Success { .. } => panic!("expected sentinel"),
        }

        h.coordinator.drain("test");
        h.pool.shutdown(Duration::from_secs(1)).await;
        assert_eq!(h.disposed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_releases_idle_slots() {
        let mut h = harness(3);
        h.coordinator.drain("stop");

        tokio::time::timeout(Duration::from_secs(5), h.pool.shutdown(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(h.pool.slots.is_empty());
        drop(h.items);
    }
}
