//! Process slots.
//!
//! Each slot is an async task that owns at most one worker process. The
//! process is started on the slot's first item and speaks the line protocol
//! over its stdin and stdout.

use super::{next_item, slot_failure, type_mismatch, AnyPayload, LaunchContext, SharedInput, SlotResult, WorkerPool};
use crate::cancellation::{ForceExit, RunState};
use crate::errors::{BoxError, FailureKind, ProtocolError, RemoteWorkerError, WorkerError};
use crate::process::protocol::{
    decode_response, encode_line, Request, Response, WireOutcome, ENV_FORCE_EXIT_MARKER, ENV_SLOT_INDEX,
    ENV_STAGE_INDEX, ENV_WORKER, ENV_WORKER_ARGS,
};
use crate::stages::{ExecutionMode, ProcessLauncher, ProcessSpec};
use crate::worker::Payload;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

const EXIT_POLL: Duration = Duration::from_millis(10);

pub(crate) struct ProcessPool {
    stage_index: usize,
    grace: Duration,
    slots: Vec<JoinHandle<()>>,
}

impl ProcessPool {
    pub(crate) fn launch<I: Payload, O: Payload>(spec: ProcessSpec<I, O>, ctx: LaunchContext) -> Self {
        debug!(
            stage = ctx.stage_index,
            worker = %spec.entry,
            slots = ctx.worker_count,
            "Starting process pool"
        );
        let spec = Arc::new(spec);
        let slots = (0..ctx.worker_count)
            .map(|slot_index| {
                let slot = ProcessSlot {
                    stage_index: ctx.stage_index,
                    slot_index,
                    worker_type: ctx.worker_type.clone(),
                    spec: spec.clone(),
                    launcher: ctx.launcher.clone(),
                    input: ctx.input.clone(),
                    results: ctx.results.clone(),
                    force_exit: ctx.force_exit.clone(),
                    run_state: ctx.run_state.clone(),
                    grace: ctx.grace,
                    process: None,
                    broken: None,
                };
                ctx.handle.spawn(slot.run())
            })
            .collect();

        Self {
            stage_index: ctx.stage_index,
            grace: ctx.grace,
            slots,
        }
    }
}

struct ProcessSlot<I: Payload, O: Payload> {
    stage_index: usize,
    slot_index: usize,
    worker_type: String,
    spec: Arc<ProcessSpec<I, O>>,
    launcher: Option<Arc<ProcessLauncher>>,
    input: SharedInput,
    results: mpsc::Sender<SlotResult>,
    force_exit: Arc<ForceExit>,
    run_state: watch::Receiver<RunState>,
    grace: Duration,
    process: Option<WorkerProcess>,
    broken: Option<String>,
}

impl<I: Payload, O: Payload> ProcessSlot<I, O> {
    async fn run(mut self) {
        while let Some(item) = next_item(&self.input, &mut self.run_state).await {
            let result = self.process(item.seq, item.payload).await;
            if self.results.send(result).await.is_err() {
                debug!(stage = self.stage_index, slot = self.slot_index, "Results closed; slot stopping");
                break;
            }
        }

        if let Some(process) = self.process.take() {
            process.shutdown(self.grace).await;
        }
    }

    async fn process(&mut self, seq: u64, payload: AnyPayload) -> SlotResult {
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

        match self.call(seq, &input).await {
            Ok((value, elapsed)) => SlotResult::Success {
                seq,
                value: Box::new(value),
                elapsed,
            },
            Err((kind, source)) => SlotResult::Failure {
                seq,
                error: slot_failure(kind, &self.worker_type, self.stage_index, source, *input),
            },
        }
    }

    async fn call(&mut self, seq: u64, input: &I) -> Result<(O, Duration), (FailureKind, BoxError)> {
        let payload = (self.spec.encode)(input)
            .map_err(|e| (FailureKind::Processing, Box::new(ProtocolError::Malformed(e)) as BoxError))?;

        let process = self.ensure_process()?;
        let outcome = match process.call(seq, payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The process is unusable after a protocol failure.
                if let Some(process) = self.process.take() {
                    process.kill().await;
                }
                self.broken = Some(e.to_string());
                return Err((FailureKind::Processing, e.into()));
            }
        };

        match outcome {
            WireOutcome::Success { value, elapsed_secs } => {
                let value = (self.spec.decode)(value)
                    .map_err(|e| (FailureKind::Processing, Box::new(ProtocolError::Malformed(e)) as BoxError))?;
                Ok((value, Duration::from_secs_f64(elapsed_secs.max(0.0))))
            }
            WireOutcome::Failure { kind, detail } => {
                Err((kind, Box::new(RemoteWorkerError::new(kind, detail)) as BoxError))
            }
        }
    }

    fn ensure_process(&mut self) -> Result<&mut WorkerProcess, (FailureKind, BoxError)> {
        if let Some(reason) = &self.broken {
            return Err((FailureKind::Initialization, reason.clone().into()));
        }
        if self.process.is_none() {
            let Some(launcher) = self.launcher.as_deref() else {
                return Err((
                    FailureKind::Initialization,
                    "process stage started without a launcher".into(),
                ));
            };
            let spawned = WorkerProcess::spawn(
                launcher,
                &self.spec.entry,
                &self.spec.args,
                &self.force_exit,
                self.stage_index,
                self.slot_index,
                self.grace,
            );
            match spawned {
                Ok(process) => self.process = Some(process),
                Err(e) => {
                    self.broken = Some(e.to_string());
                    return Err((FailureKind::Initialization, e.into()));
                }
            }
        }
        self.process
            .as_mut()
            .ok_or_else(|| (FailureKind::Initialization, "worker process unavailable".into()))
    }
}

/// A running worker process.
///
/// Dropping it without [`shutdown`](Self::shutdown), as happens when the
/// runtime goes away under an abandoned run, closes stdin so the worker
/// disposes on end of input, and only kills it if it is still running
/// after the grace period.
struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stage_index: usize,
    slot_index: usize,
    grace: Duration,
}

impl WorkerProcess {
    fn spawn(
        launcher: &ProcessLauncher,
        entry: &str,
        args: &serde_json::Value,
        force_exit: &ForceExit,
        stage_index: usize,
        slot_index: usize,
        grace: Duration,
    ) -> Result<Self, ProtocolError> {
        let mut command = Command::new(&launcher.program);
        command
            .args(&launcher.args)
            .env(ENV_WORKER, entry)
            .env(ENV_WORKER_ARGS, args.to_string())
            .env(ENV_STAGE_INDEX, stage_index.to_string())
            .env(ENV_SLOT_INDEX, slot_index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(marker) = force_exit.marker_path() {
            command.env(ENV_FORCE_EXIT_MARKER, marker);
        }

        let spawn_error = |source: std::io::Error| ProtocolError::Spawn {
            program: launcher.program.display().to_string(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_error)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdout was not captured",
            ))
        })?;

        debug!(stage = stage_index, slot = slot_index, pid = ?child.id(), "Worker process started");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stage_index,
            slot_index,
            grace,
        })
    }

    async fn send(&mut self, request: &Request) -> Result<(), ProtocolError> {
        let line = encode_line(request)?;
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker stdin is closed")
        })?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<Response>, ProtocolError> {
        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Ok(None);
            };
            if !line.trim().is_empty() {
                return Ok(Some(decode_response(&line)?));
            }
        }
    }

    async fn call(&mut self, seq: u64, payload: serde_json::Value) -> Result<WireOutcome, ProtocolError> {
        self.send(&Request::Process { seq, payload }).await?;
        match self.receive().await? {
            Some(Response::Result { seq: got, outcome }) if got == seq => Ok(outcome),
            Some(Response::Result { seq: got, .. }) => Err(ProtocolError::OutOfSequence { expected: seq, got }),
            Some(Response::Disposed { .. }) | None => Err(ProtocolError::Closed { seq }),
        }
    }

    /// Asks the worker to dispose and waits for the acknowledgement.
    async fn dispose(&mut self) -> Result<(), ProtocolError> {
        self.send(&Request::Dispose).await?;
        drop(self.stdin.take());
        loop {
            match self.receive().await? {
                Some(Response::Disposed { constructed, error }) => {
                    match error {
                        Some(e) => warn!(
                            stage = self.stage_index,
                            slot = self.slot_index,
                            "Worker process dispose failed: {}",
                            e
                        ),
                        None => debug!(
                            stage = self.stage_index,
                            slot = self.slot_index,
                            constructed,
                            "Worker process disposed"
                        ),
                    }
                    return Ok(());
                }
                Some(Response::Result { .. }) => {}
                None => return Err(ProtocolError::Unacknowledged),
            }
        }
    }

    /// Disposes the worker, then waits for the process to exit, killing it
    /// if it overruns `grace`.
    async fn shutdown(mut self, grace: Duration) {
        let disposed = timeout(grace, self.dispose()).await;
        match disposed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                stage = self.stage_index,
                slot = self.slot_index,
                "Worker process did not acknowledge dispose: {}",
                e
            ),
            Err(_) => warn!(
                stage = self.stage_index,
                slot = self.slot_index,
                "Worker process dispose timed out"
            ),
        }

        let exited = timeout(grace, self.child.wait()).await;
        match exited {
            Ok(Ok(status)) => {
                debug!(stage = self.stage_index, slot = self.slot_index, %status, "Worker process exited");
            }
            Ok(Err(e)) => {
                warn!(stage = self.stage_index, slot = self.slot_index, "Failed to wait for worker process: {}", e);
                self.kill().await;
            }
            Err(_) => self.kill().await,
        }
    }

    /// Terminates the process, retrying once.
    async fn kill(mut self) {
        for attempt in 1..=2 {
            match self.child.kill().await {
                Ok(()) => {
                    debug!(stage = self.stage_index, slot = self.slot_index, "Worker process terminated");
                    return;
                }
                Err(e) => warn!(
                    stage = self.stage_index,
                    slot = self.slot_index,
                    attempt,
                    "Failed to terminate worker process: {}",
                    e
                ),
            }
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let deadline = Instant::now() + self.grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL),
                Ok(None) => {
                    warn!(
                        stage = self.stage_index,
                        slot = self.slot_index,
                        "Abandoned worker process did not exit in time; terminating"
                    );
                    break;
                }
                Err(e) => {
                    warn!(stage = self.stage_index, slot = self.slot_index, "Failed to poll worker process: {}", e);
                    break;
                }
            }
        }
        if let Err(e) = self.child.start_kill() {
            warn!(stage = self.stage_index, slot = self.slot_index, "Failed to terminate worker process: {}", e);
        }
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    fn stage_index(&self) -> usize {
        self.stage_index
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Process
    }

    async fn shutdown(&mut self, grace: Duration) {
        // A slot needs up to two grace periods to dispose and reap its process.
        let budget = grace.max(self.grace).saturating_mul(2) + Duration::from_secs(1);
        for (slot_index, mut slot) in self.slots.drain(..).enumerate() {
            match timeout(budget, &mut slot).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => {
                    warn!(stage = self.stage_index, slot = slot_index, "Process slot failed: {}", e);
                    continue;
                }
                Err(_) => warn!(
                    stage = self.stage_index,
                    slot = slot_index,
                    "Process slot did not stop in time; terminating"
                ),
            }
            slot.abort();
            if timeout(grace, &mut slot).await.is_err() {
                warn!(stage = self.stage_index, slot = slot_index, "Process slot could not be joined");
            }
        }
    }

    fn abort(&mut self) {
        for slot in self.slots.drain(..) {
            slot.abort();
        }
    }
}
