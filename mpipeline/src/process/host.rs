//! The worker side of a process slot.

use super::protocol::{
    decode_line, encode_line, render_chain, Request, Response, WireOutcome, ENV_FORCE_EXIT_MARKER,
    ENV_SLOT_INDEX, ENV_STAGE_INDEX, ENV_WORKER, ENV_WORKER_ARGS,
};
use crate::cancellation::ForceExitProbe;
use crate::errors::{FailureKind, ForcedShutdown};
use crate::worker::{DisposeOutcome, DynJsonWorker, LazyWorker, SlotOutcome, WorkerFactory, WorkerRegistry};
use anyhow::Context;
use serde_json::Value;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Settings a worker process receives from its parent.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Registered worker name.
    pub worker: String,
    /// Factory arguments.
    pub args: Value,
    /// Read side of the run's force-exit signal.
    pub probe: ForceExitProbe,
    /// Stage index, for logging.
    pub stage_index: Option<usize>,
    /// Slot index, for logging.
    pub slot_index: Option<usize>,
}

impl HostConfig {
    /// Reads the settings from the environment.
    ///
    /// Returns `Ok(None)` when this process was not started as a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker arguments are not valid JSON.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let Ok(worker) = std::env::var(ENV_WORKER) else {
            return Ok(None);
        };
        let args = match std::env::var(ENV_WORKER_ARGS) {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("{ENV_WORKER_ARGS} is not valid JSON"))?,
            Err(_) => Value::Null,
        };
        let probe = std::env::var_os(ENV_FORCE_EXIT_MARKER)
            .map_or_else(ForceExitProbe::detached, ForceExitProbe::new);
        let index = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());

        Ok(Some(Self {
            worker,
            args,
            probe,
            stage_index: index(ENV_STAGE_INDEX),
            slot_index: index(ENV_SLOT_INDEX),
        }))
    }
}

/// Serves worker requests if this process was started as a worker.
///
/// Call this at the top of `main` in any binary used as a worker host.
/// Returns `Ok(true)` after serving, in which case `main` should return
/// immediately, and `Ok(false)` when the process is not a worker.
///
/// Stdout carries the protocol while serving. Hosted workers must log to
/// stderr and never print to stdout: a stray line reaches the parent as a
/// malformed message and fails the item in flight.
///
/// # Errors
///
/// Returns an error if the environment is malformed or the parent stops
/// speaking the protocol.
pub fn serve_if_worker_process(registry: &WorkerRegistry) -> anyhow::Result<bool> {
    let Some(config) = HostConfig::from_env()? else {
        return Ok(false);
    };
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(registry, &config, stdin.lock(), stdout.lock())?;
    Ok(true)
}

/// Runs the request loop until `Dispose` or end of input.
///
/// The worker is constructed on the first `Process` request and disposed
/// exactly once on the way out, whatever ended the loop.
///
/// # Errors
///
/// Returns an error on unreadable input or a closed output.
pub fn serve<R: BufRead, W: Write>(
    registry: &WorkerRegistry,
    config: &HostConfig,
    reader: R,
    mut writer: W,
) -> anyhow::Result<()> {
    debug!(
        worker = %config.worker,
        stage = ?config.stage_index,
        slot = ?config.slot_index,
        "Worker process started"
    );
    let mut worker = LazyWorker::new(resolve_factory(registry, config));

    let served = serve_requests(&mut worker, &config.probe, reader, &mut writer);

    let (constructed, error) = match worker.dispose() {
        DisposeOutcome::NotConstructed => (false, None),
        DisposeOutcome::Disposed => (true, None),
        DisposeOutcome::Failed(e) => {
            warn!(worker = %config.worker, "Worker disposal failed: {}", e);
            (true, Some(e))
        }
    };
    let acknowledged = encode_line(&Response::Disposed { constructed, error })
        .map_err(anyhow::Error::from)
        .and_then(|line| {
            writer.write_all(line.as_bytes())?;
            writer.flush()?;
            Ok(())
        });

    served?;
    acknowledged?;
    info!(worker = %config.worker, "Worker process finished");
    Ok(())
}

fn resolve_factory(registry: &WorkerRegistry, config: &HostConfig) -> WorkerFactory<DynJsonWorker> {
    if let Some(factory) = registry.factory(&config.worker, config.args.clone()) {
        return factory;
    }
    let message = format!(
        "no worker registered as '{}' (known: {})",
        config.worker,
        registry.names().join(", ")
    );
    Arc::new(move || -> anyhow::Result<DynJsonWorker> { Err(anyhow::anyhow!(message.clone())) })
}

fn serve_requests<R: BufRead, W: Write>(
    worker: &mut LazyWorker<DynJsonWorker>,
    probe: &ForceExitProbe,
    reader: R,
    writer: &mut W,
) -> anyhow::Result<()> {
    for line in reader.lines() {
        let line = line.context("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = decode_line(&line).context("malformed request")?;
        let (seq, payload) = match request {
            Request::Process { seq, payload } => (seq, payload),
            Request::Dispose => break,
        };

        let outcome = if probe.is_set() {
            WireOutcome::failure(FailureKind::ForcedShutdown, ForcedShutdown.to_string())
        } else {
            match worker.process(&payload) {
                SlotOutcome::Success { value, elapsed } => WireOutcome::success(value, elapsed),
                SlotOutcome::Failure { kind, error } => {
                    WireOutcome::failure(kind, render_chain(error.as_ref()))
                }
            }
        };

        let line = encode_line(&Response::Result { seq, outcome })?;
        writer.write_all(line.as_bytes()).context("parent closed the result pipe")?;
        writer.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::ForceExit;
    use crate::worker::Worker;
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DISPOSED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct AddN {
        n: i64,
    }

    impl Worker for AddN {
        type Input = i64;
        type Output = i64;

        fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
            if *input == 99 {
                anyhow::bail!("refusing 99");
            }
            Ok(input + self.n)
        }

        fn dispose(&mut self) -> anyhow::Result<()> {
            DISPOSED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new().register("add", |args: &Value| {
            Ok(AddN {
                n: args["n"].as_i64().unwrap_or(0),
            })
        })
    }

    fn config(worker: &str, probe: ForceExitProbe) -> HostConfig {
        HostConfig {
            worker: worker.to_string(),
            args: json!({"n": 10}),
            probe,
            stage_index: Some(0),
            slot_index: Some(0),
        }
    }

    fn requests(items: &[Request]) -> Cursor<Vec<u8>> {
        let text: String = items.iter().map(|r| encode_line(r).unwrap()).collect();
        Cursor::new(text.into_bytes())
    }

    fn responses(output: &[u8]) -> Vec<Response> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|l| decode_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_serves_items_then_disposes() {
        let before = DISPOSED.load(Ordering::SeqCst);
        let input = requests(&[
            Request::Process { seq: 0, payload: json!(1) },
            Request::Process { seq: 1, payload: json!(99) },
            Request::Dispose,
        ]);
        let mut output = Vec::new();

        serve(&registry(), &config("add", ForceExitProbe::detached()), input, &mut output).unwrap();

        let responses = responses(&output);
        assert_eq!(responses.len(), 3);
        match &responses[0] {
            Response::Result { seq: 0, outcome: WireOutcome::Success { value, .. } } => {
                assert_eq!(value, &json!(11));
            }
            other => panic!("unexpected response {other:?}"),
        }
        match &responses[1] {
            Response::Result { seq: 1, outcome: WireOutcome::Failure { kind, detail } } => {
                assert_eq!(*kind, FailureKind::Processing);
                assert_eq!(detail, "refusing 99");
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(
            responses[2],
            Response::Disposed { constructed: true, error: None }
        );
        assert!(DISPOSED.load(Ordering::SeqCst) > before);
    }

    #[test]
    fn test_end_of_input_without_items() {
        let mut output = Vec::new();
        serve(
            &registry(),
            &config("add", ForceExitProbe::detached()),
            Cursor::new(Vec::new()),
            &mut output,
        )
        .unwrap();

        assert_eq!(
            responses(&output),
            vec![Response::Disposed { constructed: false, error: None }]
        );
    }

    #[test]
    fn test_unknown_worker_fails_initialization() {
        let input = requests(&[Request::Process { seq: 3, payload: json!(1) }]);
        let mut output = Vec::new();
        serve(&registry(), &config("missing", ForceExitProbe::detached()), input, &mut output).unwrap();

        match &responses(&output)[0] {
            Response::Result { outcome: WireOutcome::Failure { kind, detail }, .. } => {
                assert_eq!(*kind, FailureKind::Initialization);
                assert!(detail.contains("no worker registered as 'missing'"));
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_force_exit_marker_stops_processing() {
        let signal = ForceExit::with_process_marker().unwrap();
        signal.trip("stage 1 failed");
        let probe = ForceExitProbe::new(signal.marker_path().unwrap());

        let input = requests(&[Request::Process { seq: 0, payload: json!(1) }]);
        let mut output = Vec::new();
        serve(&registry(), &config("add", probe), input, &mut output).unwrap();

        let responses = responses(&output);
        match &responses[0] {
            Response::Result { outcome: WireOutcome::Failure { kind, .. }, .. } => {
                assert_eq!(*kind, FailureKind::ForcedShutdown);
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(
            responses[1],
            Response::Disposed { constructed: false, error: None }
        );
    }

    #[test]
    fn test_malformed_request_still_disposes() {
        let mut output = Vec::new();
        let result = serve(
            &registry(),
            &config("add", ForceExitProbe::detached()),
            Cursor::new(b"not json\n".to_vec()),
            &mut output,
        );

        assert!(result.is_err());
        assert!(matches!(responses(&output).last(), Some(Response::Disposed { .. })));
    }
}
