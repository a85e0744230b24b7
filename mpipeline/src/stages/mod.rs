//! Stage descriptors.
//!
//! A stage is pure data: how to build its workers, whether its slots are
//! threads or processes, and how many slots to run.

mod launcher;

pub use launcher::{ProcessLauncher, StartMethod};

use crate::errors::ConfigurationError;
use crate::worker::{short_type_name, BoxedWorker, FnWorker, Payload, Worker, WorkerFactory};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Slot constructor of a thread stage.
pub(crate) type ThreadFactory<I, O> = WorkerFactory<BoxedWorker<I, O>>;

/// How a stage runs its slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// OS threads sharing the host process's memory.
    #[default]
    Thread,
    /// OS processes with isolated memory.
    Process,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

/// Static summary of a stage, for introspection and logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Position of the stage in the pipeline.
    pub index: usize,
    /// Declared worker type name.
    pub worker_type: String,
    /// Slot kind.
    pub mode: ExecutionMode,
    /// Number of slots.
    pub worker_count: usize,
}

pub(crate) type Encode<I> = fn(&I) -> serde_json::Result<Value>;
pub(crate) type Decode<O> = fn(Value) -> serde_json::Result<O>;

/// How a process stage reaches its worker.
pub(crate) struct ProcessSpec<I, O> {
    pub(crate) entry: String,
    pub(crate) args: Value,
    pub(crate) start: StartMethod,
    pub(crate) encode: Encode<I>,
    pub(crate) decode: Decode<O>,
}

impl<I, O> Clone for ProcessSpec<I, O> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            args: self.args.clone(),
            start: self.start.clone(),
            encode: self.encode,
            decode: self.decode,
        }
    }
}

pub(crate) enum StageKind<I: Payload, O: Payload> {
    Thread(ThreadFactory<I, O>),
    Process(ProcessSpec<I, O>),
}

impl<I: Payload, O: Payload> Clone for StageKind<I, O> {
    fn clone(&self) -> Self {
        match self {
            Self::Thread(factory) => Self::Thread(factory.clone()),
            Self::Process(spec) => Self::Process(spec.clone()),
        }
    }
}

/// One step of a pipeline, consuming `I` and producing `O`.
pub struct Stage<I: Payload, O: Payload> {
    pub(crate) worker_type: String,
    pub(crate) worker_count: usize,
    pub(crate) kind: StageKind<I, O>,
}

impl<I: Payload, O: Payload> Stage<I, O> {
    /// Creates a thread stage. Each slot calls `factory` once, lazily.
    pub fn thread<W, F>(worker_count: usize, factory: F) -> Self
    where
        W: Worker<Input = I, Output = O>,
        F: Fn() -> anyhow::Result<W> + Send + Sync + 'static,
    {
        let erased: ThreadFactory<I, O> = Arc::new(move || -> anyhow::Result<BoxedWorker<I, O>> {
            let worker = factory()?;
            Ok(Box::new(worker) as BoxedWorker<I, O>)
        });
        Self {
            worker_type: short_type_name::<W>(),
            worker_count,
            kind: StageKind::Thread(erased),
        }
    }

    /// Creates a thread stage from a plain function.
    pub fn thread_fn<F>(worker_count: usize, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&I) -> anyhow::Result<O> + Clone + Send + Sync + 'static,
    {
        let mut stage = Self::thread(worker_count, move || Ok(FnWorker::<I, O, F>::new(func.clone())));
        stage.worker_type = name.into();
        stage
    }

    /// Overrides the declared worker type name.
    #[must_use]
    pub fn with_worker_type(mut self, name: impl Into<String>) -> Self {
        self.worker_type = name.into();
        self
    }

    /// Returns the declared worker type name.
    #[must_use]
    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    /// Returns the number of slots.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Returns the slot kind.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        match self.kind {
            StageKind::Thread(_) => ExecutionMode::Thread,
            StageKind::Process(_) => ExecutionMode::Process,
        }
    }

    /// Returns the start method of a process stage.
    #[must_use]
    pub fn start_method(&self) -> Option<&StartMethod> {
        match &self.kind {
            StageKind::Process(spec) => Some(&spec.start),
            StageKind::Thread(_) => None,
        }
    }

    /// Returns a summary of this stage at `index`.
    #[must_use]
    pub fn descriptor(&self, index: usize) -> StageDescriptor {
        StageDescriptor {
            index,
            worker_type: self.worker_type.clone(),
            mode: self.mode(),
            worker_count: self.worker_count,
        }
    }

    /// Validates the stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker count is zero or a process stage has
    /// no worker name.
    pub fn validate(&self, index: usize) -> Result<(), ConfigurationError> {
        if self.worker_count == 0 {
            return Err(ConfigurationError::new(format!(
                "Stage {} ({}) must have a positive worker count",
                index, self.worker_type
            ))
            .with_stage(index)
            .with_fix_hint("Use at least one worker per stage."));
        }
        if let StageKind::Process(spec) = &self.kind {
            if spec.entry.trim().is_empty() {
                return Err(ConfigurationError::new(format!(
                    "Process stage {index} has an empty worker name"
                ))
                .with_stage(index)
                .with_fix_hint("Name the worker as it is registered in the worker host."));
            }
        }
        Ok(())
    }
}

impl<I, O> Stage<I, O>
where
    I: Payload + Serialize,
    O: Payload + DeserializeOwned,
{
    /// Creates a process stage running the worker registered as `entry`.
    ///
    /// The worker process must register `entry` in its
    /// [`WorkerRegistry`](crate::worker::WorkerRegistry).
    pub fn process(entry: impl Into<String>, worker_count: usize) -> Self {
        let entry = entry.into();
        Self {
            worker_type: entry.clone(),
            worker_count,
            kind: StageKind::Process(ProcessSpec {
                entry,
                args: Value::Null,
                start: StartMethod::default(),
                encode: |input| serde_json::to_value(input),
                decode: serde_json::from_value,
            }),
        }
    }

    /// Creates a process stage for `W`, registered under its type name.
    pub fn process_worker<W>(worker_count: usize) -> Self
    where
        W: Worker<Input = I, Output = O>,
    {
        Self::process(short_type_name::<W>(), worker_count)
    }

    /// Sets the JSON arguments passed to the worker factory.
    #[must_use]
    pub fn with_args(mut self, args: Value) -> Self {
        if let StageKind::Process(spec) = &mut self.kind {
            spec.args = args;
        }
        self
    }

    /// Sets how worker processes are started.
    #[must_use]
    pub fn with_start_method(mut self, start: StartMethod) -> Self {
        if let StageKind::Process(spec) = &mut self.kind {
            spec.start = start;
        }
        self
    }
}

impl<I: Payload, O: Payload> Clone for Stage<I, O> {
    fn clone(&self) -> Self {
        Self {
            worker_type: self.worker_type.clone(),
            worker_count: self.worker_count,
            kind: self.kind.clone(),
        }
    }
}

impl<I: Payload, O: Payload> fmt::Debug for Stage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("worker_type", &self.worker_type)
            .field("mode", &self.mode())
            .field("worker_count", &self.worker_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Doubler;

    impl Worker for Doubler {
        type Input = i64;
        type Output = i64;

        fn process(&mut self, input: &i64) -> anyhow::Result<i64> {
            Ok(input * 2)
        }
    }

    #[test]
    fn test_thread_stage_descriptor() {
        let stage = Stage::thread(4, || Ok(Doubler));
        let descriptor = stage.descriptor(0);

        assert_eq!(descriptor.worker_type, "Doubler");
        assert_eq!(descriptor.mode, ExecutionMode::Thread);
        assert_eq!(descriptor.worker_count, 4);
        assert!(stage.start_method().is_none());
    }

    #[test]
    fn test_thread_fn_stage_uses_given_name() {
        let stage: Stage<i64, String> = Stage::thread_fn(2, "ToText", |x: &i64| Ok(x.to_string()));
        assert_eq!(stage.worker_type(), "ToText");
        assert!(stage.validate(0).is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let stage = Stage::thread(0, || Ok(Doubler));
        let err = stage.validate(3).unwrap_err();

        assert_eq!(err.stage_index, Some(3));
        assert!(err.message.contains("positive worker count"));
    }

    #[test]
    fn test_process_stage_defaults() {
        let stage = Stage::<i64, i64>::process_worker::<Doubler>(2)
            .with_args(serde_json::json!({"factor": 2}));

        assert_eq!(stage.mode(), ExecutionMode::Process);
        assert_eq!(stage.worker_type(), "Doubler");
        assert_eq!(stage.start_method(), Some(&StartMethod::CurrentExe));
        assert!(stage.validate(1).is_ok());
    }

    #[test]
    fn test_process_stage_empty_name_rejected() {
        let stage = Stage::<i64, i64>::process("  ", 1);
        assert!(stage.validate(0).is_err());
    }
}
