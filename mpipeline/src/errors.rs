//! Error types for the pipeline executor.
//!
//! Every failure a run can end with is a [`PipelineError`]. Worker failures
//! keep the original error as their `source`, together with the failing
//! worker's type name, the stage it ran in and the input it was processing.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error used as the source of wrapped worker failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline or one of its stages is misconfigured.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A worker failed during construction, initialization or processing.
    #[error("{0}")]
    Worker(#[from] WorkerError),

    /// The engine itself failed while driving the stages.
    #[error("Pipeline runtime error: {0}")]
    Runtime(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Creates a runtime error.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Returns the wrapped worker error, if this is a worker failure.
    #[must_use]
    pub fn worker_error(&self) -> Option<&WorkerError> {
        match self {
            Self::Worker(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true for configuration errors.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is the forced-shutdown sentinel.
    #[must_use]
    pub fn is_forced_shutdown(&self) -> bool {
        self.worker_error().is_some_and(WorkerError::is_forced_shutdown)
    }
}

/// Error raised when a pipeline or stage fails validation.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// Index of the offending stage, if any.
    pub stage_index: Option<usize>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stage_index: None,
            fix_hint: None,
        }
    }

    /// Sets the stage index.
    #[must_use]
    pub fn with_stage(mut self, index: usize) -> Self {
        self.stage_index = Some(index);
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        if let Some(index) = self.stage_index {
            map.insert("stage_index".to_string(), serde_json::json!(index));
        }
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        serde_json::Value::Object(map)
    }
}

/// Where in a worker's lifecycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Construction or `local_init` failed.
    Initialization,
    /// `process` failed on a specific item.
    Processing,
    /// The slot saw the force-exit signal before starting the item.
    ForcedShutdown,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialization => "initialization",
            Self::Processing => "processing",
            Self::ForcedShutdown => "forced_shutdown",
        };
        f.write_str(s)
    }
}

/// Sentinel error raised by slots that observed the force-exit signal.
#[derive(Debug, Clone, Copy, Default, Error)]
#[error("Force exit signal received")]
pub struct ForcedShutdown;

/// A failure reported by a worker running in another process.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteWorkerError {
    /// The failure kind reported by the worker process.
    pub kind: FailureKind,
    /// The rendered error chain from the worker process.
    pub message: String,
}

impl RemoteWorkerError {
    /// Creates a new remote worker error.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Breakage of the line protocol between a process slot and its child.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The child process could not be started.
    #[error("failed to start worker process '{program}': {source}")]
    Spawn {
        /// Program that was executed.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The child closed its output before answering.
    #[error("worker process exited before answering item {seq}")]
    Closed {
        /// Sequence number of the unanswered item.
        seq: u64,
    },

    /// The child exited without acknowledging `Dispose`.
    #[error("worker process exited without acknowledging dispose")]
    Unacknowledged,

    /// The child wrote something that is not a protocol message.
    #[error("malformed message from worker process: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The child wrote a line to stdout that is not a protocol message,
    /// usually a worker printing instead of logging to stderr.
    #[error("worker process wrote a non-protocol line to stdout ({line:?}); workers must log to stderr: {source}")]
    StrayOutput {
        /// The offending line, shortened.
        line: String,
        /// Why it failed to parse.
        #[source]
        source: serde_json::Error,
    },

    /// The child answered a different item than the one in flight.
    #[error("worker process answered item {got} while item {expected} was in flight")]
    OutOfSequence {
        /// Sequence number that was sent.
        expected: u64,
        /// Sequence number that came back.
        got: u64,
    },

    /// Reading from or writing to the child failed.
    #[error("worker process pipe failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The input a worker was processing when it failed.
#[derive(Clone)]
pub struct OffendingInput {
    rendered: String,
    value: Arc<dyn Any + Send + Sync>,
}

impl OffendingInput {
    /// Captures an input value.
    pub fn new<T: Any + Send + Sync + fmt::Debug>(value: T) -> Self {
        Self {
            rendered: format!("{value:?}"),
            value: Arc::new(value),
        }
    }

    /// Returns the input as `T` if it has that type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Returns the `Debug` rendering of the input.
    #[must_use]
    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Debug for OffendingInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

/// A worker failure, annotated with where it happened.
#[derive(Debug, Error)]
pub struct WorkerError {
    kind: FailureKind,
    worker_type: String,
    stage_index: usize,
    #[source]
    source: BoxError,
    input: Option<OffendingInput>,
}

impl WorkerError {
    /// Creates a new worker error.
    pub fn new(
        kind: FailureKind,
        worker_type: impl Into<String>,
        stage_index: usize,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            kind,
            worker_type: worker_type.into(),
            stage_index,
            source: source.into(),
            input: None,
        }
    }

    /// Creates an initialization failure. These never carry an input.
    pub fn initialization(
        worker_type: impl Into<String>,
        stage_index: usize,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::new(FailureKind::Initialization, worker_type, stage_index, source)
    }

    /// Creates a processing failure for `input`.
    pub fn processing(
        worker_type: impl Into<String>,
        stage_index: usize,
        source: impl Into<BoxError>,
        input: OffendingInput,
    ) -> Self {
        Self::new(FailureKind::Processing, worker_type, stage_index, source).with_input(input)
    }

    /// Creates the forced-shutdown sentinel.
    pub fn forced_shutdown(worker_type: impl Into<String>, stage_index: usize) -> Self {
        Self::new(
            FailureKind::ForcedShutdown,
            worker_type,
            stage_index,
            ForcedShutdown,
        )
    }

    /// Attaches the offending input.
    #[must_use]
    pub fn with_input(mut self, input: OffendingInput) -> Self {
        self.input = Some(input);
        self
    }

    /// Returns the failure kind.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// Returns the failing worker's declared type name.
    #[must_use]
    pub fn worker_type(&self) -> &str {
        &self.worker_type
    }

    /// Returns the index of the stage the worker belongs to.
    #[must_use]
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Returns the original error.
    #[must_use]
    pub fn original(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Returns the offending input, if the failure happened on an item.
    #[must_use]
    pub fn input(&self) -> Option<&OffendingInput> {
        self.input.as_ref()
    }

    /// Returns the offending input as `T`.
    #[must_use]
    pub fn input_as<T: Any>(&self) -> Option<&T> {
        self.input.as_ref().and_then(OffendingInput::downcast_ref)
    }

    /// Returns true if this is the forced-shutdown sentinel.
    #[must_use]
    pub fn is_forced_shutdown(&self) -> bool {
        self.kind == FailureKind::ForcedShutdown
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "worker_type": self.worker_type,
            "stage_index": self.stage_index,
            "error": self.source.to_string(),
            "input": self.input.as_ref().map(OffendingInput::rendered),
        })
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Worker {} (stage {}) failed during {}",
            self.worker_type, self.stage_index, self.kind
        )?;
        if let Some(ref input) = self.input {
            write!(f, " on input {}", input.rendered())?;
        }
        write!(f, ": {}", self.source)
    }
}
