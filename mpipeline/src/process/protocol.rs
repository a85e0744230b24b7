//! Wire protocol between a process slot and its worker process.
//!
//! Messages are JSON objects, one per line. The parent writes requests to the
//! worker's stdin and reads responses from its stdout; stderr is left to the
//! worker's logging.

use crate::errors::{FailureKind, ProtocolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Name of the worker to host.
pub const ENV_WORKER: &str = "MPIPELINE_WORKER";
/// JSON arguments for the worker factory.
pub const ENV_WORKER_ARGS: &str = "MPIPELINE_WORKER_ARGS";
/// Path of the run's force-exit marker.
pub const ENV_FORCE_EXIT_MARKER: &str = "MPIPELINE_FORCE_EXIT_MARKER";
/// Index of the stage the process belongs to.
pub const ENV_STAGE_INDEX: &str = "MPIPELINE_STAGE_INDEX";
/// Index of the slot within its stage.
pub const ENV_SLOT_INDEX: &str = "MPIPELINE_SLOT_INDEX";

/// Parent → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Process one item.
    Process {
        /// Ingestion sequence number.
        seq: u64,
        /// The item.
        payload: Value,
    },
    /// Dispose the worker and exit.
    Dispose,
}

/// Worker → parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Outcome of a `Process` request.
    Result {
        /// Sequence number of the request.
        seq: u64,
        /// What happened.
        outcome: WireOutcome,
    },
    /// Sent once, after the worker was disposed.
    Disposed {
        /// Whether a worker had been constructed.
        constructed: bool,
        /// Disposal failure, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Tagged result of one worker call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireOutcome {
    /// The worker produced a value.
    Success {
        /// The output.
        value: Value,
        /// Time spent in `process`, in seconds.
        elapsed_secs: f64,
    },
    /// The worker failed.
    Failure {
        /// Lifecycle phase of the failure.
        kind: FailureKind,
        /// Rendered error chain.
        detail: String,
    },
}

impl WireOutcome {
    /// Creates a success outcome.
    #[must_use]
    pub fn success(value: Value, elapsed: Duration) -> Self {
        Self::Success {
            value,
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }

    /// Creates a failure outcome.
    pub fn failure(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            detail: detail.into(),
        }
    }
}

/// Serializes a message as one line, including the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}

const STRAY_LINE_LIMIT: usize = 80;

/// Parses one line from a worker's stdout, reporting anything that is not a
/// protocol message as stray output.
pub(crate) fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    decode_line(line).map_err(|source| ProtocolError::StrayOutput {
        line: line.trim_end().chars().take(STRAY_LINE_LIMIT).collect(),
        source,
    })
}

/// Renders an error and its sources as `outer: inner: root`.
pub fn render_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let line = encode_line(&Request::Process {
            seq: 4,
            payload: json!([1, 2]),
        })
        .unwrap();

        assert_eq!(line, "{\"type\":\"process\",\"seq\":4,\"payload\":[1,2]}\n");
        assert_eq!(encode_line(&Request::Dispose).unwrap(), "{\"type\":\"dispose\"}\n");
    }

    #[test]
    fn test_response_round_trip() {
        let response = Response::Result {
            seq: 9,
            outcome: WireOutcome::failure(FailureKind::Processing, "boom"),
        };
        let parsed: Response = decode_line(&encode_line(&response).unwrap()).unwrap();
        assert_eq!(parsed, response);
    }

    #[test]
    fn test_success_outcome_format() {
        let value = serde_json::to_value(WireOutcome::success(json!("x"), Duration::from_millis(1500))).unwrap();
        assert_eq!(value, json!({"status": "success", "value": "x", "elapsed_secs": 1.5}));
    }

    #[test]
    fn test_disposed_omits_missing_error() {
        let line = encode_line(&Response::Disposed {
            constructed: false,
            error: None,
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"disposed\",\"constructed\":false}\n");
    }

    #[test]
    fn test_printed_line_is_stray_output() {
        let err = decode_response("loading model weights...\n").unwrap_err();
        match &err {
            ProtocolError::StrayOutput { line, .. } => assert_eq!(line, "loading model weights..."),
            other => panic!("expected stray output, got {other:?}"),
        }
        assert!(err.to_string().contains("must log to stderr"));

        let long = "x".repeat(500);
        match decode_response(&long).unwrap_err() {
            ProtocolError::StrayOutput { line, .. } => assert_eq!(line.len(), STRAY_LINE_LIMIT),
            other => panic!("expected stray output, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_accepts_protocol_lines() {
        let line = encode_line(&Response::Disposed {
            constructed: true,
            error: None,
        })
        .unwrap();
        assert_eq!(
            decode_response(&line).unwrap(),
            Response::Disposed {
                constructed: true,
                error: None
            }
        );
    }

    #[test]
    fn test_render_chain() {
        let err = anyhow::anyhow!("disk full").context("cannot write output");
        let boxed: Box<dyn std::error::Error + Send + Sync> = err.into();
        assert_eq!(render_chain(boxed.as_ref()), "cannot write output: disk full");
    }
}
