//! How process stages start their worker processes.

use crate::errors::ConfigurationError;
use crate::process::protocol::ENV_WORKER;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Strategy for starting worker processes.
///
/// There is no fork-style strategy: forking a multi-threaded process is
/// unsound without `unsafe`, so every worker process starts from a fresh
/// executable image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StartMethod {
    /// Re-execute the running binary. Its `main` must call
    /// [`serve_if_worker_process`](crate::process::serve_if_worker_process)
    /// before doing anything else.
    #[default]
    CurrentExe,
    /// Execute a dedicated worker-host binary.
    Program {
        /// Path to the executable.
        path: PathBuf,
        /// Extra command-line arguments.
        #[serde(default)]
        args: Vec<String>,
    },
}

impl StartMethod {
    /// Starts workers with the executable at `path`.
    pub fn program(path: impl Into<PathBuf>) -> Self {
        Self::Program {
            path: path.into(),
            args: Vec::new(),
        }
    }

    /// Resolves the strategy to a concrete launcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable cannot be located, or if this
    /// process is itself a worker and would re-execute itself.
    pub fn resolve(&self, stage_index: usize) -> Result<ProcessLauncher, ConfigurationError> {
        self.resolve_in(stage_index, std::env::var_os(ENV_WORKER).is_some())
    }

    fn resolve_in(
        &self,
        stage_index: usize,
        inside_worker: bool,
    ) -> Result<ProcessLauncher, ConfigurationError> {
        match self {
            Self::CurrentExe => {
                if inside_worker {
                    return Err(ConfigurationError::new(format!(
                        "Stage {stage_index} would re-execute a worker process ({ENV_WORKER} is set)"
                    ))
                    .with_stage(stage_index)
                    .with_fix_hint(
                        "Call serve_if_worker_process at the very top of main, or use StartMethod::Program.",
                    ));
                }
                let program = std::env::current_exe().map_err(|e| {
                    ConfigurationError::new(format!(
                        "Cannot locate the current executable for stage {stage_index}: {e}"
                    ))
                    .with_stage(stage_index)
                })?;
                Ok(ProcessLauncher {
                    program,
                    args: Vec::new(),
                })
            }
            Self::Program { path, args } => {
                if !path.is_file() {
                    return Err(ConfigurationError::new(format!(
                        "Worker program '{}' for stage {} does not exist",
                        path.display(),
                        stage_index
                    ))
                    .with_stage(stage_index)
                    .with_fix_hint("Point StartMethod::Program at a built worker-host binary."));
                }
                Ok(ProcessLauncher {
                    program: path.clone(),
                    args: args.clone(),
                })
            }
        }
    }
}

/// A resolved start strategy: the program and arguments for every slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLauncher {
    /// Executable to run.
    pub program: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_exe_resolves() {
        let launcher = StartMethod::CurrentExe.resolve_in(0, false).unwrap();
        assert!(launcher.program.exists());
        assert!(launcher.args.is_empty());
    }

    #[test]
    fn test_current_exe_refused_inside_worker() {
        let err = StartMethod::CurrentExe.resolve_in(1, true).unwrap_err();
        assert_eq!(err.stage_index, Some(1));
        assert!(err.message.contains("re-execute"));
        assert!(err.fix_hint.unwrap().contains("serve_if_worker_process"));
    }

    #[test]
    fn test_program_allowed_inside_worker() {
        let exe = std::env::current_exe().unwrap();
        let launcher = StartMethod::program(&exe).resolve_in(0, true).unwrap();
        assert_eq!(launcher.program, exe);
    }

    #[test]
    fn test_missing_program_rejected() {
        let err = StartMethod::program("/definitely/not/here/worker")
            .resolve(2)
            .unwrap_err();
        assert_eq!(err.stage_index, Some(2));
        assert!(err.message.contains("does not exist"));
    }

    #[test]
    fn test_start_method_serde() {
        let method: StartMethod =
            serde_json::from_str(r#"{"kind": "program", "path": "/bin/worker"}"#).unwrap();
        assert_eq!(method, StartMethod::program("/bin/worker"));

        let json = serde_json::to_value(StartMethod::CurrentExe).unwrap();
        assert_eq!(json["kind"], "current_exe");
    }
}
