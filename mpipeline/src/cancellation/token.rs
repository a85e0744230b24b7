//! Run-scoped force-exit signal shared by threads and worker processes.

use parking_lot::RwLock;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;
use tracing::{debug, warn};

/// File name of the marker that tells worker processes to stop.
const MARKER_FILE: &str = "force-exit";

/// A cooperative stop signal for one pipeline run.
///
/// Tripping is idempotent: only the first reason is kept and the flag never
/// resets. Thread slots read the atomic flag directly. When the run has
/// process stages, tripping also creates a marker file that worker
/// processes poll through a [`ForceExitProbe`].
pub struct ForceExit {
    tripped: AtomicBool,
    reason: RwLock<Option<String>>,
    marker_dir: Option<TempDir>,
}

impl ForceExit {
    /// Creates a signal visible to threads only.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tripped: AtomicBool::new(false),
            reason: RwLock::new(None),
            marker_dir: None,
        }
    }

    /// Creates a signal that is also visible to worker processes.
    pub fn with_process_marker() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("mpipeline-run-").tempdir()?;
        debug!(path = %dir.path().display(), "Created force-exit marker directory");
        Ok(Self {
            marker_dir: Some(dir),
            ..Self::new()
        })
    }

    /// Sets the signal. Returns true if this call was the one that set it.
    pub fn trip(&self, reason: impl Into<String>) -> bool {
        if self
            .tripped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let reason = reason.into();
        debug!(reason = %reason, "Force exit tripped");
        *self.reason.write() = Some(reason);

        if let Some(path) = self.marker_path() {
            if let Err(e) = std::fs::write(&path, b"1") {
                warn!(path = %path.display(), "Failed to write force-exit marker: {}", e);
            }
        }
        true
    }

    /// Returns whether the signal is set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    /// Returns the reason given by the first `trip`, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Returns the marker path worker processes should poll.
    #[must_use]
    pub fn marker_path(&self) -> Option<PathBuf> {
        self.marker_dir.as_ref().map(|dir| dir.path().join(MARKER_FILE))
    }
}

impl Default for ForceExit {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ForceExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForceExit")
            .field("set", &self.is_set())
            .field("reason", &self.reason())
            .field("marker", &self.marker_path())
            .finish()
    }
}

/// Read side of [`ForceExit`] inside a worker process.
#[derive(Debug, Clone)]
pub struct ForceExitProbe {
    marker: Option<PathBuf>,
}

impl ForceExitProbe {
    /// Creates a probe for the given marker path.
    pub fn new(marker: impl Into<PathBuf>) -> Self {
        Self {
            marker: Some(marker.into()),
        }
    }

    /// Creates a probe that never reports the signal as set.
    #[must_use]
    pub fn detached() -> Self {
        Self { marker: None }
    }

    /// Returns the marker path, if any.
    #[must_use]
    pub fn marker(&self) -> Option<&Path> {
        self.marker.as_deref()
    }

    /// Returns whether the parent has tripped the signal.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.marker.as_deref().is_some_and(Path::exists)
    }
}
