//! Run configuration.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable overriding [`RunOptions::ordered`].
pub const ENV_ORDERED: &str = "MPIPELINE_ORDERED";
/// Environment variable overriding [`RunOptions::progress`].
pub const ENV_PROGRESS: &str = "MPIPELINE_PROGRESS";
/// Environment variable overriding [`RunOptions::channel_capacity`].
pub const ENV_CHANNEL_CAPACITY: &str = "MPIPELINE_CHANNEL_CAPACITY";
/// Environment variable overriding [`RunOptions::shutdown_grace_ms`].
pub const ENV_SHUTDOWN_GRACE_MS: &str = "MPIPELINE_SHUTDOWN_GRACE_MS";

/// Which progress bars a run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// No progress reporting.
    #[default]
    None,
    /// One bar for items leaving the last stage.
    Total,
    /// One bar per stage plus the total.
    Stage,
}

impl fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Total => write!(f, "total"),
            Self::Stage => write!(f, "stage"),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "total" => Ok(Self::Total),
            "stage" => Ok(Self::Stage),
            other => Err(ConfigurationError::new(format!("Unknown progress mode '{other}'"))
                .with_fix_hint("Use one of: none, total, stage.")),
        }
    }
}

fn default_ordered() -> bool {
    true
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_progress_window() -> usize {
    100
}

/// Options for a single pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Deliver outputs in input order.
    #[serde(default = "default_ordered")]
    pub ordered: bool,

    /// Progress reporting mode.
    #[serde(default)]
    pub progress: ProgressMode,

    /// Capacity of each stage's input channel. Defaults to twice the
    /// stage's worker count.
    #[serde(default)]
    pub channel_capacity: Option<usize>,

    /// How long teardown waits for slots to exit before terminating them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Number of recent item durations used for rate estimates.
    #[serde(default = "default_progress_window")]
    pub progress_window: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ordered: default_ordered(),
            progress: ProgressMode::default(),
            channel_capacity: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            progress_window: default_progress_window(),
        }
    }
}

impl RunOptions {
    /// Creates the default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default options with the environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::default().with_env_overrides()
    }

    /// Applies the `MPIPELINE_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigurationError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        if let Some(raw) = lookup(ENV_ORDERED) {
            self.ordered = parse_bool(ENV_ORDERED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PROGRESS) {
            self.progress = raw.parse()?;
        }
        if let Some(raw) = lookup(ENV_CHANNEL_CAPACITY) {
            self.channel_capacity = Some(parse_number(ENV_CHANNEL_CAPACITY, &raw)?);
        }
        if let Some(raw) = lookup(ENV_SHUTDOWN_GRACE_MS) {
            self.shutdown_grace_ms = parse_number(ENV_SHUTDOWN_GRACE_MS, &raw)?;
        }
        Ok(self)
    }

    /// Sets ordered delivery.
    #[must_use]
    pub fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Sets the progress mode.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressMode) -> Self {
        self.progress = progress;
        self
    }

    /// Sets the per-stage channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = Some(capacity);
        self
    }

    /// Sets the teardown grace period.
    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the progress rate window.
    #[must_use]
    pub fn with_progress_window(mut self, window: usize) -> Self {
        self.progress_window = window;
        self
    }

    /// Returns the teardown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Returns the input channel capacity for a stage with `worker_count` slots.
    #[must_use]
    pub fn capacity_for(&self, worker_count: usize) -> usize {
        self.channel_capacity
            .unwrap_or_else(|| worker_count.saturating_mul(2))
            .max(1)
    }

    /// Validates the options.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.channel_capacity == Some(0) {
            return Err(ConfigurationError::new("channel_capacity must be positive")
                .with_fix_hint("Leave it unset to use twice the stage's worker count."));
        }
        if self.progress_window == 0 {
            return Err(ConfigurationError::new("progress_window must be positive"));
        }
        Ok(())
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, ConfigurationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigurationError::new(format!(
            "{name} must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigurationError> {
    raw.trim().parse().map_err(|_| {
        ConfigurationError::new(format!("{name} must be a non-negative integer, got '{raw}'"))
    })
}
