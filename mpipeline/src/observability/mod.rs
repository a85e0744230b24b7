//! Logging setup.
//!
//! The library only emits `tracing` events. Binaries that want them printed
//! call [`init_tracing`] once at startup. Output always goes to stderr, since
//! a worker process's stdout carries the wire protocol.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for [`init_tracing`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Emit JSON lines instead of human-readable text.
    pub json_format: bool,
    /// Colorize text output.
    pub colorize: bool,
    /// Targets the default level applies to.
    pub targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            colorize: false,
            targets: vec!["mpipeline".to_string()],
        }
    }
}

impl LoggingConfig {
    /// Sets the default level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Switches JSON output on or off.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json_format = json;
        self
    }

    /// Adds a target to the default filter.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    fn filter_directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        if self.targets.is_empty() {
            return level;
        }
        self.targets
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Installs a global stderr subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Returns false if a
/// global subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.colorize)
        .with_target(true);
    let layer = if config.json_format {
        layer.json().flatten_event(true).boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()
        .is_ok()
}
