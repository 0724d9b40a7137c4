//! Logging setup for hosts and worker processes.
//!
//! The library itself only emits `tracing` events. Hosts may install their own
//! subscriber or call [`init`]; worker binaries get one from
//! [`run_worker_main`](crate::worker::run_worker_main). Workers always log to stderr,
//! because stdout carries the protocol.
//!
//! # Environment Variables
//!
//! - `WATCHDOG_LOG` - Log filter (overrides RUST_LOG)
//! - `WATCHDOG_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `WATCHDOG_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    pub format: LogFormat,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    pub show_target: bool,
    /// ANSI colors; off for workers, whose stderr usually lands in the host's logs.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            filter: None,
            show_target: true,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for worker processes: compact lines, no colors.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            ansi: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter set explicitly wins over `WATCHDOG_LOG` and `RUST_LOG`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|var| std::env::var(var).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.filter.is_none() {
            self.filter = lookup("WATCHDOG_LOG").or_else(|| lookup("RUST_LOG"));
        }
        if self.filter.is_none() {
            if let Some(level) = lookup("WATCHDOG_LOG_LEVEL").and_then(|s| parse_level(&s)) {
                self.level = level;
            }
        }
        if let Some(format) = lookup("WATCHDOG_LOG_FORMAT").and_then(|s| s.parse().ok()) {
            self.format = format;
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let by_level = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                by_level()
            }),
            None => by_level(),
        }
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Initialize the global tracing subscriber, writing to stderr.
///
/// Later calls keep the subscriber that is already installed.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();
    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(config.show_target)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.show_target)
                    .with_ansi(config.ansi)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(config.show_target)
                    .with_ansi(config.ansi)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    if let Err(error) = result {
        tracing::debug!(%error, "global subscriber already installed; keeping it");
    }
}

/// Logging for a worker child process.
pub fn init_worker_logging() {
    init(LogConfig::for_worker().with_env_overrides());
}
