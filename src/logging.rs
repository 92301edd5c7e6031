//! Tracing setup for hosts embedding module instances.
//!
//! Every lifecycle log line carries structured `module` fields (and `event`
//! for transitions), so one filter such as
//! `RUST_LOG=daq_module=debug` shows which thread activated what.
//!
//! # Example
//! ```no_run
//! use daq_module::{config::HostConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = HostConfig::load_from("bench.toml")?;
//! logging::init_from_config(&config)?;
//! tracing::info!(module = "counter", "Host started");
//! # Ok(())
//! # }
//! ```

use crate::config::HostConfig;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line format with colors, for a developer's terminal
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// Tracing configuration options
///
/// Thread names are always printed: home threads are named `mod-<module>`,
/// which is what ties a transition to the thread that ran it.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level used when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include thread IDs next to the names
    pub with_thread_ids: bool,
    /// Whether to enable ANSI colors (Pretty format only)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_thread_ids: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the host configuration
    pub fn from_host_config(config: &HostConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;

        Ok(Self {
            level,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable thread IDs
    pub fn with_thread_ids(mut self, enabled: bool) -> Self {
        self.with_thread_ids = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the host configuration
pub fn init_from_config(config: &HostConfig) -> Result<(), String> {
    let tracing_config = TracingConfig::from_host_config(config)?;
    init(tracing_config)
}

/// Initialize tracing with custom configuration
///
/// Idempotent: if a global subscriber is already set, returns `Ok(())`.
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(config: TracingConfig) -> Result<(), String> {
    // Several hosts may share a process.
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let layer = fmt::layer()
        .with_thread_ids(config.with_thread_ids)
        .with_thread_names(true);
    let layer = match config.format {
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).with_filter(env_filter).boxed(),
        OutputFormat::Compact => layer.compact().with_ansi(false).with_filter(env_filter).boxed(),
        OutputFormat::Json => layer.json().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {}", e))
}

/// Parse log level string into tracing Level
pub(crate) fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}
