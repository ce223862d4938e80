//! Tracing setup and runtime log level control.
//!
//! The server logs through `tracing`. [`init`] installs a `tracing-subscriber`
//! stack with a reloadable `EnvFilter` so the level can be changed while the
//! server runs (`SERVER/set_log_level/<n>`). Levels are exchanged with clients
//! as numbers:
//!
//! | number | level |
//! |--------|-------|
//! | <= 0   | error |
//! | 1      | warn  |
//! | 2      | info  |
//! | 3      | debug |
//! | >= 4   | trace |
//!
//! # Example
//! ```no_run
//! use device_server::tracing_setup::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Compact);
//! let log = tracing_setup::init(config)?;
//! log.set_level(1)?;
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

const ALREADY_SET: &str = "a global default trace dispatcher has already been set";

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                s
            )),
        }
    }
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Initial log level
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (NEW, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config with custom level
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

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

// ============================================================================
// Runtime level control
// ============================================================================

struct LogControlInner {
    level: AtomicI32,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

/// Shared handle to the active log level.
///
/// Cloning is cheap. A control created with [`LogControl::detached`] only
/// stores the number, which is what tests and embedders without a
/// subscriber need.
#[derive(Clone)]
pub struct LogControl {
    inner: Arc<LogControlInner>,
}

impl LogControl {
    /// Level holder not connected to any subscriber.
    pub fn detached(level: i32) -> Self {
        Self {
            inner: Arc::new(LogControlInner {
                level: AtomicI32::new(level),
                reload: None,
            }),
        }
    }

    /// Current numeric level.
    pub fn level(&self) -> i32 {
        self.inner.level.load(Ordering::SeqCst)
    }

    /// Change the level, updating the subscriber filter if one is attached.
    pub fn set_level(&self, level: i32) -> Result<(), String> {
        if let Some(handle) = &self.inner.reload {
            let filter = EnvFilter::new(level_to_filter_string(level_from_number(level)));
            handle
                .reload(filter)
                .map_err(|e| format!("Failed to change log level: {}", e))?;
        }
        self.inner.level.store(level, Ordering::SeqCst);
        Ok(())
    }
}

impl std::fmt::Debug for LogControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogControl")
            .field("level", &self.level())
            .field("attached", &self.inner.reload.is_some())
            .finish()
    }
}

/// Initialize tracing and return the level control.
///
/// `RUST_LOG` overrides the configured level at startup. If a global
/// subscriber is already installed (tests, embedding), the existing one is
/// kept and a detached control is returned.
pub fn init(config: TracingConfig) -> Result<LogControl, String> {
    let level = number_from_level(config.level);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        OutputFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .pretty()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(config.with_ansi);
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init()
        }
        OutputFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init()
        }
        OutputFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_span_events(span_events)
                .with_file(config.with_file_and_line)
                .with_line_number(config.with_file_and_line)
                .with_thread_names(config.with_thread_names);
            tracing_subscriber::registry()
                .with(filter_layer)
                .with(fmt_layer)
                .try_init()
        }
    };

    match result {
        Ok(()) => Ok(LogControl {
            inner: Arc::new(LogControlInner {
                level: AtomicI32::new(level),
                reload: Some(handle),
            }),
        }),
        // Handle "already initialized" gracefully - this is expected in tests
        Err(e) if e.to_string().contains(ALREADY_SET) => {
            Ok(LogControl::detached(level))
        }
        Err(e) => Err(format!("Failed to initialize tracing: {}", e)),
    }
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
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

/// Map a client level number to a tracing level.
pub fn level_from_number(level: i32) -> Level {
    match level {
        i32::MIN..=0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Map a tracing level to its client level number.
pub fn number_from_level(level: Level) -> i32 {
    match level {
        Level::ERROR => 0,
        Level::WARN => 1,
        Level::INFO => 2,
        Level::DEBUG => 3,
        Level::TRACE => 4,
    }
}

/// Convert Level to env filter string
fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("warn"), Ok(Level::WARN)));
        // Case insensitive
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(parse_log_level("invalid").is_err());
    }

    #[test]
    fn test_level_numbers() {
        assert_eq!(level_from_number(-3), Level::ERROR);
        assert_eq!(level_from_number(1), Level::WARN);
        assert_eq!(level_from_number(2), Level::INFO);
        assert_eq!(level_from_number(3), Level::DEBUG);
        assert_eq!(level_from_number(100), Level::TRACE);
        for n in 0..=4 {
            assert_eq!(number_from_level(level_from_number(n)), n);
        }
    }

    #[test]
    fn test_detached_control() {
        let log = LogControl::detached(2);
        let copy = log.clone();
        log.set_level(-5).unwrap();
        assert_eq!(copy.level(), -5);
    }

    #[test]
    fn test_output_format() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_tracing_config_builder() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Json)
            .with_span_events(true)
            .with_ansi(false);
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.with_span_events);
        assert!(!config.with_ansi);
    }
}
