//! Error types for the device server.
//!
//! Errors are split by the layer that produces them, each defined with
//! `thiserror`:
//!
//! - **`ConfigError`**: a device file could not be read or one of its records
//!   is malformed. Loading is all-or-nothing, so a `ConfigError` always means
//!   the previously active device set is still in place.
//! - **`DriverError`**: anything a hardware backend reports, from a closed
//!   device to a read timeout or an SPP framing violation. Backend errors carry
//!   the backend's configurable error prefix so clients can tell them apart.
//! - **`DispatchError`**: failures of a single action request. These never
//!   affect other requests or connections.
//!
//! The binary wraps these in `anyhow` at the top level.

use std::io;
use thiserror::Error;

/// Convenience alias for results of a dispatched action.
pub type AppResult<T> = std::result::Result<T, DispatchError>;

/// A device file could not be loaded.
///
/// `line` is the 1-based line where the offending record starts, or 0 when
/// the source itself could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bad configuration {source_name} at line {line}: {message}")]
pub struct ConfigError {
    /// File name (or other label) of the configuration source
    pub source_name: String,
    /// Line of the record that failed
    pub line: usize,
    /// Human readable reason
    pub message: String,
}

impl ConfigError {
    /// Error for a record starting at `line`.
    pub fn at(source_name: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    /// Error for a source that could not be read at all.
    pub fn unreadable(source_name: impl Into<String>, err: &io::Error) -> Self {
        let source_name = source_name.into();
        let message = format!("can't open configuration: {source_name}: {err}");
        Self {
            source_name,
            line: 0,
            message,
        }
    }
}

/// Errors reported by hardware drivers.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{0}device is closed")]
    ClosedDevice(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0}read timeout")]
    Timeout(String),

    #[error("{0}no #OK or #Error message")]
    NoTerminator(String),

    #[error("{prefix}symbol {marker} at the beginning of a line is not protected")]
    UnescapedMarker { prefix: String, marker: char },

    /// Error reported by the device itself (SPP `#Error:` line)
    #[error("{prefix}{message}")]
    Device { prefix: String, message: String },

    /// Unrecoverable device failure (SPP `#Fatal:` line); the device is closed
    #[error("{prefix}{message}")]
    Fatal { prefix: String, message: String },

    #[error("{prefix}{message}")]
    Protocol { prefix: String, message: String },

    #[error("{prefix}can't run {program}: {source}")]
    Spawn {
        prefix: String,
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{prefix}{source}")]
    Io {
        prefix: String,
        #[source]
        source: io::Error,
    },

    /// Invalid driver arguments, detected when the driver is built
    #[error("{0}")]
    Config(String),

    #[error("{0} support not enabled. Rebuild with --features {1}")]
    FeatureDisabled(&'static str, &'static str),
}

impl DriverError {
    /// True for errors after which the device must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Fatal { .. })
    }
}

/// Failure of one dispatched action.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("empty device name")]
    EmptyDevice,

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown command for SERVER device: {0}")]
    UnknownServerCommand(String),

    #[error("bad argument for {command}: {value:?}")]
    BadArgument { command: String, value: String },

    #[error("{0}")]
    Logging(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("device task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
