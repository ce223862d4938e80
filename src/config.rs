//! Server settings using Figment.
//!
//! Settings are loaded from:
//! 1. a TOML file (default `device_server.toml`, missing file means defaults)
//! 2. environment variables prefixed with `DEVICE_SERVER_`, sections
//!    separated by a double underscore
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8082"
//! devices = "/etc/device_server/devices.txt"
//! idle_timeout = "10min"
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```
//!
//! Example override: `DEVICE_SERVER_LOGGING__LEVEL=debug`.
//!
//! The device list itself lives in a separate, line based file (see
//! [`crate::config_file`]) so it can be reloaded without restarting.

use crate::tracing_setup::{parse_log_level, OutputFormat, TracingConfig};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file name
pub const DEFAULT_SETTINGS_FILE: &str = "device_server.toml";

/// Top-level server settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network and device file settings
    #[serde(default)]
    pub server: ServerSection,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[server]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// Address of the TCP listener
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Device file
    #[serde(default = "default_devices")]
    pub devices: PathBuf,
    /// Close connections silent for this long (no limit if absent)
    #[serde(default, with = "humantime_serde::option")]
    pub idle_timeout: Option<Duration>,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Colored output for the pretty format
    #[serde(default = "default_ansi")]
    pub ansi: bool,
}

// Default value functions
fn default_listen() -> String {
    "127.0.0.1:8082".to_string()
}

fn default_devices() -> PathBuf {
    PathBuf::from("devices.txt")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_ansi() -> bool {
    true
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            devices: default_devices(),
            idle_timeout: None,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            ansi: default_ansi(),
        }
    }
}

impl ServerSettings {
    /// Load settings from a specific file path and the environment
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DEVICE_SERVER_").split("__"))
            .extract()
    }

    /// Validate settings after loading
    pub fn validate(&self) -> Result<(), String> {
        self.listen_addr()?;
        parse_log_level(&self.logging.level)?;
        self.logging.format.parse::<OutputFormat>()?;
        if self.server.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err("Invalid idle_timeout 0s. Omit it to disable the limit".into());
        }
        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        self.server
            .listen
            .parse()
            .map_err(|e| format!("Invalid listen address '{}': {}", self.server.listen, e))
    }

    /// Tracing configuration for these settings
    pub fn tracing_config(&self) -> Result<TracingConfig, String> {
        let format = self.logging.format.parse()?;
        Ok(TracingConfig::new(parse_log_level(&self.logging.level)?)
            .with_format(format)
            .with_ansi(self.logging.ansi))
    }
}
