//! Driver abstraction shared by all hardware backends.
//!
//! A [`Driver`] is a small synchronous capability: open the hardware, close
//! it, and run a named command. All calls may block on I/O and are made by
//! [`crate::device::Device`] with its lock held, so a driver never sees two
//! calls at once and needs no internal locking.
//!
//! Drivers are built from a [`DriverConfig`], which is validated when it is
//! created: the argument keys must belong to the backend's closed set and the
//! required ones must be present. Numeric values are checked when the driver
//! is built by [`create_driver`], which happens at configuration load time.

use crate::error::DriverError;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::gpib::GpibTransport;
use super::net::NetTransport;
use super::serial::SerialTransport;
use super::spp_driver::SppDriver;
use super::stream::StreamDriver;
use super::test_driver::TestDriver;

/// Capability implemented by every hardware backend.
pub trait Driver: Send {
    /// Open the hardware. Called only while the device has no users.
    fn open(&mut self) -> Result<(), DriverError>;

    /// Close the hardware. Must be idempotent.
    fn close(&mut self) -> Result<(), DriverError>;

    /// Run a command. Only `ask` is defined; other names fail with
    /// [`DriverError::UnknownCommand`].
    fn cmd(&mut self, name: &str, arg: &str) -> Result<String, DriverError>;
}

// ============================================================================
// Driver kinds
// ============================================================================

/// Closed set of driver backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Echo driver without hardware
    Test,
    /// Subprocess speaking SPP
    Spp,
    /// Serial port
    Serial,
    /// TCP socket (LXI/SCPI raw port)
    Net,
    /// GPIB through VISA
    Gpib,
}

impl DriverKind {
    /// All kinds, in documentation order.
    pub const ALL: [DriverKind; 5] = [
        DriverKind::Test,
        DriverKind::Spp,
        DriverKind::Serial,
        DriverKind::Net,
        DriverKind::Gpib,
    ];

    /// Name used in device files.
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverKind::Test => "test",
            DriverKind::Spp => "spp",
            DriverKind::Serial => "serial",
            DriverKind::Net => "net",
            DriverKind::Gpib => "gpib",
        }
    }

    /// Argument keys accepted by this backend.
    pub fn allowed_args(&self) -> &'static [&'static str] {
        match self {
            DriverKind::Test => &[],
            DriverKind::Spp => &["prog", "open_timeout", "read_timeout", "errpref", "idn"],
            DriverKind::Serial => &[
                "dev", "speed", "timeout", "sfc", "bufsize", "errpref", "idn", "add_str",
                "trim_str",
            ],
            DriverKind::Net => &[
                "addr", "port", "timeout", "bufsize", "errpref", "idn", "read_cond", "add_str",
                "trim_str",
            ],
            DriverKind::Gpib => &[
                "addr",
                "board",
                "timeout",
                "open_timeout",
                "bufsize",
                "errpref",
                "idn",
                "add_str",
                "trim_str",
            ],
        }
    }

    /// Argument keys that must be present.
    pub fn required_args(&self) -> &'static [&'static str] {
        match self {
            DriverKind::Test => &[],
            DriverKind::Spp => &["prog"],
            DriverKind::Serial => &["dev"],
            DriverKind::Net | DriverKind::Gpib => &["addr"],
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.driver_name())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DriverKind::ALL
            .into_iter()
            .find(|kind| kind.driver_name() == s)
            .ok_or_else(|| DriverError::Config(format!("unknown driver: {s}")))
    }
}

// ============================================================================
// Driver configuration
// ============================================================================

/// Backend kind plus its arguments. Keys are stored without the `-` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    kind: DriverKind,
    args: BTreeMap<String, String>,
}

impl DriverConfig {
    /// Validate argument keys against the backend and build the config.
    pub fn new(kind: DriverKind, args: BTreeMap<String, String>) -> Result<Self, DriverError> {
        let allowed = kind.allowed_args();
        if let Some(key) = args.keys().find(|k| !allowed.contains(&k.as_str())) {
            return Err(DriverError::Config(format!(
                "unknown argument for {kind} driver: -{key}"
            )));
        }
        if let Some(key) = kind
            .required_args()
            .iter()
            .find(|k| !args.contains_key(**k))
        {
            return Err(DriverError::Config(format!(
                "missing argument for {kind} driver: -{key}"
            )));
        }
        Ok(Self { kind, args })
    }

    /// Convenience constructor from key/value pairs.
    pub fn with_args<K, V>(
        kind: DriverKind,
        args: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, DriverError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let args = args
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(kind, args)
    }

    /// Backend kind.
    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    /// All arguments, sorted by key.
    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    pub(crate) fn reader(&self) -> ArgReader<'_> {
        ArgReader { args: &self.args }
    }
}

/// Typed access to driver arguments with defaults.
pub(crate) struct ArgReader<'a> {
    args: &'a BTreeMap<String, String>,
}

impl<'a> ArgReader<'a> {
    pub(crate) fn required(&self, key: &str) -> Result<&'a str, DriverError> {
        self.args
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| DriverError::Config(format!("missing argument: -{key}")))
    }

    pub(crate) fn string(&self, key: &str, default: &str) -> String {
        self.args
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub(crate) fn optional(&self, key: &str) -> Option<String> {
        self.args.get(key).cloned()
    }

    pub(crate) fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, DriverError> {
        match self.args.get(key) {
            Some(value) => value.trim().parse().map_err(|_| bad_value(key, value)),
            None => Ok(default),
        }
    }

    /// Timeout in seconds. Negative values mean "wait forever" (`None`).
    pub(crate) fn timeout(
        &self,
        key: &str,
        default_secs: f64,
    ) -> Result<Option<Duration>, DriverError> {
        let secs: f64 = self.parse(key, default_secs)?;
        if secs < 0.0 && secs.is_finite() {
            return Ok(None);
        }
        // NaN, infinity and values beyond `Duration::MAX` are refused
        Duration::try_from_secs_f64(secs).map(Some).map_err(|_| {
            let raw = self.args.get(key).map_or_else(|| secs.to_string(), String::clone);
            bad_value(key, &raw)
        })
    }
}

fn bad_value(key: &str, value: &str) -> DriverError {
    DriverError::Config(format!("bad value for -{key}: {value}"))
}

/// Build a driver instance. The driver starts closed.
pub fn create_driver(config: &DriverConfig) -> Result<Box<dyn Driver>, DriverError> {
    let driver: Box<dyn Driver> = match config.kind() {
        DriverKind::Test => Box::new(TestDriver::new()),
        DriverKind::Spp => Box::new(SppDriver::from_config(config)?),
        DriverKind::Serial => Box::new(StreamDriver::<SerialTransport>::from_config(config)?),
        DriverKind::Net => Box::new(StreamDriver::<NetTransport>::from_config(config)?),
        DriverKind::Gpib => Box::new(StreamDriver::<GpibTransport>::from_config(config)?),
    };
    Ok(driver)
}
