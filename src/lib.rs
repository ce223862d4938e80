//! # Device Server Library
//!
//! A gateway that shares laboratory instruments between many clients. Each
//! configured device (serial port, network instrument, GPIB instrument, or a
//! program speaking the Simple Pipe Protocol) is opened when the first client
//! needs it and closed when the last one leaves. Commands to one device are
//! serialized; different devices work in parallel.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `Driver` trait and its backends (`test`, `spp`,
//!   `serial`, `net`, `gpib`).
//! - **`spp`**: the line framing used by subprocess devices and by the TCP
//!   front end.
//! - **`device`**: a named device with reference-counted open/close.
//! - **`config_file`**: parser for the line based device file.
//! - **`registry`**: the current device set, replaced atomically on reload.
//! - **`dispatcher`**: routes `<device>/<command>/<argument>` actions,
//!   including the built-in `SERVER` commands.
//! - **`network`**: TCP front end used by the binary.
//! - **`config`**: server settings (Figment, TOML plus environment).
//! - **`tracing_setup`**: tracing initialisation and runtime level changes.
//! - **`error`**: error types.

pub mod config;
pub mod config_file;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod hardware;
pub mod network;
pub mod registry;
pub mod spp;
pub mod tracing_setup;

pub use device::{ConnectionId, Device, DeviceHandle};
pub use dispatcher::{parse_url, ActionDispatcher, ActionPath};
pub use error::{AppResult, ConfigError, DispatchError, DriverError};
pub use registry::{DeviceRegistry, DeviceSnapshot};
