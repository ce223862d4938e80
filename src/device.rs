//! A named device shared between connections.
//!
//! A [`Device`] owns exactly one driver instance and the set of connections
//! currently using it. The driver is open exactly while that set is not
//! empty: the first user opens it, the last one to leave closes it.
//!
//! All driver calls happen under the device mutex, and the mutex stays held
//! for the whole I/O exchange. Commands to one device are therefore
//! serialized, while different devices proceed independently. Every method
//! here may block and must not be called on an async executor thread; the
//! dispatcher runs them with `tokio::task::spawn_blocking`.

use crate::error::DriverError;
use crate::hardware::{create_driver, Driver, DriverConfig};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Identifier of a client connection, assigned by the transport.
pub type ConnectionId = u64;

/// Shared handle that keeps a device alive across a configuration reload.
pub type DeviceHandle = Arc<Device>;

struct DeviceState {
    driver: Box<dyn Driver>,
    users: BTreeSet<ConnectionId>,
}

/// Device with reference-counted open/close.
pub struct Device {
    name: String,
    config: DriverConfig,
    state: Mutex<DeviceState>,
}

impl Device {
    /// Build the device and its (closed) driver.
    pub fn new(name: impl Into<String>, config: DriverConfig) -> Result<Self, DriverError> {
        let driver = create_driver(&config)?;
        Ok(Self::with_driver(name, config, driver))
    }

    /// Build a device around an existing driver instance.
    pub fn with_driver(
        name: impl Into<String>,
        config: DriverConfig,
        driver: Box<dyn Driver>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(DeviceState {
                driver,
                users: BTreeSet::new(),
            }),
        }
    }

    /// Device name from the configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver kind and arguments.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    // a panic inside a driver must not make the device unusable for others
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `conn` as a user, opening the driver if it is the first one.
    ///
    /// Idempotent. If opening fails, `conn` is not registered.
    pub fn use_by(&self, conn: ConnectionId) -> Result<(), DriverError> {
        let mut state = self.lock();
        if state.users.contains(&conn) {
            return Ok(());
        }
        if state.users.is_empty() {
            info!(device = %self.name, "Opening device");
            state.driver.open()?;
        }
        state.users.insert(conn);
        Ok(())
    }

    /// Unregister `conn`, closing the driver when the last user leaves.
    ///
    /// Idempotent. Close errors are returned after `conn` has been removed.
    pub fn release(&self, conn: ConnectionId) -> Result<(), DriverError> {
        let mut state = self.lock();
        if !state.users.remove(&conn) || !state.users.is_empty() {
            return Ok(());
        }
        info!(device = %self.name, "Closing device");
        state.driver.close()
    }

    /// Run a driver command with the device lock held.
    ///
    /// After a fatal driver error the device is closed and forgets all its
    /// users, so the next request opens it again.
    pub fn command(&self, cmd: &str, arg: &str) -> Result<String, DriverError> {
        let mut state = self.lock();
        debug!(device = %self.name, cmd, arg, "Device command");
        let result = state.driver.cmd(cmd, arg);
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(device = %self.name, error = %err, "Fatal device error, closing device");
                if let Err(e) = state.driver.close() {
                    warn!(device = %self.name, "Failed to close device: {}", e);
                }
                state.users.clear();
            }
        }
        result
    }

    /// Whether the driver is currently open.
    pub fn is_open(&self) -> bool {
        !self.lock().users.is_empty()
    }

    /// Number of connections using the device.
    pub fn user_count(&self) -> usize {
        self.lock().users.len()
    }

    /// Whether `conn` is one of the users.
    pub fn is_used_by(&self, conn: ConnectionId) -> bool {
        self.lock().users.contains(&conn)
    }

    /// Human readable state, as seen from connection `conn`.
    pub fn describe(&self, conn: ConnectionId) -> String {
        let (count, used) = {
            let state = self.lock();
            (state.users.len(), state.users.contains(&conn))
        };
        let mut out = String::new();
        let _ = writeln!(out, "Device: {}", self.name);
        let _ = writeln!(out, "Driver: {}", self.config.kind());
        if !self.config.args().is_empty() {
            out.push_str("Driver arguments:\n");
            for (key, value) in self.config.args() {
                let _ = writeln!(out, "  {key}: {value}");
            }
        }
        let _ = writeln!(
            out,
            "Device is {}",
            if count > 0 { "open" } else { "closed" }
        );
        let _ = writeln!(out, "Number of users: {count}");
        if used {
            out.push_str("You are currently using the device\n");
        }
        out
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.users.is_empty() {
            return;
        }
        info!(device = %self.name, "Closing device on removal");
        state.users.clear();
        if let Err(e) = state.driver.close() {
            warn!(device = %self.name, "Failed to close device: {}", e);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("driver", &self.config.kind())
            .field("users", &self.user_count())
            .finish()
    }
}
