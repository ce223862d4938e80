//! Echo driver without hardware.
//!
//! `ask` returns its argument while the driver is open. Useful for checking
//! the server and for tests.

use super::driver::Driver;
use crate::error::DriverError;

const ERRPREF: &str = "test: ";

/// Driver that echoes `ask` arguments.
#[derive(Debug, Default)]
pub struct TestDriver {
    opened: bool,
}

impl TestDriver {
    /// New closed driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `open` was called more recently than `close`.
    pub fn is_open(&self) -> bool {
        self.opened
    }
}

impl Driver for TestDriver {
    fn open(&mut self) -> Result<(), DriverError> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.opened = false;
        Ok(())
    }

    fn cmd(&mut self, name: &str, arg: &str) -> Result<String, DriverError> {
        if name != "ask" {
            return Err(DriverError::UnknownCommand(name.to_string()));
        }
        if !self.opened {
            return Err(DriverError::ClosedDevice(ERRPREF.to_string()));
        }
        Ok(arg.to_string())
    }
}
