//! GPIB transport through a VISA library.
//!
//! Arguments: `addr` (primary address, required), `board` (default 0),
//! `timeout` (I/O timeout in seconds, default 3), `open_timeout` (seconds to
//! wait for the resource lock, default 3).
//!
//! Requires the `instrument_visa` feature and an installed VISA runtime.

use super::driver::{DriverConfig, DriverKind};
use super::stream::Transport;
use crate::error::DriverError;
use std::io;
use std::time::Duration;

const DEFAULT_TIMEOUT: f64 = 3.0;

/// VISA session to one GPIB instrument.
pub struct GpibTransport {
    board: u32,
    addr: u32,
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    timeout: Option<Duration>,
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    open_timeout: Option<Duration>,
    #[cfg(feature = "instrument_visa")]
    session: Option<visa::Session>,
}

impl GpibTransport {
    /// VISA resource string, e.g. `GPIB0::12::INSTR`.
    pub fn resource_string(&self) -> String {
        format!("GPIB{}::{}::INSTR", self.board, self.addr)
    }
}

impl Transport for GpibTransport {
    const KIND: DriverKind = DriverKind::Gpib;
    const FEATURE: Option<&'static str> = Some("instrument_visa");
    const AVAILABLE: bool = cfg!(feature = "instrument_visa");
    const ERRPREF: &'static str = "gpib: ";

    fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let args = config.reader();
        let addr: u32 = args.parse("addr", 0)?;
        if addr > 30 {
            return Err(DriverError::Config(format!(
                "bad value for -addr: {addr} (GPIB addresses are 0..30)"
            )));
        }
        Ok(Self {
            board: args.parse("board", 0)?,
            addr,
            timeout: args.timeout("timeout", DEFAULT_TIMEOUT)?,
            open_timeout: args.timeout("open_timeout", DEFAULT_TIMEOUT)?,
            #[cfg(feature = "instrument_visa")]
            session: None,
        })
    }

    #[cfg(feature = "instrument_visa")]
    fn connect(&mut self) -> io::Result<()> {
        let session =
            visa::Session::open(&self.resource_string(), self.open_timeout, self.timeout)?;
        self.session = Some(session);
        Ok(())
    }

    #[cfg(not(feature = "instrument_visa"))]
    fn connect(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "VISA support not enabled",
        ))
    }

    fn disconnect(&mut self) -> io::Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            self.session = None;
        }
        Ok(())
    }

    #[cfg(feature = "instrument_visa")]
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.session_mut()?.write_all(data)
    }

    #[cfg(not(feature = "instrument_visa"))]
    fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
        Err(io::ErrorKind::NotConnected.into())
    }

    #[cfg(feature = "instrument_visa")]
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.session_mut()?.read(buf)
    }

    #[cfg(not(feature = "instrument_visa"))]
    fn read_some(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }
}

#[cfg(feature = "instrument_visa")]
impl GpibTransport {
    fn session_mut(&mut self) -> io::Result<&mut visa::Session> {
        self.session
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session is not open"))
    }
}

#[cfg(feature = "instrument_visa")]
mod visa {
    use std::ffi::CString;
    use std::io::{self, Read, Write};
    use std::time::Duration;
    use visa_rs::prelude::*;

    /// Open instrument plus the resource manager that owns it.
    pub(super) struct Session {
        instr: Instrument,
        _rm: DefaultRM,
    }

    fn visa_err(e: impl std::fmt::Display) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e.to_string())
    }

    impl Session {
        pub(super) fn open(
            resource: &str,
            open_timeout: Option<Duration>,
            io_timeout: Option<Duration>,
        ) -> io::Result<Self> {
            let rm = DefaultRM::new().map_err(visa_err)?;
            let name = CString::new(resource).map_err(visa_err)?;
            let instr = rm
                .open(
                    &name.into(),
                    AccessMode::NO_LOCK,
                    open_timeout.unwrap_or(TIMEOUT_IMMEDIATE),
                )
                .map_err(visa_err)?;
            if let Some(t) = io_timeout {
                let millis = u32::try_from(t.as_millis()).unwrap_or(u32::MAX);
                let attr = attribute::AttrTmoValue::new_checked(millis)
                    .ok_or_else(|| visa_err(format!("bad timeout: {millis} ms")))?;
                instr.set_attr(attr).map_err(visa_err)?;
            }
            Ok(Self { instr, _rm: rm })
        }

        pub(super) fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.instr.write_all(data)
        }

        pub(super) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.instr.read(buf)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::driver::Driver;
    use crate::hardware::stream::StreamDriver;

    #[test]
    fn resource_string_from_arguments() {
        let cfg =
            DriverConfig::with_args(DriverKind::Gpib, [("addr", "12"), ("board", "1")]).unwrap();
        let t = GpibTransport::from_config(&cfg).unwrap();
        assert_eq!(t.resource_string(), "GPIB1::12::INSTR");
    }

    #[test]
    fn address_range_is_checked() {
        let cfg = DriverConfig::with_args(DriverKind::Gpib, [("addr", "31")]).unwrap();
        assert!(GpibTransport::from_config(&cfg).is_err());
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[test]
    fn open_without_visa_reports_feature() {
        let cfg = DriverConfig::with_args(DriverKind::Gpib, [("addr", "5")]).unwrap();
        let mut drv = StreamDriver::<GpibTransport>::from_config(&cfg).unwrap();
        let err = drv.open().unwrap_err();
        assert_eq!(
            err.to_string(),
            "gpib support not enabled. Rebuild with --features instrument_visa"
        );
    }
}
