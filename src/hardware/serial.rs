//! Serial port transport, 8N1 framing.
//!
//! Arguments: `dev` (required), `speed` (default 9600), `timeout` (seconds,
//! default 5), `sfc` (software flow control, default 1).
//!
//! Requires the `instrument_serial` feature.

use super::driver::{DriverConfig, DriverKind};
use super::stream::Transport;
use crate::error::DriverError;
use std::io;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};

const DEFAULT_SPEED: u32 = 9600;
const DEFAULT_TIMEOUT: f64 = 5.0;
/// serialport has no "wait forever", use a day instead
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// Serial port connection.
pub struct SerialTransport {
    dev: String,
    speed: u32,
    timeout: Duration,
    software_flow_control: bool,
    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    /// Device path, e.g. `/dev/ttyUSB0`.
    pub fn dev(&self) -> &str {
        &self.dev
    }

    /// Baud rate.
    pub fn speed(&self) -> u32 {
        self.speed
    }
}

impl Transport for SerialTransport {
    const KIND: DriverKind = DriverKind::Serial;
    const FEATURE: Option<&'static str> = Some("instrument_serial");
    const AVAILABLE: bool = cfg!(feature = "instrument_serial");
    const ERRPREF: &'static str = "serial: ";

    fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let args = config.reader();
        let sfc: u8 = args.parse("sfc", 1)?;
        Ok(Self {
            dev: args.required("dev")?.to_string(),
            speed: args.parse("speed", DEFAULT_SPEED)?,
            timeout: args
                .timeout("timeout", DEFAULT_TIMEOUT)?
                .unwrap_or(BLOCKING_TIMEOUT),
            software_flow_control: sfc != 0,
            #[cfg(feature = "instrument_serial")]
            port: None,
        })
    }

    #[cfg(feature = "instrument_serial")]
    fn connect(&mut self) -> io::Result<()> {
        use serialport::{DataBits, FlowControl, Parity, StopBits};

        let flow = if self.software_flow_control {
            FlowControl::Software
        } else {
            FlowControl::None
        };
        let port = serialport::new(&self.dev, self.speed)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(flow)
            .timeout(self.timeout)
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn connect(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "serial support not enabled",
        ))
    }

    #[cfg(feature = "instrument_serial")]
    fn disconnect(&mut self) -> io::Result<()> {
        self.port = None;
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn disconnect(&mut self) -> io::Result<()> {
        Ok(())
    }

    #[cfg(feature = "instrument_serial")]
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
        Err(io::ErrorKind::NotConnected.into())
    }

    #[cfg(feature = "instrument_serial")]
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port_mut()?.read(buf)
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn read_some(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::NotConnected.into())
    }
}

#[cfg(feature = "instrument_serial")]
impl SerialTransport {
    fn port_mut(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "port is not open"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::driver::Driver;
    use crate::hardware::stream::StreamDriver;

    #[test]
    fn arguments_and_defaults() {
        let cfg = DriverConfig::with_args(
            DriverKind::Serial,
            [("dev", "/dev/ttyUSB0"), ("sfc", "0"), ("timeout", "-1")],
        )
        .unwrap();
        let t = SerialTransport::from_config(&cfg).unwrap();
        assert_eq!(t.dev(), "/dev/ttyUSB0");
        assert_eq!(t.speed(), 9600);
        assert!(!t.software_flow_control);
        assert_eq!(t.timeout, BLOCKING_TIMEOUT);
    }

    #[test]
    fn missing_port_fails_open() {
        let cfg = DriverConfig::with_args(
            DriverKind::Serial,
            [("dev", "/dev/this-port-does-not-exist")],
        )
        .unwrap();
        let mut drv = StreamDriver::<SerialTransport>::from_config(&cfg).unwrap();
        let err = drv.open().unwrap_err();
        assert!(err.to_string().starts_with("serial"), "{err}");
        assert!(matches!(
            drv.cmd("ask", "x"),
            Err(DriverError::ClosedDevice(_))
        ));
    }
}
