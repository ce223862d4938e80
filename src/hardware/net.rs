//! TCP transport for network instruments (raw SCPI socket, LXI).
//!
//! Arguments: `addr` (required), `port` (default 5025), `timeout` (seconds,
//! default 5). Answers are read only for queries by default (`qmark1w`).

use super::driver::{DriverConfig, DriverKind};
use super::stream::{ReadCond, Transport};
use crate::error::DriverError;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

const DEFAULT_PORT: u16 = 5025;
const DEFAULT_TIMEOUT: f64 = 5.0;

/// TCP client connection.
#[derive(Debug)]
pub struct NetTransport {
    addr: String,
    port: u16,
    timeout: Option<Duration>,
    stream: Option<TcpStream>,
}

impl NetTransport {
    /// Target host and port.
    pub fn target(&self) -> (&str, u16) {
        (&self.addr, self.port)
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))
    }
}

impl Transport for NetTransport {
    const KIND: DriverKind = DriverKind::Net;
    const ERRPREF: &'static str = "net: ";
    const READ_COND: ReadCond = ReadCond::QMark1W;

    fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let args = config.reader();
        Ok(Self {
            addr: args.required("addr")?.to_string(),
            port: args.parse("port", DEFAULT_PORT)?,
            // zero is rejected by the socket API
            timeout: args.timeout("timeout", DEFAULT_TIMEOUT)?.filter(|t| !t.is_zero()),
            stream: None,
        })
    }

    fn connect(&mut self) -> io::Result<()> {
        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("can't resolve {}", self.addr),
        );
        for addr in (self.addr.as_str(), self.port).to_socket_addrs()? {
            let attempt = match self.timeout {
                Some(t) => TcpStream::connect_timeout(&addr, t),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream.set_read_timeout(self.timeout)?;
                    stream.set_write_timeout(self.timeout)?;
                    stream.set_nodelay(true)?;
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn disconnect(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        stream.flush()
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::driver::Driver;
    use crate::hardware::stream::StreamDriver;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    fn config(port: u16, extra: &[(&str, &str)]) -> DriverConfig {
        let port = port.to_string();
        let mut args = vec![("addr", "127.0.0.1"), ("port", port.as_str())];
        args.extend_from_slice(extra);
        DriverConfig::with_args(DriverKind::Net, args).unwrap()
    }

    #[test]
    fn defaults() {
        let t = NetTransport::from_config(
            &DriverConfig::with_args(DriverKind::Net, [("addr", "scope.lan")]).unwrap(),
        )
        .unwrap();
        assert_eq!(t.target(), ("scope.lan", 5025));
        assert_eq!(t.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn queries_against_local_instrument() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            let mut writer = socket.try_clone().unwrap();
            let mut seen = Vec::new();
            for line in BufReader::new(socket).lines() {
                let line = line.unwrap();
                if line.ends_with('?') {
                    writer.write_all(b"ACME,42\n").unwrap();
                }
                seen.push(line);
            }
            seen
        });

        let mut drv = StreamDriver::<NetTransport>::from_config(&config(port, &[])).unwrap();
        drv.open().unwrap();
        assert_eq!(drv.cmd("ask", "VOLT 3").unwrap(), "");
        assert_eq!(drv.cmd("ask", "*IDN?").unwrap(), "ACME,42");
        drv.close().unwrap();

        assert_eq!(server.join().unwrap(), vec!["VOLT 3", "*IDN?"]);
    }

    #[test]
    fn silent_instrument_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || listener.accept().map(|(s, _)| s));

        let cfg = config(port, &[("timeout", "0.2")]);
        let mut drv = StreamDriver::<NetTransport>::from_config(&cfg).unwrap();
        drv.open().unwrap();
        let err = drv.cmd("ask", "MEAS?").unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)), "{err}");
        drv.close().unwrap();
        drop(server.join());
    }
}
