//! Request/response driver over a byte stream.
//!
//! Serial ports, TCP sockets and GPIB sessions all behave the same from the
//! server's point of view: write a message with a terminator, then read an
//! answer with a timeout. [`StreamDriver`] implements that once on top of the
//! small [`Transport`] trait, and each backend only knows how to connect and
//! move bytes.
//!
//! Common arguments:
//! * `bufsize` - maximum answer size in bytes (default 4096)
//! * `errpref` - prefix for error messages
//! * `idn` - fixed answer for `*idn?`, the device is not asked
//! * `add_str` - appended to every message (default `"\n"`)
//! * `trim_str` - removed from the end of every answer (default `"\n"`)

use super::driver::{Driver, DriverConfig, DriverKind};
use crate::error::DriverError;
use std::io;
use std::str::FromStr;
use tracing::{debug, info};

const DEFAULT_BUFSIZE: usize = 4096;

/// Byte transport used by [`StreamDriver`].
pub trait Transport: Send + Sized {
    /// Backend this transport implements
    const KIND: DriverKind;
    /// Cargo feature the transport needs, if any
    const FEATURE: Option<&'static str> = None;
    /// False when the transport was compiled out
    const AVAILABLE: bool = true;
    /// Default error prefix
    const ERRPREF: &'static str;
    /// Default read condition
    const READ_COND: ReadCond = ReadCond::Always;

    /// Build a disconnected transport from driver arguments.
    fn from_config(config: &DriverConfig) -> Result<Self, DriverError>;

    /// Open the connection.
    fn connect(&mut self) -> io::Result<()>;

    /// Drop the connection. Must be idempotent.
    fn disconnect(&mut self) -> io::Result<()>;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read available bytes, waiting at most the configured timeout.
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// When a request expects an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCond {
    /// Always read an answer
    Always,
    /// Never read, `ask` returns an empty string
    Never,
    /// Read if the message contains `?`
    QMark,
    /// Read if the first word of the message contains `?`
    QMark1W,
}

impl ReadCond {
    /// Whether `msg` expects an answer.
    pub fn should_read(&self, msg: &str) -> bool {
        match self {
            ReadCond::Always => true,
            ReadCond::Never => false,
            ReadCond::QMark => msg.contains('?'),
            ReadCond::QMark1W => msg
                .split_whitespace()
                .next()
                .is_some_and(|w| w.contains('?')),
        }
    }
}

impl FromStr for ReadCond {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(ReadCond::Always),
            "never" => Ok(ReadCond::Never),
            "qmark" => Ok(ReadCond::QMark),
            "qmark1w" => Ok(ReadCond::QMark1W),
            _ => Err(DriverError::Config(format!(
                "bad value for -read_cond: {s} (expected always, never, qmark or qmark1w)"
            ))),
        }
    }
}

/// Settings shared by all stream backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Maximum answer size
    pub bufsize: usize,
    /// Appended to messages
    pub add_str: String,
    /// Stripped from answers
    pub trim_str: String,
    /// Error prefix
    pub errpref: String,
    /// Fixed `*idn?` answer
    pub idn: Option<String>,
    /// When to read an answer
    pub read_cond: ReadCond,
}

impl StreamSettings {
    fn from_config<T: Transport>(config: &DriverConfig) -> Result<Self, DriverError> {
        let args = config.reader();
        let bufsize: usize = args.parse("bufsize", DEFAULT_BUFSIZE)?;
        if bufsize == 0 {
            return Err(DriverError::Config("bad value for -bufsize: 0".into()));
        }
        let read_cond = match args.optional("read_cond") {
            Some(value) => value.parse()?,
            None => T::READ_COND,
        };
        Ok(Self {
            bufsize,
            add_str: args.string("add_str", "\n"),
            trim_str: args.string("trim_str", "\n"),
            errpref: args.string("errpref", T::ERRPREF),
            idn: args.optional("idn"),
            read_cond,
        })
    }
}

/// Driver writing requests to a [`Transport`] and reading answers back.
pub struct StreamDriver<T: Transport> {
    transport: T,
    settings: StreamSettings,
    opened: bool,
}

impl<T: Transport> StreamDriver<T> {
    /// Build from validated arguments.
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let settings = StreamSettings::from_config::<T>(config)?;
        Ok(Self::new(T::from_config(config)?, settings))
    }

    /// Wrap an existing transport.
    pub fn new(transport: T, settings: StreamSettings) -> Self {
        Self {
            transport,
            settings,
            opened: false,
        }
    }

    /// Active settings.
    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn io_error(&self, source: io::Error) -> DriverError {
        let prefix = self.settings.errpref.clone();
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DriverError::Timeout(prefix),
            _ => DriverError::Io { prefix, source },
        }
    }

    /// Read until the answer ends with `trim_str`, or one chunk if it is empty.
    fn read_answer(&mut self) -> Result<String, DriverError> {
        let bufsize = self.settings.bufsize;
        let trim = self.settings.trim_str.as_bytes().to_vec();
        let mut answer: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; bufsize];
        loop {
            let room = bufsize - answer.len();
            let n = self
                .transport
                .read_some(&mut chunk[..room])
                .map_err(|e| self.io_error(e))?;
            if n == 0 {
                return Err(self.io_error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by device",
                )));
            }
            answer.extend_from_slice(&chunk[..n]);
            if trim.is_empty() || answer.ends_with(&trim) || answer.len() >= bufsize {
                break;
            }
        }
        if !trim.is_empty() && answer.ends_with(&trim) {
            answer.truncate(answer.len() - trim.len());
        }
        Ok(String::from_utf8_lossy(&answer).into_owned())
    }
}

impl<T: Transport> Driver for StreamDriver<T> {
    fn open(&mut self) -> Result<(), DriverError> {
        if self.opened {
            return Ok(());
        }
        if !T::AVAILABLE {
            return Err(DriverError::FeatureDisabled(
                T::KIND.driver_name(),
                T::FEATURE.unwrap_or_default(),
            ));
        }
        self.transport.connect().map_err(|e| self.io_error(e))?;
        self.opened = true;
        info!(driver = %T::KIND, "Connection opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if !self.opened {
            return Ok(());
        }
        self.opened = false;
        info!(driver = %T::KIND, "Connection closed");
        self.transport.disconnect().map_err(|e| self.io_error(e))
    }

    fn cmd(&mut self, name: &str, arg: &str) -> Result<String, DriverError> {
        if name != "ask" {
            return Err(DriverError::UnknownCommand(name.to_string()));
        }
        if !self.opened {
            return Err(DriverError::ClosedDevice(self.settings.errpref.clone()));
        }
        if let Some(idn) = &self.settings.idn {
            if arg.trim().eq_ignore_ascii_case("*idn?") {
                return Ok(idn.clone());
            }
        }
        debug!(driver = %T::KIND, "Sending: {}", arg.escape_default());
        let msg = format!("{arg}{}", self.settings.add_str);
        self.transport
            .write_all(msg.as_bytes())
            .map_err(|e| self.io_error(e))?;
        if !self.settings.read_cond.should_read(arg) {
            return Ok(String::new());
        }
        let answer = self.read_answer()?;
        debug!(driver = %T::KIND, "Received: {}", answer.escape_default());
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory transport replaying canned chunks.
    #[derive(Default)]
    struct MockTransport {
        connected: bool,
        written: Arc<Mutex<Vec<String>>>,
        chunks: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Transport for MockTransport {
        const KIND: DriverKind = DriverKind::Net;
        const ERRPREF: &'static str = "mock: ";

        fn from_config(_config: &DriverConfig) -> Result<Self, DriverError> {
            Ok(Self::default())
        }

        fn connect(&mut self) -> io::Result<()> {
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) -> io::Result<()> {
            self.connected = false;
            Ok(())
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(data).into_owned());
            Ok(())
        }

        fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    fn settings() -> StreamSettings {
        let cfg = DriverConfig::with_args(DriverKind::Net, [("addr", "localhost")]).unwrap();
        StreamSettings::from_config::<MockTransport>(&cfg).unwrap()
    }

    fn driver(chunks: &[&str]) -> StreamDriver<MockTransport> {
        let transport = MockTransport {
            chunks: chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect(),
            ..Default::default()
        };
        StreamDriver::new(transport, settings())
    }

    #[test]
    fn defaults_from_transport() {
        let s = settings();
        assert_eq!(s.errpref, "mock: ");
        assert_eq!(s.bufsize, 4096);
        assert_eq!(s.add_str, "\n");
        assert_eq!(s.read_cond, ReadCond::Always);
    }

    #[test]
    fn answer_is_assembled_and_trimmed() {
        let mut drv = driver(&["12.", "5\n"]);
        drv.open().unwrap();
        assert_eq!(drv.cmd("ask", "MEAS?").unwrap(), "12.5");
        let written = drv.transport().written.lock().unwrap().clone();
        assert_eq!(written, vec!["MEAS?\n".to_string()]);
    }

    #[test]
    fn timeout_is_reported_with_prefix() {
        let mut drv = driver(&[]);
        drv.open().unwrap();
        let err = drv.cmd("ask", "x?").unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
        assert_eq!(err.to_string(), "mock: read timeout");
    }

    #[test]
    fn closed_driver_does_not_write() {
        let mut drv = driver(&["x\n"]);
        assert!(matches!(
            drv.cmd("ask", "x"),
            Err(DriverError::ClosedDevice(_))
        ));
        assert!(drv.transport().written.lock().unwrap().is_empty());
    }

    #[test]
    fn read_conditions() {
        assert!(ReadCond::QMark.should_read("SOUR:VOLT 1; MEAS?"));
        assert!(!ReadCond::QMark1W.should_read("SOUR:VOLT 1; MEAS?"));
        assert!(ReadCond::QMark1W.should_read("*IDN?"));
        assert!(!ReadCond::QMark1W.should_read(""));
        assert!(!ReadCond::Never.should_read("*IDN?"));
        assert!("sometimes".parse::<ReadCond>().is_err());

        let mut drv = driver(&[]);
        drv.settings.read_cond = ReadCond::QMark1W;
        drv.open().unwrap();
        assert_eq!(drv.cmd("ask", "VOLT 5").unwrap(), "");
    }

    #[test]
    fn idn_is_answered_locally() {
        let mut drv = driver(&[]);
        drv.settings.idn = Some("ACME,1".into());
        drv.open().unwrap();
        assert_eq!(drv.cmd("ask", "*idn?").unwrap(), "ACME,1");
    }

    #[test]
    fn close_is_idempotent() {
        let mut drv = driver(&[]);
        drv.open().unwrap();
        assert!(drv.transport().connected);
        drv.close().unwrap();
        drv.close().unwrap();
        assert!(!drv.transport().connected);
    }
}
