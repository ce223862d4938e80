//! Driver for programs speaking the Simple Pipe Protocol.
//!
//! The program is started through the shell on `open`, so `-prog` may carry
//! its own arguments. Its stdout is drained by a reader thread into a channel,
//! which gives every line read a timeout without non-blocking pipes.
//!
//! Arguments:
//! * `prog` - command line of the program (required)
//! * `open_timeout` - seconds to wait for the header and first `#OK` (default 20)
//! * `read_timeout` - seconds to wait for each answer line (default 5)
//! * `errpref` - prefix for error messages (default `"spp: "`)
//! * `idn` - fixed answer for `*idn?`, the program is not asked
//!
//! Negative timeouts wait forever. A read timeout keeps the program running;
//! a failed open kills it. An answer that timed out is skipped before the
//! next request is sent, so later answers stay matched to their requests.
//!
//! On unix the shell and everything it starts share a new process group, and
//! closing the driver kills the whole group.

use super::driver::{Driver, DriverConfig};
use crate::error::DriverError;
use crate::spp::{self, LineSource, SppError};
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_OPEN_TIMEOUT: f64 = 20.0;
const DEFAULT_READ_TIMEOUT: f64 = 5.0;
const DEFAULT_ERRPREF: &str = "spp: ";

/// SPP subprocess driver.
pub struct SppDriver {
    prog: String,
    open_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    errpref: String,
    idn: Option<String>,
    session: Option<SppSession>,
}

impl SppDriver {
    /// Build from validated arguments.
    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let args = config.reader();
        Ok(Self {
            prog: args.required("prog")?.to_string(),
            open_timeout: args.timeout("open_timeout", DEFAULT_OPEN_TIMEOUT)?,
            read_timeout: args.timeout("read_timeout", DEFAULT_READ_TIMEOUT)?,
            errpref: args.string("errpref", DEFAULT_ERRPREF),
            idn: args.optional("idn"),
            session: None,
        })
    }

    /// Whether the program is running.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Protocol version announced by the running program.
    pub fn protocol_version(&self) -> Option<u32> {
        self.session.as_ref().map(|s| s.version)
    }

    fn wrap(&self, err: SppError) -> DriverError {
        let prefix = self.errpref.clone();
        match err {
            SppError::Timeout => DriverError::Timeout(prefix),
            SppError::NoTerminator => DriverError::NoTerminator(prefix),
            SppError::UnescapedMarker(marker) => DriverError::UnescapedMarker { prefix, marker },
            SppError::Error(message) => DriverError::Device { prefix, message },
            SppError::Fatal(message) => DriverError::Fatal { prefix, message },
            SppError::BadHeader(message) => DriverError::Protocol { prefix, message },
            SppError::Io(source) => DriverError::Io { prefix, source },
        }
    }
}

impl Driver for SppDriver {
    fn open(&mut self) -> Result<(), DriverError> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut session = SppSession::spawn(&self.prog).map_err(|source| DriverError::Spawn {
            prefix: self.errpref.clone(),
            program: self.prog.clone(),
            source,
        })?;
        if let Err(err) = session.handshake(self.open_timeout) {
            if let Err(e) = session.terminate() {
                warn!(prog = %self.prog, "Failed to stop SPP program: {}", e);
            }
            return Err(self.wrap(err));
        }
        info!(prog = %self.prog, version = session.version, "SPP program started");
        self.session = Some(session);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        info!(prog = %self.prog, "Stopping SPP program");
        session.terminate().map_err(|source| DriverError::Io {
            prefix: self.errpref.clone(),
            source,
        })
    }

    fn cmd(&mut self, name: &str, arg: &str) -> Result<String, DriverError> {
        if name != "ask" {
            return Err(DriverError::UnknownCommand(name.to_string()));
        }
        let timeout = self.read_timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(DriverError::ClosedDevice(self.errpref.clone()));
        };
        if let Some(idn) = &self.idn {
            if arg.trim().eq_ignore_ascii_case("*idn?") {
                return Ok(idn.clone());
            }
        }
        debug!(prog = %self.prog, "SPP request: {}", arg.escape_default());
        let result = session.ask(arg, timeout);
        result.map_err(|e| self.wrap(e))
    }
}

impl Drop for SppDriver {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.terminate();
        }
    }
}

// ============================================================================
// Running program
// ============================================================================

struct SppSession {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: ChannelLines,
    marker: char,
    version: u32,
    /// Answers still owed by the program for requests that timed out
    unanswered: usize,
    terminated: bool,
}

impl SppSession {
    fn spawn(prog: &str) -> io::Result<Self> {
        let mut child = shell_command(prog)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdout pipe"))?;
        Ok(Self {
            child,
            stdin,
            lines: ChannelLines::spawn(stdout),
            marker: '#',
            version: 0,
            unanswered: 0,
            terminated: false,
        })
    }

    /// Read the header and the first answer.
    fn handshake(&mut self, timeout: Option<Duration>) -> Result<(), SppError> {
        let header = self.lines.next_line(timeout)?.ok_or_else(|| {
            SppError::BadHeader("program exited before sending SPP header".into())
        })?;
        let header = spp::parse_header(&header)?;
        self.marker = header.marker;
        self.version = header.version;
        spp::read_response(&mut self.lines, self.marker, timeout)?;
        Ok(())
    }

    fn ask(&mut self, arg: &str, timeout: Option<Duration>) -> Result<String, SppError> {
        self.skip_unanswered(timeout)?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed"))?;
        stdin.write_all(arg.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        let answer = spp::read_response(&mut self.lines, self.marker, timeout);
        if matches!(answer, Err(SppError::Timeout)) {
            self.unanswered += 1;
        }
        answer
    }

    /// Read and drop late answers. Fails with `Timeout` if the program is
    /// still busy, without sending anything.
    fn skip_unanswered(&mut self, timeout: Option<Duration>) -> Result<(), SppError> {
        while self.unanswered > 0 {
            match spp::read_response(&mut self.lines, self.marker, timeout) {
                Ok(_) | Err(SppError::Error(_) | SppError::UnescapedMarker(_)) => {
                    debug!("Dropped late SPP answer");
                    self.unanswered -= 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        drop(self.stdin.take());
        kill_program(&mut self.child)?;
        self.child.wait().map(|_| ())
    }
}

/// Kill the shell's process group, so programs it started go too.
#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_program(child: &mut Child) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) with a negative pid only sends a signal to that group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // group already gone
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn kill_program(child: &mut Child) -> io::Result<()> {
    match child.kill() {
        // already exited
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

impl Drop for SppSession {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

#[cfg(unix)]
fn shell_command(prog: &str) -> Command {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(prog).process_group(0);
    cmd
}

#[cfg(windows)]
fn shell_command(prog: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(prog);
    cmd
}

/// Lines from the program's stdout, delivered by a reader thread.
///
/// The thread is not joined: it ends when the pipe closes or the receiver is
/// dropped.
struct ChannelLines {
    rx: Receiver<io::Result<String>>,
}

impl ChannelLines {
    fn spawn(stdout: ChildStdout) -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut buf = Vec::new();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = spp::strip_line_end(String::from_utf8_lossy(&buf).into_owned());
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });
        Self { rx }
    }
}

impl LineSource for ChannelLines {
    fn next_line(&mut self, timeout: Option<Duration>) -> Result<Option<String>, SppError> {
        let received = match timeout {
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => return Err(SppError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            },
            None => match self.rx.recv() {
                Ok(item) => item,
                Err(_) => return Ok(None),
            },
        };
        Ok(Some(received?))
    }
}
