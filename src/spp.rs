//! Simple Pipe Protocol (SPP) framing.
//!
//! SPP is a line-oriented protocol spoken by subprocess-backed devices over
//! their stdin/stdout. A program announces itself with a header line
//! `<marker>SPP<version>` where the marker is the first character (usually
//! `#`). Every answer afterwards is a sequence of data lines closed by one of
//! the control lines:
//!
//! ```text
//! #OK              answer complete
//! #Error: <text>   request failed, device keeps working
//! #Fatal: <text>   device is broken and must be closed
//! ```
//!
//! A data line that itself starts with the marker is protected by doubling
//! the marker. Escaping is recognised only at the start of a line.

use std::io::{self, BufRead};
use std::time::Duration;
use thiserror::Error;

/// Protocol versions understood by the codec.
pub const SUPPORTED_VERSIONS: [u32; 2] = [1, 2];

/// Codec level failures, before a driver adds its error prefix.
#[derive(Error, Debug)]
pub enum SppError {
    #[error("read timeout")]
    Timeout,

    #[error("no #OK or #Error message")]
    NoTerminator,

    #[error("symbol {0} at the beginning of a line is not protected")]
    UnescapedMarker(char),

    #[error("{0}")]
    Error(String),

    #[error("{0}")]
    Fatal(String),

    #[error("{0}")]
    BadHeader(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One classified line of SPP output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SppFrame {
    /// Payload line, already unescaped
    Data(String),
    /// `#OK`
    Ok,
    /// `#Error: <text>`
    Error(String),
    /// `#Fatal: <text>`
    Fatal(String),
    /// End of stream
    Eof,
}

/// Parsed `<marker>SPP<version>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SppHeader {
    /// Control character for this session
    pub marker: char,
    /// Protocol version (1 or 2)
    pub version: u32,
}

/// A source of text lines with an optional per-line timeout.
///
/// `None` as the timeout blocks until a line or end of stream arrives.
pub trait LineSource {
    /// Read one line without its terminator, `Ok(None)` at end of stream.
    fn next_line(&mut self, timeout: Option<Duration>) -> Result<Option<String>, SppError>;
}

/// Blocking [`LineSource`] over any buffered reader. Timeouts are ignored.
pub struct BufLines<R> {
    inner: R,
}

impl<R: BufRead> BufLines<R> {
    /// Wrap a buffered reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: BufRead> LineSource for BufLines<R> {
    fn next_line(&mut self, _timeout: Option<Duration>) -> Result<Option<String>, SppError> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(strip_line_end(line)))
    }
}

/// Remove one trailing `\n` (and a `\r` before it).
pub fn strip_line_end(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

/// Parse the header line a program prints right after start.
pub fn parse_header(line: &str) -> Result<SppHeader, SppError> {
    let mut chars = line.chars();
    let marker = chars
        .next()
        .ok_or_else(|| SppError::BadHeader("SPP header expected, got empty line".into()))?;
    let rest = chars
        .as_str()
        .strip_prefix("SPP")
        .ok_or_else(|| SppError::BadHeader(format!("SPP header expected: {line}")))?;
    let version: u32 = rest
        .trim()
        .parse()
        .map_err(|_| SppError::BadHeader(format!("bad SPP protocol version: {line}")))?;
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(SppError::BadHeader(format!(
            "unsupported SPP protocol version: {version}"
        )));
    }
    Ok(SppHeader { marker, version })
}

/// Classify one line. Checks run in protocol precedence order.
pub fn classify_line(line: &str, marker: char) -> Result<SppFrame, SppError> {
    let Some(rest) = line.strip_prefix(marker) else {
        return Ok(SppFrame::Data(line.to_string()));
    };
    if let Some(msg) = rest.strip_prefix("Fatal: ") {
        return Ok(SppFrame::Fatal(msg.to_string()));
    }
    if let Some(msg) = rest.strip_prefix("Error: ") {
        return Ok(SppFrame::Error(msg.to_string()));
    }
    if rest == "OK" {
        return Ok(SppFrame::Ok);
    }
    if rest.starts_with(marker) {
        return Ok(SppFrame::Data(rest.to_string()));
    }
    Err(SppError::UnescapedMarker(marker))
}

/// Read one framed answer and return its payload lines joined with `\n`.
pub fn read_response<S: LineSource + ?Sized>(
    source: &mut S,
    marker: char,
    timeout: Option<Duration>,
) -> Result<String, SppError> {
    let mut lines: Vec<String> = Vec::new();
    loop {
        let frame = match source.next_line(timeout)? {
            Some(line) => classify_line(&line, marker)?,
            None => SppFrame::Eof,
        };
        match frame {
            SppFrame::Data(data) => lines.push(data),
            SppFrame::Ok => return Ok(lines.join("\n")),
            SppFrame::Error(msg) => return Err(SppError::Error(msg)),
            SppFrame::Fatal(msg) => return Err(SppError::Fatal(msg)),
            SppFrame::Eof => return Err(SppError::NoTerminator),
        }
    }
}

/// Protect one payload line for sending.
pub fn encode_data_line(text: &str, marker: char) -> String {
    if text.starts_with(marker) {
        format!("{marker}{text}")
    } else {
        text.to_string()
    }
}

/// Encode a complete successful answer, terminator included.
pub fn encode_answer(payload: &str, marker: char) -> String {
    let mut out = String::new();
    if !payload.is_empty() {
        for line in payload.split('\n') {
            out.push_str(&encode_data_line(line, marker));
            out.push('\n');
        }
    }
    out.push(marker);
    out.push_str("OK\n");
    out
}

/// Encode an error answer. Newlines in `message` are flattened.
pub fn encode_error(message: &str, marker: char) -> String {
    format!("{marker}Error: {}\n", message.replace('\n', " "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Script(VecDeque<Result<Option<String>, SppError>>);

    impl Script {
        fn lines(lines: &[&str]) -> Self {
            Self(lines.iter().map(|l| Ok(Some(l.to_string()))).collect())
        }
    }

    impl LineSource for Script {
        fn next_line(&mut self, _timeout: Option<Duration>) -> Result<Option<String>, SppError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    #[test]
    fn header_versions() {
        assert_eq!(
            parse_header("#SPP001").unwrap(),
            SppHeader {
                marker: '#',
                version: 1
            }
        );
        assert_eq!(parse_header("%SPP2").unwrap().marker, '%');
        assert!(matches!(parse_header("#SPP3"), Err(SppError::BadHeader(_))));
        assert!(matches!(parse_header("#XYZ1"), Err(SppError::BadHeader(_))));
        assert!(matches!(parse_header(""), Err(SppError::BadHeader(_))));
    }

    #[test]
    fn data_lines_are_joined() {
        let mut src = Script::lines(&["data1", "##data2", "#OK"]);
        assert_eq!(read_response(&mut src, '#', None).unwrap(), "data1\n#data2");
    }

    #[test]
    fn empty_answer() {
        let mut src = Script::lines(&["#OK"]);
        assert_eq!(read_response(&mut src, '#', None).unwrap(), "");
    }

    #[test]
    fn error_line_fails_request() {
        let mut src = Script::lines(&["partial", "#Error: boom"]);
        match read_response(&mut src, '#', None) {
            Err(SppError::Error(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn fatal_line_fails_request() {
        let mut src = Script::lines(&["#Fatal: on fire"]);
        assert!(matches!(
            read_response(&mut src, '#', None),
            Err(SppError::Fatal(msg)) if msg == "on fire"
        ));
    }

    #[test]
    fn unescaped_marker_is_a_violation() {
        let mut src = Script::lines(&["#Xabc", "#OK"]);
        assert!(matches!(
            read_response(&mut src, '#', None),
            Err(SppError::UnescapedMarker('#'))
        ));

        // payload starting with the marker must be doubled
        let mut src = Script::lines(&["data1", "#data2", "#OK"]);
        assert!(matches!(
            read_response(&mut src, '#', None),
            Err(SppError::UnescapedMarker('#'))
        ));
    }

    #[test]
    fn eof_without_terminator() {
        let mut src = Script::lines(&["data"]);
        assert!(matches!(
            read_response(&mut src, '#', None),
            Err(SppError::NoTerminator)
        ));
    }

    #[test]
    fn timeout_propagates() {
        let mut src = Script(VecDeque::from([Ok(Some("a".into())), Err(SppError::Timeout)]));
        assert!(matches!(
            read_response(&mut src, '#', Some(Duration::from_millis(1))),
            Err(SppError::Timeout)
        ));
    }

    #[test]
    fn precedence_of_control_lines() {
        assert_eq!(classify_line("#OK", '#').unwrap(), SppFrame::Ok);
        // "#OK " is not exactly OK
        assert!(classify_line("#OK ", '#').is_err());
        assert_eq!(
            classify_line("#Error: ", '#').unwrap(),
            SppFrame::Error(String::new())
        );
        // escaping only counts at line start
        assert_eq!(
            classify_line("a#b", '#').unwrap(),
            SppFrame::Data("a#b".into())
        );
        assert_eq!(classify_line("", '#').unwrap(), SppFrame::Data(String::new()));
    }

    #[test]
    fn encoded_answer_reads_back() {
        let payload = "line one\n#starts with marker\n";
        let encoded = encode_answer(payload, '#');
        let mut src = BufLines::new(encoded.as_bytes());
        assert_eq!(read_response(&mut src, '#', None).unwrap(), payload);
    }

    #[test]
    fn buf_lines_strips_crlf() {
        let mut src = BufLines::new("abc\r\n#OK\r\n".as_bytes());
        assert_eq!(read_response(&mut src, '#', None).unwrap(), "abc");
    }

    #[test]
    fn error_encoding_is_single_line() {
        assert_eq!(encode_error("a\nb", '#'), "#Error: a b\n");
    }
}
