//! Device file parser.
//!
//! One record per line:
//!
//! ```text
//! # name    driver  arguments
//! door      spp     -prog "./door_ctl --port /dev/ttyS0" -read_timeout 2
//! echo      test
//! scope     net     -addr 192.168.1.20 \
//!                   -port 5025
//! ```
//!
//! Words are separated by whitespace. `#` at the start of a word begins a
//! comment. Single or double quotes group words; inside double quotes a
//! backslash escapes the next character. A backslash at the end of a line
//! joins it with the next one. Errors report the line where the record
//! starts.

use crate::error::ConfigError;
use crate::hardware::{DriverConfig, DriverKind};
use std::collections::BTreeMap;

/// Name reserved for the built-in server pseudo-device.
pub const SERVER_DEVICE: &str = "SERVER";

/// One validated device record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// 1-based line where the record starts
    pub line: usize,
    /// Device name
    pub name: String,
    /// Driver kind and arguments
    pub config: DriverConfig,
}

/// Words of one record with its starting line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based line of the first word
    pub line: usize,
    /// Unquoted words
    pub words: Vec<String>,
}

/// Split text into records of words. Fails only on unterminated quotes.
pub fn tokenize(text: &str) -> Result<Vec<RawRecord>, (usize, String)> {
    let mut records = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word: Option<String> = None;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    fn finish_word(word: &mut Option<String>, words: &mut Vec<String>) {
        if let Some(w) = word.take() {
            words.push(w);
        }
    }

    while let Some(c) = chars.next() {
        if word.is_none() && words.is_empty() && !c.is_whitespace() {
            record_line = line;
        }
        match c {
            '\n' => {
                finish_word(&mut word, &mut words);
                if !words.is_empty() {
                    records.push(RawRecord {
                        line: record_line,
                        words: std::mem::take(&mut words),
                    });
                }
                line += 1;
            }
            '\\' => match chars.next() {
                Some('\n') => {
                    finish_word(&mut word, &mut words);
                    line += 1;
                }
                Some(next) => word.get_or_insert_with(String::new).push(next),
                None => {}
            },
            '#' if word.is_none() => {
                while chars.peek().is_some_and(|&n| n != '\n') {
                    chars.next();
                }
            }
            '"' | '\'' => {
                let start = line;
                let buf = word.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some(q) if q == c => break,
                        Some('\\') if c == '"' => match chars.next() {
                            Some(escaped) => {
                                if escaped == '\n' {
                                    line += 1;
                                }
                                buf.push(escaped);
                            }
                            None => return Err((start, "unterminated quote".into())),
                        },
                        Some(other) => {
                            if other == '\n' {
                                line += 1;
                            }
                            buf.push(other);
                        }
                        None => return Err((start, "unterminated quote".into())),
                    }
                }
            }
            c if c.is_whitespace() => finish_word(&mut word, &mut words),
            c => word.get_or_insert_with(String::new).push(c),
        }
    }
    finish_word(&mut word, &mut words);
    if !words.is_empty() {
        records.push(RawRecord {
            line: record_line,
            words,
        });
    }
    Ok(records)
}

/// Parse and validate all records of a device file.
///
/// `source_name` only labels errors.
pub fn parse_devices(source_name: &str, text: &str) -> Result<Vec<DeviceRecord>, ConfigError> {
    let raw = tokenize(text).map_err(|(line, msg)| ConfigError::at(source_name, line, msg))?;
    let mut seen = BTreeMap::new();
    let mut records = Vec::with_capacity(raw.len());
    for rec in raw {
        let err = |msg: String| ConfigError::at(source_name, rec.line, msg);
        let record = parse_record(&rec.words).map_err(err)?;
        if seen.insert(record.0.clone(), rec.line).is_some() {
            return Err(err(format!("duplicated device name: {}", record.0)));
        }
        records.push(DeviceRecord {
            line: rec.line,
            name: record.0,
            config: record.1,
        });
    }
    Ok(records)
}

const BAD_PARAMETER_NAME: &str =
    "parameter name should be prefixed with \"-\" and contain at least one character";

fn parse_record(words: &[String]) -> Result<(String, DriverConfig), String> {
    let [name, kind, args @ ..] = words else {
        return Err("expected: <device name> <driver name> [-<parameter> <value>]".into());
    };
    if name.is_empty() {
        return Err("empty device".into());
    }
    if name == SERVER_DEVICE {
        return Err(format!("device name {SERVER_DEVICE} is reserved"));
    }
    let kind: DriverKind = kind.parse().map_err(|e: crate::error::DriverError| e.to_string())?;
    if args.len() % 2 != 0 {
        return Err("even-size list of [-<parameter> <value>] pairs expected".into());
    }
    let mut map = BTreeMap::new();
    for pair in args.chunks(2) {
        let key = match pair[0].strip_prefix('-') {
            Some(key) if !key.is_empty() => key,
            _ => {
                return Err(format!("{BAD_PARAMETER_NAME}: {}", pair[0]))
            }
        };
        if map.insert(key.to_string(), pair[1].clone()).is_some() {
            return Err(format!("duplicated parameter: -{key}"));
        }
    }
    let config = DriverConfig::new(kind, map).map_err(|e| e.to_string())?;
    Ok((name.clone(), config))
}
