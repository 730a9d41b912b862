//! # bloomd Line Protocol
//!
//! Purpose: Encode client commands and parse server replies for the bloomd
//! text protocol, independent of any socket.
//!
//! ## Design Principles
//! 1. **One Encoder, Three Parsers**: Every command encodes through `Command`;
//!    every reply is one of three shapes (status, boolean vector, block).
//! 2. **Buffer Reuse**: Callers own the write and line buffers.
//! 3. **Fail Fast**: Anything outside the expected shape is a protocol error.
//!
//! ## Wire Format
//!
//! ```text
//! request:   <verb> [<filter>] [<arg> ...]\r\n
//! status:    Done | Exists | Filter does not exist | Client Error: ...\n
//! booleans:  Yes No Yes\n
//! block:     START\n <entry>\n ... END\n
//! ```

use std::collections::BTreeMap;
use std::io::BufRead;

use crate::error::{BloomdError, BloomdResult};
use crate::filter::{is_wire_token, CreateParams, FilterInfo, FilterList, FilterStats};

/// Terminator line of a block reply.
pub const END: &str = "END";
/// Optional opening line of a block reply.
pub const START: &str = "START";

const DONE: &str = "Done";
const EXISTS: &str = "Exists";
const YES: &str = "Yes";
const NO: &str = "No";
const FILTER_NOT_FOUND: &str = "Filter does not exist";
const NOT_PROXIED: &str = "Filter is not proxied. Close it first.";
const CLIENT_ERROR: &str = "Client Error";
const INTERNAL_ERROR: &str = "Internal Error";

/// One request line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    Create { name: &'a str, params: CreateParams },
    Drop(&'a str),
    Close(&'a str),
    Clear(&'a str),
    Flush,
    List,
    Info(&'a str),
    Check { name: &'a str, key: &'a str },
    Set { name: &'a str, key: &'a str },
    MultiCheck { name: &'a str, keys: Vec<&'a str> },
    MultiSet { name: &'a str, keys: Vec<&'a str> },
}

impl Command<'_> {
    /// Protocol verb written at the start of the line.
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Drop(_) => "drop",
            Command::Close(_) => "close",
            Command::Clear(_) => "clear",
            Command::Flush => "flush",
            Command::List => "list",
            Command::Info(_) => "info",
            Command::Check { .. } => "c",
            Command::Set { .. } => "s",
            Command::MultiCheck { .. } => "m",
            Command::MultiSet { .. } => "b",
        }
    }

    /// Filter the command targets, if any.
    pub fn filter(&self) -> Option<&str> {
        match self {
            Command::Flush | Command::List => None,
            Command::Create { name, .. }
            | Command::Drop(name)
            | Command::Close(name)
            | Command::Clear(name)
            | Command::Info(name)
            | Command::Check { name, .. }
            | Command::Set { name, .. }
            | Command::MultiCheck { name, .. }
            | Command::MultiSet { name, .. } => Some(*name),
        }
    }

    /// Appends the CRLF-terminated command line to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.verb().as_bytes());
        if let Some(name) = self.filter() {
            push_arg(out, name);
        }

        match self {
            Command::Create { params, .. } => {
                // Zero values are the server defaults and stay off the wire.
                if params.capacity > 0 {
                    push_arg(out, &format!("capacity={}", params.capacity));
                }
                if params.probability > 0.0 {
                    push_arg(out, &format!("prob={}", params.probability));
                }
                if params.in_memory {
                    push_arg(out, "in_memory=1");
                }
            }
            Command::Check { key, .. } | Command::Set { key, .. } => push_arg(out, key),
            Command::MultiCheck { keys, .. } | Command::MultiSet { keys, .. } => {
                for key in keys {
                    push_arg(out, key);
                }
            }
            _ => {}
        }

        out.extend_from_slice(b"\r\n");
    }
}

fn push_arg(out: &mut Vec<u8>, arg: &str) {
    out.push(b' ');
    out.extend_from_slice(arg.as_bytes());
}

/// Rejects keys that would break the single-line command framing.
pub fn validate_key(key: &str) -> BloomdResult<()> {
    if is_wire_token(key) {
        Ok(())
    } else {
        Err(BloomdError::InvalidKey(key.to_string()))
    }
}

/// Successful outcome of a status-only command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The command was applied.
    Done,
    /// `create` found the filter already present.
    Exists,
}

/// Reads a single status line (`create`, `drop`, `close`, `clear`, `flush`).
pub fn read_status<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    filter: &str,
) -> BloomdResult<Status> {
    let line = read_line(reader, line_buf)?;
    match line {
        DONE => Ok(Status::Done),
        EXISTS => Ok(Status::Exists),
        _ => Err(reply_error(line, filter).unwrap_or_else(|| {
            BloomdError::Protocol(format!("unexpected status reply {:?}", line))
        })),
    }
}

/// Reads one line of `Yes`/`No` tokens and checks it has `expected` entries.
pub fn read_bools<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    filter: &str,
    expected: usize,
) -> BloomdResult<Vec<bool>> {
    let line = read_line(reader, line_buf)?;
    if let Some(err) = reply_error(line, filter) {
        return Err(err);
    }

    let mut values = Vec::with_capacity(expected);
    for token in line.split_whitespace() {
        match token {
            YES => values.push(true),
            NO => values.push(false),
            _ => {
                return Err(BloomdError::Protocol(format!(
                    "unexpected token {:?} in boolean reply",
                    token
                )))
            }
        }
    }

    if values.len() != expected {
        return Err(BloomdError::Protocol(format!(
            "expected {} boolean(s), got {}",
            expected,
            values.len()
        )));
    }
    Ok(values)
}

/// Reads a `list` block: each entry is `<name> <prob> <bytes> <capacity> <size>`.
///
/// The stats text is kept verbatim but must parse as `FilterStats`.
pub fn read_list<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> BloomdResult<FilterList> {
    read_block(reader, line_buf, "", |line| {
        let (name, stats) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| BloomdError::Protocol(format!("malformed list entry {:?}", line)))?;
        let stats = stats.split_whitespace().collect::<Vec<_>>().join(" ");
        FilterStats::parse(&stats)?;
        Ok((name.to_string(), stats))
    })
}

/// Reads an `info` block: each entry is `<key> <value>`.
pub fn read_info<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    filter: &str,
) -> BloomdResult<FilterInfo> {
    read_block(reader, line_buf, filter, |line| {
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(key), Some(first)) => {
                let mut value = first.to_string();
                for rest in tokens {
                    value.push(' ');
                    value.push_str(rest);
                }
                Ok((key.to_string(), value))
            }
            _ => Err(BloomdError::Protocol(format!("malformed info entry {:?}", line))),
        }
    })
}

fn read_block<R, F>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    filter: &str,
    mut entry: F,
) -> BloomdResult<BTreeMap<String, String>>
where
    R: BufRead,
    F: FnMut(&str) -> BloomdResult<(String, String)>,
{
    let mut entries = BTreeMap::new();
    let mut first = true;
    loop {
        let line = read_line(reader, line_buf)?;
        if line == END {
            return Ok(entries);
        }
        if let Some(err) = reply_error(line, filter) {
            return Err(err);
        }
        if first && line == START {
            first = false;
            continue;
        }
        first = false;
        if line.is_empty() {
            return Err(BloomdError::Protocol("empty line inside block".to_string()));
        }
        let (key, value) = entry(line)?;
        entries.insert(key, value);
    }
}

/// Maps a server error line to its error kind. Returns `None` for any line
/// that is not a recognised error reply.
fn reply_error(line: &str, filter: &str) -> Option<BloomdError> {
    if line == FILTER_NOT_FOUND {
        return Some(BloomdError::FilterNotFound(filter.to_string()));
    }
    if line == NOT_PROXIED {
        return Some(BloomdError::Command(line.to_string()));
    }
    line.strip_prefix(CLIENT_ERROR)
        .or_else(|| line.strip_prefix(INTERNAL_ERROR))
        .map(|message| {
            BloomdError::Command(message.trim_start_matches(':').trim().to_string())
        })
}

/// Reads one LF-terminated line and returns it with trailing whitespace
/// (including the optional CR) removed.
fn read_line<'b, R: BufRead>(reader: &mut R, buf: &'b mut Vec<u8>) -> BloomdResult<&'b str> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(BloomdError::ConnectionClosed);
    }
    if buf.last() != Some(&b'\n') {
        return Err(BloomdError::Protocol("truncated reply line".to_string()));
    }
    let line = std::str::from_utf8(buf)
        .map_err(|_| BloomdError::Protocol("reply is not valid UTF-8".to_string()))?;
    Ok(line.trim_end())
}

/// Appends a boolean-vector reply. Used by test servers.
pub fn encode_bools(values: &[bool], out: &mut Vec<u8>) {
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            out.push(b' ');
        }
        out.extend_from_slice(if *value { YES } else { NO }.as_bytes());
    }
    out.push(b'\n');
}

/// Appends a `START`/`END` block reply. Used by test servers.
pub fn encode_block<'a, I>(entries: I, out: &mut Vec<u8>)
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    out.extend_from_slice(START.as_bytes());
    out.push(b'\n');
    for (key, value) in entries {
        out.extend_from_slice(key.as_bytes());
        out.push(b' ');
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(END.as_bytes());
    out.push(b'\n');
}
