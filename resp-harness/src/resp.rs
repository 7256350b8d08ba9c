//! RESP wire codec.
//!
//! Commands are always sent as an array of bulk strings. Replies come back as
//! one of five tagged types, with arrays nesting recursively:
//!
//! ```text
//! +OK\r\n                    simple string
//! -ERR unknown\r\n           error
//! :42\r\n                    integer
//! $5\r\nhello\r\n            bulk string ($-1 is null)
//! *2\r\n$1\r\na\r\n:1\r\n    array (*-1 is null)
//! ```
//!
//! The decoder is synchronous and works on any [`BufRead`]; it never reads
//! past the end of the reply it was asked for.

use std::fmt;
use std::io::{BufRead, Read};

use crate::error::{HarnessError, Result};

const CRLF: &[u8] = b"\r\n";

/// Arrays larger than this are still decoded, just without an up-front allocation.
const MAX_PREALLOCATED_ITEMS: usize = 1024;
const MAX_PREALLOCATED_BYTES: usize = 64 * 1024;

/// Largest bulk payload accepted, matching the server's default `proto-max-bulk-len`.
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`), distinct from an empty payload.
    Bulk(Option<Vec<u8>>),
    /// `None` is the null array (`*-1`), distinct from an empty array.
    Array(Option<Vec<Response>>),
}

impl Response {
    /// Builds a non-null bulk string.
    pub fn bulk(payload: impl AsRef<[u8]>) -> Self {
        Response::Bulk(Some(payload.as_ref().to_vec()))
    }

    /// Builds an array of non-null bulk strings.
    pub fn bulk_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Response::Array(Some(items.into_iter().map(Response::bulk).collect()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Response::Bulk(None) | Response::Array(None))
    }

    /// Text of a simple string, error, or bulk string. Non-UTF-8 bytes are replaced.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Response::Simple(text) | Response::Error(text) => Some(text.clone()),
            Response::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Response::Bulk(Some(bytes)) => Some(bytes),
            Response::Simple(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Response::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Response]> {
        match self {
            Response::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        match self {
            Response::Simple(text) => write!(f, "{text}"),
            Response::Error(text) => write!(f, "(error) {text}"),
            Response::Integer(value) => write!(f, "(integer) {value}"),
            Response::Bulk(None) => write!(f, "(nil)"),
            Response::Bulk(Some(bytes)) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Response::Array(None) => write!(f, "(nil array)"),
            Response::Array(Some(items)) if items.is_empty() => write!(f, "(empty array)"),
            Response::Array(Some(items)) => {
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        write!(f, "\n{:indent$}", "")?;
                    }
                    let label = format!("{}) ", index + 1);
                    write!(f, "{label}")?;
                    item.render(f, indent + label.len())?;
                }
                Ok(())
            }
        }
    }
}

/// Renders like an interactive client would, nested arrays indented under their parent.
impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, 0)
    }
}

/// Encodes a command as an array of bulk strings.
///
/// Arguments are opaque bytes: nothing is escaped, so payloads containing
/// `\r\n` or type prefixes survive intact. An empty slice encodes as `*0\r\n`.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let payload: usize = args.iter().map(|arg| arg.as_ref().len() + 16).sum();
    let mut out = Vec::with_capacity(payload + 16);
    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);
    for arg in args {
        let arg = arg.as_ref();
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF);
    }
    out
}

/// Splits a whitespace-separated command line into arguments.
pub fn parse_command_line(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}

/// Reads exactly one reply from `reader`.
///
/// # Errors
/// - [`HarnessError::Protocol`] on an unknown type tag, a malformed length line, a bulk
///   length above [`MAX_BULK_LEN`], or a read timeout after the type tag arrived
/// - [`HarnessError::ConnectionClosed`] if the stream ends mid-reply
/// - [`HarnessError::Timeout`] if the socket read timed out before any byte of the reply
pub fn read_response<R: BufRead>(reader: &mut R) -> Result<Response> {
    let tag = read_byte(reader)?;
    // Part of the frame is already consumed, so the stream can no longer be resynchronised.
    read_body(reader, tag).map_err(|err| match err {
        HarnessError::Timeout(detail) => {
            HarnessError::Protocol(format!("timed out mid-frame: {detail}"))
        }
        other => other,
    })
}

fn read_body<R: BufRead>(reader: &mut R, tag: u8) -> Result<Response> {
    match tag {
        b'+' => Ok(Response::Simple(read_text_line(reader)?)),
        b'-' => Ok(Response::Error(read_text_line(reader)?)),
        b':' => Ok(Response::Integer(read_decimal_line(reader)?)),
        b'$' => read_bulk(reader),
        b'*' => read_array(reader),
        other => Err(HarnessError::Protocol(format!(
            "unknown type tag {:?} (0x{other:02x})",
            char::from(other)
        ))),
    }
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Accumulates bytes until a `\r\n` terminator; a bare `\n` is kept as data.
fn read_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 || !line.ends_with(b"\n") {
            return Err(HarnessError::ConnectionClosed);
        }
        if line.ends_with(CRLF) {
            line.truncate(line.len() - CRLF.len());
            return Ok(line);
        }
    }
}

fn read_text_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let line = read_line(reader)?;
    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn read_decimal_line<R: BufRead>(reader: &mut R) -> Result<i64> {
    let line = read_line(reader)?;
    std::str::from_utf8(&line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| {
            HarnessError::Protocol(format!(
                "invalid decimal line {:?}",
                String::from_utf8_lossy(&line)
            ))
        })
}

fn read_bulk<R: BufRead>(reader: &mut R) -> Result<Response> {
    let len = read_decimal_line(reader)?;
    if len == -1 {
        return Ok(Response::Bulk(None));
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_BULK_LEN)
        .ok_or_else(|| HarnessError::Protocol(format!("invalid bulk length {len}")))?;

    // Grow with the bytes that actually arrive rather than the declared length.
    let mut payload = Vec::with_capacity(len.min(MAX_PREALLOCATED_BYTES));
    (&mut *reader).take(len as u64).read_to_end(&mut payload)?;
    if payload.len() < len {
        return Err(HarnessError::ConnectionClosed);
    }
    let mut terminator = [0u8; 2];
    reader.read_exact(&mut terminator)?;
    if terminator != CRLF {
        return Err(HarnessError::Protocol(
            "bulk string missing trailing CRLF".to_string(),
        ));
    }
    Ok(Response::Bulk(Some(payload)))
}

fn read_array<R: BufRead>(reader: &mut R) -> Result<Response> {
    let count = read_decimal_line(reader)?;
    if count == -1 {
        return Ok(Response::Array(None));
    }
    let count = usize::try_from(count)
        .map_err(|_| HarnessError::Protocol(format!("invalid array length {count}")))?;

    let mut items = Vec::with_capacity(count.min(MAX_PREALLOCATED_ITEMS));
    for _ in 0..count {
        items.push(read_response(reader)?);
    }
    Ok(Response::Array(Some(items)))
}
