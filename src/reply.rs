// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;

use bytes::{Buf, Bytes};
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum ParseError {
    #[error("not enough data is available to parse an entire reply")]
    Incomplete,
    #[error("invalid reply type prefix: {0}")]
    InvalidPrefix(u8),
    #[error("malformed decimal field: {0}")]
    Format(String),
}

/// A single decoded server reply.
///
/// The first five variants map one-for-one onto the RESP wire grammar.
/// `Pass` and `Cancelled` are synthetic: `Pass` replaces a status reply
/// that matched a message's expected literal, and `Cancelled` completes
/// messages that never reached the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Status(Bytes),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Option<Vec<Reply>>),
    Pass,
    Cancelled,
}

impl Reply {
    /// Parse one reply from the cursor. On `ParseError::Incomplete` the
    /// cursor position is meaningless and the caller must retry with more
    /// data; on success the cursor sits one past the reply's final CRLF.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, ParseError> {
        // The first byte always identifies the reply type; the rest of the
        // frame is either CRLF-terminated inline or length-prefixed.
        let prefix = get_byte(src)?;

        match prefix {
            b'+' => {
                let line = get_line(src)?;
                Ok(Reply::Status(Bytes::copy_from_slice(line)))
            }
            b'-' => {
                let line = get_line(src)?;
                let text = String::from_utf8_lossy(line).into_owned();
                Ok(Reply::Error(text))
            }
            b':' => {
                let line = get_line(src)?;
                Ok(Reply::Integer(read_decimal(line)?))
            }
            // $<length>\r\n<data>\r\n, with $-1\r\n encoding nil.
            b'$' => {
                let line = get_line(src)?;
                let length = read_decimal(line)?;

                if length < 0 {
                    return Ok(Reply::Bulk(None));
                }

                let data = get_exact(src, length as usize)?;
                Ok(Reply::Bulk(Some(data)))
            }
            // *<count>\r\n<reply-1>...<reply-n>, with *-1\r\n encoding nil.
            b'*' => {
                let line = get_line(src)?;
                let count = read_decimal(line)?;

                if count < 0 {
                    return Ok(Reply::Array(None));
                }

                let mut replies = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    replies.push(Reply::parse(src)?);
                }

                Ok(Reply::Array(Some(replies)))
            }
            prefix => Err(ParseError::InvalidPrefix(prefix)),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Reply::Status(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'+');
                bytes.extend_from_slice(s);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'-');
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(b':');
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Bulk(Some(data)) => {
                let length = data.len().to_string();
                let mut bytes =
                    Vec::with_capacity(1 + length.len() + CRLF.len() * 2 + data.len());
                bytes.push(b'$');
                bytes.extend_from_slice(length.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Bulk(None) => b"$-1\r\n".to_vec(),
            Reply::Array(Some(replies)) => {
                let count = replies.len().to_string();
                let mut bytes = Vec::with_capacity(1 + count.len() + CRLF.len());
                bytes.push(b'*');
                bytes.extend_from_slice(count.as_bytes());
                bytes.extend_from_slice(CRLF);
                for reply in replies {
                    bytes.extend(reply.serialize());
                }
                bytes
            }
            Reply::Array(None) => b"*-1\r\n".to_vec(),
            // Synthetic variants never appear on the wire.
            Reply::Pass | Reply::Cancelled => Vec::new(),
        }
    }

    /// Short noun for diagnostics, e.g. "expected array, got integer".
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk",
            Reply::Array(_) => "array",
            Reply::Pass => "pass",
            Reply::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "+{}", String::from_utf8_lossy(s)),
            Reply::Error(s) => write!(f, "-{}", s),
            Reply::Integer(i) => write!(f, ":{}", i),
            Reply::Bulk(Some(data)) => write!(f, "${}", String::from_utf8_lossy(data)),
            Reply::Bulk(None) => write!(f, "$-1"),
            Reply::Array(Some(replies)) => {
                write!(f, "*{}", replies.len())?;
                for reply in replies {
                    write!(f, " {}", reply)?;
                }
                Ok(())
            }
            Reply::Array(None) => write!(f, "*-1"),
            Reply::Pass => write!(f, "(pass)"),
            Reply::Cancelled => write!(f, "(cancelled)"),
        }
    }
}

impl From<ParseError> for crate::Error {
    fn from(err: ParseError) -> crate::Error {
        crate::Error::Protocol(err.to_string())
    }
}

/// Decimal reader for `:`, `$` and `*` fields: an optional leading minus
/// followed by ASCII digits only. Anything else is a `Format` error.
fn read_decimal(line: &[u8]) -> Result<i64, ParseError> {
    let (negative, digits) = match line.first() {
        Some(b'-') => (true, &line[1..]),
        _ => (false, line),
    };

    if digits.is_empty() {
        return Err(ParseError::Format("empty decimal field".to_string()));
    }

    let mut value: i64 = 0;
    for &byte in digits {
        if !byte.is_ascii_digit() {
            return Err(ParseError::Format(format!(
                "unexpected byte {:#04x} in decimal field",
                byte
            )));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((byte - b'0') as i64))
            .ok_or_else(|| ParseError::Format("decimal field overflows i64".to_string()))?;
    }

    Ok(if negative { -value } else { value })
}

/// Slice up to the next CRLF and advance past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(ParseError::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

/// Slice exactly `length` payload bytes plus the trailing CRLF. Unlike
/// `get_line` this is binary safe: the payload may itself contain CRLF.
fn get_exact(src: &mut Cursor<&[u8]>, length: usize) -> Result<Bytes, ParseError> {
    let start = src.position() as usize;
    let total = length + CRLF.len();

    if src.get_ref().len() - start < total {
        return Err(ParseError::Incomplete);
    }

    let data = &src.get_ref()[start..start + length];
    if &src.get_ref()[start + length..start + total] != CRLF {
        return Err(ParseError::Format(
            "bulk payload not terminated by CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(data);
    src.set_position((start + total) as u64);
    Ok(data)
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    if !src.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    Ok(src.get_u8())
}
