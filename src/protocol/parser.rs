use super::types::RespValue;
use crate::error::{ClusterError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::io::Cursor;

/// Outcome of decoding one frame from the buffered bytes.
enum Decode {
    Incomplete,
    Invalid(String),
}

type DecodeResult<T> = std::result::Result<T, Decode>;

/// Incremental RESP reply parser.
///
/// Bytes read from the socket are appended with [`RespParser::feed`] (or
/// directly through [`RespParser::buffer_mut`]); [`RespParser::parse`] yields
/// a complete reply once enough bytes have arrived and leaves any trailing
/// bytes buffered for the next reply.
pub struct RespParser {
    buffer: BytesMut,
}

impl RespParser {
    /// Parser with an initial buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Buffer to read into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Try to parse a complete RESP value from the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed, and a protocol error when
    /// the buffered bytes can never form a valid reply.
    pub fn parse(&mut self) -> Result<Option<RespValue>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.buffer[..]);
        match parse_value(&mut cursor) {
            Ok(value) => {
                let pos = cursor.position() as usize;
                self.buffer.advance(pos);
                Ok(Some(value))
            }
            Err(Decode::Incomplete) => Ok(None),
            Err(Decode::Invalid(msg)) => Err(ClusterError::Protocol(msg)),
        }
    }
}

fn parse_value(cursor: &mut Cursor<&[u8]>) -> DecodeResult<RespValue> {
    let pos = cursor.position() as usize;
    let marker = *cursor.get_ref().get(pos).ok_or(Decode::Incomplete)?;
    cursor.set_position((pos + 1) as u64);

    match marker {
        b'+' => Ok(RespValue::SimpleString(read_line(cursor)?)),
        b'-' => Ok(RespValue::Error(read_line(cursor)?)),
        b':' => Ok(RespValue::Integer(read_number(cursor, "integer")?)),
        b'$' => match read_length(cursor, "bulk string")? {
            None => Ok(RespValue::BulkString(None)),
            Some(len) => Ok(RespValue::BulkString(Some(read_blob(cursor, len)?))),
        },
        b'*' => match read_length(cursor, "array")? {
            None => Ok(RespValue::Array(None)),
            Some(len) => Ok(RespValue::Array(Some(read_items(cursor, len)?))),
        },
        b'_' => {
            read_line(cursor)?;
            Ok(RespValue::Null)
        }
        b'#' => match read_line(cursor)?.as_str() {
            "t" => Ok(RespValue::Boolean(true)),
            "f" => Ok(RespValue::Boolean(false)),
            other => Err(Decode::Invalid(format!("Invalid boolean: {}", other))),
        },
        b',' => {
            let line = read_line(cursor)?;
            let value = match line.as_str() {
                "inf" => f64::INFINITY,
                "-inf" => f64::NEG_INFINITY,
                _ => line
                    .parse::<f64>()
                    .map_err(|_| Decode::Invalid(format!("Invalid double: {}", line)))?,
            };
            Ok(RespValue::Double(value))
        }
        b'(' => Ok(RespValue::BigNumber(read_line(cursor)?)),
        b'!' => {
            let len = required_length(cursor, "bulk error")?;
            let blob = read_blob(cursor, len)?;
            Ok(RespValue::BulkError(String::from_utf8_lossy(&blob).to_string()))
        }
        b'=' => {
            let len = required_length(cursor, "verbatim string")?;
            let blob = read_blob(cursor, len)?;
            let colon = blob
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| Decode::Invalid("Invalid verbatim string format".to_string()))?;
            Ok(RespValue::VerbatimString {
                format: String::from_utf8_lossy(&blob[..colon]).to_string(),
                data: blob.slice(colon + 1..),
            })
        }
        b'%' => {
            let len = required_length(cursor, "map")?;
            let mut pairs = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                let key = parse_value(cursor)?;
                let value = parse_value(cursor)?;
                pairs.push((key, value));
            }
            Ok(RespValue::Map(pairs))
        }
        b'~' => {
            let len = required_length(cursor, "set")?;
            Ok(RespValue::Set(read_items(cursor, len)?))
        }
        b'>' => {
            let len = required_length(cursor, "push")?;
            Ok(RespValue::Push(read_items(cursor, len)?))
        }
        // Attributes carry out-of-band metadata; the client only needs the reply
        b'|' => {
            let len = required_length(cursor, "attribute")?;
            for _ in 0..len * 2 {
                parse_value(cursor)?;
            }
            parse_value(cursor)
        }
        other => Err(Decode::Invalid(format!(
            "Invalid RESP type marker: {}",
            other as char
        ))),
    }
}

fn read_line(cursor: &mut Cursor<&[u8]>) -> DecodeResult<String> {
    let start = cursor.position() as usize;
    let data = *cursor.get_ref();
    if start >= data.len() {
        return Err(Decode::Incomplete);
    }

    let end = data[start..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or(Decode::Incomplete)?;
    let line = String::from_utf8_lossy(&data[start..start + end]).to_string();
    cursor.set_position((start + end + 2) as u64);
    Ok(line)
}

fn read_number(cursor: &mut Cursor<&[u8]>, what: &str) -> DecodeResult<i64> {
    let line = read_line(cursor)?;
    line.parse::<i64>()
        .map_err(|_| Decode::Invalid(format!("Invalid {}: {}", what, line)))
}

/// Length header where -1 encodes null.
fn read_length(cursor: &mut Cursor<&[u8]>, what: &str) -> DecodeResult<Option<usize>> {
    match read_number(cursor, what)? {
        -1 => Ok(None),
        len if len < 0 => Err(Decode::Invalid(format!("Invalid {} length: {}", what, len))),
        len => Ok(Some(len as usize)),
    }
}

fn required_length(cursor: &mut Cursor<&[u8]>, what: &str) -> DecodeResult<usize> {
    read_length(cursor, what)?
        .ok_or_else(|| Decode::Invalid(format!("Invalid {} length: -1", what)))
}

fn read_blob(cursor: &mut Cursor<&[u8]>, len: usize) -> DecodeResult<Bytes> {
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    if pos + len + 2 > data.len() {
        return Err(Decode::Incomplete);
    }
    if &data[pos + len..pos + len + 2] != b"\r\n" {
        return Err(Decode::Invalid("Missing CRLF after bulk payload".to_string()));
    }

    let blob = Bytes::copy_from_slice(&data[pos..pos + len]);
    cursor.set_position((pos + len + 2) as u64);
    Ok(blob)
}

fn read_items(cursor: &mut Cursor<&[u8]>, len: usize) -> DecodeResult<Vec<RespValue>> {
    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        items.push(parse_value(cursor)?);
    }
    Ok(items)
}
