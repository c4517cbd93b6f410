use bytes::{BufMut, Bytes, BytesMut};

/// RESP (REdis Serialization Protocol) reply types, RESP2 and RESP3.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String: +OK\r\n
    SimpleString(String),

    /// Error: -Error message\r\n
    Error(String),

    /// Integer: :1000\r\n
    Integer(i64),

    /// Bulk String: $6\r\nfoobar\r\n or $-1\r\n for null
    BulkString(Option<Bytes>),

    /// Array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n or *-1\r\n for null
    Array(Option<Vec<RespValue>>),

    /// RESP3 Null: _\r\n
    Null,

    /// RESP3 Boolean: #t\r\n
    Boolean(bool),

    /// RESP3 Double: ,3.14\r\n
    Double(f64),

    /// RESP3 Big number: (3492890328409238509324850943850943825024385\r\n
    BigNumber(String),

    /// RESP3 Bulk error: !21\r\nSYNTAX invalid syntax\r\n
    BulkError(String),

    /// RESP3 Verbatim string: =15\r\ntxt:Some string\r\n
    VerbatimString { format: String, data: Bytes },

    /// RESP3 Map: %2\r\n...
    Map(Vec<(RespValue, RespValue)>),

    /// RESP3 Set: ~2\r\n...
    Set(Vec<RespValue>),

    /// RESP3 Push: >2\r\n...
    Push(Vec<RespValue>),
}

impl RespValue {
    /// `+` reply.
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// An error reply such as `MOVED 3999 127.0.0.1:6381`.
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// `$` reply.
    pub fn bulk_string(s: impl Into<Bytes>) -> Self {
        RespValue::BulkString(Some(s.into()))
    }

    /// `*` reply.
    pub fn array(arr: Vec<RespValue>) -> Self {
        RespValue::Array(Some(arr))
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Error text of an error reply, for both RESP2 and RESP3 error forms.
    pub fn as_error(&self) -> Option<&str> {
        match self {
            RespValue::Error(e) | RespValue::BulkError(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this is any of the null encodings.
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            RespValue::Null | RespValue::BulkString(None) | RespValue::Array(None)
        )
    }

    /// Integer payload, accepting numeric bulk strings as well.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            RespValue::BulkString(Some(b)) => std::str::from_utf8(b).ok()?.parse().ok(),
            RespValue::SimpleString(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Raw bytes of string-like replies.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            RespValue::BulkString(Some(b)) => Some(b),
            RespValue::VerbatimString { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Elements of aggregate replies.
    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(Some(items)) | RespValue::Set(items) | RespValue::Push(items) => {
                Some(items)
            }
            _ => None,
        }
    }

    /// Serialize to RESP format bytes
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, b'+', s.as_bytes()),
            RespValue::Error(e) => write_line(buf, b'-', e.as_bytes()),
            RespValue::Integer(i) => write_line(buf, b':', i.to_string().as_bytes()),
            RespValue::BulkString(None) => buf.put_slice(b"$-1\r\n"),
            RespValue::BulkString(Some(s)) => write_bulk(buf, b'$', s),
            RespValue::Array(None) => buf.put_slice(b"*-1\r\n"),
            RespValue::Array(Some(items)) => write_aggregate(buf, b'*', items),
            RespValue::Null => buf.put_slice(b"_\r\n"),
            RespValue::Boolean(b) => write_line(buf, b'#', if *b { b"t" } else { b"f" }),
            RespValue::Double(d) => {
                let text = if d.is_infinite() {
                    if d.is_sign_positive() { "inf".to_string() } else { "-inf".to_string() }
                } else {
                    d.to_string()
                };
                write_line(buf, b',', text.as_bytes())
            }
            RespValue::BigNumber(n) => write_line(buf, b'(', n.as_bytes()),
            RespValue::BulkError(e) => write_bulk(buf, b'!', e.as_bytes()),
            RespValue::VerbatimString { format, data } => {
                let mut content = Vec::with_capacity(format.len() + 1 + data.len());
                content.extend_from_slice(format.as_bytes());
                content.push(b':');
                content.extend_from_slice(data);
                write_bulk(buf, b'=', &content)
            }
            RespValue::Map(pairs) => {
                write_line(buf, b'%', pairs.len().to_string().as_bytes());
                for (k, v) in pairs {
                    k.write_to(buf);
                    v.write_to(buf);
                }
            }
            RespValue::Set(items) => write_aggregate(buf, b'~', items),
            RespValue::Push(items) => write_aggregate(buf, b'>', items),
        }
    }
}

fn write_line(buf: &mut BytesMut, marker: u8, body: &[u8]) {
    buf.put_u8(marker);
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
}

fn write_bulk(buf: &mut BytesMut, marker: u8, body: &[u8]) {
    write_line(buf, marker, body.len().to_string().as_bytes());
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
}

fn write_aggregate(buf: &mut BytesMut, marker: u8, items: &[RespValue]) {
    write_line(buf, marker, items.len().to_string().as_bytes());
    for item in items {
        item.write_to(buf);
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    write_line(&mut buf, b'*', args.len().to_string().as_bytes());
    for arg in args {
        write_bulk(&mut buf, b'$', arg);
    }
    buf.freeze()
}
