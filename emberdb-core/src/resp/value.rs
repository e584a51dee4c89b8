//! Parsed response values

use bytes::Bytes;

/// A single reply from the master
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+text\r\n`
    Simple(String),
    /// `-message\r\n`
    Error(String),
    /// `:n\r\n`
    Integer(i64),
    /// `$len\r\npayload\r\n`
    Bulk(Bytes),
    /// `$-1\r\n` or `*-1\r\n`
    Null,
    /// `*count\r\n...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Text of a simple string or bulk string reply, if valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RespValue::Simple(s) => Some(s.as_str()),
            RespValue::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw bytes of a bulk string reply.
    pub fn as_bulk(&self) -> Option<&Bytes> {
        match self {
            RespValue::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Integer payload of an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Whether this reply is the given simple/bulk string (exact match).
    pub fn is_text(&self, expected: &str) -> bool {
        self.as_text() == Some(expected)
    }
}
