//! Resumable response parser
//!
//! `parse_value` attempts to decode one complete reply from the front of
//! a buffer. `Ok(None)` means the buffer holds only a prefix of a reply;
//! the caller reads more bytes and calls again. Nothing is consumed
//! until a whole reply is available, so the buffer itself carries all
//! partial-parse state.

use super::value::RespValue;
use crate::error::ReplicaError;
use bytes::Bytes;

/// Upper bound on a single bulk payload. Replies larger than this are
/// treated as framing corruption rather than buffered indefinitely.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on array arity for the same reason.
const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Try to parse one reply from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied, `None` if the
/// buffer does not yet hold a complete reply, or `BadMessage` on a
/// protocol violation.
pub fn parse_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>, ReplicaError> {
    let Some(&prefix) = buf.first() else {
        return Ok(None);
    };

    match prefix {
        b'+' => parse_line(buf).map(|opt| {
            opt.map(|(line, used)| (RespValue::Simple(String::from_utf8_lossy(line).into_owned()), used))
        }),
        b'-' => parse_line(buf).map(|opt| {
            opt.map(|(line, used)| (RespValue::Error(String::from_utf8_lossy(line).into_owned()), used))
        }),
        b':' => {
            let Some((line, used)) = parse_line(buf)? else {
                return Ok(None);
            };
            let n = parse_int(line)?;
            Ok(Some((RespValue::Integer(n), used)))
        }
        b'$' => parse_bulk(buf),
        b'*' => parse_array(buf),
        other => Err(ReplicaError::BadMessage(format!(
            "unexpected reply prefix byte 0x{other:02x}"
        ))),
    }
}

/// Payload of a `+`/`-`/`:`/`$`/`*` header line, excluding the prefix
/// byte and the `\r\n` terminator, plus total bytes consumed.
fn parse_line(buf: &[u8]) -> Result<Option<(&[u8], usize)>, ReplicaError> {
    match find_crlf(&buf[1..])? {
        Some(pos) => Ok(Some((&buf[1..1 + pos], 1 + pos + 2))),
        None => Ok(None),
    }
}

/// Position of `\r\n` in `buf`. A `\n` not preceded by `\r` is a
/// framing violation.
fn find_crlf(buf: &[u8]) -> Result<Option<usize>, ReplicaError> {
    match buf.iter().position(|&b| b == b'\n') {
        Some(0) => Err(ReplicaError::BadMessage("line feed without carriage return".into())),
        Some(nl) => {
            if buf[nl - 1] == b'\r' {
                Ok(Some(nl - 1))
            } else {
                Err(ReplicaError::BadMessage("line feed without carriage return".into()))
            }
        }
        None => Ok(None),
    }
}

fn parse_int(line: &[u8]) -> Result<i64, ReplicaError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ReplicaError::BadMessage("non-ascii integer reply".into()))?;
    text.parse::<i64>()
        .map_err(|_| ReplicaError::BadMessage(format!("bad integer reply: {text:?}")))
}

fn parse_bulk(buf: &[u8]) -> Result<Option<(RespValue, usize)>, ReplicaError> {
    let Some((line, header_len)) = parse_line(buf)? else {
        return Ok(None);
    };
    let len = parse_int(line)?;

    if len == -1 {
        return Ok(Some((RespValue::Null, header_len)));
    }
    if len < 0 || len > MAX_BULK_LEN {
        return Err(ReplicaError::BadMessage(format!("bad bulk length {len}")));
    }

    let len = len as usize;
    let total = header_len + len + 2;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header_len + len..total] != b"\r\n" {
        return Err(ReplicaError::BadMessage("bulk payload not CRLF-terminated".into()));
    }

    let payload = Bytes::copy_from_slice(&buf[header_len..header_len + len]);
    Ok(Some((RespValue::Bulk(payload), total)))
}

fn parse_array(buf: &[u8]) -> Result<Option<(RespValue, usize)>, ReplicaError> {
    let Some((line, header_len)) = parse_line(buf)? else {
        return Ok(None);
    };
    let count = parse_int(line)?;

    if count == -1 {
        return Ok(Some((RespValue::Null, header_len)));
    }
    if count < 0 || count > MAX_ARRAY_LEN {
        return Err(ReplicaError::BadMessage(format!("bad array length {count}")));
    }

    let mut items = Vec::with_capacity(count as usize);
    let mut used = header_len;
    for _ in 0..count {
        match parse_value(&buf[used..])? {
            Some((item, item_len)) => {
                items.push(item);
                used += item_len;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), used)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string() {
        let (value, used) = parse_value(b"+PONG\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Simple("PONG".into()));
        assert_eq!(used, 7);
    }

    #[test]
    fn test_error_reply() {
        let (value, _) = parse_value(b"-ERR unknown command\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Error("ERR unknown command".into()));
    }

    #[test]
    fn test_integer() {
        let (value, used) = parse_value(b":1024\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Integer(1024));
        assert_eq!(used, 7);
    }

    #[test]
    fn test_bulk_string() {
        let (value, used) = parse_value(b"$5\r\nhello\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Bulk(Bytes::from_static(b"hello")));
        assert_eq!(used, 11);
    }

    #[test]
    fn test_null_bulk() {
        let (value, _) = parse_value(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::Null);
    }

    #[test]
    fn test_array() {
        let input = b"*3\r\n$4\r\nabcd\r\n$5\r\nsess1\r\n:4\r\n";
        let (value, used) = parse_value(input).unwrap().unwrap();
        assert_eq!(used, input.len());
        match value {
            RespValue::Array(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0], RespValue::Bulk(Bytes::from_static(b"abcd")));
                assert_eq!(items[2], RespValue::Integer(4));
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_inputs() {
        assert!(parse_value(b"").unwrap().is_none());
        assert!(parse_value(b"+PON").unwrap().is_none());
        assert!(parse_value(b"$5\r\nhel").unwrap().is_none());
        assert!(parse_value(b"*2\r\n$1\r\na\r\n").unwrap().is_none());
    }

    #[test]
    fn test_trailing_bytes_not_consumed() {
        let (_, used) = parse_value(b"+OK\r\n+PONG\r\n").unwrap().unwrap();
        assert_eq!(used, 5);
    }

    #[test]
    fn test_bad_prefix() {
        assert!(matches!(
            parse_value(b"hello\r\n"),
            Err(ReplicaError::BadMessage(_))
        ));
    }

    #[test]
    fn test_lone_line_feed() {
        assert!(matches!(
            parse_value(b"+PONG\n"),
            Err(ReplicaError::BadMessage(_))
        ));
    }

    #[test]
    fn test_negative_bulk_length() {
        assert!(matches!(
            parse_value(b"$-7\r\n"),
            Err(ReplicaError::BadMessage(_))
        ));
    }

    #[test]
    fn test_bulk_missing_terminator() {
        assert!(matches!(
            parse_value(b"$3\r\nabcXY"),
            Err(ReplicaError::BadMessage(_))
        ));
    }
}
