use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const DELIMITER: &[u8] = b"\r\n";
pub(crate) const PING: &[u8] = b"ping";

mod connection;
pub use connection::Connection;
pub(crate) use connection::FrameReader;

/// Splits the next complete frame off the front of `buffer`.
///
/// Returns `Ok(None)` while the delimiter has not arrived yet. `scanned` holds
/// how much of `buffer` is already known to contain no delimiter, so bytes
/// arriving in small pieces are only searched once. A frame (or an undelimited
/// prefix) longer than `max_frame_size` is a protocol error.
pub(crate) fn parse_frame(
    buffer: &mut BytesMut,
    scanned: &mut usize,
    max_frame_size: usize,
) -> Result<Option<Bytes>> {
    // the delimiter may straddle the previous end of the buffer.
    let start = (*scanned).min(buffer.len()).saturating_sub(DELIMITER.len() - 1);
    let Some(pos) = buffer[start..]
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
        .map(|pos| start + pos)
    else {
        // a trailing partial delimiter does not count against the limit.
        if buffer.len() > max_frame_size + DELIMITER.len() - 1 {
            return Err(Error::new(
                ErrorKind::TcpParseMsgFailed,
                format!("frame is too long: {} without delimiter", buffer.len()),
            ));
        }
        *scanned = buffer.len();
        return Ok(None);
    };
    *scanned = 0;

    if pos > max_frame_size {
        return Err(Error::new(
            ErrorKind::TcpParseMsgFailed,
            format!("frame is too long: {pos}"),
        ));
    }

    let frame = buffer.split_to(pos).freeze();
    let _ = buffer.split_to(DELIMITER.len());
    Ok(Some(frame))
}

/// Encodes `payload` as one JSON frame terminated by the delimiter.
pub(crate) fn encode_frame<P: Serialize>(payload: &P, max_frame_size: usize) -> Result<Bytes> {
    let mut bytes = BytesMut::with_capacity(256).writer();
    serde_json::to_writer(&mut bytes, payload)
        .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?;
    let mut bytes = bytes.into_inner();
    if bytes.len() > max_frame_size {
        return Err(Error::new(
            ErrorKind::SerializeFailed,
            format!("frame is too long: {}", bytes.len()),
        ));
    }
    bytes.extend_from_slice(DELIMITER);
    Ok(bytes.freeze())
}

pub(crate) fn ping_frame() -> Bytes {
    let mut bytes = BytesMut::with_capacity(PING.len() + DELIMITER.len());
    bytes.extend_from_slice(PING);
    bytes.extend_from_slice(DELIMITER);
    bytes.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(buffer: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
        let mut scanned = 0;
        parse_frame(buffer, &mut scanned, max_frame_size)
    }

    #[test]
    fn test_parse_frames() {
        let mut scanned = 0;
        let mut buffer = BytesMut::from(&b"ping\r\n{\"id\":1}\r\n{\"id\""[..]);
        let frame = parse_frame(&mut buffer, &mut scanned, 1024).unwrap();
        assert_eq!(frame.unwrap(), &b"ping"[..]);
        let frame = parse_frame(&mut buffer, &mut scanned, 1024).unwrap();
        assert_eq!(frame.unwrap(), &b"{\"id\":1}"[..]);
        assert!(parse_frame(&mut buffer, &mut scanned, 1024).unwrap().is_none());
        assert_eq!(scanned, buffer.len());

        buffer.extend_from_slice(b":2}\r");
        assert!(parse_frame(&mut buffer, &mut scanned, 1024).unwrap().is_none());
        buffer.extend_from_slice(b"\n");
        let frame = parse_frame(&mut buffer, &mut scanned, 1024).unwrap();
        assert_eq!(frame.unwrap(), &b"{\"id\":2}"[..]);
        assert!(buffer.is_empty());
        assert_eq!(scanned, 0);
    }

    #[test]
    fn test_incremental_scan() {
        let body = "x".repeat(64 << 10);
        let mut scanned = 0;
        let mut buffer = BytesMut::new();
        for chunk in body.as_bytes().chunks(1024) {
            buffer.extend_from_slice(chunk);
            assert!(parse_frame(&mut buffer, &mut scanned, 1 << 20).unwrap().is_none());
            assert_eq!(scanned, buffer.len());
        }
        buffer.extend_from_slice(b"\r");
        assert!(parse_frame(&mut buffer, &mut scanned, 1 << 20).unwrap().is_none());
        buffer.extend_from_slice(b"\nping\r\n");
        let frame = parse_frame(&mut buffer, &mut scanned, 1 << 20).unwrap();
        assert_eq!(frame.unwrap(), body.as_bytes());
        let frame = parse_frame(&mut buffer, &mut scanned, 1 << 20).unwrap();
        assert_eq!(frame.unwrap(), &b"ping"[..]);
    }

    #[test]
    fn test_frame_size_limit() {
        let mut buffer = BytesMut::from(&b"0123456789"[..]);
        let err = parse(&mut buffer, 8).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TcpParseMsgFailed);

        let mut buffer = BytesMut::from(&b"0123456789\r\n"[..]);
        assert!(parse(&mut buffer, 8).is_err());
    }

    #[test]
    fn test_full_frame_split_inside_delimiter() {
        let mut scanned = 0;
        let mut buffer = BytesMut::from(&b"12345678\r"[..]);
        assert!(parse_frame(&mut buffer, &mut scanned, 8).unwrap().is_none());
        buffer.extend_from_slice(b"\n");
        let frame = parse_frame(&mut buffer, &mut scanned, 8).unwrap();
        assert_eq!(frame.unwrap(), &b"12345678"[..]);

        let mut buffer = BytesMut::from(&b"1234567890"[..]);
        assert!(parse(&mut buffer, 8).is_err());
    }

    #[test]
    fn test_encode_frame() {
        let bytes = encode_frame(&serde_json::json!({"id": 1}), 1024).unwrap();
        assert_eq!(&bytes[..], b"{\"id\":1}\r\n");
        assert!(encode_frame(&"x".repeat(64), 16).is_err());
        assert_eq!(&ping_frame()[..], b"ping\r\n");
    }
}
