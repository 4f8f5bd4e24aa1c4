//! HTTP/1.1 reply and chunk wire encoders.
//!
//! Pure byte-level encoders behind the three emission protocols: full reply,
//! chunked streaming, and the header-only variant used for HEAD responses in
//! static file delegation. The connection table appends the encoded bytes to
//! a connection's write buffer; nothing here touches a socket.

use bytes::{BufMut, BytesMut};

use super::{Headers, reason_phrase};

/// Preamble written by the `begin` phase of a chunked reply: a fixed 200
/// status line with `Transfer-Encoding: chunked` and no body yet.
pub const CHUNKED_PREAMBLE: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";

/// Terminating zero-length chunk written by the `end` phase.
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Encodes a full reply: status line, the header mapping in iteration order,
/// `Content-Length` (always written, always last), blank line, body.
///
/// # Examples
///
/// ```
/// use embhttp::http::{Headers, response::encode_reply};
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/plain");
/// let bytes = encode_reply(200, &headers, b"ok");
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 2\r\n"));
/// assert!(text.ends_with("\r\n\r\nok"));
/// ```
pub fn encode_reply(status: u16, headers: &Headers, body: &[u8]) -> BytesMut {
    let mut buf = reply_head(status, headers, body.len());
    buf.put(body);
    buf
}

/// Encodes a header-only reply carrying the given `Content-Length` but no
/// body bytes. Used for HEAD responses where the length must describe the
/// representation that was not sent.
pub fn encode_header_only(status: u16, headers: &Headers, content_length: usize) -> BytesMut {
    reply_head(status, headers, content_length)
}

/// Encodes one chunk of a chunked reply: hex length, CRLF, data, CRLF.
///
/// Callers must not pass empty data — the zero-length chunk is the stream
/// terminator, written via [`CHUNKED_TERMINATOR`].
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.put(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}

fn reply_head(status: u16, headers: &Headers, content_length: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + headers.len() * 64 + content_length);

    buf.put(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes());

    for (name, value) in headers.iter() {
        buf.put(format!("{name}: {value}\r\n").as_bytes());
    }

    // Content-Length is always the last header before the blank line
    buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
    buf.put(&b"\r\n"[..]);

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Strips the chunked framing from a raw chunk stream, returning the
    /// reassembled payload. Panics on malformed framing.
    fn dechunk(mut stream: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        loop {
            let line_end = stream
                .windows(2)
                .position(|w| w == b"\r\n")
                .expect("chunk size line");
            let size = usize::from_str_radix(
                std::str::from_utf8(&stream[..line_end]).unwrap(),
                16,
            )
            .unwrap();
            stream = &stream[line_end + 2..];
            if size == 0 {
                assert_eq!(stream, b"\r\n", "terminator trailer");
                return payload;
            }
            payload.extend_from_slice(&stream[..size]);
            assert_eq!(&stream[size..size + 2], b"\r\n");
            stream = &stream[size + 2..];
        }
    }

    #[test]
    fn reply_status_line_and_body() {
        let s = to_string(encode_reply(200, &Headers::new(), b"ok"));
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 2\r\n"));
        assert!(s.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn reply_preserves_mapping_order() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("X-Id", "7");
        let s = to_string(encode_reply(200, &headers, b"ok"));
        let ct = s.find("Content-Type: text/plain\r\n").unwrap();
        let id = s.find("X-Id: 7\r\n").unwrap();
        assert!(ct < id);
    }

    #[test]
    fn reply_with_empty_body() {
        let s = to_string(encode_reply(500, &Headers::new(), b""));
        assert!(s.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(s.contains("Content-Length: 0\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn unknown_status_gets_fallback_phrase() {
        let s = to_string(encode_reply(599, &Headers::new(), b""));
        assert!(s.starts_with("HTTP/1.1 599 Unknown\r\n"));
    }

    #[test]
    fn header_only_reply_carries_length_without_body() {
        let s = to_string(encode_header_only(200, &Headers::new(), 1234));
        assert!(s.contains("Content-Length: 1234\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunk_uses_hex_length() {
        let s = to_string(encode_chunk(&[0u8; 26]));
        assert!(s.starts_with("1a\r\n"));
        assert!(s.ends_with("\r\n"));
    }

    #[test]
    fn chunk_stream_reassembles_to_payload() {
        let mut stream = Vec::new();
        for part in [&b"alpha"[..], b"beta", b"gamma"] {
            stream.extend_from_slice(&encode_chunk(part));
        }
        stream.extend_from_slice(CHUNKED_TERMINATOR);
        assert_eq!(dechunk(&stream), b"alphabetagamma");
    }

    #[test]
    fn chunked_preamble_has_no_body_framing() {
        let s = std::str::from_utf8(CHUNKED_PREAMBLE).unwrap();
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }
}
