//! HTTP/1.1 request parsing using the [`httparse`] crate.
//!
//! The engine feeds buffered connection bytes through [`Request::parse`] once
//! per read tick. Body framing uses `Content-Length` (absent means empty), so
//! a single call answers the only question the engine has: is a complete
//! request available, and if so, how many buffered bytes did it consume.

use std::str;

use bytes::Bytes;
use thiserror::Error;

use super::{Headers, Method};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. The body is stored
/// as a [`Bytes`] buffer.
///
/// # Examples
///
/// ```
/// use embhttp::http::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, consumed) = Request::parse(raw).unwrap().unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query(), Some("name=world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// assert_eq!(consumed, raw.len());
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    path: String,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
}

impl Request {
    /// Maximum number of headers scanned per request. Headers beyond this
    /// bound make the request unparseable (`httparse::Error::TooManyHeaders`),
    /// mirroring the fixed header table of the wire-level engine contract.
    const MAX_HEADERS: usize = 64;

    /// Parses one HTTP/1.1 request from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// request (headers still arriving, or the `Content-Length` body is
    /// short) — the caller should read more bytes and retry. On success
    /// returns the request and the total number of bytes consumed from
    /// `buf`, including the body.
    ///
    /// # Errors
    ///
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — a required field (method, path) is absent.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let header_end = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Ok(None),
        };

        let method: Method = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse()
            .unwrap(); // Infallible

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.find('?') {
            Some(pos) => (
                raw_path[..pos].to_owned(),
                Some(raw_path[pos + 1..].to_owned()),
            ),
            None => (raw_path.to_owned(), None),
        };

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let content_length: usize = header_map
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let total = header_end + content_length;
        if buf.len() < total {
            return Ok(None);
        }

        let body = Bytes::copy_from_slice(&buf[header_end..total]);

        Ok(Some((
            Self {
                method,
                path,
                headers: header_map,
                query,
                body,
            },
            total,
        )))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the request body bytes. May be empty.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}
