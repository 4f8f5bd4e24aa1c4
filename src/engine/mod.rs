//! Non-blocking HTTP engine: sockets, readiness polling, and buffered I/O.
//!
//! The engine owns the listening socket and every live connection. It is
//! driven one bounded tick at a time through [`Engine::poll`]: wait for
//! readiness (via the [`polling`] crate), accept pending connections, read
//! and parse per-connection input, deliver [`EventSink`] callbacks, and
//! flush buffered output. Nothing in here blocks beyond the poll timeout.
//!
//! Response emission goes through [`ConnTable`], which only appends encoded
//! bytes to a connection's write buffer — the actual socket writes happen on
//! subsequent ticks. All emission calls are silent no-ops for connection ids
//! the table no longer knows, so late replies against closed peers are safe.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use polling::{Event as PollEvent, Events, Poller};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::http::response::{CHUNKED_PREAMBLE, CHUNKED_TERMINATOR, encode_chunk, encode_reply};
use crate::http::{Headers, Method, Request, response};

/// Poller key reserved for the listening socket. Connection ids start above it.
const LISTENER_KEY: usize = 0;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("poll failed: {0}")]
    Poll(#[from] io::Error),
}

/// Identifier of one live connection.
///
/// Engine-assigned and monotonic within a process run, so the default engine
/// never reuses an id. Consumers must only rely on ids being unique while
/// the connection is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    /// Wraps a raw identifier value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    fn key(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiver of engine events, implemented by the bridge core.
///
/// `on_message` hands over the live connection table so the sink can emit a
/// response re-entrantly, from within the same poll tick that parsed the
/// request.
pub trait EventSink {
    /// One complete HTTP request arrived on connection `id`.
    fn on_message(&mut self, conns: &mut ConnTable, id: ConnId, request: Request);

    /// Connection `id` closed (peer EOF or I/O failure) and was removed.
    fn on_close(&mut self, id: ConnId);
}

struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

/// The engine's map of live connections, keyed by [`ConnId`].
///
/// All emission operations buffer encoded bytes for the flush phase of the
/// next poll tick and silently ignore unknown ids.
pub struct ConnTable {
    map: HashMap<ConnId, Connection>,
}

impl ConnTable {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Returns `true` if the engine currently tracks connection `id`.
    pub fn contains(&self, id: ConnId) -> bool {
        self.map.contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns `true` if no connections are live.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Buffers a full reply: status, header mapping in iteration order, body.
    ///
    /// A header mapping that cannot be serialized as wire lines degrades to
    /// a 500 reply with an empty body.
    pub fn reply(&mut self, id: ConnId, status: u16, headers: &Headers, body: &[u8]) {
        let Some(conn) = self.map.get_mut(&id) else {
            debug!(conn = %id, "reply to unknown connection ignored");
            return;
        };
        if headers.is_wire_safe() {
            conn.write_buf.extend_from_slice(&encode_reply(status, headers, body));
        } else {
            warn!(conn = %id, "malformed header mapping — degrading to empty 500");
            conn.write_buf
                .extend_from_slice(&encode_reply(500, &Headers::new(), b""));
        }
    }

    /// Buffers the chunked-reply preamble (fixed 200 status line plus
    /// `Transfer-Encoding: chunked`).
    pub fn chunk_begin(&mut self, id: ConnId) {
        let Some(conn) = self.map.get_mut(&id) else {
            debug!(conn = %id, "chunk_begin to unknown connection ignored");
            return;
        };
        conn.write_buf.extend_from_slice(CHUNKED_PREAMBLE);
    }

    /// Buffers one chunk of caller-supplied bytes. Empty data is skipped —
    /// a zero-length chunk would terminate the stream early.
    pub fn chunk_send(&mut self, id: ConnId, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(conn) = self.map.get_mut(&id) else {
            debug!(conn = %id, "chunk_send to unknown connection ignored");
            return;
        };
        conn.write_buf.extend_from_slice(&encode_chunk(data));
    }

    /// Buffers the terminating zero-length chunk.
    pub fn chunk_end(&mut self, id: ConnId) {
        let Some(conn) = self.map.get_mut(&id) else {
            debug!(conn = %id, "chunk_end to unknown connection ignored");
            return;
        };
        conn.write_buf.extend_from_slice(CHUNKED_TERMINATOR);
    }

    /// Serves a static file as a full reply with an extension-derived
    /// `Content-Type`. A file that cannot be read degrades to a 404 reply.
    /// HEAD requests receive the header block and length only.
    pub fn serve_file(&mut self, id: ConnId, request: &Request, path: &Path) {
        if !self.map.contains_key(&id) {
            debug!(conn = %id, "serve_file to unknown connection ignored");
            return;
        }
        match fs::read(path) {
            Ok(body) => {
                let mut headers = Headers::new();
                headers.insert("Content-Type", mime_for(path));
                if *request.method() == Method::Head {
                    let head = response::encode_header_only(200, &headers, body.len());
                    if let Some(conn) = self.map.get_mut(&id) {
                        conn.write_buf.extend_from_slice(&head);
                    }
                } else {
                    self.reply(id, 200, &headers, &body);
                }
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "serve_file failed");
                self.reply(id, 404, &Headers::new(), b"Not Found");
            }
        }
    }

    /// Bytes currently buffered for transmission on `id`, for inspection in
    /// crate-internal tests.
    #[cfg(test)]
    pub(crate) fn buffered_output(&self, id: ConnId) -> Option<&[u8]> {
        self.map.get(&id).map(|c| c.write_buf.as_ref())
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&mut self, id: ConnId, stream: TcpStream) {
        self.map.insert(
            id,
            Connection {
                stream,
                read_buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
                write_buf: BytesMut::new(),
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn empty_for_test() -> Self {
        Self::new()
    }
}

/// The non-blocking HTTP engine.
///
/// Owns the listener, the readiness poller, and the [`ConnTable`]. Driven by
/// repeated calls to [`Engine::poll`] from the event loop adapter.
pub struct Engine {
    poller: Poller,
    events: Events,
    listener: Option<TcpListener>,
    conns: ConnTable,
    next_id: u64,
}

impl Engine {
    /// Creates an engine with no listener bound.
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            poller: Poller::new().map_err(EngineError::Poll)?,
            events: Events::new(),
            listener: None,
            conns: ConnTable::new(),
            next_id: LISTENER_KEY as u64 + 1,
        })
    }

    /// Binds a non-blocking HTTP listener on all interfaces at `port`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub fn listen(&mut self, port: u16) -> Result<(), EngineError> {
        // At most one listening socket per engine; rebinding replaces it.
        self.close_listener();

        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).map_err(|e| EngineError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| EngineError::Bind {
                addr: addr.clone(),
                source: e,
            })?;

        // SAFETY: the listener is deleted from the poller before it is
        // dropped (close_listener and Drop).
        unsafe {
            self.poller
                .add(&listener, PollEvent::readable(LISTENER_KEY))?;
        }

        info!(address = %addr, "listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Returns the bound listener address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Closes the listening socket. Idempotent. Open connections are kept.
    pub fn close_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            let _ = self.poller.delete(&listener);
            debug!("listener closed");
        }
    }

    /// Access to the live connection table.
    pub fn conns_mut(&mut self) -> &mut ConnTable {
        &mut self.conns
    }

    /// Performs one bounded non-blocking tick.
    ///
    /// Flushes pending output, waits for readiness up to `timeout`, accepts
    /// pending connections, reads and parses per-connection input (one
    /// `on_message` per complete request, in order), delivers `on_close` for
    /// connections that went away, and flushes again so responses emitted
    /// during dispatch hit the wire within the same tick.
    pub fn poll(&mut self, timeout: Duration, sink: &mut dyn EventSink) -> Result<(), EngineError> {
        self.flush_pending(sink);

        self.events.clear();
        self.poller.wait(&mut self.events, Some(timeout))?;

        let keys: Vec<usize> = self.events.iter().map(|ev| ev.key).collect();
        for key in keys {
            if key == LISTENER_KEY {
                self.accept_pending();
            } else {
                self.drain_conn(ConnId::new(key as u64), sink);
            }
        }

        self.flush_pending(sink);
        Ok(())
    }

    /// Accepts all pending connections and re-arms the listener's oneshot
    /// readiness registration.
    fn accept_pending(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!(peer = %peer, error = %e, "failed to set non-blocking; dropping");
                        continue;
                    }
                    let id = ConnId::new(self.next_id);
                    self.next_id += 1;

                    // SAFETY: the stream is deleted from the poller before
                    // the connection is dropped (close_conn and Drop).
                    let registered =
                        unsafe { self.poller.add(&stream, PollEvent::readable(id.key())) };
                    if let Err(e) = registered {
                        warn!(peer = %peer, error = %e, "failed to register connection; dropping");
                        continue;
                    }

                    debug!(peer = %peer, conn = %id, "connection accepted");
                    self.conns.map.insert(
                        id,
                        Connection {
                            stream,
                            read_buf: BytesMut::with_capacity(INITIAL_BUF_SIZE),
                            write_buf: BytesMut::new(),
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    break;
                }
            }
        }
        if let Some(listener) = self.listener.as_ref() {
            let _ = self
                .poller
                .modify(listener, PollEvent::readable(LISTENER_KEY));
        }
    }

    /// Reads everything currently available on `id`, dispatches each complete
    /// request, and handles peer close.
    fn drain_conn(&mut self, id: ConnId, sink: &mut dyn EventSink) {
        let mut closing = false;
        let mut requests = Vec::new();

        {
            let Some(conn) = self.conns.map.get_mut(&id) else {
                return;
            };

            let mut tmp = [0u8; 4096];
            loop {
                match conn.stream.read(&mut tmp) {
                    Ok(0) => {
                        debug!(conn = %id, "connection closed by peer");
                        closing = true;
                        break;
                    }
                    Ok(n) => conn.read_buf.extend_from_slice(&tmp[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!(conn = %id, error = %e, "read failed");
                        closing = true;
                        break;
                    }
                }
            }

            if conn.read_buf.len() > MAX_REQUEST_SIZE {
                warn!(conn = %id, "request too large — sending 413");
                conn.write_buf
                    .extend_from_slice(&encode_reply(413, &Headers::new(), b""));
                closing = true;
            } else {
                // One event per complete request: keep-alive pipelining.
                loop {
                    match Request::parse(&conn.read_buf) {
                        Ok(Some((request, consumed))) => {
                            let _ = conn.read_buf.split_to(consumed);
                            requests.push(request);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(conn = %id, error = %e, "bad request — sending 400");
                            conn.write_buf
                                .extend_from_slice(&encode_reply(400, &Headers::new(), b""));
                            closing = true;
                            break;
                        }
                    }
                }
            }
        }

        for request in requests {
            sink.on_message(&mut self.conns, id, request);
        }

        if closing {
            self.close_conn(id, sink);
        } else if let Some(conn) = self.conns.map.get(&id) {
            // polling uses oneshot notifications; re-arm for the next tick.
            let _ = self.poller.modify(&conn.stream, PollEvent::readable(id.key()));
        }
    }

    /// Removes a connection: best-effort drain of buffered output, poller
    /// deregistration, close event.
    fn close_conn(&mut self, id: ConnId, sink: &mut dyn EventSink) {
        if let Some(mut conn) = self.conns.map.remove(&id) {
            if !conn.write_buf.is_empty() {
                let _ = conn.stream.write_all(&conn.write_buf);
            }
            let _ = self.poller.delete(&conn.stream);
            debug!(conn = %id, "connection removed");
            sink.on_close(id);
        }
    }

    /// Writes as much buffered output as each socket accepts right now.
    /// Connections whose socket has failed are closed.
    fn flush_pending(&mut self, sink: &mut dyn EventSink) {
        let pending: Vec<ConnId> = self
            .conns
            .map
            .iter()
            .filter(|(_, c)| !c.write_buf.is_empty())
            .map(|(id, _)| *id)
            .collect();

        for id in pending {
            let mut failed = false;
            if let Some(conn) = self.conns.map.get_mut(&id) {
                while !conn.write_buf.is_empty() {
                    match conn.stream.write(&conn.write_buf) {
                        Ok(0) => {
                            failed = true;
                            break;
                        }
                        Ok(n) => conn.write_buf.advance(n),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            debug!(conn = %id, error = %e, "write failed");
                            failed = true;
                            break;
                        }
                    }
                }
            }
            if failed {
                self.close_conn(id, sink);
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Uphold the poller registration invariant: every registered source
        // is deleted before its socket drops.
        if let Some(listener) = self.listener.take() {
            let _ = self.poller.delete(&listener);
        }
        for (_, conn) in self.conns.map.drain() {
            let _ = self.poller.delete(&conn.stream);
        }
    }
}

/// Content type derived from the file extension. Unknown extensions are
/// served as opaque bytes.
fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}
