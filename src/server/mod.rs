//! The bridge core: one server instance per listening endpoint.
//!
//! [`Server`] translates engine events into synchronous invocations of a
//! single host-supplied [`Handler`] and routes the handler's response back
//! out by connection id. Everything runs on one cooperative scheduling turn:
//! engine poll, event dispatch, and handler execution happen back-to-back,
//! so a handler that blocks delays every connection on its server.
//!
//! ## Response contract
//!
//! The dispatcher never answers a request on the handler's behalf (beyond
//! the 404 no-handler and 500 invocation-failure fallbacks). A handler that
//! returns `Ok` without emitting anything — and without arranging deferred
//! chunked completion — leaves its client waiting until the peer gives up.

use std::collections::HashMap;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::engine::{ConnId, ConnTable, Engine, EngineError, EventSink};
use crate::http::{Headers, Method, Request};
use crate::scheduler::IdleScheduler;

/// Poll timeout per scheduler turn.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Failure reported by a handler invocation.
///
/// The dispatcher answers the affected request with an empty 500; the error
/// text only reaches the log, never the peer.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Creates a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

/// The immutable argument snapshot passed to the handler, once per request.
#[derive(Debug, Clone)]
pub struct HandlerRequest {
    /// Name of the server instance that delivered the request.
    pub server: String,
    /// Connection the request arrived on; pass this to the emission calls.
    pub conn_id: ConnId,
    /// HTTP method.
    pub method: Method,
    /// URI path, without the query string.
    pub uri: String,
    /// Raw query string (no leading `?`); empty if the URI had none.
    pub query: String,
    /// Request headers in wire order.
    pub headers: Headers,
    /// Request body; may be empty.
    pub body: Bytes,
}

/// The single externally supplied callback invoked once per request.
///
/// Implemented automatically for matching closures, so hosts can register
/// `|req, rsp| { … }` directly via [`Server::set_handler_fn`].
pub trait Handler {
    /// Handles one request synchronously.
    ///
    /// The handler drives the response itself through `rsp`, addressed by
    /// `request.conn_id` — an immediate full reply, a chunked stream, a
    /// static file, or nothing now and chunked completion on a later turn.
    ///
    /// # Errors
    ///
    /// Returning an error makes the dispatcher answer the request with an
    /// empty 500 reply. The fallback fires only on invocation failure, never
    /// after a handler-emitted success.
    fn handle(&self, request: &HandlerRequest, rsp: &mut Responder<'_>)
    -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&HandlerRequest, &mut Responder<'_>) -> Result<(), HandlerError>,
{
    fn handle(
        &self,
        request: &HandlerRequest,
        rsp: &mut Responder<'_>,
    ) -> Result<(), HandlerError> {
        self(request, rsp)
    }
}

/// Per-connection state tracked by the server.
///
/// The connection itself lives in the engine; the context holds the most
/// recent parsed request for the id (needed by static file delegation) and
/// doubles as the liveness gate for emission: an id absent from the context
/// table is silently ignored.
struct ConnContext {
    request: Request,
}

/// Emission surface for responses, keyed by connection id.
///
/// Handed to the handler during dispatch; also constructed internally by the
/// server's own emission methods for deferred (between-turn) completion.
/// Every call against an id with no live context is a silent no-op.
pub struct Responder<'a> {
    conns: &'a mut ConnTable,
    contexts: &'a HashMap<ConnId, ConnContext>,
}

impl Responder<'_> {
    /// Emits a full reply: status code, header mapping (serialized in
    /// iteration order), body.
    pub fn reply(&mut self, id: ConnId, status: u16, headers: &Headers, body: &[u8]) {
        if self.contexts.contains_key(&id) {
            self.conns.reply(id, status, headers, body);
        } else {
            debug!(conn = %id, "reply for stale connection ignored");
        }
    }

    /// Begins a chunked reply. Call exactly once, before any
    /// [`chunk_send`](Self::chunk_send).
    pub fn chunk_begin(&mut self, id: ConnId) {
        if self.contexts.contains_key(&id) {
            self.conns.chunk_begin(id);
        } else {
            debug!(conn = %id, "chunk_begin for stale connection ignored");
        }
    }

    /// Sends one chunk of a chunked reply. May be called any number of times
    /// between [`chunk_begin`](Self::chunk_begin) and
    /// [`chunk_end`](Self::chunk_end).
    ///
    /// Ordering is a caller responsibility: chunks sent outside a
    /// begin/end bracket produce undefined wire output.
    pub fn chunk_send(&mut self, id: ConnId, data: &[u8]) {
        if self.contexts.contains_key(&id) {
            self.conns.chunk_send(id, data);
        } else {
            debug!(conn = %id, "chunk_send for stale connection ignored");
        }
    }

    /// Ends a chunked reply with the terminating zero-length chunk.
    pub fn chunk_end(&mut self, id: ConnId) {
        if self.contexts.contains_key(&id) {
            self.conns.chunk_end(id);
        } else {
            debug!(conn = %id, "chunk_end for stale connection ignored");
        }
    }

    /// Delegates the response to static file delivery. MIME type is derived
    /// from the file extension; an unreadable file degrades to a 404 reply.
    pub fn reply_file(&mut self, id: ConnId, path: impl AsRef<Path>) {
        match self.contexts.get(&id) {
            Some(ctx) => self.conns.serve_file(id, &ctx.request, path.as_ref()),
            None => debug!(conn = %id, "reply_file for stale connection ignored"),
        }
    }
}

/// The dispatch half of a server: handler slot plus context table.
///
/// Split from [`Server`] so the engine can borrow it as the event sink while
/// the engine itself is being polled.
struct Dispatcher {
    name: String,
    handler: Option<Rc<dyn Handler>>,
    contexts: HashMap<ConnId, ConnContext>,
}

impl EventSink for Dispatcher {
    fn on_message(&mut self, conns: &mut ConnTable, id: ConnId, request: Request) {
        let Some(handler) = self.handler.clone() else {
            debug!(server = %self.name, conn = %id, "no handler registered — sending 404");
            conns.reply(id, 404, &Headers::new(), b"");
            return;
        };

        let snapshot = HandlerRequest {
            server: self.name.clone(),
            conn_id: id,
            method: request.method().clone(),
            uri: request.path().to_owned(),
            query: request.query().unwrap_or("").to_owned(),
            headers: request.headers().clone(),
            body: request.body().clone(),
        };

        // Upsert: a later request on the same connection replaces the
        // context, never duplicates it (keep-alive).
        self.contexts.insert(id, ConnContext { request });

        debug!(
            server = %self.name,
            conn = %id,
            method = %snapshot.method,
            uri = %snapshot.uri,
            "dispatching request"
        );

        let mut rsp = Responder {
            conns: &mut *conns,
            contexts: &self.contexts,
        };
        if let Err(e) = handler.handle(&snapshot, &mut rsp) {
            warn!(server = %self.name, conn = %id, error = %e, "handler failed — sending 500");
            conns.reply(id, 500, &Headers::new(), b"");
        }
    }

    fn on_close(&mut self, id: ConnId) {
        if self.contexts.remove(&id).is_some() {
            debug!(server = %self.name, conn = %id, "context removed");
        }
    }
}

/// One listening HTTP endpoint bridged to one synchronous handler.
///
/// Created through [`Registry::create_server`](crate::Registry::create_server),
/// which assigns the unique name the handler later receives with every
/// request. See the crate docs for a complete host program.
pub struct Server {
    engine: Engine,
    core: Dispatcher,
    started: bool,
    poll_generation: u64,
}

impl Server {
    /// Creates a server with the given instance name.
    ///
    /// # Errors
    ///
    /// Fails if the engine's readiness poller cannot be created.
    pub fn new(name: impl Into<String>) -> Result<Self, EngineError> {
        Ok(Self {
            engine: Engine::new()?,
            core: Dispatcher {
                name: name.into(),
                handler: None,
                contexts: HashMap::new(),
            },
            started: false,
            poll_generation: 0,
        })
    }

    /// Returns the server's instance name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Binds an HTTP listener on all interfaces at `port`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Bind`] if the port cannot be bound. Bind
    /// failure is fatal to this call; the server does not retry.
    pub fn listen(&mut self, port: u16) -> Result<(), EngineError> {
        self.engine.listen(port)
    }

    /// Returns the bound listener address, if listening. With port 0 this is
    /// where the ephemeral port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.engine.local_addr()
    }

    /// Replaces the registered handler, releasing the reference to any
    /// previous one. At most one handler is registered at any time.
    pub fn set_handler(&mut self, handler: Rc<dyn Handler>) {
        self.core.handler = Some(handler);
    }

    /// Convenience for registering a closure handler.
    pub fn set_handler_fn<F>(&mut self, handler: F)
    where
        F: Fn(&HandlerRequest, &mut Responder<'_>) -> Result<(), HandlerError> + 'static,
    {
        self.set_handler(Rc::new(handler));
    }

    /// Drops the registered handler. Subsequent requests receive 404 until a
    /// new handler is set.
    pub fn clear_handler(&mut self) {
        self.core.handler = None;
    }

    /// Arms the server's polling chain on the scheduler: every turn performs
    /// one bounded engine poll and re-schedules itself.
    ///
    /// Idempotent — calling `start` while the server is already polling is a
    /// no-op, so at most one chain is ever armed per server.
    pub fn start(server: &Rc<RefCell<Server>>, scheduler: &mut IdleScheduler) {
        let generation = {
            let mut s = server.borrow_mut();
            if s.started {
                debug!(server = %s.name(), "start ignored — already polling");
                return;
            }
            s.started = true;
            s.poll_generation += 1;
            info!(server = %s.name(), "polling started");
            s.poll_generation
        };
        Self::arm(Rc::clone(server), generation, scheduler);
    }

    fn arm(server: Rc<RefCell<Server>>, generation: u64, scheduler: &mut IdleScheduler) {
        scheduler.schedule(move |scheduler| {
            {
                let mut s = server.borrow_mut();
                // A stale chain (stopped, or superseded by a restart) ends
                // here by not re-arming.
                if !s.started || s.poll_generation != generation {
                    return;
                }
                if let Err(e) = s.poll_tick(POLL_INTERVAL) {
                    error!(server = %s.name(), error = %e, "poll tick failed");
                }
            }
            Server::arm(server, generation, scheduler);
        });
    }

    /// Stops polling and closes the listening socket. Idempotent. The armed
    /// poll task observes the stop on its next turn and does not re-arm.
    /// Open connections are left to engine teardown.
    pub fn stop(&mut self) {
        let was_started = self.started;
        self.started = false;
        self.engine.close_listener();
        if was_started {
            info!(server = %self.name(), "stopped");
        }
    }

    /// Performs one bounded engine poll, dispatching any resulting events.
    /// Exposed for hosts that drive polling themselves instead of using
    /// [`Server::start`].
    pub fn poll_tick(&mut self, timeout: Duration) -> Result<(), EngineError> {
        self.engine.poll(timeout, &mut self.core)
    }

    /// Emits a full reply on `id`: status, header mapping, body. A no-op if
    /// the connection has no live context (e.g. it closed before this call).
    pub fn reply(&mut self, id: ConnId, status: u16, headers: &Headers, body: &[u8]) {
        self.responder().reply(id, status, headers, body);
    }

    /// Begins a deferred chunked reply on `id`. See [`Responder::chunk_begin`].
    pub fn reply_chunk_begin(&mut self, id: ConnId) {
        self.responder().chunk_begin(id);
    }

    /// Sends one chunk on `id`. See [`Responder::chunk_send`].
    pub fn reply_chunk_send(&mut self, id: ConnId, data: &[u8]) {
        self.responder().chunk_send(id, data);
    }

    /// Ends a chunked reply on `id`. See [`Responder::chunk_end`].
    pub fn reply_chunk_end(&mut self, id: ConnId) {
        self.responder().chunk_end(id);
    }

    /// Serves a static file on `id`. See [`Responder::reply_file`].
    pub fn reply_file(&mut self, id: ConnId, path: impl AsRef<Path>) {
        self.responder().reply_file(id, path);
    }

    fn responder(&mut self) -> Responder<'_> {
        Responder {
            conns: self.engine.conns_mut(),
            contexts: &self.core.contexts,
        }
    }

    /// Number of connections with a live context.
    pub fn context_count(&self) -> usize {
        self.core.contexts.len()
    }

    #[cfg(test)]
    fn handler_is_set(&self) -> bool {
        self.core.handler.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ConnTable;
    use std::net::{TcpListener, TcpStream};

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (client, server_side)
    }

    fn request(raw: &[u8]) -> Request {
        Request::parse(raw).unwrap().unwrap().0
    }

    fn dispatcher(name: &str) -> Dispatcher {
        Dispatcher {
            name: name.to_owned(),
            handler: None,
            contexts: HashMap::new(),
        }
    }

    fn table_with_conn(id: ConnId) -> (ConnTable, TcpStream) {
        let (client, server_side) = socket_pair();
        let mut table = ConnTable::empty_for_test();
        table.insert_for_test(id, server_side);
        (table, client)
    }

    fn buffered_text(table: &ConnTable, id: ConnId) -> String {
        String::from_utf8(table.buffered_output(id).unwrap().to_vec()).unwrap()
    }

    #[test]
    fn no_handler_yields_404_without_context_entry() {
        let id = ConnId::new(5);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("test");

        core.on_message(&mut table, id, request(b"GET / HTTP/1.1\r\n\r\n"));

        assert!(buffered_text(&table, id).starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(core.contexts.is_empty());
    }

    #[test]
    fn handler_receives_argument_snapshot() {
        let id = ConnId::new(9);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("http-server-1");

        let seen: Rc<RefCell<Option<HandlerRequest>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&seen);
        core.handler = Some(Rc::new(
            move |req: &HandlerRequest, _rsp: &mut Responder<'_>| {
                *sink.borrow_mut() = Some(req.clone());
                Ok(())
            },
        ));

        core.on_message(
            &mut table,
            id,
            request(b"GET /items?x=1 HTTP/1.1\r\nAccept: application/json\r\n\r\n"),
        );

        let seen = seen.borrow();
        let req = seen.as_ref().unwrap();
        assert_eq!(req.server, "http-server-1");
        assert_eq!(req.conn_id, id);
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.uri, "/items");
        assert_eq!(req.query, "x=1");
        assert_eq!(req.headers.get("accept"), Some("application/json"));
        assert!(req.body.is_empty());
        assert!(core.contexts.contains_key(&id));
    }

    #[test]
    fn handler_reply_reaches_wire_buffer() {
        let id = ConnId::new(3);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("s");

        core.handler = Some(Rc::new(
            |req: &HandlerRequest, rsp: &mut Responder<'_>| {
                let mut headers = Headers::new();
                headers.insert("Content-Type", "application/json");
                rsp.reply(req.conn_id, 200, &headers, b"[]");
                Ok(())
            },
        ));

        core.on_message(&mut table, id, request(b"GET /items HTTP/1.1\r\n\r\n"));

        let text = buffered_text(&table, id);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.ends_with("\r\n\r\n[]"));
    }

    #[test]
    fn handler_failure_sends_500() {
        let id = ConnId::new(4);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("s");

        core.handler = Some(Rc::new(
            |_req: &HandlerRequest, _rsp: &mut Responder<'_>| Err(HandlerError::new("boom")),
        ));

        core.on_message(&mut table, id, request(b"GET / HTTP/1.1\r\n\r\n"));

        let text = buffered_text(&table, id);
        assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn handler_success_sends_nothing_automatically() {
        let id = ConnId::new(6);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("s");

        core.handler = Some(Rc::new(
            |_req: &HandlerRequest, _rsp: &mut Responder<'_>| Ok(()),
        ));

        core.on_message(&mut table, id, request(b"GET / HTTP/1.1\r\n\r\n"));

        assert!(table.buffered_output(id).unwrap().is_empty());
    }

    #[test]
    fn chunked_reply_via_responder() {
        let id = ConnId::new(8);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("s");

        core.handler = Some(Rc::new(
            |req: &HandlerRequest, rsp: &mut Responder<'_>| {
                rsp.chunk_begin(req.conn_id);
                rsp.chunk_send(req.conn_id, b"hello ");
                rsp.chunk_send(req.conn_id, b"world");
                rsp.chunk_end(req.conn_id);
                Ok(())
            },
        ));

        core.on_message(&mut table, id, request(b"GET /stream HTTP/1.1\r\n\r\n"));

        let text = buffered_text(&table, id);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"));
        assert!(text.contains("6\r\nhello \r\n"));
        assert!(text.contains("5\r\nworld\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn keep_alive_replaces_context_entry() {
        let id = ConnId::new(2);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("s");
        core.handler = Some(Rc::new(
            |_req: &HandlerRequest, _rsp: &mut Responder<'_>| Ok(()),
        ));

        core.on_message(&mut table, id, request(b"GET /first HTTP/1.1\r\n\r\n"));
        assert_eq!(core.contexts[&id].request.path(), "/first");

        core.on_message(&mut table, id, request(b"GET /second HTTP/1.1\r\n\r\n"));
        assert_eq!(core.contexts.len(), 1);
        assert_eq!(core.contexts[&id].request.path(), "/second");
    }

    #[test]
    fn close_removes_context_and_reuse_creates_fresh_entry() {
        let id = ConnId::new(7);
        let (mut table, _client) = table_with_conn(id);
        let mut core = dispatcher("s");
        core.handler = Some(Rc::new(
            |_req: &HandlerRequest, _rsp: &mut Responder<'_>| Ok(()),
        ));

        core.on_message(&mut table, id, request(b"GET /old HTTP/1.1\r\n\r\n"));
        core.on_close(id);
        assert!(core.contexts.is_empty());

        // The default engine never reuses ids; simulate an engine that does.
        core.on_message(&mut table, id, request(b"GET /new HTTP/1.1\r\n\r\n"));
        assert_eq!(core.contexts[&id].request.path(), "/new");
    }

    #[test]
    fn set_handler_twice_releases_first_reference() {
        let mut server = Server::new("s").unwrap();

        let first: Rc<dyn Handler> = Rc::new(
            |_req: &HandlerRequest, _rsp: &mut Responder<'_>| Ok(()),
        );
        server.set_handler(Rc::clone(&first));
        assert_eq!(Rc::strong_count(&first), 2);

        let second: Rc<dyn Handler> = Rc::new(
            |_req: &HandlerRequest, _rsp: &mut Responder<'_>| Ok(()),
        );
        server.set_handler(Rc::clone(&second));
        assert_eq!(Rc::strong_count(&first), 1); // released exactly once
        assert_eq!(Rc::strong_count(&second), 2);
        assert!(server.handler_is_set());
    }

    #[test]
    fn emission_with_unknown_id_is_noop() {
        let mut server = Server::new("s").unwrap();
        let ghost = ConnId::new(999);

        server.reply(ghost, 200, &Headers::new(), b"late");
        server.reply_chunk_begin(ghost);
        server.reply_chunk_send(ghost, b"late");
        server.reply_chunk_end(ghost);
        server.reply_file(ghost, "/does/not/matter");

        assert_eq!(server.context_count(), 0);
    }

    // The reference behavior armed one more poll chain per start() call;
    // repeat calls are deliberately redesigned into safe no-ops here.
    #[test]
    fn start_twice_arms_single_poll_chain() {
        let server = Rc::new(RefCell::new(Server::new("s").unwrap()));
        let mut scheduler = IdleScheduler::new();

        Server::start(&server, &mut scheduler);
        Server::start(&server, &mut scheduler);

        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn stop_halts_rearming_and_is_idempotent() {
        let server = Rc::new(RefCell::new(Server::new("s").unwrap()));
        let mut scheduler = IdleScheduler::new();

        Server::start(&server, &mut scheduler);
        server.borrow_mut().stop();
        server.borrow_mut().stop(); // second stop is a no-op

        // The armed task observes the stop and does not re-arm.
        assert!(scheduler.run_once());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn restart_after_stop_arms_one_fresh_chain() {
        let server = Rc::new(RefCell::new(Server::new("s").unwrap()));
        let mut scheduler = IdleScheduler::new();

        Server::start(&server, &mut scheduler);
        server.borrow_mut().stop();
        Server::start(&server, &mut scheduler);

        // Two queued tasks, but the first belongs to the stale generation:
        // it runs once without re-arming, while the new chain keeps going.
        assert_eq!(scheduler.pending(), 2);
        assert!(scheduler.run_once()); // stale task ends its chain
        assert!(scheduler.run_once()); // live task re-arms
        assert_eq!(scheduler.pending(), 1);

        server.borrow_mut().stop();
    }
}
