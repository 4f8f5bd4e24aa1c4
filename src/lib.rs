//! # embhttp
//!
//! An embeddable HTTP/1.1 server core that bridges an event-driven,
//! non-blocking engine to a synchronous, callback-style request handler
//! supplied by the embedding host.
//!
//! The host creates named [`Server`] instances through a [`Registry`],
//! registers one [`Handler`](server::Handler) per server, and drives all of
//! them on a cooperative [`IdleScheduler`]. Each incoming request becomes
//! exactly one synchronous handler invocation; the handler answers through
//! emission calls addressed by connection id — a full reply, a chunked
//! stream, or a static file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use embhttp::{HandlerRequest, Headers, IdleScheduler, Registry, Responder, Server};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = Registry::new();
//!     let mut scheduler = IdleScheduler::new();
//!
//!     let name = registry.create_server()?;
//!     let server = registry.get(&name).expect("just created");
//!
//!     server.borrow_mut().listen(8080)?;
//!     server
//!         .borrow_mut()
//!         .set_handler_fn(|req: &HandlerRequest, rsp: &mut Responder<'_>| {
//!             let mut headers = Headers::new();
//!             headers.insert("Content-Type", "text/plain");
//!             rsp.reply(req.conn_id, 200, &headers, b"Hello, World!");
//!             Ok(())
//!         });
//!
//!     Server::start(&server, &mut scheduler);
//!     loop {
//!         scheduler.run_for(Duration::from_secs(1));
//!     }
//! }
//! ```
//!
//! ## Concurrency model
//!
//! One logical thread of control per process: engine polls, event dispatch,
//! and handler invocations all execute back-to-back on scheduler turns.
//! While a handler runs, no other event is processed — handler execution
//! time adds latency to every connection, and a handler that never returns
//! stalls the host. There is no locking anywhere because there is nothing
//! to lock against.

pub mod engine;
pub mod http;
pub mod registry;
pub mod scheduler;
pub mod server;

pub use engine::{ConnId, ConnTable, Engine, EngineError, EventSink};
pub use http::{Headers, Method, Request};
pub use registry::Registry;
pub use scheduler::IdleScheduler;
pub use server::{Handler, HandlerError, HandlerRequest, Responder, Server};
