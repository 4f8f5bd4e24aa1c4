//! Minimal embedding host: one server, one handler, one scheduler loop.
//!
//! Run with `cargo run --example hello_world`, then:
//!
//! ```text
//! curl -i http://127.0.0.1:8080/hello?who=world
//! curl -i http://127.0.0.1:8080/stream
//! ```

use std::time::Duration;

use embhttp::{HandlerRequest, Headers, IdleScheduler, Registry, Responder, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut registry = Registry::new();
    let mut scheduler = IdleScheduler::new();

    let name = registry.create_server()?;
    let server = registry.get(&name).expect("just created");

    server.borrow_mut().listen(8080)?;
    server
        .borrow_mut()
        .set_handler_fn(|req: &HandlerRequest, rsp: &mut Responder<'_>| {
            match req.uri.as_str() {
                "/stream" => {
                    // Chunked streaming: begin, any number of sends, end.
                    rsp.chunk_begin(req.conn_id);
                    for part in ["streamed ", "from ", req.server.as_str()] {
                        rsp.chunk_send(req.conn_id, part.as_bytes());
                    }
                    rsp.chunk_end(req.conn_id);
                }
                uri => {
                    let mut headers = Headers::new();
                    headers.insert("Content-Type", "text/plain");
                    let body = format!(
                        "server={} conn={} method={} uri={} query={}\n",
                        req.server, req.conn_id, req.method, uri, req.query
                    );
                    rsp.reply(req.conn_id, 200, &headers, body.as_bytes());
                }
            }
            Ok(())
        });

    Server::start(&server, &mut scheduler);
    println!("listening on http://127.0.0.1:8080 — Ctrl-C to quit");
    loop {
        scheduler.run_for(Duration::from_secs(1));
    }
}
