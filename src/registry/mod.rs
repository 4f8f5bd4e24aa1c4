//! Host-facing server factory and name registry.
//!
//! The embedding host creates servers here and addresses them by name from
//! then on; the name is also the first argument every handler invocation
//! receives, so a shared handler can tell which server delivered a request.
//! Servers are destroyed only by an explicit [`Registry::destroy`] (or by
//! dropping the registry), never implicitly by connection events.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{info, warn};

use crate::engine::EngineError;
use crate::server::Server;

/// Factory and lookup table for named [`Server`] instances.
///
/// Names are unique per registry and never reused within a process run.
/// Servers are handed out as `Rc<RefCell<Server>>` so the host, the
/// scheduler's poll task, and the registry can share them on the single
/// cooperative thread.
#[derive(Default)]
pub struct Registry {
    servers: HashMap<String, Rc<RefCell<Server>>>,
    next_seq: u64,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new server and returns its unique name (`http-server-{n}`).
    ///
    /// # Errors
    ///
    /// Fails if the server's engine cannot allocate its readiness poller.
    pub fn create_server(&mut self) -> Result<String, EngineError> {
        self.next_seq += 1;
        let name = format!("http-server-{}", self.next_seq);
        let server = Server::new(name.clone())?;
        self.servers
            .insert(name.clone(), Rc::new(RefCell::new(server)));
        info!(server = %name, "server created");
        Ok(name)
    }

    /// Looks up a server by name.
    pub fn get(&self, name: &str) -> Option<Rc<RefCell<Server>>> {
        self.servers.get(name).cloned()
    }

    /// Destroys the named server: stops its polling chain, closes its
    /// listener, and releases the registry's reference. The handler
    /// reference and engine resources are released once the last shared
    /// reference (e.g. a still-queued poll task) drops.
    ///
    /// Returns `false` if no server with that name exists. Must not be
    /// called from within a handler invocation on the same server.
    pub fn destroy(&mut self, name: &str) -> bool {
        match self.servers.remove(name) {
            Some(server) => {
                server.borrow_mut().stop();
                if Rc::strong_count(&server) > 1 {
                    warn!(server = %name, "destroyed while still shared; freed on last release");
                }
                info!(server = %name, "server destroyed");
                true
            }
            None => false,
        }
    }

    /// Number of live servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns `true` if no servers are registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Handler, HandlerRequest, Responder};

    #[test]
    fn names_are_unique_and_sequential() {
        let mut registry = Registry::new();
        let a = registry.create_server().unwrap();
        let b = registry.create_server().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, "http-server-1");
        assert_eq!(b, "http-server-2");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn server_knows_its_registry_name() {
        let mut registry = Registry::new();
        let name = registry.create_server().unwrap();
        let server = registry.get(&name).unwrap();
        assert_eq!(server.borrow().name(), name);
    }

    #[test]
    fn lookup_of_unknown_name_is_none() {
        let registry = Registry::new();
        assert!(registry.get("http-server-1").is_none());
    }

    #[test]
    fn destroy_removes_and_reports() {
        let mut registry = Registry::new();
        let name = registry.create_server().unwrap();
        assert!(registry.destroy(&name));
        assert!(!registry.destroy(&name)); // already gone
        assert!(registry.is_empty());
    }

    #[test]
    fn destroy_releases_handler_reference() {
        let mut registry = Registry::new();
        let name = registry.create_server().unwrap();

        let handler: Rc<dyn Handler> = Rc::new(
            |_req: &HandlerRequest, _rsp: &mut Responder<'_>| Ok(()),
        );
        registry
            .get(&name)
            .unwrap()
            .borrow_mut()
            .set_handler(Rc::clone(&handler));
        assert_eq!(Rc::strong_count(&handler), 2);

        registry.destroy(&name);
        assert_eq!(Rc::strong_count(&handler), 1);
    }
}
