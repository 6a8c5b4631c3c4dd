//! User-facing session handlers.

use std::sync::{Arc, Mutex};

use crate::buffer::BufferRaw;
use crate::error::SockError;
use crate::net::socket::Socket;

/// Per-connection (TCP) or per-peer (UDP) handler.
///
/// All hooks run on the poller that owns the session's socket, never
/// concurrently with each other. `on_manager` ticks roughly every two
/// seconds for idle management; `on_error` fires exactly once, after which
/// the session is detached from its server.
pub trait Session: Send {
    fn on_recv(&mut self, buf: &mut BufferRaw);

    fn on_error(&mut self, err: &SockError);

    fn on_manager(&mut self) {}
}

/// Builds a session for a freshly attached socket. The socket handle is the
/// session's way to send; the id is unique within the server.
pub type SessionAllocator = dyn Fn(Socket, &str) -> Box<dyn Session> + Send + Sync;

/// Owning wrapper registered in a server's session map.
///
/// Keeps the socket (and therefore the fd) alive for as long as the server
/// tracks the session, and shares the handler with the socket's callbacks.
pub struct SessionHelper {
    id: String,
    socket: Socket,
    session: Arc<Mutex<Box<dyn Session>>>,
}

impl SessionHelper {
    pub fn new(id: String, socket: Socket, session: Box<dyn Session>) -> SessionHelper {
        SessionHelper {
            id,
            socket,
            session: Arc::new(Mutex::new(session)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn session(&self) -> Arc<Mutex<Box<dyn Session>>> {
        self.session.clone()
    }
}
