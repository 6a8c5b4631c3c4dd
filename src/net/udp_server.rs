//! Multi-reactor UDP server.
//!
//! Every pool poller gets its own socket bound to the same port (address
//! reuse), so the kernel spreads datagrams across reactors. Peers are
//! identified by an 18-byte key derived from the source address; the first
//! datagram from an unknown peer creates a session with a dedicated socket
//! that is `connect(2)`ed to the peer on Linux, letting the kernel route
//! that peer's traffic straight to the session's fd from then on. The
//! session map is shared by all clones under one short-hold mutex.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use crate::buffer::BufferRaw;
use crate::error::{ErrorKind, SockError};
use crate::executor::TaskExecutor;
use crate::net::session::{Session, SessionAllocator};
use crate::net::socket::Socket;
use crate::poller::{DelayTask, EventPoller, EventPollerPool};

const MANAGER_INTERVAL_MS: u64 = 2_000;

/// Erase is delayed this long after a session socket errors, absorbing
/// re-creation flaps from late datagrams carrying the same peer id.
const SESSION_ERASE_DELAY_MS: u64 = 3_000;

/// `[port_be, 16-byte address]`, IPv4 mapped into IPv6 space.
pub type PeerId = [u8; 18];

pub fn make_sock_id(addr: &SocketAddr) -> PeerId {
    let mut id = [0u8; 18];
    id[0..2].copy_from_slice(&addr.port().to_be_bytes());
    match addr.ip() {
        IpAddr::V4(v4) => id[2..18].copy_from_slice(&v4.to_ipv6_mapped().octets()),
        IpAddr::V6(v6) => id[2..18].copy_from_slice(&v6.octets()),
    }
    id
}

struct SessionEntry {
    poller: EventPoller,
    socket: Socket,
    session: Arc<Mutex<Box<dyn Session>>>,
}

impl Clone for SessionEntry {
    fn clone(&self) -> SessionEntry {
        SessionEntry {
            poller: self.poller.clone(),
            socket: self.socket.clone(),
            session: self.session.clone(),
        }
    }
}

type SharedSessions = Arc<Mutex<HashMap<PeerId, SessionEntry>>>;

struct ServerInner {
    poller: EventPoller,
    socket: Socket,
    allocator: Arc<SessionAllocator>,
    sessions: SharedSessions,
    clones: Mutex<Vec<UdpServer>>,
    manager_timer: Mutex<Option<DelayTask>>,
    port: Mutex<u16>,
    host: Mutex<String>,
    is_primary: bool,
}

/// Cheap-to-clone handle to one server instance (primary or clone).
#[derive(Clone)]
pub struct UdpServer {
    inner: Arc<ServerInner>,
}

impl UdpServer {
    pub fn new(allocator: Box<SessionAllocator>) -> UdpServer {
        let poller = EventPollerPool::instance().first_poller();
        UdpServer::with_parts(poller, Arc::from(allocator), Default::default(), true)
    }

    fn with_parts(
        poller: EventPoller,
        allocator: Arc<SessionAllocator>,
        sessions: SharedSessions,
        is_primary: bool,
    ) -> UdpServer {
        let socket = Socket::new(poller.clone());
        UdpServer {
            inner: Arc::new(ServerInner {
                poller,
                socket,
                allocator,
                sessions,
                clones: Mutex::new(Vec::new()),
                manager_timer: Mutex::new(None),
                port: Mutex::new(0),
                host: Mutex::new(String::new()),
                is_primary,
            }),
        }
    }

    /// Bind and start receiving. Returns the bound port.
    pub fn start(&self, port: u16, host: &str) -> io::Result<u16> {
        debug_assert!(self.inner.is_primary);
        self.bind_main_socket(port, host)?;
        let bound = self.inner.socket.local_addr()?.port();
        *self.inner.port.lock().unwrap() = bound;
        *self.inner.host.lock().unwrap() = host.to_string();
        self.start_manager();

        let mut clones = self.inner.clones.lock().unwrap();
        let this = self.clone();
        let mut failed = false;
        EventPollerPool::instance().for_each(|poller| {
            if poller.id() == this.inner.poller.id() || failed {
                return;
            }
            let clone = UdpServer::with_parts(
                poller.clone(),
                this.inner.allocator.clone(),
                this.inner.sessions.clone(),
                false,
            );
            *clone.inner.port.lock().unwrap() = bound;
            *clone.inner.host.lock().unwrap() = host.to_string();
            if let Err(err) = clone.bind_main_socket(bound, host) {
                // Platforms without real port sharing serve from one fd.
                warn!("udp clone bind failed on {}: {}", poller.name(), err);
                failed = true;
                return;
            }
            clone.start_manager();
            clones.push(clone);
        });
        info!(
            "udp server bound on {}:{} across {} pollers",
            host,
            bound,
            clones.len() + 1
        );
        Ok(bound)
    }

    pub fn port(&self) -> u16 {
        *self.inner.port.lock().unwrap()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    pub fn stop(&self) {
        self.inner.socket.close();
        if let Some(timer) = self.inner.manager_timer.lock().unwrap().take() {
            timer.cancel();
        }
        for clone in self.inner.clones.lock().unwrap().drain(..) {
            clone.stop();
        }
        if self.inner.is_primary {
            let sessions = std::mem::take(&mut *self.inner.sessions.lock().unwrap());
            let err = SockError::new(ErrorKind::Shutdown, "server shutdown");
            for (_, entry) in sessions {
                entry.socket.close();
                let session = entry.session.clone();
                let err = err.clone();
                entry.poller.async_task(
                    Box::new(move || {
                        session.lock().unwrap().on_error(&err);
                    }),
                    true,
                );
            }
        }
    }

    fn bind_main_socket(&self, port: u16, host: &str) -> io::Result<()> {
        let server = Arc::downgrade(&self.inner);
        self.inner.socket.set_on_read(Box::new(move |buf, addr| {
            let Some(inner) = server.upgrade() else { return };
            let Some(addr) = addr else { return };
            UdpServer { inner }.on_datagram(buf, addr);
        }));
        self.inner.socket.bind_udp(port, host)
    }

    /// Demultiplex one datagram arriving on a clone's main socket.
    fn on_datagram(&self, buf: &mut BufferRaw, addr: SocketAddr) {
        let peer_id = make_sock_id(&addr);
        let hit = self.inner.sessions.lock().unwrap().get(&peer_id).cloned();
        match hit {
            Some(entry) => deliver(&entry, buf),
            None => self.create_session(peer_id, addr, buf),
        }
    }

    /// First datagram from an unknown peer: create the session socket on a
    /// chosen poller and hand the packet over.
    fn create_session(&self, peer_id: PeerId, addr: SocketAddr, first_packet: &mut BufferRaw) {
        let poller = EventPollerPool::instance().get_poller(false);
        let socket = Socket::new(poller.clone());
        let port = *self.inner.port.lock().unwrap();
        let host = self.inner.host.lock().unwrap().clone();

        let id = format!("{}", addr);
        let session: Arc<Mutex<Box<dyn Session>>> =
            Arc::new(Mutex::new((*self.inner.allocator)(socket.clone(), &id)));

        {
            let session = session.clone();
            socket.set_on_read(Box::new(move |buf, _addr| {
                session.lock().unwrap().on_recv(buf);
            }));
        }
        {
            let session = session.clone();
            let sessions = Arc::downgrade(&self.inner.sessions);
            let poller2 = poller.clone();
            let socket_for_match = socket.clone();
            socket.set_on_err(Box::new(move |err| {
                session.lock().unwrap().on_error(err);
                // Late datagrams with this peer id may still recreate the
                // session; erase after a grace period.
                let Some(sessions) = sessions.upgrade() else { return };
                let socket_for_match = socket_for_match.clone();
                poller2.do_delay_task(
                    SESSION_ERASE_DELAY_MS,
                    Box::new(move || {
                        let mut sessions = sessions.lock().unwrap();
                        if let Some(entry) = sessions.get(&peer_id) {
                            if Socket::ptr_eq(&entry.socket, &socket_for_match) {
                                sessions.remove(&peer_id);
                            }
                        }
                        0
                    }),
                );
            }));
        }

        if let Err(err) = socket.bind_udp(port, &host) {
            error!("udp session bind failed for {}: {}", addr, err);
            return;
        }
        // Hard bind on Linux: the kernel now routes this peer to the new
        // fd. Elsewhere port sharing is unreliable, so stay soft and keep
        // demultiplexing through the main fds.
        let soft = !cfg!(any(target_os = "linux", target_os = "android"));
        if let Err(err) = socket.bind_peer_addr(addr, soft) {
            warn!("udp peer bind failed for {}: {}", addr, err);
        }

        let entry = SessionEntry {
            poller,
            socket,
            session,
        };

        // Another reactor may have raced us to the same peer.
        let winner = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            match sessions.get(&peer_id) {
                Some(existing) => existing.clone(),
                None => {
                    sessions.insert(peer_id, entry.clone());
                    entry
                }
            }
        };
        deliver(&winner, first_packet);
    }

    fn start_manager(&self) {
        let server = Arc::downgrade(&self.inner);
        let timer = self.inner.poller.do_delay_task(
            MANAGER_INTERVAL_MS,
            Box::new(move || {
                let Some(inner) = server.upgrade() else { return 0 };
                UdpServer { inner }.on_manager_tick();
                MANAGER_INTERVAL_MS
            }),
        );
        *self.inner.manager_timer.lock().unwrap() = Some(timer);
    }

    /// Each clone manages only the sessions living on its own poller; the
    /// shared map is snapshotted so error callbacks can erase freely.
    fn on_manager_tick(&self) {
        let my_poller = self.inner.poller.id();
        let sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .filter(|entry| entry.poller.id() == my_poller)
            .map(|entry| entry.session.clone())
            .collect();
        for session in sessions {
            if let Err(panic) =
                catch_unwind(AssertUnwindSafe(|| session.lock().unwrap().on_manager()))
            {
                error!("udp session on_manager panicked: {:?}", panic);
            }
        }
    }
}

/// Route a datagram to its session, crossing pollers with an owned copy of
/// the buffer when needed.
fn deliver(entry: &SessionEntry, buf: &mut BufferRaw) {
    if entry.poller.is_current_thread() {
        entry.session.lock().unwrap().on_recv(buf);
        return;
    }
    // The buffer is borrowed from this reactor's read path; move the bytes
    // out before crossing threads.
    let bytes = buf.take();
    let session = entry.session.clone();
    entry.poller.async_task(
        Box::new(move || {
            let mut owned = BufferRaw::from_slice(&bytes);
            session.lock().unwrap().on_recv(&mut owned);
        }),
        true,
    );
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(timer) = self.manager_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

impl std::fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpServer")
            .field("poller", &self.inner.poller.id())
            .field("primary", &self.inner.is_primary)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sock_id_maps_v4_into_v6() {
        let addr: SocketAddr = "1.2.3.4:5678".parse().unwrap();
        let id = make_sock_id(&addr);
        assert_eq!(&id[0..2], &5678u16.to_be_bytes());
        // ::ffff:1.2.3.4
        assert_eq!(&id[2..14], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff]);
        assert_eq!(&id[14..18], &[1, 2, 3, 4]);
    }

    #[test]
    fn sock_id_distinguishes_ports() {
        let a: SocketAddr = "9.9.9.9:1000".parse().unwrap();
        let b: SocketAddr = "9.9.9.9:1001".parse().unwrap();
        assert_ne!(make_sock_id(&a), make_sock_id(&b));
    }
}
