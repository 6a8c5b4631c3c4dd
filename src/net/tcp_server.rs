//! Multi-reactor TCP server.
//!
//! The primary server owns the listening socket on one poller and clones
//! itself onto every other pool poller by duplicating the listener fd, so
//! each reactor accepts independently. New peers are placed on the
//! least-loaded poller; the clone living on that poller takes ownership of
//! the session. Each clone keeps its own session map and ticks a 2 s
//! manager timer over it.

use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{error, info, warn};

use crate::error::{ErrorKind, SockError};
use crate::executor::TaskExecutor;
use crate::net::session::{SessionAllocator, SessionHelper};
use crate::net::socket::Socket;
use crate::poller::{DelayTask, EventPoller, EventPollerPool};

const MANAGER_INTERVAL_MS: u64 = 2_000;
const LISTEN_BACKLOG: i32 = 1024;

type ServerLookup = Arc<Mutex<HashMap<usize, Weak<ServerInner>>>>;

struct ServerInner {
    poller: EventPoller,
    socket: Socket,
    allocator: Arc<SessionAllocator>,
    sessions: Mutex<HashMap<String, SessionHelper>>,
    /// poller id -> server clone on that poller, shared by the whole family.
    lookup: ServerLookup,
    /// Primary only: keeps the clones alive.
    clones: Mutex<Vec<TcpServer>>,
    manager_timer: Mutex<Option<DelayTask>>,
    in_manager: AtomicBool,
    next_session: AtomicU64,
    is_primary: bool,
}

/// Cheap-to-clone handle to one server instance (primary or clone).
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// Create the primary server. `allocator` runs on the target poller for
    /// every accepted connection.
    pub fn new(allocator: Box<SessionAllocator>) -> TcpServer {
        let poller = EventPollerPool::instance().first_poller();
        TcpServer::with_parts(poller, Arc::from(allocator), Default::default(), true)
    }

    fn with_parts(
        poller: EventPoller,
        allocator: Arc<SessionAllocator>,
        lookup: ServerLookup,
        is_primary: bool,
    ) -> TcpServer {
        let socket = Socket::new(poller.clone());
        TcpServer {
            inner: Arc::new(ServerInner {
                poller,
                socket,
                allocator,
                sessions: Mutex::new(HashMap::new()),
                lookup,
                clones: Mutex::new(Vec::new()),
                manager_timer: Mutex::new(None),
                in_manager: AtomicBool::new(false),
                next_session: AtomicU64::new(0),
                is_primary,
            }),
        }
    }

    /// Bind and start accepting. Returns the bound port (useful with
    /// `port == 0`).
    pub fn start(&self, port: u16, host: &str) -> io::Result<u16> {
        debug_assert!(self.inner.is_primary);
        self.register_lookup();
        self.wire_listener();
        self.inner.socket.listen(port, host, LISTEN_BACKLOG)?;
        let bound = self.inner.socket.local_addr()?.port();
        self.start_manager();

        // One clone per remaining pool poller, accepting on a dup of the
        // same listener fd.
        let mut clones = self.inner.clones.lock().unwrap();
        let this = self.clone();
        EventPollerPool::instance().for_each(|poller| {
            if poller.id() == this.inner.poller.id() {
                return;
            }
            let clone = TcpServer::with_parts(
                poller.clone(),
                this.inner.allocator.clone(),
                this.inner.lookup.clone(),
                false,
            );
            clone.register_lookup();
            clone.wire_listener();
            if let Err(err) = clone.inner.socket.clone_from_listen_socket(&this.inner.socket) {
                warn!("listener clone failed on {}: {}", poller.name(), err);
                return;
            }
            clone.start_manager();
            clones.push(clone);
        });
        info!(
            "tcp server listening on {}:{} across {} pollers",
            host,
            bound,
            clones.len() + 1
        );
        Ok(bound)
    }

    pub fn port(&self) -> u16 {
        self.inner
            .socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Sessions across the primary and every clone.
    pub fn session_count(&self) -> usize {
        let mut count = self.inner.sessions.lock().unwrap().len();
        for clone in self.inner.clones.lock().unwrap().iter() {
            count += clone.inner.sessions.lock().unwrap().len();
        }
        count
    }

    /// Stop accepting, tear down every session with a `Shutdown` error and
    /// drop the clones.
    pub fn stop(&self) {
        // Listener first so no new sessions appear while tearing down.
        self.inner.socket.close();
        if let Some(timer) = self.inner.manager_timer.lock().unwrap().take() {
            timer.cancel();
        }
        let sessions = std::mem::take(&mut *self.inner.sessions.lock().unwrap());
        let err = SockError::new(ErrorKind::Shutdown, "server shutdown");
        for (_, helper) in sessions {
            let session = helper.session();
            helper.socket().close();
            let err = err.clone();
            helper.socket().poller().clone().async_task(
                Box::new(move || {
                    session.lock().unwrap().on_error(&err);
                }),
                true,
            );
        }
        for clone in self.inner.clones.lock().unwrap().drain(..) {
            clone.stop();
        }
        self.inner
            .lookup
            .lock()
            .unwrap()
            .remove(&self.inner.poller.id());
    }

    fn register_lookup(&self) {
        self.inner
            .lookup
            .lock()
            .unwrap()
            .insert(self.inner.poller.id(), Arc::downgrade(&self.inner));
    }

    fn wire_listener(&self) {
        let socket = &self.inner.socket;
        socket.set_on_before_accept(Box::new(|| {
            Some(EventPollerPool::instance().get_poller(false))
        }));

        let lookup = self.inner.lookup.clone();
        let fallback = Arc::downgrade(&self.inner);
        socket.set_on_accept(Box::new(move |peer| {
            let target = peer.poller().clone();
            let owner = lookup
                .lock()
                .unwrap()
                .get(&target.id())
                .cloned()
                .unwrap_or_else(|| fallback.clone());
            target.clone().async_task(
                Box::new(move || {
                    if let Some(inner) = owner.upgrade() {
                        TcpServer { inner }.setup_session(peer);
                    }
                }),
                true,
            );
        }));
    }

    /// Runs on this server's own poller: build the session, wire the peer
    /// socket and start its events.
    fn setup_session(&self, peer: Socket) {
        let seq = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let id = match peer.peer_addr() {
            Ok(addr) => format!("{}-{}", seq, addr),
            Err(_) => format!("{}-?", seq),
        };

        let session = (*self.inner.allocator)(peer.clone(), &id);
        let helper = SessionHelper::new(id.clone(), peer.clone(), session);
        let session = helper.session();
        self.inner.sessions.lock().unwrap().insert(id.clone(), helper);

        {
            let session = session.clone();
            peer.set_on_read(Box::new(move |buf, _addr| {
                session.lock().unwrap().on_recv(buf);
            }));
        }
        {
            let session = session.clone();
            let server = Arc::downgrade(&self.inner);
            let id = id.clone();
            peer.set_on_err(Box::new(move |err| {
                session.lock().unwrap().on_error(err);
                let Some(inner) = server.upgrade() else { return };
                let server = TcpServer { inner };
                if server.inner.in_manager.load(Ordering::Acquire) {
                    // Manager tick is walking the map; defer the erase.
                    let server2 = server.clone();
                    let id = id.clone();
                    server.inner.poller.clone().async_task(
                        Box::new(move || {
                            server2.inner.sessions.lock().unwrap().remove(&id);
                        }),
                        false,
                    );
                } else {
                    server.inner.sessions.lock().unwrap().remove(&id);
                }
            }));
        }

        if let Err(err) = peer.attach_events() {
            error!("failed to attach accepted socket: {}", err);
            self.inner.sessions.lock().unwrap().remove(&id);
        }
    }

    fn start_manager(&self) {
        let server = Arc::downgrade(&self.inner);
        let timer = self.inner.poller.do_delay_task(
            MANAGER_INTERVAL_MS,
            Box::new(move || {
                let Some(inner) = server.upgrade() else { return 0 };
                let server = TcpServer { inner };
                server.on_manager_tick();
                MANAGER_INTERVAL_MS
            }),
        );
        *self.inner.manager_timer.lock().unwrap() = Some(timer);
    }

    fn on_manager_tick(&self) {
        self.inner.in_manager.store(true, Ordering::Release);
        let sessions: Vec<_> = self
            .inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|helper| helper.session())
            .collect();
        for session in sessions {
            if let Err(panic) =
                catch_unwind(AssertUnwindSafe(|| session.lock().unwrap().on_manager()))
            {
                error!("session on_manager panicked: {:?}", panic);
            }
        }
        self.inner.in_manager.store(false, Ordering::Release);
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        if let Some(timer) = self.manager_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("poller", &self.inner.poller.id())
            .field("primary", &self.inner.is_primary)
            .finish()
    }
}
