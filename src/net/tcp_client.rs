//! Client-side counterpart of [`Session`](crate::net::session::Session).

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::buffer::BufferRaw;
use crate::error::SockError;
use crate::net::socket::Socket;
use crate::poller::{DelayTask, EventPollerPool};

const MANAGER_INTERVAL_MS: u64 = 2_000;

/// Hooks for one outgoing TCP connection. All of them run on the poller
/// that owns the client's socket.
pub trait ClientHandler: Send {
    fn on_connect(&mut self, result: Result<(), SockError>);

    fn on_recv(&mut self, buf: &mut BufferRaw);

    fn on_error(&mut self, err: &SockError);

    fn on_manager(&mut self) {}
}

struct ClientInner {
    poller: crate::poller::EventPoller,
    socket: Mutex<Socket>,
    handler: Arc<Mutex<Box<dyn ClientHandler>>>,
    manager_timer: Mutex<Option<DelayTask>>,
}

/// One outgoing TCP connection bound to a pool poller, with reconnectable
/// lifecycle: `connect` may be called again after an error.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    pub fn new(handler: Box<dyn ClientHandler>) -> TcpClient {
        let poller = EventPollerPool::instance().get_poller(true);
        TcpClient {
            inner: Arc::new(ClientInner {
                socket: Mutex::new(Socket::new(poller.clone())),
                poller,
                handler: Arc::new(Mutex::new(handler)),
                manager_timer: Mutex::new(None),
            }),
        }
    }

    pub fn socket(&self) -> Socket {
        self.inner.socket.lock().unwrap().clone()
    }

    /// Start (or restart) the connection. Each attempt uses a fresh socket
    /// so a reconnect never observes state from the previous lifetime.
    pub fn connect(&self, host: &str, port: u16, timeout_ms: u64) {
        self.stop_manager();
        let socket = Socket::new(self.inner.poller.clone());
        *self.inner.socket.lock().unwrap() = socket.clone();

        {
            let handler = self.inner.handler.clone();
            socket.set_on_read(Box::new(move |buf, _| {
                handler.lock().unwrap().on_recv(buf);
            }));
        }
        {
            let handler = self.inner.handler.clone();
            let weak = Arc::downgrade(&self.inner);
            socket.set_on_err(Box::new(move |err| {
                if let Some(inner) = weak.upgrade() {
                    TcpClient { inner }.stop_manager();
                }
                handler.lock().unwrap().on_error(err);
            }));
        }

        let handler = self.inner.handler.clone();
        let weak = Arc::downgrade(&self.inner);
        socket.connect(
            host,
            port,
            timeout_ms,
            Box::new(move |result| {
                if result.is_ok() {
                    if let Some(inner) = weak.upgrade() {
                        TcpClient { inner }.start_manager();
                    }
                }
                handler.lock().unwrap().on_connect(result);
            }),
        );
    }

    pub fn send(&self, data: &[u8]) -> isize {
        self.socket().send(data)
    }

    pub fn send_bytes(&self, data: Bytes) -> isize {
        self.socket().send_bytes(data)
    }

    pub fn shutdown(&self, reason: &str) {
        self.stop_manager();
        self.socket().shutdown(reason);
    }

    fn start_manager(&self) {
        let handler = Arc::downgrade(&self.inner.handler);
        let timer = self.inner.poller.do_delay_task(
            MANAGER_INTERVAL_MS,
            Box::new(move || {
                let Some(handler) = handler.upgrade() else { return 0 };
                handler.lock().unwrap().on_manager();
                MANAGER_INTERVAL_MS
            }),
        );
        *self.inner.manager_timer.lock().unwrap() = Some(timer);
    }

    fn stop_manager(&self) {
        if let Some(timer) = self.inner.manager_timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}
