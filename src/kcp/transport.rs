//! Binds a [`Kcp`] machine to a UDP [`Socket`] and a poller timer.
//!
//! Datagrams from the socket go into [`input`](KcpTransport::input) (either
//! wired automatically with
//! [`bind_socket_reads`](KcpTransport::bind_socket_reads) or fed by a
//! session), application bytes go in through [`send`](KcpTransport::send),
//! and assembled messages come back through the `on_read` callback. A
//! repeating delay task on the socket's poller drives the protocol clock at
//! the configured interval; it starts with the first send or input.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;

use crate::net::socket::Socket;
use crate::poller::DelayTask;
use crate::util;

use super::{DelayMode, Kcp, KcpStats};

/// One fully reassembled, in-order application message.
pub type OnMessageCB = Box<dyn FnMut(Bytes) + Send>;

struct TransportInner {
    socket: Socket,
    kcp: Mutex<Kcp>,
    on_read: Mutex<OnMessageCB>,
    timer: Mutex<Option<DelayTask>>,
    timer_armed: AtomicBool,
}

/// Reliable, ordered byte/message stream over a UDP socket.
#[derive(Clone)]
pub struct KcpTransport {
    inner: Arc<TransportInner>,
}

fn now32() -> u32 {
    util::now_millis() as u32
}

impl KcpTransport {
    /// Active opener: picks a random conv carried by every packet.
    pub fn new_client(socket: Socket) -> KcpTransport {
        let conv: u32 = rand::random();
        KcpTransport::construct(socket, Some(conv))
    }

    /// Passive opener: adopts the conv of the first packet received.
    pub fn new_server(socket: Socket) -> KcpTransport {
        KcpTransport::construct(socket, None)
    }

    fn construct(socket: Socket, conv: Option<u32>) -> KcpTransport {
        let out_socket = socket.clone();
        let output = Box::new(move |data: &[u8]| {
            out_socket.send(data);
        });
        let kcp = match conv {
            Some(conv) => Kcp::new(conv, output),
            None => Kcp::new_server(output),
        };
        KcpTransport {
            inner: Arc::new(TransportInner {
                socket,
                kcp: Mutex::new(kcp),
                on_read: Mutex::new(Box::new(|_| {})),
                timer: Mutex::new(None),
                timer_armed: AtomicBool::new(false),
            }),
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.inner.socket
    }

    pub fn set_on_read(&self, cb: OnMessageCB) {
        *self.inner.on_read.lock().unwrap() = cb;
    }

    /// Route the socket's datagrams straight into this transport. Server
    /// sessions that own the socket's `on_read` call
    /// [`input`](KcpTransport::input) themselves instead.
    pub fn bind_socket_reads(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.socket.set_on_read(Box::new(move |buf, _addr| {
            if let Some(inner) = weak.upgrade() {
                KcpTransport { inner }.input(crate::buffer::Buffer::data(buf));
            }
        }));
    }

    /// Feed one received UDP payload into the protocol.
    pub fn input(&self, data: &[u8]) {
        {
            let mut kcp = self.inner.kcp.lock().unwrap();
            kcp.input(data);
        }
        self.ensure_timer();
        self.deliver_messages();
    }

    /// Queue application bytes; the next timer tick puts them on the wire.
    pub fn send(&self, data: &[u8]) -> io::Result<usize> {
        let accepted = self.inner.kcp.lock().unwrap().send(data)?;
        self.ensure_timer();
        Ok(accepted)
    }

    /// Queue and transmit immediately instead of waiting for the tick.
    pub fn send_flush(&self, data: &[u8]) -> io::Result<usize> {
        let accepted = {
            let mut kcp = self.inner.kcp.lock().unwrap();
            let accepted = kcp.send(data)?;
            kcp.flush_now(now32());
            accepted
        };
        self.ensure_timer();
        Ok(accepted)
    }

    /// Pull assembled messages out of the machine and hand them to
    /// `on_read` without holding the protocol lock.
    fn deliver_messages(&self) {
        loop {
            let message = self.inner.kcp.lock().unwrap().recv();
            let Some(message) = message else { return };
            (*self.inner.on_read.lock().unwrap())(message);
        }
    }

    /// Start the repeating update timer on the socket's poller (first send
    /// or input arms it; stop() disarms).
    fn ensure_timer(&self) {
        if self.inner.timer_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<TransportInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.kcp.lock().unwrap().interval() as u64;
        let timer = self.inner.socket.poller().do_delay_task(
            interval,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else { return 0 };
                let next = {
                    let mut kcp = inner.kcp.lock().unwrap();
                    kcp.update(now32());
                    kcp.interval() as u64
                };
                next
            }),
        );
        *self.inner.timer.lock().unwrap() = Some(timer);
    }

    /// Cancel the update timer. In-flight state is kept; traffic re-arms
    /// the timer.
    pub fn stop(&self) {
        if let Some(timer) = self.inner.timer.lock().unwrap().take() {
            timer.cancel();
        }
        self.inner.timer_armed.store(false, Ordering::SeqCst);
    }

    // ===== Configuration passthrough (set before traffic flows) =====

    pub fn set_nodelay(&self, mode: DelayMode, interval: u32, resend: u32, nocwnd: bool) {
        self.inner
            .kcp
            .lock()
            .unwrap()
            .set_nodelay(mode, interval, resend, nocwnd);
    }

    pub fn set_wndsize(&self, snd_wnd: u16, rcv_wnd: u16) {
        self.inner.kcp.lock().unwrap().set_wndsize(snd_wnd, rcv_wnd);
    }

    pub fn set_mtu(&self, mtu: usize) -> io::Result<()> {
        self.inner.kcp.lock().unwrap().set_mtu(mtu)
    }

    pub fn set_stream(&self, stream: bool) {
        self.inner.kcp.lock().unwrap().set_stream(stream);
    }

    pub fn set_fastack_conserve(&self, conserve: bool) {
        self.inner.kcp.lock().unwrap().set_fastack_conserve(conserve);
    }

    pub fn set_dead_link(&self, dead_link: u32) {
        self.inner.kcp.lock().unwrap().set_dead_link(dead_link);
    }

    // ===== State =====

    pub fn conv(&self) -> u32 {
        self.inner.kcp.lock().unwrap().conv()
    }

    /// The peer stopped acknowledging; see [`Kcp::is_dead_link`].
    pub fn is_dead_link(&self) -> bool {
        self.inner.kcp.lock().unwrap().is_dead_link()
    }

    pub fn wait_snd(&self) -> usize {
        self.inner.kcp.lock().unwrap().wait_snd()
    }

    pub fn stats(&self) -> KcpStats {
        self.inner.kcp.lock().unwrap().stats()
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.cancel();
        }
    }
}
