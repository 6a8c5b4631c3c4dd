//! Non-blocking socket with a write-buffered send pipeline.
//!
//! A [`Socket`] wraps one TCP or UDP fd and lives on exactly one
//! [`EventPoller`]; every callback it fires runs on that poller's thread.
//! Outbound data is appended to a `waiting` queue and drained in batches: a
//! [`BufferList`] snapshot is cut from `waiting`, pushed through the
//! platform's batched send syscall, and write interest is only consulted
//! when the kernel pushes back. A dead-man ticker tears the socket down if
//! the queue makes no progress for the configured window.
//!
//! Error delivery is exactly-once: whatever goes wrong first wins, the fd
//! is closed on the owning poller, and `on_err` fires a single time.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{trace, warn};

use crate::buffer::BufferRaw;
use crate::error::{ErrorKind, SockError};
use crate::executor::TaskExecutor;
use crate::net::buffer_list::{BufferList, SendPacket};
use crate::net::dns;
use crate::poller::{DelayTask, EventPoller, EventPollerPool, PollEvent};
use crate::sys::{sockopt, uio, RawAddr};
use crate::util::Ticker;

/// Default dead-man window for a clogged send queue.
const SEND_TIMEOUT_MS: u64 = 10_000;

/// TCP read chunk per `recv` call.
const TCP_READ_SIZE: usize = 128 * 1024;

/// Payload delivered from the socket: the buffer plus, for unconnected UDP,
/// the datagram source.
pub type OnReadCB = Box<dyn FnMut(&mut BufferRaw, Option<SocketAddr>) + Send>;
pub type OnErrCB = Box<dyn FnMut(&SockError) + Send>;
pub type OnFlushCB = Box<dyn FnMut() + Send>;
/// A freshly accepted peer socket. Wire its callbacks, then call
/// [`Socket::attach_events`].
pub type OnAcceptCB = Box<dyn FnMut(Socket) + Send>;
/// Chooses the poller a new peer socket will live on; `None` falls back to
/// the least-loaded pool poller.
pub type OnBeforeAcceptCB = Box<dyn FnMut() -> Option<EventPoller> + Send>;
pub type OnConnectCB = Box<dyn FnOnce(Result<(), SockError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Mode {
    Invalid = 0,
    Connecting = 1,
    Connected = 2,
    TcpListen = 3,
    Udp = 4,
    Closed = 5,
}

impl Mode {
    fn from_u8(v: u8) -> Mode {
        match v {
            1 => Mode::Connecting,
            2 => Mode::Connected,
            3 => Mode::TcpListen,
            4 => Mode::Udp,
            5 => Mode::Closed,
            _ => Mode::Invalid,
        }
    }
}

/// Owns one fd. Deregistration and close always happen on the poller the
/// fd is registered with, even when the last reference drops elsewhere.
struct FdGuard {
    fd: RawFd,
    sock_type: SockType,
    shutdown_on_close: bool,
    poller: EventPoller,
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        let fd = self.fd;
        if self.shutdown_on_close {
            sockopt::shutdown_both(fd);
        }
        let poller = self.poller.clone();
        if poller.is_current_thread() || poller.has_shut_down() {
            poller.del_event(fd, None);
            sockopt::close(fd);
            return;
        }
        let poller2 = poller.clone();
        poller.async_task(
            Box::new(move || {
                poller2.del_event(fd, None);
                sockopt::close(fd);
            }),
            true,
        );
    }
}

struct SocketInner {
    poller: EventPoller,
    fd: Mutex<Option<Arc<FdGuard>>>,
    mode: AtomicU8,
    enable_recv: AtomicBool,
    err_fired: AtomicBool,
    send_flags: AtomicU64,

    on_read: Mutex<OnReadCB>,
    on_err: Mutex<OnErrCB>,
    on_flush: Mutex<OnFlushCB>,
    on_accept: Mutex<OnAcceptCB>,
    on_before_accept: Mutex<Option<OnBeforeAcceptCB>>,
    connect_cb: Mutex<Option<OnConnectCB>>,
    connect_timer: Mutex<Option<DelayTask>>,

    send_waiting: Mutex<VecDeque<SendPacket>>,
    send_sending: Mutex<Option<BufferList>>,
    send_timeout_ms: AtomicU64,
    send_ticker: Mutex<Ticker>,
    send_timer_armed: AtomicBool,

    tcp_arena: Mutex<Vec<u8>>,
    #[cfg(any(target_os = "linux", target_os = "android"))]
    udp_arena: Mutex<Option<Box<[[u8; uio::UDP_PACKET_SIZE]; uio::UDP_BURST]>>>,

    /// Soft-bound UDP peer used by plain `send` calls.
    udp_peer: Mutex<Option<RawAddr>>,
}

/// Cheap-to-clone handle; all clones refer to the same underlying socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl Socket {
    pub fn new(poller: EventPoller) -> Socket {
        Socket {
            inner: Arc::new(SocketInner {
                poller,
                fd: Mutex::new(None),
                mode: AtomicU8::new(Mode::Invalid as u8),
                enable_recv: AtomicBool::new(true),
                err_fired: AtomicBool::new(false),
                send_flags: AtomicU64::new(0),
                on_read: Mutex::new(Box::new(|_, _| {})),
                on_err: Mutex::new(Box::new(|err| {
                    warn!("socket error ignored (no on_err handler): {}", err);
                })),
                on_flush: Mutex::new(Box::new(|| {})),
                on_accept: Mutex::new(Box::new(|_| {
                    warn!("accepted socket dropped (no on_accept handler)");
                })),
                on_before_accept: Mutex::new(None),
                connect_cb: Mutex::new(None),
                connect_timer: Mutex::new(None),
                send_waiting: Mutex::new(VecDeque::new()),
                send_sending: Mutex::new(None),
                send_timeout_ms: AtomicU64::new(SEND_TIMEOUT_MS),
                send_ticker: Mutex::new(Ticker::new()),
                send_timer_armed: AtomicBool::new(false),
                tcp_arena: Mutex::new(Vec::new()),
                #[cfg(any(target_os = "linux", target_os = "android"))]
                udp_arena: Mutex::new(None),
                udp_peer: Mutex::new(None),
            }),
        }
    }

    pub fn poller(&self) -> &EventPoller {
        &self.inner.poller
    }

    /// Whether two handles refer to the same underlying socket.
    pub fn ptr_eq(a: &Socket, b: &Socket) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn set_on_read(&self, cb: OnReadCB) {
        *self.inner.on_read.lock().unwrap() = cb;
    }

    pub fn set_on_err(&self, cb: OnErrCB) {
        *self.inner.on_err.lock().unwrap() = cb;
    }

    pub fn set_on_flush(&self, cb: OnFlushCB) {
        *self.inner.on_flush.lock().unwrap() = cb;
    }

    pub fn set_on_accept(&self, cb: OnAcceptCB) {
        *self.inner.on_accept.lock().unwrap() = cb;
    }

    pub fn set_on_before_accept(&self, cb: OnBeforeAcceptCB) {
        *self.inner.on_before_accept.lock().unwrap() = Some(cb);
    }

    /// Dead-man window for the send queue; reset on every successful write.
    pub fn set_send_timeout(&self, ms: u64) {
        self.inner.send_timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Extra flags passed to every send syscall.
    pub fn set_send_flags(&self, flags: i32) {
        self.inner.send_flags.store(flags as u64, Ordering::Relaxed);
    }

    /// Toggle read interest. Write and error interest are unaffected.
    pub fn enable_recv(&self, enable: bool) {
        self.inner.enable_recv.store(enable, Ordering::Relaxed);
        if let Some(guard) = self.fd_guard() {
            let mut events = PollEvent::WRITE | PollEvent::ERROR;
            if enable {
                events |= PollEvent::READ;
            }
            let _ = self.inner.poller.modify_event(guard.fd, events);
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd_guard().map(|guard| guard.fd)
    }

    pub fn sock_type(&self) -> Option<SockType> {
        self.fd_guard().map(|guard| guard.sock_type)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.raw_fd() {
            Some(fd) => sockopt::local_addr(fd),
            None => Err(no_fd()),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self.raw_fd() {
            Some(fd) => sockopt::peer_addr(fd),
            None => Err(no_fd()),
        }
    }

    fn fd_guard(&self) -> Option<Arc<FdGuard>> {
        self.inner.fd.lock().unwrap().clone()
    }

    fn mode(&self) -> Mode {
        Mode::from_u8(self.inner.mode.load(Ordering::Acquire))
    }

    fn set_mode(&self, mode: Mode) {
        self.inner.mode.store(mode as u8, Ordering::Release);
    }

    // ===== Connect =====

    /// Open a TCP connection. DNS resolution is blocking (cached 60 s);
    /// everything after that is asynchronous and `cb` fires exactly once on
    /// the poller thread. A failed connect fires `cb` only, never `on_err`.
    pub fn connect(&self, host: &str, port: u16, timeout_ms: u64, cb: OnConnectCB) {
        self.connect_with_bind(host, port, timeout_ms, None, cb)
    }

    pub fn connect_with_bind(
        &self,
        host: &str,
        port: u16,
        timeout_ms: u64,
        local: Option<SocketAddr>,
        cb: OnConnectCB,
    ) {
        let addr = match dns::resolve(host, port) {
            Ok(addr) => addr,
            Err(err) => {
                cb(Err(SockError::new(ErrorKind::Dns, err.to_string())));
                return;
            }
        };

        let this = self.clone();
        self.inner.poller.clone().async_task(
            Box::new(move || this.connect_inner(addr, local, timeout_ms, cb)),
            true,
        );
    }

    fn connect_inner(
        &self,
        addr: SocketAddr,
        local: Option<SocketAddr>,
        timeout_ms: u64,
        cb: OnConnectCB,
    ) {
        let setup = (|| -> io::Result<RawFd> {
            let fd = sockopt::new_tcp_socket(sockopt::family_of(&addr))?;
            let _ = sockopt::setup_tcp_socket(fd);
            let _ = sockopt::set_reuseaddr(fd);
            if let Some(local) = local {
                if let Err(err) = sockopt::bind(fd, &local) {
                    sockopt::close(fd);
                    return Err(err);
                }
            }
            if let Err(err) = sockopt::connect(fd, &addr) {
                sockopt::close(fd);
                return Err(err);
            }
            Ok(fd)
        })();

        let fd = match setup {
            Ok(fd) => fd,
            Err(err) => {
                cb(Err(SockError::from_os(err)));
                return;
            }
        };

        *self.inner.connect_cb.lock().unwrap() = Some(cb);
        self.set_mode(Mode::Connecting);
        self.attach_fd(fd, SockType::Tcp, true);
        if let Err(err) = self.attach_events() {
            trace!("connect registration failed: {}", err);
            self.finish_connect(Err(SockError::from_os(err)));
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.poller.do_delay_task(
            timeout_ms,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let sock = Socket { inner };
                    sock.finish_connect(Err(SockError::new(
                        ErrorKind::Timeout,
                        "connect timeout",
                    )));
                }
                0
            }),
        );
        *self.inner.connect_timer.lock().unwrap() = Some(timer);
    }

    fn finish_connect(&self, result: Result<(), SockError>) {
        let Some(cb) = self.inner.connect_cb.lock().unwrap().take() else {
            return;
        };
        if let Some(timer) = self.inner.connect_timer.lock().unwrap().take() {
            timer.cancel();
        }
        match result {
            Ok(()) => {
                self.set_mode(Mode::Connected);
                cb(Ok(()));
            }
            Err(err) => {
                // Suppress any later on_err: the connect callback is the
                // one and only report for a failed connect.
                self.inner.err_fired.store(true, Ordering::SeqCst);
                self.close();
                cb(Err(err));
            }
        }
    }

    // ===== Listen / accept =====

    /// Listen for TCP connections. `on_accept` fires on this socket's
    /// poller for every new peer.
    pub fn listen(&self, port: u16, local_ip: &str, backlog: i32) -> io::Result<()> {
        let addr: SocketAddr = dns::resolve(local_ip, port)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let fd = sockopt::new_tcp_socket(sockopt::family_of(&addr))?;
        sockopt::set_reuseaddr(fd)?;
        let _ = sockopt::set_no_sigpipe(fd);
        if let Err(err) = sockopt::bind(fd, &addr).and_then(|_| sockopt::listen(fd, backlog)) {
            sockopt::close(fd);
            return Err(err);
        }
        self.set_mode(Mode::TcpListen);
        self.attach_fd(fd, SockType::Tcp, false);
        self.attach_events()
    }

    /// Duplicate another socket's listening fd onto this socket's poller,
    /// for one-listener-per-poller accept spreading. Wire callbacks first.
    pub fn clone_from_listen_socket(&self, other: &Socket) -> io::Result<()> {
        let Some(guard) = other.fd_guard() else {
            return Err(no_fd());
        };
        let fd = sockopt::dup(guard.fd)?;
        self.set_mode(other.mode());
        self.attach_fd(fd, guard.sock_type, false);
        self.attach_events()
    }

    // ===== UDP =====

    /// Bind a UDP socket. Reads start flowing immediately; wire `on_read`
    /// before calling.
    pub fn bind_udp(&self, port: u16, local_ip: &str) -> io::Result<()> {
        let addr: SocketAddr = dns::resolve(local_ip, port)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let fd = sockopt::new_udp_socket(sockopt::family_of(&addr))?;
        let _ = sockopt::setup_udp_socket(fd);
        if let Err(err) = sockopt::bind(fd, &addr) {
            sockopt::close(fd);
            return Err(err);
        }
        self.set_mode(Mode::Udp);
        self.attach_fd(fd, SockType::Udp, false);
        self.attach_events()
    }

    /// Associate this UDP socket with one peer. A hard bind (`soft ==
    /// false`) `connect(2)`s the fd so the kernel routes that peer's
    /// datagrams here; a soft bind only remembers the address for `send`.
    pub fn bind_peer_addr(&self, addr: SocketAddr, soft: bool) -> io::Result<()> {
        let raw = RawAddr::from(addr);
        if !soft {
            let Some(guard) = self.fd_guard() else {
                return Err(no_fd());
            };
            sockopt::connect_udp(guard.fd, &raw)?;
            // Connected fd: the kernel fills destinations from now on.
            *self.inner.udp_peer.lock().unwrap() = None;
            return Ok(());
        }
        *self.inner.udp_peer.lock().unwrap() = Some(raw);
        Ok(())
    }

    // ===== Event plumbing =====

    fn attach_fd(&self, fd: RawFd, sock_type: SockType, shutdown_on_close: bool) {
        *self.inner.fd.lock().unwrap() = Some(Arc::new(FdGuard {
            fd,
            sock_type,
            shutdown_on_close,
            poller: self.inner.poller.clone(),
        }));
    }

    /// Register this socket's fd with its poller. Called automatically on
    /// connect/listen/bind paths; accepted sockets call it after their
    /// callbacks are wired.
    pub fn attach_events(&self) -> io::Result<()> {
        let Some(guard) = self.fd_guard() else {
            return Err(no_fd());
        };
        let mut events = PollEvent::WRITE | PollEvent::ERROR;
        if self.inner.enable_recv.load(Ordering::Relaxed) {
            events |= PollEvent::READ;
        }
        if self.mode() == Mode::TcpListen {
            events = PollEvent::READ | PollEvent::ERROR;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.poller.add_event(
            guard.fd,
            events,
            Box::new(move |events| {
                if let Some(inner) = weak.upgrade() {
                    let sock = Socket { inner };
                    sock.on_event(events);
                }
            }),
        )
    }

    fn on_event(&self, events: PollEvent) {
        match self.mode() {
            Mode::Connecting => {
                if events.is_write() || events.is_error() {
                    let result = self
                        .raw_fd()
                        .and_then(|fd| sockopt::take_socket_error(fd).ok())
                        .flatten();
                    match result {
                        Some(err) => self.finish_connect(Err(SockError::from_os(err))),
                        None if events.is_error() => self.finish_connect(Err(SockError::new(
                            ErrorKind::Other,
                            "connect failed",
                        ))),
                        None => self.finish_connect(Ok(())),
                    }
                }
            }
            Mode::TcpListen => {
                if events.is_read() {
                    self.on_acceptable();
                }
                if events.is_error() {
                    self.emit_err(SockError::new(ErrorKind::Other, "listener error"));
                }
            }
            Mode::Connected | Mode::Udp => {
                if events.is_read() && self.inner.enable_recv.load(Ordering::Relaxed) {
                    self.on_readable();
                }
                if events.is_write() {
                    self.flush_data(true);
                }
                if events.is_error() {
                    let err = self
                        .raw_fd()
                        .and_then(|fd| sockopt::take_socket_error(fd).ok())
                        .flatten()
                        .map(SockError::from_os)
                        .unwrap_or_else(|| SockError::new(ErrorKind::Eof, "socket closed"));
                    self.emit_err(err);
                }
            }
            Mode::Invalid | Mode::Closed => {}
        }
    }

    fn on_acceptable(&self) {
        let Some(guard) = self.fd_guard() else { return };
        loop {
            match sockopt::accept(guard.fd) {
                Ok(Some((peer_fd, _peer_addr))) => {
                    let _ = sockopt::setup_tcp_socket(peer_fd);
                    let target = {
                        let mut before = self.inner.on_before_accept.lock().unwrap();
                        match before.as_mut().and_then(|cb| cb()) {
                            Some(poller) => poller,
                            None => EventPollerPool::instance().get_poller(false),
                        }
                    };
                    let peer = Socket::new(target);
                    peer.set_mode(Mode::Connected);
                    peer.attach_fd(peer_fd, SockType::Tcp, true);
                    (*self.inner.on_accept.lock().unwrap())(peer);
                }
                Ok(None) => return,
                Err(err) => {
                    // EMFILE and friends: skip this round, keep listening.
                    warn!("accept failed: {}", err);
                    return;
                }
            }
        }
    }

    fn on_readable(&self) {
        let Some(guard) = self.fd_guard() else { return };
        match guard.sock_type {
            SockType::Tcp => self.read_tcp(guard.fd),
            SockType::Udp => self.read_udp(guard.fd),
        }
    }

    fn read_tcp(&self, fd: RawFd) {
        loop {
            let mut arena = self.inner.tcp_arena.lock().unwrap();
            if arena.len() < TCP_READ_SIZE {
                arena.resize(TCP_READ_SIZE, 0);
            }
            let n = match uio::recv(fd, &mut arena[..]) {
                Ok(0) => {
                    drop(arena);
                    self.emit_err(SockError::new(ErrorKind::Eof, "peer closed"));
                    return;
                }
                Ok(n) => n,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    drop(arena);
                    self.emit_err(SockError::from_os(err));
                    return;
                }
            };
            let mut buffer = BufferRaw::from_slice(&arena[..n]);
            drop(arena);
            (*self.inner.on_read.lock().unwrap())(&mut buffer, None);
            if !self.inner.enable_recv.load(Ordering::Relaxed) {
                return;
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn read_udp(&self, fd: RawFd) {
        loop {
            let mut arena_slot = self.inner.udp_arena.lock().unwrap();
            let arena = arena_slot
                .get_or_insert_with(|| Box::new([[0; uio::UDP_PACKET_SIZE]; uio::UDP_BURST]));
            let received = match uio::recv_mmsg(fd, &mut arena[..]) {
                Ok(received) => received,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    drop(arena_slot);
                    self.emit_err(SockError::from_os(err));
                    return;
                }
            };
            let count = received.len();
            let mut packets = Vec::with_capacity(count);
            for (i, (len, raw)) in received.into_iter().enumerate() {
                let addr = raw.to_socket_addr().ok();
                packets.push((BufferRaw::from_slice(&arena[i][..len]), addr));
            }
            drop(arena_slot);
            for (mut buffer, addr) in packets {
                (*self.inner.on_read.lock().unwrap())(&mut buffer, addr);
            }
            if count < uio::UDP_BURST || !self.inner.enable_recv.load(Ordering::Relaxed) {
                return;
            }
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn read_udp(&self, fd: RawFd) {
        let mut buf = [0u8; uio::UDP_PACKET_SIZE];
        loop {
            match uio::recv_from(fd, &mut buf) {
                Ok((len, raw)) => {
                    let mut buffer = BufferRaw::from_slice(&buf[..len]);
                    let addr = raw.to_socket_addr().ok();
                    (*self.inner.on_read.lock().unwrap())(&mut buffer, addr);
                    if !self.inner.enable_recv.load(Ordering::Relaxed) {
                        return;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.emit_err(SockError::from_os(err));
                    return;
                }
            }
        }
    }

    // ===== Send pipeline =====

    /// Queue bytes for sending. Returns the number of bytes accepted, or
    /// -1 once the socket is closed or errored.
    pub fn send(&self, data: &[u8]) -> isize {
        self.send_packet(SendPacket::new(Bytes::copy_from_slice(data)))
    }

    /// Queue an owned buffer without copying.
    pub fn send_bytes(&self, data: Bytes) -> isize {
        self.send_packet(SendPacket::new(data))
    }

    /// Queue one datagram to an explicit destination (UDP only).
    pub fn send_to(&self, data: Bytes, addr: SocketAddr) -> isize {
        self.send_packet(SendPacket::to(data, RawAddr::from(addr)))
    }

    pub fn send_packet(&self, mut packet: SendPacket) -> isize {
        if self.inner.err_fired.load(Ordering::SeqCst) || self.fd_guard().is_none() {
            return -1;
        }
        let size = packet.data.len();
        if size == 0 {
            return 0;
        }
        if packet.addr.is_none() {
            if let Some(peer) = *self.inner.udp_peer.lock().unwrap() {
                packet.addr = Some(peer);
            }
        }
        // Lock order everywhere is `sending` before `waiting`.
        let sending_idle = self.inner.send_sending.lock().unwrap().is_none();
        let arm_timer = {
            let mut waiting = self.inner.send_waiting.lock().unwrap();
            let was_idle = waiting.is_empty() && sending_idle;
            waiting.push_back(packet);
            was_idle
        };
        if arm_timer {
            self.inner.send_ticker.lock().unwrap().reset();
            self.arm_send_timer();
        }

        if self.inner.poller.is_current_thread() {
            self.flush_data(false);
        } else {
            let this = self.clone();
            self.inner
                .poller
                .async_task(Box::new(move || this.flush_data(false)), false);
        }
        size as isize
    }

    /// Drain `sending`, then cut new batches from `waiting`, until the
    /// kernel pushes back or everything is out. No-op on empty queues.
    fn flush_data(&self, from_write_event: bool) {
        let Some(guard) = self.fd_guard() else { return };
        let flags = self.inner.send_flags.load(Ordering::Relaxed) as i32 | uio::SEND_FLAGS;
        let is_udp = guard.sock_type == SockType::Udp;
        let mut sent_any = false;

        loop {
            let mut sending = self.inner.send_sending.lock().unwrap();
            if sending.is_none() {
                let mut waiting = self.inner.send_waiting.lock().unwrap();
                if waiting.is_empty() {
                    drop(waiting);
                    drop(sending);
                    if sent_any || from_write_event {
                        self.stop_writeable();
                    }
                    // Only a drain that actually moved bytes flushes;
                    // spurious wake-ups on empty queues stay silent.
                    if sent_any {
                        (*self.inner.on_flush.lock().unwrap())();
                    }
                    return;
                }
                *sending = Some(BufferList::new(std::mem::take(&mut *waiting), is_udp));
            }

            let list = sending.as_mut().expect("just filled");
            match list.send(guard.fd, flags) {
                Ok(sent) => {
                    if sent > 0 {
                        sent_any = true;
                        self.inner.send_ticker.lock().unwrap().reset();
                    }
                    if list.is_empty() {
                        *sending = None;
                        continue;
                    }
                    // Partial batch: wait for writability.
                    drop(sending);
                    self.start_writeable();
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    drop(sending);
                    self.start_writeable();
                    return;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    drop(sending);
                    self.emit_err(SockError::from_os(err));
                    return;
                }
            }
        }
    }

    /// Bytes queued but not yet accepted by the kernel.
    pub fn pending_send_bytes(&self) -> usize {
        let waiting: usize = self
            .inner
            .send_waiting
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.data.len())
            .sum();
        let sending = self
            .inner
            .send_sending
            .lock()
            .unwrap()
            .as_ref()
            .map(|list| list.remaining())
            .unwrap_or(0);
        waiting + sending
    }

    fn start_writeable(&self) {
        // Write interest is part of the registration already (edge
        // triggered); nothing to re-arm beyond making sure recv state did
        // not drop it.
        if let Some(guard) = self.fd_guard() {
            if self.mode() == Mode::TcpListen {
                return;
            }
            let mut events = PollEvent::WRITE | PollEvent::ERROR;
            if self.inner.enable_recv.load(Ordering::Relaxed) {
                events |= PollEvent::READ;
            }
            let _ = self.inner.poller.modify_event(guard.fd, events);
        }
    }

    fn stop_writeable(&self) {
        // Edge-triggered write interest is armed by the kernel only after
        // EAGAIN; leaving it registered costs nothing, so this is a
        // placeholder for level-triggered fallbacks.
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        if let Some(guard) = self.fd_guard() {
            if self.mode() == Mode::TcpListen {
                return;
            }
            let mut events = PollEvent::ERROR;
            if self.inner.enable_recv.load(Ordering::Relaxed) {
                events |= PollEvent::READ;
            }
            let _ = self.inner.poller.modify_event(guard.fd, events);
        }
    }

    fn arm_send_timer(&self) {
        if self.inner.send_timer_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let timeout_ms = self.inner.send_timeout_ms.load(Ordering::Relaxed);
        self.inner.poller.do_delay_task(
            timeout_ms,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else { return 0 };
                let sock = Socket { inner };
                let busy = {
                    let waiting = sock.inner.send_waiting.lock().unwrap();
                    !waiting.is_empty()
                        || sock.inner.send_sending.lock().unwrap().is_some()
                };
                if !busy {
                    sock.inner.send_timer_armed.store(false, Ordering::SeqCst);
                    return 0;
                }
                let max = sock.inner.send_timeout_ms.load(Ordering::Relaxed);
                let elapsed = sock.inner.send_ticker.lock().unwrap().elapsed_millis();
                if elapsed >= max {
                    sock.inner.send_timer_armed.store(false, Ordering::SeqCst);
                    sock.emit_err(SockError::new(ErrorKind::Timeout, "send timeout"));
                    return 0;
                }
                max - elapsed
            }),
        );
    }

    // ===== Teardown =====

    /// Graceful, user-initiated teardown: the socket closes and `on_err`
    /// reports `Shutdown` with the given reason.
    pub fn shutdown(&self, reason: &str) {
        self.emit_err(SockError::new(ErrorKind::Shutdown, reason));
    }

    /// Close without firing callbacks.
    ///
    /// Registered callbacks often hold the session that in turn holds this
    /// socket; they are dropped (on the poller thread, after the current
    /// dispatch finishes) so the reference cycle is broken.
    pub fn close(&self) {
        if let Some(timer) = self.inner.connect_timer.lock().unwrap().take() {
            timer.cancel();
        }
        self.set_mode(Mode::Closed);
        self.inner.err_fired.store(true, Ordering::SeqCst);
        self.inner.send_waiting.lock().unwrap().clear();
        self.inner.send_sending.lock().unwrap().take();
        self.inner.fd.lock().unwrap().take();
        let this = self.clone();
        self.inner
            .poller
            .async_task(Box::new(move || this.clear_callbacks()), false);
    }

    fn clear_callbacks(&self) {
        *self.inner.on_read.lock().unwrap() = Box::new(|_, _| {});
        *self.inner.on_err.lock().unwrap() = Box::new(|_| {});
        *self.inner.on_flush.lock().unwrap() = Box::new(|| {});
        *self.inner.on_accept.lock().unwrap() = Box::new(|_| {});
        *self.inner.on_before_accept.lock().unwrap() = None;
        *self.inner.connect_cb.lock().unwrap() = None;
    }

    /// Exactly-once error delivery: closes the socket, then fires `on_err`
    /// on the poller thread. Delivery is always deferred to the next loop
    /// turn so a handler observing the error never re-enters whatever
    /// callback raised it.
    pub(crate) fn emit_err(&self, err: SockError) {
        if self.inner.err_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        self.inner.poller.async_task(
            Box::new(move || {
                let mut cb = std::mem::replace(
                    &mut *this.inner.on_err.lock().unwrap(),
                    Box::new(|_| {}),
                );
                this.close();
                cb(&err);
            }),
            false,
        );
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.raw_fd())
            .field("mode", &self.mode())
            .finish()
    }
}

fn no_fd() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket has no fd")
}
