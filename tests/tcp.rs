//! End-to-end TCP server behavior over loopback.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use netkit::buffer::{Buffer, BufferRaw};
use netkit::net::{ClientHandler, Session, Socket, TcpClient, TcpServer};
use netkit::{ErrorKind, SockError};

struct EchoSession {
    socket: Socket,
    manager_ticks: Arc<AtomicUsize>,
}

impl Session for EchoSession {
    fn on_recv(&mut self, buf: &mut BufferRaw) {
        self.socket.send(buf.data());
    }

    fn on_error(&mut self, _err: &SockError) {}

    fn on_manager(&mut self) {
        self.manager_ticks.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn echo_one_megabyte_and_manager_ticks() {
    let manager_ticks = Arc::new(AtomicUsize::new(0));
    let ticks = manager_ticks.clone();
    let server = TcpServer::new(Box::new(move |socket, _id| {
        Box::new(EchoSession {
            socket,
            manager_ticks: ticks.clone(),
        })
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    let start = Instant::now();
    let mut rng = rand::rng();
    let payload: Vec<u8> = (0..1024 * 1024).map(|_| rng.random()).collect();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_nodelay(true).unwrap();
    let mut reader = stream.try_clone().unwrap();
    let expected = payload.clone();
    let reader_thread = std::thread::spawn(move || {
        let mut received = vec![0u8; expected.len()];
        reader
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut off = 0;
        while off < received.len() {
            match reader.read(&mut received[off..]) {
                Ok(0) => panic!("server closed early"),
                Ok(n) => off += n,
                Err(err) => panic!("echo read failed at {}: {}", off, err),
            }
        }
        assert_eq!(received, expected);
    });

    for chunk in payload.chunks(4096) {
        stream.write_all(chunk).unwrap();
    }
    reader_thread.join().unwrap();
    assert_eq!(server.session_count(), 1);

    // Scenario runs five seconds; the 2 s manager must tick at least twice.
    let elapsed = start.elapsed();
    if elapsed < Duration::from_millis(4600) {
        std::thread::sleep(Duration::from_millis(4600) - elapsed);
    }
    assert!(
        manager_ticks.load(Ordering::SeqCst) >= 2,
        "manager ticked {} times",
        manager_ticks.load(Ordering::SeqCst)
    );

    server.stop();
}

/// Large enough that kernel buffers on both ends cannot swallow it whole,
/// even with loopback autotuning.
const PUSH_BLOB_SIZE: usize = 32 * 1024 * 1024;

struct PushSession {
    socket: Socket,
}

impl Session for PushSession {
    fn on_recv(&mut self, buf: &mut BufferRaw) {
        // Any request triggers a large response.
        let _ = buf;
        let blob = vec![0x5au8; PUSH_BLOB_SIZE];
        self.socket.send(&blob);
    }

    fn on_error(&mut self, _err: &SockError) {}
}

#[test]
fn backpressure_flush_waits_for_reader() {
    let flushed = Arc::new(AtomicBool::new(false));
    let flushed2 = flushed.clone();
    let server = TcpServer::new(Box::new(move |socket, _id| {
        let flushed = flushed2.clone();
        socket.set_on_flush(Box::new(move || {
            flushed.store(true, Ordering::SeqCst);
        }));
        Box::new(PushSession { socket })
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"GO").unwrap();

    // Suspended reader: the 4 MiB response cannot fit in kernel buffers,
    // so the flush callback must still be pending.
    std::thread::sleep(Duration::from_millis(700));
    assert!(
        !flushed.load(Ordering::SeqCst),
        "flush fired with the reader suspended"
    );

    // Drain everything; the flush follows.
    let mut total = 0;
    let mut buf = vec![0u8; 64 * 1024];
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    while total < PUSH_BLOB_SIZE {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0);
        total += n;
    }
    let deadline = Instant::now() + Duration::from_secs(3);
    while !flushed.load(Ordering::SeqCst) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(flushed.load(Ordering::SeqCst), "flush never fired");

    server.stop();
}

#[test]
fn send_timeout_tears_the_socket_down() {
    let errored = Arc::new(Mutex::new(None::<SockError>));
    let errored2 = errored.clone();
    let server = TcpServer::new(Box::new(move |socket, _id| {
        socket.set_send_timeout(1_000);
        let errored = errored2.clone();
        Box::new(TimeoutProbeSession {
            socket,
            errored,
        })
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.write_all(b"GO").unwrap();

    // Never read: the dead-man timer must fire roughly at the configured
    // window.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(err) = errored.lock().unwrap().clone() {
            assert_eq!(err.kind(), ErrorKind::Timeout);
            assert!(err.reason().contains("send"));
            break;
        }
        assert!(Instant::now() < deadline, "send timeout never fired");
        std::thread::sleep(Duration::from_millis(50));
    }

    server.stop();
}

struct TimeoutProbeSession {
    socket: Socket,
    errored: Arc<Mutex<Option<SockError>>>,
}

impl Session for TimeoutProbeSession {
    fn on_recv(&mut self, _buf: &mut BufferRaw) {
        // More than the kernel will buffer with a stuck reader.
        let blob = vec![0u8; PUSH_BLOB_SIZE];
        self.socket.send(&blob);
    }

    fn on_error(&mut self, err: &SockError) {
        *self.errored.lock().unwrap() = Some(err.clone());
    }
}

#[test]
fn idle_socket_never_flushes() {
    let flushes = Arc::new(AtomicUsize::new(0));
    let flushes2 = flushes.clone();
    let server = TcpServer::new(Box::new(move |socket, _id| {
        let flushes = flushes2.clone();
        socket.set_on_flush(Box::new(move || {
            flushes.fetch_add(1, Ordering::SeqCst);
        }));
        Box::new(SilentSession)
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    let _stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(flushes.load(Ordering::SeqCst), 0);

    server.stop();
}

struct SilentSession;

impl Session for SilentSession {
    fn on_recv(&mut self, _buf: &mut BufferRaw) {}
    fn on_error(&mut self, _err: &SockError) {}
}

struct ProbeClient {
    connected: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl ClientHandler for ProbeClient {
    fn on_connect(&mut self, result: Result<(), SockError>) {
        result.expect("connect should succeed");
        self.connected.store(true, Ordering::SeqCst);
    }

    fn on_recv(&mut self, buf: &mut BufferRaw) {
        self.received.lock().unwrap().extend_from_slice(buf.data());
    }

    fn on_error(&mut self, _err: &SockError) {}
}

#[test]
fn tcp_client_round_trip() {
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks2 = ticks.clone();
    let server = TcpServer::new(Box::new(move |socket, _id| {
        Box::new(EchoSession {
            socket,
            manager_ticks: ticks2.clone(),
        })
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    let connected = Arc::new(AtomicBool::new(false));
    let received = Arc::new(Mutex::new(Vec::new()));
    let client = TcpClient::new(Box::new(ProbeClient {
        connected: connected.clone(),
        received: received.clone(),
    }));
    client.connect("127.0.0.1", port, 2_000);

    let deadline = Instant::now() + Duration::from_secs(3);
    while !connected.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "client never connected");
        std::thread::sleep(Duration::from_millis(10));
    }

    let payload = b"ping over the client helper";
    assert_eq!(client.send(payload), payload.len() as isize);

    let deadline = Instant::now() + Duration::from_secs(3);
    while received.lock().unwrap().len() < payload.len() {
        assert!(Instant::now() < deadline, "echo never arrived");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(received.lock().unwrap().as_slice(), &payload[..]);

    client.shutdown("test done");
    server.stop();
}

#[test]
fn connect_to_closed_port_is_refused() {
    // Grab a port that is certainly closed.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let poller = netkit::EventPollerPool::instance().get_poller(false);
    let socket = Socket::new(poller);
    let result = Arc::new(Mutex::new(None));
    let result2 = result.clone();
    socket.connect(
        "127.0.0.1",
        port,
        2_000,
        Box::new(move |res| {
            *result2.lock().unwrap() = Some(res);
        }),
    );

    let deadline = Instant::now() + Duration::from_secs(4);
    loop {
        if let Some(res) = result.lock().unwrap().take() {
            let err = res.expect_err("connect must fail");
            assert_eq!(err.kind(), ErrorKind::Refused);
            break;
        }
        assert!(Instant::now() < deadline, "connect callback never fired");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn shutdown_reports_exactly_one_error() {
    let errors = Arc::new(AtomicUsize::new(0));
    let errors2 = errors.clone();
    let server = TcpServer::new(Box::new(move |socket, _id| {
        let errors = errors2.clone();
        Box::new(CountingSession {
            _socket: socket,
            errors,
        })
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    drop(stream);
    std::thread::sleep(Duration::from_millis(500));

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(server.session_count(), 0);
    server.stop();
}

struct CountingSession {
    _socket: Socket,
    errors: Arc<AtomicUsize>,
}

impl Session for CountingSession {
    fn on_recv(&mut self, _buf: &mut BufferRaw) {}
    fn on_error(&mut self, _err: &SockError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}
