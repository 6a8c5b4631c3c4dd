//! KCP recovery under loss and the transport glue over real sockets.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use netkit::kcp::{Kcp, KcpTransport};
use netkit::net::Socket;
use netkit::EventPollerPool;

type Wire = Arc<Mutex<Vec<Vec<u8>>>>;

fn machine(conv: Option<u32>) -> (Kcp, Wire) {
    let wire: Wire = Arc::new(Mutex::new(Vec::new()));
    let sink = wire.clone();
    let output = Box::new(move |data: &[u8]| {
        sink.lock().unwrap().push(data.to_vec());
    });
    let kcp = match conv {
        Some(conv) => Kcp::new(conv, output),
        None => Kcp::new_server(output),
    };
    (kcp, wire)
}

/// Unidirectional lossy link: 30 % uniform loss, +30 ms delay.
struct LossyLink {
    rng: StdRng,
    loss: f64,
    delay_ms: u32,
    in_flight: VecDeque<(u32, Vec<u8>)>,
}

impl LossyLink {
    fn new(seed: u64, loss: f64, delay_ms: u32) -> LossyLink {
        LossyLink {
            rng: StdRng::seed_from_u64(seed),
            loss,
            delay_ms,
            in_flight: VecDeque::new(),
        }
    }

    fn push(&mut self, now: u32, datagram: Vec<u8>) {
        if self.rng.random::<f64>() < self.loss {
            return;
        }
        self.in_flight.push_back((now + self.delay_ms, datagram));
    }

    fn pop_due(&mut self, now: u32) -> Option<Vec<u8>> {
        match self.in_flight.front() {
            Some(&(due, _)) if due <= now => self.in_flight.pop_front().map(|(_, d)| d),
            _ => None,
        }
    }
}

#[test]
fn kcp_recovers_all_data_through_thirty_percent_loss() {
    let (mut sender, wire_s) = machine(Some(0xbeef));
    let (mut receiver, wire_r) = machine(None);

    // Big windows so loss, not flow control, dominates the run.
    sender.set_wndsize(128, 256);
    receiver.set_wndsize(128, 256);
    sender.set_nodelay(netkit::kcp::DelayMode::Fast, 10, 2, false);
    receiver.set_nodelay(netkit::kcp::DelayMode::Fast, 10, 2, false);

    const MESSAGE: usize = 512;
    const MESSAGES: usize = 4096; // 2 MiB total

    let mut rng = StdRng::seed_from_u64(7);
    let mut sent_payload = Vec::with_capacity(MESSAGE * MESSAGES);
    let mut queued = 0usize;

    // Downstream is lossy and slow; the ACK path is clean.
    let mut down = LossyLink::new(1, 0.30, 30);
    let mut up = LossyLink::new(2, 0.0, 5);

    let mut received_payload = Vec::with_capacity(MESSAGE * MESSAGES);
    let mut now: u32 = 0;

    while received_payload.len() < MESSAGE * MESSAGES {
        now += 10;
        assert!(now < 3_000_000, "simulation did not converge");

        // Feed the sender while staying inside its queue budget.
        while queued < MESSAGES && sender.wait_snd() < 512 {
            let message: Vec<u8> = (0..MESSAGE).map(|_| rng.random()).collect();
            sender.send(&message).unwrap();
            sent_payload.extend_from_slice(&message);
            queued += 1;
        }

        sender.update(now);
        for datagram in std::mem::take(&mut *wire_s.lock().unwrap()) {
            down.push(now, datagram);
        }
        while let Some(datagram) = down.pop_due(now) {
            receiver.input(&datagram);
        }

        receiver.update(now);
        for datagram in std::mem::take(&mut *wire_r.lock().unwrap()) {
            up.push(now, datagram);
        }
        while let Some(datagram) = up.pop_due(now) {
            sender.input(&datagram);
        }

        while let Some(message) = receiver.recv() {
            received_payload.extend_from_slice(&message);
        }
    }

    assert_eq!(received_payload, sent_payload);
    assert_eq!(receiver.conv(), 0xbeef);

    let stats = sender.stats();
    assert!(
        stats.retrans_segments >= 500,
        "expected heavy retransmission, got {}",
        stats.retrans_segments
    );
    assert!(
        stats.max_xmit < netkit::kcp::KCP_DEADLINK,
        "a segment came too close to dead_link: {}",
        stats.max_xmit
    );
    assert!(!sender.is_dead_link());
}

#[test]
fn transport_round_trip_over_loopback() {
    let pool = EventPollerPool::instance();

    // Server: raw socket, manual wiring so the first datagram soft-binds
    // the reply path.
    let server_socket = Socket::new(pool.get_poller(false));
    let server_transport = KcpTransport::new_server(server_socket.clone());
    {
        let transport = server_transport.clone();
        let socket = server_socket.clone();
        let bound = Arc::new(Mutex::new(false));
        server_socket.set_on_read(Box::new(move |buf, addr| {
            let mut bound = bound.lock().unwrap();
            if !*bound {
                if let Some(addr) = addr {
                    socket.bind_peer_addr(addr, true).unwrap();
                    *bound = true;
                }
            }
            use netkit::buffer::Buffer;
            transport.input(buf.data());
        }));
    }
    // Echo every message back.
    {
        let transport = server_transport.clone();
        server_transport.set_on_read(Box::new(move |message| {
            transport.send(&message).unwrap();
        }));
    }
    server_socket.bind_udp(0, "127.0.0.1").unwrap();
    let server_port = server_socket.local_addr().unwrap().port();
    server_transport.set_nodelay(netkit::kcp::DelayMode::NoDelay, 10, 2, true);

    // Client: automatic read wiring.
    let client_socket = Socket::new(pool.get_poller(false));
    client_socket.bind_udp(0, "127.0.0.1").unwrap();
    client_socket
        .bind_peer_addr(
            format!("127.0.0.1:{}", server_port).parse().unwrap(),
            true,
        )
        .unwrap();
    let client_transport = KcpTransport::new_client(client_socket.clone());
    client_transport.set_nodelay(netkit::kcp::DelayMode::NoDelay, 10, 2, true);
    client_transport.bind_socket_reads();

    let echoed: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let echoed = echoed.clone();
        client_transport.set_on_read(Box::new(move |message| {
            echoed.lock().unwrap().extend_from_slice(&message);
        }));
    }

    let mut rng = StdRng::seed_from_u64(99);
    let mut sent = Vec::new();
    for _ in 0..200 {
        let message: Vec<u8> = (0..1024).map(|_| rng.random()).collect();
        client_transport.send(&message).unwrap();
        sent.extend_from_slice(&message);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while echoed.lock().unwrap().len() < sent.len() {
        assert!(
            Instant::now() < deadline,
            "echoed {} of {} bytes",
            echoed.lock().unwrap().len(),
            sent.len()
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(*echoed.lock().unwrap(), sent);
    // The passive side adopted the active side's conv.
    assert_eq!(server_transport.conv(), client_transport.conv());

    client_transport.stop();
    server_transport.stop();
}
