//! UDP server demultiplexing over loopback.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netkit::buffer::{Buffer, BufferRaw};
use netkit::net::{Session, UdpServer};
use netkit::SockError;

type Received = Arc<Mutex<HashMap<u32, Vec<u32>>>>;

struct RecordingSession {
    received: Received,
}

impl Session for RecordingSession {
    fn on_recv(&mut self, buf: &mut BufferRaw) {
        let data = buf.data();
        assert!(data.len() >= 8, "short packet: {}", data.len());
        let client = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let seq = u32::from_be_bytes(data[4..8].try_into().unwrap());
        self.received.lock().unwrap().entry(client).or_default().push(seq);
    }

    fn on_error(&mut self, _err: &SockError) {}
}

#[test]
fn four_peers_demultiplex_into_four_sessions() {
    let received: Received = Arc::new(Mutex::new(HashMap::new()));
    let received2 = received.clone();
    let server = UdpServer::new(Box::new(move |_socket, _id| {
        Box::new(RecordingSession {
            received: received2.clone(),
        })
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    const CLIENTS: u32 = 4;
    const PACKETS: u32 = 100;

    let mut handles = Vec::new();
    for client in 0..CLIENTS {
        handles.push(std::thread::spawn(move || {
            let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
            socket.connect(("127.0.0.1", port)).unwrap();
            for seq in 0..PACKETS {
                let mut packet = Vec::with_capacity(8);
                packet.extend_from_slice(&client.to_be_bytes());
                packet.extend_from_slice(&seq.to_be_bytes());
                socket.send(&packet).unwrap();
                if seq == 0 {
                    // Let the first packet create the session before the
                    // rest race across reactors.
                    std::thread::sleep(Duration::from_millis(100));
                } else if seq % 20 == 0 {
                    std::thread::sleep(Duration::from_millis(2));
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Wait until everything is accounted for.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let done = {
            let received = received.lock().unwrap();
            received.len() == CLIENTS as usize
                && received.values().all(|seqs| seqs.len() == PACKETS as usize)
        };
        if done {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "incomplete delivery: {:?}",
            received
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (*k, v.len()))
                .collect::<Vec<_>>()
        );
        std::thread::sleep(Duration::from_millis(20));
    }

    // Each session saw exactly its own packets, in order.
    let received = received.lock().unwrap();
    for client in 0..CLIENTS {
        let seqs = &received[&client];
        assert_eq!(seqs, &(0..PACKETS).collect::<Vec<_>>(), "client {}", client);
    }
    assert_eq!(server.session_count(), CLIENTS as usize);

    server.stop();
}

#[test]
fn first_datagram_creates_a_session() {
    let received: Received = Arc::new(Mutex::new(HashMap::new()));
    let received2 = received.clone();
    let server = UdpServer::new(Box::new(move |_socket, _id| {
        Box::new(RecordingSession {
            received: received2.clone(),
        })
    }));
    let port = server.start(0, "127.0.0.1").unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.connect(("127.0.0.1", port)).unwrap();
    socket.send(&[0, 0, 0, 9, 0, 0, 0, 0]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while server.session_count() == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(server.session_count(), 1);

    server.stop();
}
