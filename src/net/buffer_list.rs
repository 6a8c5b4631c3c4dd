//! Outbound batch snapshots.
//!
//! A [`BufferList`] freezes one swap of the socket's `waiting` queue and
//! drains it through whichever batched syscall the platform offers: one
//! `sendmsg` with an iovec per buffer for TCP, one `sendmmsg` with a
//! destination per datagram for UDP on Linux, and a `sendto` loop
//! elsewhere. A cursor survives partial sends so re-offsets account for
//! whichever syscall ran.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;

use bytes::Bytes;

use crate::sys::{uio, RawAddr};

/// Completion hook for one outbound buffer: `true` once the kernel took the
/// whole buffer, `false` when it is dropped unsent.
pub type OnSendDone = Box<dyn FnOnce(bool) + Send>;

/// One queued outbound buffer. The `Bytes` handle keeps the underlying
/// storage alive until the syscall consumed it.
pub struct SendPacket {
    pub data: Bytes,
    /// Per-packet destination; `None` sends to the connected peer.
    pub addr: Option<RawAddr>,
    pub on_done: Option<OnSendDone>,
}

impl SendPacket {
    pub fn new(data: Bytes) -> SendPacket {
        SendPacket {
            data,
            addr: None,
            on_done: None,
        }
    }

    pub fn to(data: Bytes, addr: RawAddr) -> SendPacket {
        SendPacket {
            data,
            addr: Some(addr),
            on_done: None,
        }
    }
}

impl std::fmt::Debug for SendPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPacket")
            .field("len", &self.data.len())
            .field("addr", &self.addr)
            .finish()
    }
}

/// Immutable snapshot of one send batch, drained by repeated
/// [`send`](BufferList::send) calls until empty or the socket errors.
pub struct BufferList {
    packets: VecDeque<SendPacket>,
    remain_bytes: usize,
    /// Bytes of the front packet already accepted by the kernel (TCP only;
    /// datagrams are all-or-nothing).
    front_offset: usize,
    is_udp: bool,
}

impl BufferList {
    pub fn new(packets: VecDeque<SendPacket>, is_udp: bool) -> BufferList {
        let remain_bytes = packets.iter().map(|p| p.data.len()).sum();
        BufferList {
            packets,
            remain_bytes,
            front_offset: 0,
            is_udp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.remain_bytes
    }

    /// Attempt one batched send. Returns bytes the kernel accepted; the
    /// cursor advances and fully-sent packets fire their completion hooks.
    /// `WouldBlock` with partial progress is reported as `Ok(progress)`;
    /// callers re-arm write interest while [`is_empty`](BufferList::is_empty)
    /// is false.
    pub fn send(&mut self, fd: RawFd, flags: libc::c_int) -> io::Result<usize> {
        if self.is_udp {
            self.send_udp(fd, flags)
        } else {
            self.send_tcp(fd, flags)
        }
    }

    fn send_tcp(&mut self, fd: RawFd, flags: libc::c_int) -> io::Result<usize> {
        let mut slices: Vec<&[u8]> = Vec::with_capacity(self.packets.len().min(uio::IOV_MAX));
        for (i, packet) in self.packets.iter().enumerate().take(uio::IOV_MAX) {
            if i == 0 {
                slices.push(&packet.data[self.front_offset..]);
            } else {
                slices.push(&packet.data[..]);
            }
        }

        let sent = uio::send_iovec(fd, &slices, flags)?;
        self.advance_bytes(sent);
        Ok(sent)
    }

    fn advance_bytes(&mut self, mut sent: usize) {
        self.remain_bytes -= sent.min(self.remain_bytes);
        while sent > 0 {
            let front_left = self.packets[0].data.len() - self.front_offset;
            if sent >= front_left {
                sent -= front_left;
                self.front_offset = 0;
                let mut packet = self.packets.pop_front().expect("cursor within packets");
                if let Some(done) = packet.on_done.take() {
                    done(true);
                }
            } else {
                self.front_offset += sent;
                sent = 0;
            }
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn send_udp(&mut self, fd: RawFd, flags: libc::c_int) -> io::Result<usize> {
        let batch: Vec<(&[u8], Option<RawAddr>)> = self
            .packets
            .iter()
            .take(uio::IOV_MAX)
            .map(|packet| (&packet.data[..], packet.addr))
            .collect();

        let sent_packets = uio::send_mmsg(fd, &batch, flags)?;
        let mut sent_bytes = 0;
        for _ in 0..sent_packets {
            let mut packet = self.packets.pop_front().expect("kernel sent within batch");
            sent_bytes += packet.data.len();
            if let Some(done) = packet.on_done.take() {
                done(true);
            }
        }
        self.remain_bytes -= sent_bytes.min(self.remain_bytes);
        Ok(sent_bytes)
    }

    /// Per-packet fallback for platforms without `sendmmsg`.
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn send_udp(&mut self, fd: RawFd, flags: libc::c_int) -> io::Result<usize> {
        let mut sent_bytes = 0;
        while let Some(packet) = self.packets.front() {
            match uio::send_to(fd, &packet.data, packet.addr.as_ref(), flags) {
                Ok(_) => {
                    let mut packet = self.packets.pop_front().expect("front exists");
                    sent_bytes += packet.data.len();
                    self.remain_bytes -= packet.data.len().min(self.remain_bytes);
                    if let Some(done) = packet.on_done.take() {
                        done(true);
                    }
                }
                Err(err) => {
                    if sent_bytes > 0 && err.kind() == io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(err);
                }
            }
        }
        Ok(sent_bytes)
    }
}

impl Drop for BufferList {
    fn drop(&mut self) {
        // Unsent packets report failure so senders relying on per-packet
        // confirmation (the UDP server, KCP) observe the loss.
        for packet in self.packets.iter_mut() {
            if let Some(done) = packet.on_done.take() {
                done(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn packets(sizes: &[usize]) -> VecDeque<SendPacket> {
        sizes
            .iter()
            .map(|&n| SendPacket::new(Bytes::from(vec![0xabu8; n])))
            .collect()
    }

    #[test]
    fn advance_walks_the_cursor() {
        let mut list = BufferList::new(packets(&[4, 4, 4]), false);
        assert_eq!(list.remaining(), 12);

        list.advance_bytes(6);
        assert_eq!(list.remaining(), 6);
        assert_eq!(list.packets.len(), 2);
        assert_eq!(list.front_offset, 2);

        list.advance_bytes(6);
        assert!(list.is_empty());
        assert_eq!(list.remaining(), 0);
    }

    #[test]
    fn completion_fires_per_packet() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut queue = packets(&[4, 4]);
        for packet in queue.iter_mut() {
            let fired = fired.clone();
            packet.on_done = Some(Box::new(move |ok| {
                assert!(ok);
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let mut list = BufferList::new(queue, false);
        list.advance_bytes(5);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        list.advance_bytes(3);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_unsent_reports_failure() {
        let failed = Arc::new(AtomicUsize::new(0));
        let mut queue = packets(&[4]);
        let failed2 = failed.clone();
        queue[0].on_done = Some(Box::new(move |ok| {
            assert!(!ok);
            failed2.fetch_add(1, Ordering::SeqCst);
        }));
        drop(BufferList::new(queue, true));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }
}
