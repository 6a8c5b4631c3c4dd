//! Reliable, ordered, congestion-controlled transport over unreliable
//! datagrams (the KCP protocol).
//!
//! [`Kcp`] is the pure protocol machine: packets in through
//! [`input`](Kcp::input), application bytes in through [`send`](Kcp::send),
//! assembled messages out through [`recv`](Kcp::recv), and encoded packets
//! out through the output callback whenever [`update`](Kcp::update) decides
//! to transmit. [`KcpTransport`] binds one of these to a UDP socket and a
//! poller timer.
//!
//! Time is a 32-bit millisecond clock and all sequence arithmetic is
//! modulo 2^32 with signed-difference comparisons.

mod segment;
mod transport;

pub use self::segment::{KcpHeader, KCP_OVERHEAD};
pub use self::transport::KcpTransport;

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use self::segment::{
    is_valid_cmd, KcpSegment, KCP_CMD_ACK, KCP_CMD_PUSH, KCP_CMD_WASK, KCP_CMD_WINS,
};

pub const KCP_RTO_NDL: u32 = 30;
pub const KCP_RTO_MIN: u32 = 100;
pub const KCP_RTO_DEF: u32 = 200;
pub const KCP_RTO_MAX: u32 = 60_000;

const KCP_ASK_SEND: u32 = 1;
const KCP_ASK_TELL: u32 = 2;

pub const KCP_WND_SND: u16 = 32;
pub const KCP_WND_RCV: u16 = 128;

pub const KCP_MTU_DEF: usize = 1400;
pub const KCP_INTERVAL: u32 = 100;
pub const KCP_DEADLINK: u32 = 20;

const KCP_THRESH_INIT: u16 = 2;
const KCP_THRESH_MIN: u16 = 2;

/// 7 s first window probe, backing off 1.5x up to 120 s.
pub const KCP_PROBE_INIT: u32 = 7_000;
pub const KCP_PROBE_LIMIT: u32 = 120_000;

pub const KCP_FASTACK_LIMIT: u32 = 5;

/// Retransmission aggressiveness.
///
/// `Normal` doubles the RTO on loss and pads the first timeout by RTO/8;
/// `Fast` backs off by half steps; `NoDelay` backs off by half of the
/// base RTO and drops the minimum RTO to 30 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayMode {
    Normal,
    Fast,
    NoDelay,
}

/// Signed difference of two 32-bit timestamps / sequence numbers.
#[inline]
fn timediff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

#[inline]
fn bound(lower: u32, value: u32, upper: u32) -> u32 {
    value.clamp(lower, upper)
}

/// Consumes every datagram the protocol wants on the wire. One call is one
/// UDP payload (possibly several KCP packets coalesced up to the MTU).
pub type KcpOutput = Box<dyn FnMut(&[u8]) + Send>;

/// Retransmission statistics, mostly interesting to tests and monitoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct KcpStats {
    /// Segments that needed at least one retransmission.
    pub retrans_segments: u64,
    /// Highest transmit count observed on any single segment.
    pub max_xmit: u32,
}

pub struct Kcp {
    conv: u32,
    conv_init: bool,
    mtu: usize,
    mss: usize,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u16,

    rx_rttval: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u16,
    rcv_wnd: u16,
    rmt_wnd: u16,
    cwnd: u16,
    probe: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    xmit: u32,

    delay_mode: DelayMode,
    updated: bool,

    ts_probe: u32,
    probe_wait: u32,

    dead_link: u32,
    incr: usize,

    snd_queue: VecDeque<KcpSegment>,
    rcv_queue: VecDeque<KcpSegment>,
    snd_buf: VecDeque<KcpSegment>,
    rcv_buf: VecDeque<KcpSegment>,

    /// `(sn, ts)` pairs awaiting an ACK packet on the next flush.
    acklist: Vec<(u32, u32)>,
    /// Coalescing scratch, flushed whenever the next packet would overflow
    /// the MTU.
    buf: BytesMut,

    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,
    stream: bool,
    fastack_conserve: bool,

    stats: KcpStats,

    output: KcpOutput,
}

impl Kcp {
    /// Active opener: `conv` is chosen by the caller and sent in every
    /// packet.
    pub fn new(conv: u32, output: KcpOutput) -> Kcp {
        Kcp::construct(conv, true, output)
    }

    /// Passive opener: the conv is adopted from the first packet received.
    pub fn new_server(output: KcpOutput) -> Kcp {
        Kcp::construct(0, false, output)
    }

    fn construct(conv: u32, conv_init: bool, output: KcpOutput) -> Kcp {
        Kcp {
            conv,
            conv_init,
            mtu: KCP_MTU_DEF,
            mss: KCP_MTU_DEF - KCP_OVERHEAD,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: KCP_THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: KCP_RTO_DEF,
            rx_minrto: KCP_RTO_MIN,
            snd_wnd: KCP_WND_SND,
            rcv_wnd: KCP_WND_RCV,
            rmt_wnd: KCP_WND_RCV,
            cwnd: 0,
            probe: 0,
            current: 0,
            interval: KCP_INTERVAL,
            ts_flush: KCP_INTERVAL,
            xmit: 0,
            delay_mode: DelayMode::Normal,
            updated: false,
            ts_probe: 0,
            probe_wait: 0,
            dead_link: KCP_DEADLINK,
            incr: 0,
            snd_queue: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            acklist: Vec::new(),
            buf: BytesMut::with_capacity((KCP_MTU_DEF + KCP_OVERHEAD) * 3),
            fastresend: 0,
            fastlimit: KCP_FASTACK_LIMIT,
            nocwnd: false,
            stream: false,
            fastack_conserve: false,
            stats: KcpStats::default(),
            output,
        }
    }

    // ===== Configuration =====

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// MTU must leave room for at least one header; MSS follows as
    /// `mtu - 24`.
    pub fn set_mtu(&mut self, mtu: usize) -> io::Result<()> {
        if mtu <= KCP_OVERHEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("mtu {} below header size", mtu),
            ));
        }
        self.mtu = mtu;
        self.mss = mtu - KCP_OVERHEAD;
        Ok(())
    }

    /// Flush cadence in milliseconds, clamped to [10, 5000].
    pub fn set_interval(&mut self, interval: u32) {
        self.interval = bound(10, interval, 5000);
    }

    /// Delay mode, fast-retransmit threshold (0 disables) and congestion
    /// window bypass in one call, after the canonical `nodelay` knob.
    pub fn set_nodelay(&mut self, mode: DelayMode, interval: u32, resend: u32, nocwnd: bool) {
        self.delay_mode = mode;
        self.rx_minrto = if mode == DelayMode::NoDelay {
            KCP_RTO_NDL
        } else {
            KCP_RTO_MIN
        };
        self.set_interval(interval);
        self.fastresend = resend;
        self.nocwnd = nocwnd;
    }

    /// Window sizes in segments. The receive window never goes below the
    /// canonical 128.
    pub fn set_wndsize(&mut self, snd_wnd: u16, rcv_wnd: u16) {
        if snd_wnd > 0 {
            self.snd_wnd = snd_wnd;
        }
        if rcv_wnd > 0 {
            self.rcv_wnd = rcv_wnd.max(KCP_WND_RCV);
        }
    }

    /// Stream mode lets consecutive sends coalesce into the tail segment.
    pub fn set_stream(&mut self, stream: bool) {
        self.stream = stream;
    }

    pub fn set_fastack_conserve(&mut self, conserve: bool) {
        self.fastack_conserve = conserve;
    }

    pub fn set_dead_link(&mut self, dead_link: u32) {
        self.dead_link = dead_link;
    }

    // ===== State observation =====

    /// Transport is considered dead once any segment was transmitted
    /// `dead_link` times without an ACK. The machine keeps running; upper
    /// layers decide what to do.
    pub fn is_dead_link(&self) -> bool {
        self.dead
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    pub fn snd_buf_len(&self) -> usize {
        self.snd_buf.len()
    }

    /// Segments waiting to be sent or awaiting acknowledgement.
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    pub fn stats(&self) -> KcpStats {
        self.stats
    }

    // ===== Send path =====

    /// Queue application bytes. Fragments into at most 128 segments;
    /// anything larger than `mss * 128` is rejected outright. Returns the
    /// bytes accepted.
    pub fn send(&mut self, mut data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if data.len() > self.mss * KCP_WND_RCV as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message of {} bytes exceeds mss * 128", data.len()),
            ));
        }

        let mut accepted = 0;

        // Stream mode: top up the tail segment first.
        if self.stream {
            if let Some(tail) = self.snd_queue.back_mut() {
                if tail.data.len() < self.mss {
                    let extend = data.len().min(self.mss - tail.data.len());
                    let (head, rest) = data.split_at(extend);
                    tail.data.extend_from_slice(head);
                    tail.frg = 0;
                    data = rest;
                    accepted += extend;
                }
            }
            if data.is_empty() {
                return Ok(accepted);
            }
        }

        let count = if data.len() <= self.mss {
            1
        } else {
            (data.len() + self.mss - 1) / self.mss
        };

        for i in 0..count {
            let size = data.len().min(self.mss);
            let (head, rest) = data.split_at(size);
            let mut seg = KcpSegment::with_data(BytesMut::from(head));
            // Fragment numbers count down to the terminal 0; stream mode
            // has no message boundaries so every fragment is terminal.
            seg.frg = if self.stream {
                0
            } else {
                (count - i - 1) as u8
            };
            self.snd_queue.push_back(seg);
            data = rest;
            accepted += size;
        }

        Ok(accepted)
    }

    // ===== Receive path =====

    /// Size of the next complete message, or `None` while fragments are
    /// still missing.
    pub fn peeksize(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.frg == 0 {
            return Some(front.data.len());
        }
        if self.rcv_queue.len() < front.frg as usize + 1 {
            return None;
        }
        let mut size = 0;
        for seg in &self.rcv_queue {
            size += seg.data.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(size)
    }

    /// Pop the next complete message, reassembling fragments. Partial
    /// messages are never surfaced.
    pub fn recv(&mut self) -> Option<Bytes> {
        let size = self.peeksize()?;
        let recover = self.rcv_queue.len() >= self.rcv_wnd as usize;

        let mut message = BytesMut::with_capacity(size);
        while let Some(seg) = self.rcv_queue.pop_front() {
            message.extend_from_slice(&seg.data);
            if seg.frg == 0 {
                break;
            }
        }
        debug_assert_eq!(message.len(), size);

        self.move_buf();

        // The queue was clogged and just reopened; announce the window.
        if recover && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe |= KCP_ASK_TELL;
        }

        Some(message.freeze())
    }

    /// Move contiguous segments from `rcv_buf` into `rcv_queue`.
    fn move_buf(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                let seg = self.rcv_buf.pop_front().expect("front exists");
                self.rcv_queue.push_back(seg);
            } else {
                break;
            }
        }
    }

    // ===== Input path =====

    /// Feed one UDP payload (back-to-back KCP packets). Malformed tails
    /// stop the parse with a warning; effects of already-parsed packets
    /// stick. Returns the bytes consumed.
    pub fn input(&mut self, data: &[u8]) -> usize {
        let mut rest = data;
        let old_una = self.snd_una;
        let mut ack_seen = false;
        let mut max_ack = 0;
        let mut latest_ts = 0;

        while rest.len() >= KCP_OVERHEAD {
            let header = KcpHeader::decode(rest).expect("length checked");
            let body = &rest[KCP_OVERHEAD..];
            if body.len() < header.len as usize {
                warn!(
                    "kcp input truncated: payload {} > remaining {}",
                    header.len,
                    body.len()
                );
                break;
            }
            let payload = &body[..header.len as usize];
            rest = &body[header.len as usize..];

            if !self.conv_init {
                self.conv = header.conv;
                self.conv_init = true;
                trace!("kcp adopted conv {}", self.conv);
            } else if header.conv != self.conv {
                debug!("kcp conv mismatch: {} != {}", header.conv, self.conv);
                continue;
            }

            if !is_valid_cmd(header.cmd) {
                debug!("kcp unknown cmd {}", header.cmd);
                continue;
            }

            self.rmt_wnd = header.wnd;
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                KCP_CMD_ACK => {
                    let rtt = timediff(self.current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();

                    if !ack_seen {
                        ack_seen = true;
                        max_ack = header.sn;
                        latest_ts = header.ts;
                    } else if timediff(header.sn, max_ack) > 0 {
                        if !self.fastack_conserve || timediff(header.ts, latest_ts) > 0 {
                            max_ack = header.sn;
                            latest_ts = header.ts;
                        }
                    }
                }
                KCP_CMD_PUSH => {
                    // Out-of-window data is dropped but still acknowledged.
                    self.acklist.push((header.sn, header.ts));
                    if timediff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) < 0
                        && timediff(header.sn, self.rcv_nxt) >= 0
                    {
                        let mut seg = KcpSegment::with_data(BytesMut::from(payload));
                        seg.conv = header.conv;
                        seg.cmd = header.cmd;
                        seg.frg = header.frg;
                        seg.wnd = header.wnd;
                        seg.ts = header.ts;
                        seg.sn = header.sn;
                        seg.una = header.una;
                        self.parse_data(seg);
                    }
                }
                KCP_CMD_WASK => {
                    self.probe |= KCP_ASK_TELL;
                }
                KCP_CMD_WINS => {}
                _ => unreachable!(),
            }
        }

        if !rest.is_empty() && rest.len() < KCP_OVERHEAD {
            warn!("kcp input trailing {} bytes, too short for a header", rest.len());
        }

        if ack_seen {
            self.parse_fastack(max_ack, latest_ts);
        }

        if timediff(self.snd_una, old_una) > 0 && self.cwnd < self.rmt_wnd {
            self.increase_cwnd();
        }

        data.len() - rest.len()
    }

    /// Slow start below `ssthresh`, AIMD above it; always clamped by the
    /// peer's advertised window.
    fn increase_cwnd(&mut self) {
        let mss = self.mss;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        } else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr += (mss * mss) / self.incr + (mss / 16);
            if (self.cwnd as usize + 1) * mss <= self.incr {
                self.cwnd = ((self.incr + mss - 1) / mss.max(1)) as u16;
            }
        }
        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            self.incr = self.rmt_wnd as usize * mss;
        }
    }

    /// Jacobson/Karels RTT estimation.
    fn update_ack(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt + self.interval.max(4 * self.rx_rttval);
        self.rx_rto = bound(self.rx_minrto, rto, KCP_RTO_MAX);
    }

    /// `snd_una` is the sequence of the oldest in-flight segment, or
    /// `snd_nxt` when nothing is in flight.
    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if timediff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    fn parse_ack(&mut self, sn: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            match timediff(sn, self.snd_buf[i].sn) {
                0 => {
                    self.snd_buf.remove(i);
                    break;
                }
                d if d < 0 => break,
                _ => {}
            }
        }
    }

    /// Count duplicate ACKs against every segment older than `sn`.
    fn parse_fastack(&mut self, sn: u32, ts: u32) {
        if timediff(sn, self.snd_una) < 0 || timediff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in &mut self.snd_buf {
            if timediff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn && (!self.fastack_conserve || timediff(ts, seg.ts) >= 0) {
                seg.fastack += 1;
            }
        }
    }

    /// Insert a PUSH segment into `rcv_buf` keeping ascending-sn order and
    /// rejecting duplicates, then pull any contiguous prefix forward.
    fn parse_data(&mut self, seg: KcpSegment) {
        let sn = seg.sn;
        if timediff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd as u32)) >= 0
            || timediff(sn, self.rcv_nxt) < 0
        {
            return;
        }

        let mut repeat = false;
        let mut insert_at = self.rcv_buf.len();
        for existing in self.rcv_buf.iter().rev() {
            if existing.sn == sn {
                repeat = true;
                break;
            }
            if timediff(sn, existing.sn) > 0 {
                break;
            }
            insert_at -= 1;
        }

        if !repeat {
            self.rcv_buf.insert(insert_at, seg);
        }
        self.move_buf();
    }

    // ===== Transmit path =====

    fn wnd_unused(&self) -> u16 {
        (self.rcv_wnd as usize).saturating_sub(self.rcv_queue.len()) as u16
    }

    fn output_scratch(&mut self) {
        if !self.buf.is_empty() {
            (self.output)(&self.buf);
            self.buf.clear();
        }
    }

    /// Append an encoded packet to the scratch buffer, flushing first if it
    /// would overflow the MTU.
    fn emit(&mut self, seg: &KcpSegment) {
        if self.buf.len() + seg.encoded_len() > self.mtu {
            self.output_scratch();
        }
        seg.encode(&mut self.buf);
    }

    /// Grow the probe timer while the peer advertises a zero window.
    fn probe_wnd_size(&mut self) {
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = KCP_PROBE_INIT;
                self.ts_probe = self.current.wrapping_add(self.probe_wait);
            } else if timediff(self.current, self.ts_probe) >= 0 {
                if self.probe_wait < KCP_PROBE_INIT {
                    self.probe_wait = KCP_PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > KCP_PROBE_LIMIT {
                    self.probe_wait = KCP_PROBE_LIMIT;
                }
                self.ts_probe = self.current.wrapping_add(self.probe_wait);
                self.probe |= KCP_ASK_SEND;
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }
    }

    /// One transmit pass: pending ACKs, window probes, then data segments
    /// (first sends, RTO retransmits, fast retransmits), all coalesced into
    /// MTU-sized datagrams. Ends with the congestion window update.
    pub(crate) fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let mut probe_seg = KcpSegment::default();
        probe_seg.conv = self.conv;
        probe_seg.cmd = KCP_CMD_ACK;
        probe_seg.wnd = self.wnd_unused();
        probe_seg.una = self.rcv_nxt;

        // Acknowledgements first.
        let acklist = std::mem::take(&mut self.acklist);
        for &(sn, ts) in &acklist {
            probe_seg.sn = sn;
            probe_seg.ts = ts;
            self.emit(&probe_seg);
        }
        probe_seg.sn = 0;
        probe_seg.ts = 0;

        // Window probes.
        self.probe_wnd_size();
        if self.probe & KCP_ASK_SEND != 0 {
            probe_seg.cmd = KCP_CMD_WASK;
            self.emit(&probe_seg);
        }
        if self.probe & KCP_ASK_TELL != 0 {
            probe_seg.cmd = KCP_CMD_WINS;
            self.emit(&probe_seg);
        }
        self.probe = 0;

        // Promote queued segments into the in-flight window.
        let mut cwnd = self.snd_wnd.min(self.rmt_wnd);
        if !self.nocwnd {
            cwnd = cwnd.min(self.cwnd);
        }
        while timediff(self.snd_nxt, self.snd_una.wrapping_add(cwnd as u32)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else { break };
            seg.conv = self.conv;
            seg.cmd = KCP_CMD_PUSH;
            seg.wnd = probe_seg.wnd;
            seg.ts = self.current;
            seg.sn = self.snd_nxt;
            seg.una = self.rcv_nxt;
            seg.resendts = self.current;
            seg.rto = self.rx_rto;
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let rtomin = if self.delay_mode == DelayMode::Normal {
            self.rx_rto >> 3
        } else {
            0
        };

        let mut lost = false;
        let mut change = false;

        // Field-disjoint borrows: the loop holds `snd_buf` while the
        // scratch buffer and output callback drain coalesced datagrams.
        for seg in self.snd_buf.iter_mut() {
            let mut need_send = false;
            if seg.xmit == 0 {
                // First transmission.
                need_send = true;
                seg.xmit = 1;
                seg.rto = self.rx_rto;
                seg.resendts = self
                    .current
                    .wrapping_add(seg.rto)
                    .wrapping_add(rtomin);
            } else if timediff(self.current, seg.resendts) >= 0 {
                // RTO expired.
                need_send = true;
                seg.xmit += 1;
                self.xmit += 1;
                seg.rto += match self.delay_mode {
                    DelayMode::Normal => seg.rto.max(self.rx_rto),
                    DelayMode::Fast => seg.rto / 2,
                    DelayMode::NoDelay => self.rx_rto / 2,
                };
                seg.resendts = self.current.wrapping_add(seg.rto);
                lost = true;
            } else if seg.fastack >= resent && seg.xmit <= self.fastlimit {
                // Enough duplicate ACKs accumulated.
                need_send = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resendts = self.current.wrapping_add(seg.rto);
                change = true;
            }

            if need_send {
                seg.ts = self.current;
                seg.wnd = probe_seg.wnd;
                seg.una = self.rcv_nxt;
                if seg.xmit == 2 {
                    self.stats.retrans_segments += 1;
                }
                if seg.xmit > self.stats.max_xmit {
                    self.stats.max_xmit = seg.xmit;
                }
                if seg.xmit >= self.dead_link {
                    self.dead = true;
                }
                if self.buf.len() + seg.encoded_len() > self.mtu {
                    (self.output)(&self.buf);
                    self.buf.clear();
                }
                seg.encode(&mut self.buf);
            }
        }

        self.output_scratch();

        // Congestion window shrink after the pass.
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = ((inflight / 2) as u16).max(KCP_THRESH_MIN);
            self.cwnd = self.ssthresh + if resent == u32::MAX { 0 } else { resent as u16 };
            self.incr = self.cwnd as usize * self.mss;
        }
        if lost {
            self.ssthresh = (cwnd / 2).max(KCP_THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss;
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Transmit immediately, outside the update schedule.
    pub fn flush_now(&mut self, current: u32) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }
        self.flush();
    }

    /// Drive the protocol clock. `current` is a 32-bit millisecond
    /// timestamp; flushes happen every `interval` with clock-jump
    /// resynchronisation.
    pub fn update(&mut self, current: u32) {
        self.current = current;
        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = timediff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if timediff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }
}

impl std::fmt::Debug for Kcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kcp")
            .field("conv", &self.conv)
            .field("snd_una", &self.snd_una)
            .field("snd_nxt", &self.snd_nxt)
            .field("rcv_nxt", &self.rcv_nxt)
            .field("cwnd", &self.cwnd)
            .field("rx_rto", &self.rx_rto)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Wire = Arc<Mutex<Vec<Vec<u8>>>>;

    fn pair() -> (Kcp, Wire) {
        let wire: Wire = Arc::new(Mutex::new(Vec::new()));
        let sink = wire.clone();
        let kcp = Kcp::new(
            0x11223344,
            Box::new(move |data: &[u8]| {
                sink.lock().unwrap().push(data.to_vec());
            }),
        );
        (kcp, wire)
    }

    fn drain(wire: &Wire) -> Vec<Vec<u8>> {
        std::mem::take(&mut *wire.lock().unwrap())
    }

    /// Run `a`'s outbound datagrams into `b`.
    fn pump(wire: &Wire, dst: &mut Kcp) {
        for datagram in drain(wire) {
            dst.input(&datagram);
        }
    }

    #[test]
    fn send_size_boundary() {
        let (mut kcp, _wire) = pair();
        let mss = kcp.mss();
        assert!(kcp.send(&vec![0u8; mss * 128]).is_ok());
        assert!(kcp.send(&vec![0u8; mss * 128 + 1]).is_err());
    }

    #[test]
    fn stream_mode_coalesces_back_to_back_sends() {
        let (mut kcp, _wire) = pair();
        kcp.set_stream(true);
        kcp.send(b"AB").unwrap();
        kcp.send(b"CD").unwrap();
        kcp.send(b"EF").unwrap();
        assert_eq!(kcp.snd_queue.len(), 1);
        assert_eq!(&kcp.snd_queue[0].data[..], b"ABCDEF");
        assert_eq!(kcp.snd_queue[0].frg, 0);
    }

    #[test]
    fn non_stream_fragments_count_down() {
        let (mut kcp, _wire) = pair();
        let mss = kcp.mss();
        kcp.send(&vec![0u8; mss * 3 - 1]).unwrap();
        let frgs: Vec<u8> = kcp.snd_queue.iter().map(|s| s.frg).collect();
        assert_eq!(frgs, vec![2, 1, 0]);
    }

    #[test]
    fn round_trip_delivers_in_order() {
        let (mut a, wire_a) = pair();
        let wire_b: Wire = Arc::new(Mutex::new(Vec::new()));
        let sink = wire_b.clone();
        let mut b = Kcp::new_server(Box::new(move |data: &[u8]| {
            sink.lock().unwrap().push(data.to_vec());
        }));

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        a.send(&payload).unwrap();

        let mut received = Vec::new();
        for tick in 0..400u32 {
            let now = tick * 10;
            a.update(now);
            pump(&wire_a, &mut b);
            b.update(now);
            pump(&wire_b, &mut a);
            while let Some(msg) = b.recv() {
                received.extend_from_slice(&msg);
            }
            if received.len() == payload.len() {
                break;
            }
        }
        assert_eq!(received, payload);
        assert_eq!(b.conv(), 0x11223344);
    }

    #[test]
    fn snd_buf_tracks_window_invariant() {
        let (mut a, wire_a) = pair();
        let mut ticks = 0u32;
        a.send(&vec![0u8; a.mss() * 10]).unwrap();
        while a.wait_snd() > 0 && ticks < 50 {
            ticks += 1;
            a.update(ticks * 100);
            // Exactly |snd_buf| == snd_nxt - snd_una after every pass.
            assert_eq!(
                a.snd_buf_len() as u32,
                a.snd_nxt().wrapping_sub(a.snd_una())
            );
            assert!(timediff(a.snd_nxt(), a.snd_una()) >= 0);
            drain(&wire_a);
            if ticks > 30 {
                break;
            }
        }
    }

    #[test]
    fn duplicate_push_is_delivered_once_but_acked_twice() {
        let (mut a, wire_a) = pair();
        let wire_b: Wire = Arc::new(Mutex::new(Vec::new()));
        let sink = wire_b.clone();
        let mut b = Kcp::new_server(Box::new(move |data: &[u8]| {
            sink.lock().unwrap().push(data.to_vec());
        }));

        a.send(b"ping").unwrap();
        a.update(0);
        a.update(100);
        let datagrams = drain(&wire_a);
        let push: Vec<u8> = datagrams
            .iter()
            .find(|d| d.len() > KCP_OVERHEAD)
            .expect("one push datagram")
            .clone();

        b.update(0);
        b.input(&push);
        b.input(&push);

        assert_eq!(b.recv().as_deref(), Some(&b"ping"[..]));
        assert!(b.recv().is_none());
        // Two ACK entries queued, one per arrival.
        assert_eq!(b.acklist.len(), 2);
    }

    #[test]
    fn rto_updates_follow_jacobson_karels() {
        let (mut kcp, _wire) = pair();
        kcp.current = 1000;
        kcp.update_ack(100);
        assert_eq!(kcp.rx_srtt, 100);
        assert_eq!(kcp.rx_rttval, 50);
        // rto = srtt + max(interval, 4*rttval), floored at rx_minrto.
        assert_eq!(kcp.rx_rto, bound(KCP_RTO_MIN, 100 + 200, KCP_RTO_MAX));

        kcp.update_ack(100);
        assert_eq!(kcp.rx_srtt, 100);
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(timediff(1, u32::MAX) > 0);
        assert!(timediff(u32::MAX, 1) < 0);
        assert_eq!(timediff(5, 5), 0);
    }

    #[test]
    fn zero_remote_window_arms_probe() {
        let (mut a, wire_a) = pair();
        a.rmt_wnd = 0;
        a.updated = true;
        a.current = 0;
        a.flush();
        assert_eq!(a.probe_wait, KCP_PROBE_INIT);
        // Probe timer due: a WASK goes out.
        a.current = KCP_PROBE_INIT + 1;
        a.flush();
        let datagrams = drain(&wire_a);
        let wask = datagrams
            .iter()
            .flat_map(|d| d.chunks(KCP_OVERHEAD))
            .any(|chunk| chunk.len() == KCP_OVERHEAD && chunk[4] == KCP_CMD_WASK);
        assert!(wask, "expected a WASK probe");
        assert!(a.probe_wait > KCP_PROBE_INIT);
    }

    #[test]
    fn mtu_below_header_is_rejected() {
        let (mut kcp, _wire) = pair();
        assert!(kcp.set_mtu(KCP_OVERHEAD).is_err());
        assert!(kcp.set_mtu(KCP_OVERHEAD + 1).is_ok());
        assert_eq!(kcp.mss(), 1);
    }

    #[test]
    fn interval_is_clamped() {
        let (mut kcp, _wire) = pair();
        kcp.set_interval(1);
        assert_eq!(kcp.interval, 10);
        kcp.set_interval(100_000);
        assert_eq!(kcp.interval, 5000);
    }

    #[test]
    fn rcv_wnd_floor_is_canonical() {
        let (mut kcp, _wire) = pair();
        kcp.set_wndsize(64, 32);
        assert_eq!(kcp.snd_wnd, 64);
        assert_eq!(kcp.rcv_wnd, KCP_WND_RCV);
    }
}
