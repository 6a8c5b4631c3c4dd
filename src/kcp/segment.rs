//! KCP wire format.
//!
//! Every packet starts with a 24-byte big-endian header:
//!
//! ```text
//! conv(u32) | cmd(u8) | frg(u8) | wnd(u16) | ts(u32) | sn(u32) | una(u32) | len(u32)
//! ```
//!
//! followed by `len` payload bytes. Multiple packets may be packed
//! back-to-back into one UDP datagram with no extra framing.

use bytes::{Buf, BufMut, BytesMut};

/// Header size of every KCP packet.
pub const KCP_OVERHEAD: usize = 24;

pub const KCP_CMD_PUSH: u8 = 81;
pub const KCP_CMD_ACK: u8 = 82;
pub const KCP_CMD_WASK: u8 = 83;
pub const KCP_CMD_WINS: u8 = 84;

pub fn is_valid_cmd(cmd: u8) -> bool {
    (KCP_CMD_PUSH..=KCP_CMD_WINS).contains(&cmd)
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KcpHeader {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl KcpHeader {
    /// Parse one header off the front of `data`. `None` when fewer than
    /// [`KCP_OVERHEAD`] bytes remain.
    pub fn decode(data: &[u8]) -> Option<KcpHeader> {
        if data.len() < KCP_OVERHEAD {
            return None;
        }
        let mut buf = data;
        Some(KcpHeader {
            conv: buf.get_u32(),
            cmd: buf.get_u8(),
            frg: buf.get_u8(),
            wnd: buf.get_u16(),
            ts: buf.get_u32(),
            sn: buf.get_u32(),
            una: buf.get_u32(),
            len: buf.get_u32(),
        })
    }
}

/// One segment in a send or receive collection. Beyond the header it
/// carries the retransmission book-keeping the sender needs.
#[derive(Default, Clone, Debug)]
pub struct KcpSegment {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    /// Absolute resend deadline (ms clock).
    pub resendts: u32,
    /// RTO snapshot for this segment's backoff.
    pub rto: u32,
    /// Duplicate-ACK counter feeding fast retransmit.
    pub fastack: u32,
    /// Transmit count; hitting `dead_link` marks the transport dead.
    pub xmit: u32,
    pub data: BytesMut,
}

impl KcpSegment {
    pub fn with_data(data: BytesMut) -> KcpSegment {
        KcpSegment {
            data,
            ..KcpSegment::default()
        }
    }

    pub fn encoded_len(&self) -> usize {
        KCP_OVERHEAD + self.data.len()
    }

    /// Append header + payload to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16(self.wnd);
        buf.put_u32(self.ts);
        buf.put_u32(self.sn);
        buf.put_u32(self.una);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_is_big_endian() {
        let seg = KcpSegment {
            conv: 0x01020304,
            cmd: KCP_CMD_PUSH,
            frg: 3,
            wnd: 0x1122,
            ts: 0xAABBCCDD,
            sn: 7,
            una: 9,
            data: BytesMut::from(&b"hello"[..]),
            ..KcpSegment::default()
        };
        let mut buf = BytesMut::new();
        seg.encode(&mut buf);
        assert_eq!(buf.len(), KCP_OVERHEAD + 5);
        // Network byte order on the wire.
        assert_eq!(&buf[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(buf[4], KCP_CMD_PUSH);
        assert_eq!(&buf[6..8], &[0x11, 0x22]);

        let header = KcpHeader::decode(&buf).unwrap();
        assert_eq!(header.conv, 0x01020304);
        assert_eq!(header.cmd, KCP_CMD_PUSH);
        assert_eq!(header.frg, 3);
        assert_eq!(header.wnd, 0x1122);
        assert_eq!(header.ts, 0xAABBCCDD);
        assert_eq!(header.sn, 7);
        assert_eq!(header.una, 9);
        assert_eq!(header.len, 5);
    }

    #[test]
    fn short_input_does_not_decode() {
        assert!(KcpHeader::decode(&[0u8; KCP_OVERHEAD - 1]).is_none());
        assert!(KcpHeader::decode(&[0u8; KCP_OVERHEAD]).is_some());
    }

    #[test]
    fn cmd_range() {
        assert!(is_valid_cmd(KCP_CMD_PUSH));
        assert!(is_valid_cmd(KCP_CMD_WINS));
        assert!(!is_valid_cmd(80));
        assert!(!is_valid_cmd(85));
    }
}
