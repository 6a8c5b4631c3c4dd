//! Byte buffers handed between sockets, sessions and transports.
//!
//! Three shapes cover the traffic paths:
//!
//! * [`BufferRaw`]: an owned, growable buffer with capacity kept across
//!   reuse. Socket read paths hand one of these to each receive callback.
//! * [`BufferView`]: a cheap offset view into shared storage, used when one
//!   datagram burst is sliced into per-packet buffers without copying.
//! * [`BufferString`]: a string-backed buffer supporting head/tail erase by
//!   advancing offsets, for protocol layers that peel headers off.
//!
//! All of them expose the same read-only `(data, size)` contract through
//! [`Buffer`]. Outbound queues hold `Bytes` handles, which keep the
//! underlying storage alive until the syscall consumed it.

use bytes::{Bytes, BytesMut};

/// Read-only view contract: `data()[0..size())` is valid until the buffer is
/// released.
pub trait Buffer {
    fn data(&self) -> &[u8];

    fn size(&self) -> usize {
        self.data().len()
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Owned heap buffer with separate capacity and size, cheap to append to and
/// cheap to reuse across reads.
#[derive(Debug, Default)]
pub struct BufferRaw {
    data: BytesMut,
}

impl BufferRaw {
    pub fn new() -> BufferRaw {
        BufferRaw {
            data: BytesMut::new(),
        }
    }

    pub fn with_capacity(cap: usize) -> BufferRaw {
        BufferRaw {
            data: BytesMut::with_capacity(cap),
        }
    }

    pub fn from_slice(data: &[u8]) -> BufferRaw {
        BufferRaw {
            data: BytesMut::from(data),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Hand the contents off, leaving this buffer empty but reusable.
    ///
    /// Required when a read buffer borrowed from a poller's reusable slot
    /// crosses to another poller.
    pub fn take(&mut self) -> Bytes {
        self.data.split().freeze()
    }

    /// Freeze into a shareable handle without copying.
    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }
}

impl Buffer for BufferRaw {
    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Zero-copy slice of shared storage.
#[derive(Debug, Clone)]
pub struct BufferView {
    storage: Bytes,
}

impl BufferView {
    /// View `storage[offset..offset + len]`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds, like slicing would.
    pub fn new(storage: Bytes, offset: usize, len: usize) -> BufferView {
        BufferView {
            storage: storage.slice(offset..offset + len),
        }
    }

    pub fn into_bytes(self) -> Bytes {
        self.storage
    }
}

impl Buffer for BufferView {
    fn data(&self) -> &[u8] {
        &self.storage
    }
}

/// String-like buffer that erases from either end by moving offsets instead
/// of reallocating.
#[derive(Debug, Default, Clone)]
pub struct BufferString {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
}

impl BufferString {
    pub fn new(data: impl Into<Vec<u8>>) -> BufferString {
        let storage = data.into();
        let len = storage.len();
        BufferString {
            storage,
            offset: 0,
            len,
        }
    }

    /// Drop `n` bytes from the front. Clamped to the remaining size.
    pub fn erase_head(&mut self, n: usize) {
        let n = n.min(self.len);
        self.offset += n;
        self.len -= n;
    }

    /// Drop `n` bytes from the back. Clamped to the remaining size.
    pub fn erase_tail(&mut self, n: usize) {
        self.len -= n.min(self.len);
    }
}

impl Buffer for BufferString {
    fn data(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_append_and_take() {
        let mut buf = BufferRaw::with_capacity(64);
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.data(), b"hello world");

        let taken = buf.take();
        assert_eq!(&taken[..], b"hello world");
        assert!(buf.is_empty());

        // Still usable after the handoff.
        buf.append(b"again");
        assert_eq!(buf.data(), b"again");
    }

    #[test]
    fn view_is_zero_copy_slice() {
        let storage = Bytes::from_static(b"0123456789");
        let view = BufferView::new(storage.clone(), 2, 5);
        assert_eq!(view.data(), b"23456");
        assert_eq!(view.size(), 5);
    }

    #[test]
    fn string_erase_both_ends() {
        let mut buf = BufferString::new(&b"GET / HTTP/1.1\r\n"[..]);
        buf.erase_head(4);
        assert_eq!(buf.data(), b"/ HTTP/1.1\r\n");
        buf.erase_tail(2);
        assert_eq!(buf.data(), b"/ HTTP/1.1");

        // Erase is clamped, never panics.
        buf.erase_head(1000);
        assert!(buf.is_empty());
        buf.erase_tail(1);
        assert!(buf.is_empty());
    }
}
