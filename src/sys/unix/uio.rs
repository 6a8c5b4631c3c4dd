//! Scatter-gather and batched datagram syscalls.
//!
//! TCP batches one `sendmsg` over the whole pending queue (bounded by
//! `IOV_MAX`). UDP batches one `sendmmsg`/`recvmmsg` per burst on Linux and
//! degrades to per-packet `sendto`/`recvfrom` loops elsewhere. Callers see
//! one shape regardless of which syscall ran.

use std::io;
use std::mem;
use std::os::fd::RawFd;

use super::RawAddr;

/// Most platforms allow 1024 iovecs per message; staying at that bound
/// avoids probing sysconf.
pub const IOV_MAX: usize = 1024;

/// One UDP datagram slot in a receive burst.
pub const UDP_PACKET_SIZE: usize = 4096;

/// Datagrams drained per readiness wake-up on Linux.
pub const UDP_BURST: usize = 32;

/// Flags applied to every outbound send.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL | libc::MSG_DONTWAIT;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// One `sendmsg` over up to `IOV_MAX` buffers. Returns bytes written.
pub fn send_iovec(fd: RawFd, slices: &[&[u8]], flags: libc::c_int) -> io::Result<usize> {
    let mut iovecs: Vec<libc::iovec> = slices
        .iter()
        .take(IOV_MAX)
        .map(|slice| libc::iovec {
            iov_base: slice.as_ptr() as *mut libc::c_void,
            iov_len: slice.len(),
        })
        .collect();

    // SAFETY: msghdr is plain old data; iovecs outlives the call.
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iovecs.as_mut_ptr();
    msg.msg_iovlen = iovecs.len() as _;

    syscall!(sendmsg(fd, &msg, flags)).map(|n| n as usize)
}

/// One datagram, optionally to an explicit destination. Fallback for
/// platforms without `sendmmsg`.
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn send_to(
    fd: RawFd,
    buf: &[u8],
    addr: Option<&RawAddr>,
    flags: libc::c_int,
) -> io::Result<usize> {
    let (name, name_len) = match addr {
        Some(raw) => (raw.as_ptr(), raw.len),
        None => (std::ptr::null(), 0),
    };
    syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        flags,
        name,
        name_len,
    ))
    .map(|n| n as usize)
}

/// One `sendmmsg` over a batch of datagrams, each with its own destination.
/// Returns how many datagrams the kernel accepted; datagrams are
/// all-or-nothing so there is no partial-byte accounting.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn send_mmsg(
    fd: RawFd,
    packets: &[(&[u8], Option<RawAddr>)],
    flags: libc::c_int,
) -> io::Result<usize> {
    let count = packets.len().min(IOV_MAX);
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(count);
    let mut hdrs: Vec<libc::mmsghdr> = Vec::with_capacity(count);
    // Addresses live here so msg_name pointers stay valid over the call.
    let mut addrs: Vec<RawAddr> = Vec::with_capacity(count);

    for (data, addr) in packets.iter().take(count) {
        iovecs.push(libc::iovec {
            iov_base: data.as_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        });
        addrs.push(addr.unwrap_or_else(RawAddr::zeroed));
    }

    for i in 0..count {
        // SAFETY: mmsghdr is plain old data.
        let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
        hdr.msg_hdr.msg_iov = &mut iovecs[i];
        hdr.msg_hdr.msg_iovlen = 1;
        if packets[i].1.is_some() {
            hdr.msg_hdr.msg_name = addrs[i].as_mut_ptr() as *mut libc::c_void;
            hdr.msg_hdr.msg_namelen = addrs[i].len;
        }
        hdrs.push(hdr);
    }

    // `flags` is c_uint on glibc and c_int elsewhere; let the signature pick.
    syscall!(sendmmsg(fd, hdrs.as_mut_ptr(), count as libc::c_uint, flags as _))
        .map(|n| n as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(recv(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
    ))
    .map(|n| n as usize)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, RawAddr)> {
    let mut addr = RawAddr::zeroed();
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        addr.as_mut_ptr(),
        &mut addr.len,
    ))?;
    Ok((n as usize, addr))
}

/// Drain up to [`UDP_BURST`] datagrams in one `recvmmsg`. Returns
/// `(length, source)` per received datagram.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn recv_mmsg(
    fd: RawFd,
    bufs: &mut [[u8; UDP_PACKET_SIZE]],
) -> io::Result<Vec<(usize, RawAddr)>> {
    let count = bufs.len().min(UDP_BURST);
    let mut iovecs: Vec<libc::iovec> = Vec::with_capacity(count);
    let mut addrs: Vec<RawAddr> = vec![RawAddr::zeroed(); count];
    let mut hdrs: Vec<libc::mmsghdr> = Vec::with_capacity(count);

    for buf in bufs.iter_mut().take(count) {
        iovecs.push(libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        });
    }

    for i in 0..count {
        // SAFETY: mmsghdr is plain old data.
        let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
        hdr.msg_hdr.msg_iov = &mut iovecs[i];
        hdr.msg_hdr.msg_iovlen = 1;
        hdr.msg_hdr.msg_name = addrs[i].as_mut_ptr() as *mut libc::c_void;
        hdr.msg_hdr.msg_namelen = addrs[i].len;
        hdrs.push(hdr);
    }

    let n = syscall!(recvmmsg(
        fd,
        hdrs.as_mut_ptr(),
        count as libc::c_uint,
        0 as _,
        std::ptr::null_mut(),
    ))? as usize;

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let mut addr = addrs[i];
        addr.len = hdrs[i].msg_hdr.msg_namelen;
        out.push((hdrs[i].msg_len as usize, addr));
    }
    Ok(out)
}
