//! Socket creation and option plumbing.
//!
//! Options are applied best-effort at creation: a platform refusing one of
//! them is logged at trace level and otherwise ignored, matching how
//! tuned-but-optional socket knobs are usually treated.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use log::trace;

use super::RawAddr;

/// ~256 KiB kernel buffers on both directions.
const SOCKET_BUFFER_SIZE: libc::c_int = 256 * 1024;

pub fn new_tcp_socket(family: libc::c_int) -> io::Result<RawFd> {
    new_socket(family, libc::SOCK_STREAM)
}

pub fn new_udp_socket(family: libc::c_int) -> io::Result<RawFd> {
    new_socket(family, libc::SOCK_DGRAM)
}

fn new_socket(family: libc::c_int, ty: libc::c_int) -> io::Result<RawFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let fd = syscall!(socket(family, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))?;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let fd = {
        let fd = syscall!(socket(family, ty, 0))?;
        set_nonblock(fd)?;
        set_cloexec(fd)?;
        fd
    };

    Ok(fd)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn set_nonblock(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)).map(|_| ())
}

fn set_opt<T>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: T,
    what: &str,
) -> io::Result<()> {
    let res = syscall!(setsockopt(
        fd,
        level,
        name,
        &value as *const T as *const libc::c_void,
        mem::size_of::<T>() as libc::socklen_t,
    ));
    if let Err(ref err) = res {
        trace!("setsockopt {} failed on fd {}: {}", what, fd, err);
    }
    res.map(|_| ())
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as libc::c_int, "SO_REUSEADDR")
}

/// Allow several sockets to bind the same UDP port, one per poller.
pub fn set_reuseport(fd: RawFd) -> io::Result<()> {
    #[cfg(not(any(target_os = "solaris", target_os = "illumos")))]
    return set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1 as libc::c_int, "SO_REUSEPORT");
    #[cfg(any(target_os = "solaris", target_os = "illumos"))]
    return Ok(());
}

pub fn set_nodelay(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1 as libc::c_int, "TCP_NODELAY")
}

pub fn set_keepalive(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1 as libc::c_int, "SO_KEEPALIVE")
}

/// `seconds == 0` keeps the default graceful close-wait; a positive value
/// bounds how long close(2) lingers flushing unsent data.
pub fn set_close_wait(fd: RawFd, seconds: libc::c_int) -> io::Result<()> {
    let linger = libc::linger {
        l_onoff: (seconds > 0) as libc::c_int,
        l_linger: seconds,
    };
    set_opt(fd, libc::SOL_SOCKET, libc::SO_LINGER, linger, "SO_LINGER")
}

pub fn set_send_buf(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, SOCKET_BUFFER_SIZE, "SO_SNDBUF")
}

pub fn set_recv_buf(fd: RawFd) -> io::Result<()> {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, SOCKET_BUFFER_SIZE, "SO_RCVBUF")
}

/// BSD/macOS suppress SIGPIPE per socket; Linux does it per send call with
/// MSG_NOSIGNAL (see `uio::SEND_FLAGS`).
pub fn set_no_sigpipe(fd: RawFd) -> io::Result<()> {
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    return set_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as libc::c_int, "SO_NOSIGPIPE");
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    {
        let _ = fd;
        Ok(())
    }
}

/// The standard option set for a freshly created or accepted TCP socket.
pub fn setup_tcp_socket(fd: RawFd) -> io::Result<()> {
    let _ = set_no_sigpipe(fd);
    let _ = set_nodelay(fd);
    let _ = set_keepalive(fd);
    let _ = set_send_buf(fd);
    let _ = set_recv_buf(fd);
    let _ = set_close_wait(fd, 0);
    Ok(())
}

/// The standard option set for a UDP socket.
pub fn setup_udp_socket(fd: RawFd) -> io::Result<()> {
    let _ = set_no_sigpipe(fd);
    let _ = set_reuseaddr(fd);
    let _ = set_reuseport(fd);
    let _ = set_send_buf(fd);
    let _ = set_recv_buf(fd);
    Ok(())
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let raw = RawAddr::from(*addr);
    syscall!(bind(fd, raw.as_ptr(), raw.len)).map(|_| ())
}

pub fn listen(fd: RawFd, backlog: libc::c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog)).map(|_| ())
}

/// Start a non-blocking connect. `EINPROGRESS` means the handshake is in
/// flight and completion is reported through writability.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let raw = RawAddr::from(*addr);
    match syscall!(connect(fd, raw.as_ptr(), raw.len)) {
        Ok(_) => Ok(true),
        Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(err) => Err(err),
    }
}

/// `connect(2)` a UDP socket to one peer, restricting recv to that peer and
/// letting the kernel route its datagrams to this fd.
pub fn connect_udp(fd: RawFd, raw: &RawAddr) -> io::Result<()> {
    syscall!(connect(fd, raw.as_ptr(), raw.len)).map(|_| ())
}

pub fn accept(fd: RawFd) -> io::Result<Option<(RawFd, RawAddr)>> {
    let mut addr = RawAddr::zeroed();

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let res = syscall!(accept4(
        fd,
        addr.as_mut_ptr(),
        &mut addr.len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
    ));

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let res = syscall!(accept(fd, addr.as_mut_ptr(), &mut addr.len)).and_then(|peer| {
        set_nonblock(peer)?;
        set_cloexec(peer)?;
        Ok(peer)
    });

    match res {
        Ok(peer) => Ok(Some((peer, addr))),
        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(err),
    }
}

/// Read and clear the pending socket error.
pub fn take_socket_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut value as *mut _ as *mut libc::c_void,
        &mut len,
    ))?;
    if value == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(value)))
    }
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut addr = RawAddr::zeroed();
    syscall!(getsockname(fd, addr.as_mut_ptr(), &mut addr.len))?;
    addr.to_socket_addr()
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut addr = RawAddr::zeroed();
    syscall!(getpeername(fd, addr.as_mut_ptr(), &mut addr.len))?;
    addr.to_socket_addr()
}

pub fn shutdown_both(fd: RawFd) {
    let _ = syscall!(shutdown(fd, libc::SHUT_RDWR));
}

pub fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

pub fn dup(fd: RawFd) -> io::Result<RawFd> {
    let new_fd = syscall!(dup(fd))?;
    let _ = set_cloexec(new_fd);
    Ok(new_fd)
}

/// Address family matching a `SocketAddr`.
pub fn family_of(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}
