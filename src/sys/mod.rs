//! Platform-specific syscall layer.
//!
//! Everything above this module is platform-independent; everything below it
//! talks to libc directly. Linux gets the first-class backend (epoll,
//! eventfd, `sendmmsg`/`recvmmsg`); other Unix systems fall back to
//! `poll(2)`, a wake pipe and per-packet datagram syscalls.

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use self::unix::{
    selector::Selector,
    sockopt,
    uio,
    waker::Waker,
    RawAddr,
};
