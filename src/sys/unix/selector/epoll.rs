use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::poller::PollEvent;

/// Upper bound on one `epoll_wait` batch.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn register(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: events_to_epoll(events),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: events_to_epoll(events),
            u64: fd as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            ptr::null_mut()
        ))
        .map(|_| ())
    }

    /// Wait for readiness for at most `timeout_us` microseconds (-1 blocks
    /// indefinitely, 0 returns immediately). Ready fds are appended to
    /// `ready` with the observed event mask.
    pub fn select(&self, ready: &mut Vec<(RawFd, PollEvent)>, timeout_us: i64) -> io::Result<()> {
        let timeout_ms = if timeout_us < 0 {
            -1
        } else {
            // Round up so sub-millisecond waits do not spin.
            (timeout_us.saturating_add(999) / 1000).min(libc::c_int::MAX as i64) as libc::c_int
        };

        // SAFETY: epoll_event is plain old data; only the kernel-filled
        // prefix is read below.
        let mut events: [libc::epoll_event; EVENT_CAPACITY] = unsafe { std::mem::zeroed() };

        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            EVENT_CAPACITY as libc::c_int,
            timeout_ms,
        ))?;

        for event in events.iter().take(n as usize) {
            ready.push((event.u64 as RawFd, epoll_to_events(event.events)));
        }
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

fn events_to_epoll(events: PollEvent) -> u32 {
    let mut kind = 0;
    if events.is_read() {
        kind |= EPOLLIN | EPOLLRDHUP;
    }
    if events.is_write() {
        kind |= EPOLLOUT;
    }
    // EPOLLERR and EPOLLHUP are always reported; Error interest only
    // affects what the dispatch layer forwards.
    if !events.is_level_triggered() {
        kind |= EPOLLET;
    }
    kind as u32
}

fn epoll_to_events(epoll: u32) -> PollEvent {
    let epoll = epoll as libc::c_int;
    let mut events = PollEvent::empty();
    if epoll & (EPOLLIN | EPOLLRDHUP) != 0 {
        events |= PollEvent::READ;
    }
    if epoll & EPOLLOUT != 0 {
        events |= PollEvent::WRITE;
    }
    if epoll & (EPOLLERR | EPOLLHUP) != 0 {
        events |= PollEvent::ERROR;
    }
    events
}
