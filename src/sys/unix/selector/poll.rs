use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::poller::PollEvent;

/// `poll(2)` fallback selector.
///
/// Keeps its own interest map because `poll` is stateless. Always
/// level-triggered; edge-trigger requests are served level-triggered, which
/// callers must tolerate (they already drain until `WouldBlock`).
#[derive(Debug)]
pub struct Selector {
    interests: Mutex<HashMap<RawFd, PollEvent>>,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        Ok(Selector {
            interests: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let mut interests = self.interests.lock().unwrap();
        if interests.insert(fd, events).is_some() {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        Ok(())
    }

    pub fn reregister(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let mut interests = self.interests.lock().unwrap();
        match interests.get_mut(&fd) {
            Some(entry) => {
                *entry = events;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let mut interests = self.interests.lock().unwrap();
        match interests.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    pub fn select(&self, ready: &mut Vec<(RawFd, PollEvent)>, timeout_us: i64) -> io::Result<()> {
        let mut pollfds: Vec<libc::pollfd> = {
            let interests = self.interests.lock().unwrap();
            interests
                .iter()
                .map(|(&fd, &events)| libc::pollfd {
                    fd,
                    events: events_to_poll(events),
                    revents: 0,
                })
                .collect()
        };

        let timeout_ms = if timeout_us < 0 {
            -1
        } else {
            (timeout_us.saturating_add(999) / 1000).min(libc::c_int::MAX as i64) as libc::c_int
        };

        let n = syscall!(poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms
        ))?;

        if n > 0 {
            for pollfd in &pollfds {
                if pollfd.revents != 0 {
                    ready.push((pollfd.fd, poll_to_events(pollfd.revents)));
                }
            }
        }
        Ok(())
    }
}

fn events_to_poll(events: PollEvent) -> libc::c_short {
    let mut kind = 0;
    if events.is_read() {
        kind |= libc::POLLIN;
    }
    if events.is_write() {
        kind |= libc::POLLOUT;
    }
    kind
}

fn poll_to_events(revents: libc::c_short) -> PollEvent {
    let mut events = PollEvent::empty();
    if revents & (libc::POLLIN | libc::POLLHUP) != 0 {
        events |= PollEvent::READ;
    }
    if revents & libc::POLLOUT != 0 {
        events |= PollEvent::WRITE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL | libc::POLLHUP) != 0 {
        events |= PollEvent::ERROR;
    }
    events
}
