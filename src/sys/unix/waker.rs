//! Cross-thread wake channel for a reactor blocked in its selector.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use self::eventfd::Waker;
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
pub use self::pipe::Waker;

/// Waker backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be 8 bytes and
/// add to the count; reads reset the count to 0.
#[cfg(any(target_os = "linux", target_os = "android"))]
mod eventfd {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};

    #[derive(Debug)]
    pub struct Waker {
        fd: File,
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
            // SAFETY: the fd we just created is valid and owned here.
            let file = unsafe { File::from_raw_fd(fd) };
            Ok(Waker { fd: file })
        }

        pub fn wake(&self) -> io::Result<()> {
            let buf: [u8; 8] = 1u64.to_ne_bytes();
            match (&self.fd).write(&buf) {
                Ok(_) => Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Writing only blocks if the counter would overflow;
                    // reset and try once more.
                    self.drain();
                    (&self.fd).write(&buf).map(|_| ())
                }
                Err(err) => Err(err),
            }
        }

        /// Consume all pending wake-ups.
        pub fn drain(&self) {
            let mut buf: [u8; 8] = 0u64.to_ne_bytes();
            let _ = (&self.fd).read(&mut buf);
        }
    }

    impl AsRawFd for Waker {
        fn as_raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }
    }
}

/// Waker backed by a non-blocking CLOEXEC pipe (self-pipe trick).
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
mod pipe {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, RawFd};

    #[derive(Debug)]
    pub struct Waker {
        sender: File,
        receiver: File,
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            let mut fds = [-1; 2];
            syscall!(pipe(fds.as_mut_ptr()))?;
            for &fd in &fds {
                syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
                syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            }
            // SAFETY: the fds we just created are valid and owned here.
            unsafe {
                Ok(Waker {
                    receiver: File::from_raw_fd(fds[0]),
                    sender: File::from_raw_fd(fds[1]),
                })
            }
        }

        pub fn wake(&self) -> io::Result<()> {
            match (&self.sender).write(&[1]) {
                Ok(_) => Ok(()),
                // The reader will observe the bytes already in flight.
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(err) => Err(err),
            }
        }

        pub fn drain(&self) {
            let mut buf = [0u8; 128];
            while let Ok(n) = (&self.receiver).read(&mut buf) {
                if n < buf.len() {
                    break;
                }
            }
        }
    }

    impl AsRawFd for Waker {
        fn as_raw_fd(&self) -> RawFd {
            self.receiver.as_raw_fd()
        }
    }
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn check<T: Send + Sync + std::os::fd::AsRawFd>() {}
    check::<Waker>();
}
