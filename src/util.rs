//! Clock and thread helpers shared by the reactor and the thread pool.

use std::sync::OnceLock;
use std::time::Instant;

/// Origin of the process-wide monotonic clock.
fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Microseconds elapsed since the first call into this module.
pub fn now_micros() -> u64 {
    origin().elapsed().as_micros() as u64
}

/// Milliseconds elapsed since the first call into this module.
pub fn now_millis() -> u64 {
    origin().elapsed().as_millis() as u64
}

/// Measures the time since creation or the last `reset`.
///
/// Used as the dead-man timer for socket send queues: reset on every
/// successful write, checked against the configured ceiling on every flush.
#[derive(Debug)]
pub struct Ticker {
    created: Instant,
}

impl Ticker {
    pub fn new() -> Ticker {
        Ticker {
            created: Instant::now(),
        }
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.created.elapsed().as_millis() as u64
    }

    pub fn reset(&mut self) {
        self.created = Instant::now();
    }
}

impl Default for Ticker {
    fn default() -> Ticker {
        Ticker::new()
    }
}

/// Set the name of the calling thread, truncated to the 16-byte limit on
/// Linux. Best effort.
#[cfg(unix)]
pub fn set_thread_name(name: &str) {
    let mut bytes: Vec<u8> = name.bytes().take(15).collect();
    bytes.push(0);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe {
        libc::prctl(libc::PR_SET_NAME, bytes.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = bytes;
}

/// Pin the calling thread to one CPU core. Best effort; unsupported
/// platforms report success without doing anything.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set_thread_affinity(cpu: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu, &mut set);
        syscall!(sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        ))
        .map(|_| ())
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
pub fn set_thread_affinity(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}

/// OS scheduling priority of a worker thread, mapped onto nice values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPriority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

impl ThreadPriority {
    #[cfg(unix)]
    fn nice(self) -> libc::c_int {
        match self {
            ThreadPriority::Lowest => 19,
            ThreadPriority::Low => 10,
            ThreadPriority::Normal => 0,
            ThreadPriority::High => -10,
            ThreadPriority::Highest => -19,
        }
    }
}

/// Apply an OS priority to the calling thread. Raising priority usually
/// needs privileges; failures are reported to the caller.
#[cfg(unix)]
pub fn set_thread_priority(priority: ThreadPriority) -> std::io::Result<()> {
    // `which` is c_uint on glibc and c_int on other libcs; let the
    // signature pick.
    syscall!(setpriority(libc::PRIO_PROCESS as _, 0, priority.nice())).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = now_micros();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_micros();
        assert!(b > a);
    }

    #[test]
    fn ticker_resets() {
        let mut ticker = Ticker::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(ticker.elapsed_millis() >= 5);
        ticker.reset();
        assert!(ticker.elapsed_millis() < 5);
    }
}
