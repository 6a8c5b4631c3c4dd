//! Task execution contracts shared by the reactor and the worker pool.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// A one-shot unit of work shipped between threads.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Anything that can run tasks on behalf of a caller: an [`EventPoller`]
/// runs them interleaved with I/O on its reactor thread, a [`ThreadPool`]
/// on whichever worker grabs them first.
///
/// [`EventPoller`]: crate::poller::EventPoller
/// [`ThreadPool`]: crate::thread_pool::ThreadPool
pub trait TaskExecutor: Send + Sync {
    /// Schedule `task`. When `may_sync` is set and the caller already runs
    /// on the executor's thread, the task runs inline before returning.
    fn async_task(&self, task: Task, may_sync: bool);

    /// Like [`async_task`](TaskExecutor::async_task) but jumps the queue:
    /// inserted ahead of pending tasks, behind ones already dequeued.
    fn async_first(&self, task: Task, may_sync: bool);

    /// Rolling busy percentage (0..=100) over roughly the last two seconds.
    fn load(&self) -> usize;

    /// Run `task` and wait for completion.
    ///
    /// Short-circuits to an inline call when invoked from the executor's
    /// own thread, so it can never self-deadlock.
    fn sync(&self, task: Task) {
        let sem = Semaphore::new();
        // Scoped borrow would be cleaner but the task must be 'static;
        // the semaphore arc keeps the rendezvous alive instead.
        let sem2 = sem.clone();
        self.async_task(
            Box::new(move || {
                task();
                sem2.post();
            }),
            true,
        );
        sem.wait();
    }

    /// [`sync`](TaskExecutor::sync) with queue-jumping semantics.
    fn sync_first(&self, task: Task) {
        let sem = Semaphore::new();
        let sem2 = sem.clone();
        self.async_first(
            Box::new(move || {
                task();
                sem2.post();
            }),
            true,
        );
        sem.wait();
    }
}

/// Counting semaphore over Mutex + Condvar.
#[derive(Clone)]
pub(crate) struct Semaphore {
    inner: std::sync::Arc<(Mutex<usize>, Condvar)>,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            inner: std::sync::Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    pub fn post(&self) {
        let (lock, cond) = &*self.inner;
        *lock.lock().unwrap() += 1;
        cond.notify_one();
    }

    pub fn wait(&self) {
        let (lock, cond) = &*self.inner;
        let mut count = lock.lock().unwrap();
        while *count == 0 {
            count = cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// Busy-ratio estimator for one executor thread.
///
/// The thread reports transitions (`start_sleep` before blocking,
/// `wake_up` after); observers read a percentage. Samples are bounded both
/// by count and by age so the ratio tracks the recent past.
pub struct ThreadLoadCounter {
    state: Mutex<LoadState>,
    max_samples: usize,
    max_window_us: u64,
}

struct LoadState {
    last_flip: Instant,
    sleeping: bool,
    // (span_us, was_sleeping)
    samples: VecDeque<(u64, bool)>,
}

impl ThreadLoadCounter {
    /// Default window: 32 samples / 2 seconds.
    pub fn new() -> ThreadLoadCounter {
        ThreadLoadCounter::with_window(32, 2_000_000)
    }

    pub fn with_window(max_samples: usize, max_window_us: u64) -> ThreadLoadCounter {
        ThreadLoadCounter {
            state: Mutex::new(LoadState {
                last_flip: Instant::now(),
                sleeping: false,
                samples: VecDeque::new(),
            }),
            max_samples,
            max_window_us,
        }
    }

    pub fn start_sleep(&self) {
        self.flip(true);
    }

    pub fn wake_up(&self) {
        self.flip(false);
    }

    fn flip(&self, to_sleeping: bool) {
        let mut state = self.state.lock().unwrap();
        if state.sleeping == to_sleeping {
            return;
        }
        let span = state.last_flip.elapsed().as_micros() as u64;
        let was_sleeping = state.sleeping;
        state.sleeping = to_sleeping;
        state.last_flip = Instant::now();
        state.samples.push_back((span, was_sleeping));

        while state.samples.len() > self.max_samples {
            state.samples.pop_front();
        }
        let mut total: u64 = state.samples.iter().map(|&(span, _)| span).sum();
        while total > self.max_window_us && state.samples.len() > 1 {
            if let Some((span, _)) = state.samples.pop_front() {
                total -= span;
            }
        }
    }

    /// Busy percentage over the sample window, including the span currently
    /// in progress.
    pub fn load(&self) -> usize {
        let state = self.state.lock().unwrap();
        let current = state.last_flip.elapsed().as_micros() as u64;
        let mut busy: u64 = 0;
        let mut total: u64 = current;
        if !state.sleeping {
            busy += current;
        }
        for &(span, was_sleeping) in &state.samples {
            total += span;
            if !was_sleeping {
                busy += span;
            }
        }
        if total == 0 {
            0
        } else {
            (busy * 100 / total) as usize
        }
    }
}

impl Default for ThreadLoadCounter {
    fn default() -> ThreadLoadCounter {
        ThreadLoadCounter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn semaphore_rendezvous() {
        let sem = Semaphore::new();
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            sem2.post();
        });
        sem.wait();
        handle.join().unwrap();
    }

    #[test]
    fn load_counter_tracks_sleep_ratio() {
        let counter = ThreadLoadCounter::new();
        // Busy 10ms, asleep 30ms: expect load well under half.
        std::thread::sleep(Duration::from_millis(10));
        counter.start_sleep();
        std::thread::sleep(Duration::from_millis(30));
        counter.wake_up();
        let load = counter.load();
        assert!(load <= 50, "load {} should be <= 50", load);
    }

    #[test]
    fn load_counter_window_is_bounded() {
        let counter = ThreadLoadCounter::with_window(4, 1_000_000);
        for _ in 0..32 {
            counter.start_sleep();
            counter.wake_up();
        }
        let state = counter.state.lock().unwrap();
        assert!(state.samples.len() <= 4);
    }
}
