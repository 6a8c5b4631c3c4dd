//! Fixed-size worker pool draining one FIFO task queue.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::error;

use crate::executor::{Task, TaskExecutor, ThreadLoadCounter};
use crate::util::{self, ThreadPriority};

/// One slot in the queue; `None` is the shutdown sentinel.
type Slot = Option<Task>;

struct PoolShared {
    queue: Mutex<VecDeque<Slot>>,
    cond: Condvar,
    loads: Vec<ThreadLoadCounter>,
}

/// A pool of N worker threads pulling from one task queue.
///
/// Tasks run in submission order (with a head-insert variant); a panicking
/// task is logged and the worker keeps going. Workers can be pinned to
/// cores and given an OS priority at start.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn new(num_threads: usize, name: &str) -> ThreadPool {
        ThreadPool::with_options(num_threads, name, ThreadPriority::Normal, false)
    }

    pub fn with_options(
        num_threads: usize,
        name: &str,
        priority: ThreadPriority,
        pin_to_cores: bool,
    ) -> ThreadPool {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            loads: (0..num_threads).map(|_| ThreadLoadCounter::new()).collect(),
        });

        let mut threads = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = shared.clone();
            let thread_name = format!("{} {}", name, i);
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    util::set_thread_name(&thread_name);
                    if let Err(err) = util::set_thread_priority(priority) {
                        log::trace!("set priority failed for {}: {}", thread_name, err);
                    }
                    if pin_to_cores {
                        if let Err(err) = util::set_thread_affinity(i) {
                            log::trace!("set affinity failed for {}: {}", thread_name, err);
                        }
                    }
                    worker_loop(&shared, i);
                })
                .expect("failed to spawn pool worker");
            threads.push(handle);
        }

        ThreadPool {
            shared,
            threads: Mutex::new(threads),
        }
    }

    fn push(&self, slot: Slot, first: bool) {
        let mut queue = self.shared.queue.lock().unwrap();
        if first {
            queue.push_front(slot);
        } else {
            queue.push_back(slot);
        }
        drop(queue);
        self.shared.cond.notify_one();
    }
}

fn worker_loop(shared: &PoolShared, index: usize) {
    let load = &shared.loads[index];
    loop {
        let slot = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(slot) = queue.pop_front() {
                    break slot;
                }
                load.start_sleep();
                queue = shared.cond.wait(queue).unwrap();
                load.wake_up();
            }
        };
        let Some(task) = slot else { return };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
            error!("pool task panicked: {:?}", panic);
        }
    }
}

impl TaskExecutor for ThreadPool {
    fn async_task(&self, task: Task, _may_sync: bool) {
        self.push(Some(task), false);
    }

    fn async_first(&self, task: Task, _may_sync: bool) {
        self.push(Some(task), true);
    }

    fn load(&self) -> usize {
        let loads = &self.shared.loads;
        if loads.is_empty() {
            return 0;
        }
        loads.iter().map(|counter| counter.load()).sum::<usize>() / loads.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let mut threads = self.threads.lock().unwrap();
        for _ in threads.iter() {
            self.push(None, false);
        }
        // One notify per sentinel may race a worker grabbing two; wake
        // everyone.
        self.shared.cond.notify_all();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_all_submitted_tasks() {
        let pool = ThreadPool::new(4, "test pool");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.async_task(
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                false,
            );
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn sync_waits_for_completion() {
        let pool = ThreadPool::new(1, "test sync pool");
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        pool.sync(Box::new(move || {
            std::thread::sleep(Duration::from_millis(20));
            hit2.store(7, Ordering::SeqCst);
        }));
        assert_eq!(hit.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = ThreadPool::new(1, "test panic pool");
        pool.async_task(Box::new(|| panic!("boom")), false);
        let hit = Arc::new(AtomicUsize::new(0));
        let hit2 = hit.clone();
        pool.sync(Box::new(move || {
            hit2.store(1, Ordering::SeqCst);
        }));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }
}
