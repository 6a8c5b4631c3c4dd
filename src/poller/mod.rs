//! Single-threaded event reactor.
//!
//! An [`EventPoller`] owns one selector and drives one loop thread. The
//! loop multiplexes three sources of work:
//!
//! * fd readiness, dispatched to the callback registered with
//!   [`add_event`](EventPoller::add_event);
//! * tasks shipped from other threads through
//!   [`async_task`](TaskExecutor::async_task), observed via a wake fd;
//! * delayed tasks in a min-heap keyed by absolute deadline, scheduled with
//!   [`do_delay_task`](EventPoller::do_delay_task).
//!
//! Everything registered with a poller runs serially on its loop thread, so
//! per-poller state needs no further locking. Handles are cheap clones and
//! may be used from any thread; mutating calls made off the loop thread are
//! marshalled through the task queue.

mod pool;

pub use self::pool::EventPollerPool;

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use log::{error, trace, warn};

use crate::executor::{Task, TaskExecutor};
use crate::sys::{Selector, Waker};
use crate::util;

/// Event interest / readiness bitmask.
///
/// Registrations are edge-triggered unless `LT` is requested explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent(u8);

impl PollEvent {
    pub const READ: PollEvent = PollEvent(0b0001);
    pub const WRITE: PollEvent = PollEvent(0b0010);
    pub const ERROR: PollEvent = PollEvent(0b0100);
    /// Level-triggered registration.
    pub const LT: PollEvent = PollEvent(0b1000);

    pub fn empty() -> PollEvent {
        PollEvent(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_read(self) -> bool {
        self.0 & PollEvent::READ.0 != 0
    }

    pub fn is_write(self) -> bool {
        self.0 & PollEvent::WRITE.0 != 0
    }

    pub fn is_error(self) -> bool {
        self.0 & PollEvent::ERROR.0 != 0
    }

    pub fn is_level_triggered(self) -> bool {
        self.0 & PollEvent::LT.0 != 0
    }
}

impl BitOr for PollEvent {
    type Output = PollEvent;

    fn bitor(self, other: PollEvent) -> PollEvent {
        PollEvent(self.0 | other.0)
    }
}

impl BitOrAssign for PollEvent {
    fn bitor_assign(&mut self, other: PollEvent) {
        self.0 |= other.0;
    }
}

/// Callback dispatched with the observed readiness mask.
pub type PollEventCB = Box<dyn FnMut(PollEvent) + Send>;

/// Recurring delayed task: returns the next delay in milliseconds, or 0 to
/// stop recurring.
pub type DelayTaskFn = Box<dyn FnMut() -> u64 + Send>;

/// Handle to a scheduled delay task.
///
/// `cancel` is safe from any thread; when called off the poller thread the
/// task may fire at most once more before the cancellation is observed.
#[derive(Clone)]
pub struct DelayTask {
    cancelled: Arc<AtomicBool>,
}

impl DelayTask {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct DelayEntry {
    deadline_us: u64,
    cancelled: Arc<AtomicBool>,
    task: DelayTaskFn,
}

impl PartialEq for DelayEntry {
    fn eq(&self, other: &DelayEntry) -> bool {
        self.deadline_us == other.deadline_us
    }
}

impl Eq for DelayEntry {}

impl PartialOrd for DelayEntry {
    fn partial_cmp(&self, other: &DelayEntry) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayEntry {
    fn cmp(&self, other: &DelayEntry) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert for earliest-deadline-first.
        other.deadline_us.cmp(&self.deadline_us)
    }
}

struct FdEntry {
    // Shared so dispatch can run the callback without holding the map lock;
    // a callback deleting its own registration stays alive until it returns.
    cb: Arc<Mutex<PollEventCB>>,
}

struct LoopState {
    fds: HashMap<RawFd, FdEntry>,
    delay_heap: BinaryHeap<DelayEntry>,
}

struct PollerInner {
    id: usize,
    name: String,
    selector: Selector,
    waker: Waker,
    exit_flag: AtomicBool,
    running: AtomicBool,
    no_wait: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<VecDeque<Task>>,
    // Only the loop thread touches this after startup; the mutex makes the
    // handle Sync and is uncontended by construction.
    state: Mutex<LoopState>,
    load: crate::executor::ThreadLoadCounter,
}

/// Cloneable handle to one reactor.
#[derive(Clone)]
pub struct EventPoller {
    inner: Arc<PollerInner>,
}

thread_local! {
    static CURRENT_POLLER: std::cell::RefCell<Option<EventPoller>> =
        const { std::cell::RefCell::new(None) };
}

static NEXT_POLLER_ID: AtomicUsize = AtomicUsize::new(0);

impl EventPoller {
    pub fn new(name: impl Into<String>) -> io::Result<EventPoller> {
        let selector = Selector::new()?;
        let waker = Waker::new()?;
        selector.register(waker.as_raw_fd(), PollEvent::READ)?;
        Ok(EventPoller {
            inner: Arc::new(PollerInner {
                id: NEXT_POLLER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                selector,
                waker,
                exit_flag: AtomicBool::new(false),
                running: AtomicBool::new(false),
                no_wait: AtomicBool::new(false),
                loop_thread: Mutex::new(None),
                join_handle: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                state: Mutex::new(LoopState {
                    fds: HashMap::new(),
                    delay_heap: BinaryHeap::new(),
                }),
                load: crate::executor::ThreadLoadCounter::new(),
            }),
        })
    }

    /// Stable id, unique per process. Servers key their per-poller clones
    /// with it.
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The poller driving the calling thread, if any.
    pub fn current() -> Option<EventPoller> {
        CURRENT_POLLER.with(|current| current.borrow().clone())
    }

    pub fn is_current_thread(&self) -> bool {
        match *self.inner.loop_thread.lock().unwrap() {
            Some(id) => id == thread::current().id(),
            None => false,
        }
    }

    /// Trade a core for latency: never block in the selector.
    pub fn set_no_wait(&self, enable: bool) {
        self.inner.no_wait.store(enable, Ordering::Relaxed);
    }

    fn exited(&self) -> bool {
        self.inner.exit_flag.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](EventPoller::shutdown) has been requested.
    pub fn has_shut_down(&self) -> bool {
        self.exited()
    }

    /// Register interest in `fd` with one callback. Off the loop thread the
    /// mutation is queued; registration failures are then logged instead of
    /// returned.
    pub fn add_event(&self, fd: RawFd, events: PollEvent, cb: PollEventCB) -> io::Result<()> {
        if self.exited() {
            return Err(poller_gone());
        }
        if self.mutate_inline() {
            return self.add_event_inner(fd, events, cb);
        }
        let this = self.clone();
        self.async_task(
            Box::new(move || {
                if let Err(err) = this.add_event_inner(fd, events, cb) {
                    warn!("[{}] deferred add_event({}) failed: {}", this.name(), fd, err);
                }
            }),
            true,
        );
        Ok(())
    }

    fn add_event_inner(&self, fd: RawFd, events: PollEvent, cb: PollEventCB) -> io::Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.selector.register(fd, events)?;
        state.fds.insert(
            fd,
            FdEntry {
                cb: Arc::new(Mutex::new(cb)),
            },
        );
        Ok(())
    }

    /// Remove the registration for `fd`. `cb_on_done(success)` fires once,
    /// on the poller thread.
    pub fn del_event(&self, fd: RawFd, cb_on_done: Option<Box<dyn FnOnce(bool) + Send>>) {
        if self.exited() {
            if let Some(done) = cb_on_done {
                done(false);
            }
            return;
        }
        if self.mutate_inline() {
            let ok = self.del_event_inner(fd);
            if let Some(done) = cb_on_done {
                done(ok);
            }
            return;
        }
        let this = self.clone();
        self.async_task(
            Box::new(move || {
                let ok = this.del_event_inner(fd);
                if let Some(done) = cb_on_done {
                    done(ok);
                }
            }),
            true,
        );
    }

    fn del_event_inner(&self, fd: RawFd) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let had = state.fds.remove(&fd).is_some();
        if had {
            if let Err(err) = self.inner.selector.deregister(fd) {
                trace!("[{}] deregister({}) failed: {}", self.name(), fd, err);
            }
        }
        had
    }

    /// Atomically replace the interest mask for `fd`.
    pub fn modify_event(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        if self.exited() {
            return Err(poller_gone());
        }
        if self.mutate_inline() {
            return self.modify_event_inner(fd, events);
        }
        let this = self.clone();
        self.async_task(
            Box::new(move || {
                if let Err(err) = this.modify_event_inner(fd, events) {
                    trace!("[{}] deferred modify_event({}) failed: {}", this.name(), fd, err);
                }
            }),
            true,
        );
        Ok(())
    }

    fn modify_event_inner(&self, fd: RawFd, events: PollEvent) -> io::Result<()> {
        let state = self.inner.state.lock().unwrap();
        if state.fds.contains_key(&fd) {
            self.inner.selector.reregister(fd, events)
        } else {
            Err(io::Error::from_raw_os_error(libc::ENOENT))
        }
    }

    /// Schedule `task` to first fire after `delay_ms`. The task returns the
    /// next delay in milliseconds; returning 0 stops it; panicking stops it.
    pub fn do_delay_task(&self, delay_ms: u64, task: DelayTaskFn) -> DelayTask {
        let cancelled = Arc::new(AtomicBool::new(false));
        let handle = DelayTask {
            cancelled: cancelled.clone(),
        };
        if self.exited() {
            handle.cancel();
            return handle;
        }
        let deadline_us = util::now_micros().saturating_add(delay_ms.saturating_mul(1000));
        let entry = DelayEntry {
            deadline_us,
            cancelled,
            task,
        };
        if self.mutate_inline() {
            self.inner.state.lock().unwrap().delay_heap.push(entry);
        } else {
            let this = self.clone();
            self.async_task(
                Box::new(move || {
                    this.inner.state.lock().unwrap().delay_heap.push(entry);
                }),
                true,
            );
        }
        handle
    }

    /// Drive the loop on the calling thread until shutdown.
    pub fn run_loop(&self) {
        *self.inner.loop_thread.lock().unwrap() = Some(thread::current().id());
        self.inner.running.store(true, Ordering::Release);
        CURRENT_POLLER.with(|current| *current.borrow_mut() = Some(self.clone()));
        util::set_thread_name(self.name());

        let wake_fd = self.inner.waker.as_raw_fd();
        let mut ready: Vec<(RawFd, PollEvent)> = Vec::with_capacity(256);

        while !self.exited() {
            let timeout_us = if self.inner.no_wait.load(Ordering::Relaxed) {
                0
            } else {
                self.next_timeout_us()
            };

            self.inner.load.start_sleep();
            let res = self.inner.selector.select(&mut ready, timeout_us);
            self.inner.load.wake_up();

            match res {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {
                    ready.clear();
                    continue;
                }
                Err(err) => {
                    error!("[{}] selector died: {}; exiting loop", self.name(), err);
                    self.inner.exit_flag.store(true, Ordering::Release);
                    break;
                }
            }

            for &(fd, events) in ready.iter() {
                if fd == wake_fd {
                    self.inner.waker.drain();
                    self.run_pending();
                    continue;
                }
                self.dispatch(fd, events);
            }
            ready.clear();

            self.flush_delay_tasks();
        }

        // Shutdown: drain remaining tasks, then drop every registration
        // before the selector goes away.
        self.run_pending();
        let fds: Vec<RawFd> = {
            let mut state = self.inner.state.lock().unwrap();
            state.delay_heap.clear();
            state.fds.drain().map(|(fd, _)| fd).collect()
        };
        for fd in fds {
            let _ = self.inner.selector.deregister(fd);
        }
        CURRENT_POLLER.with(|current| *current.borrow_mut() = None);
        self.inner.running.store(false, Ordering::Release);
    }

    /// Spawn a named thread driving [`run_loop`](EventPoller::run_loop).
    pub fn run(&self) {
        let this = self.clone();
        let handle = thread::Builder::new()
            .name(self.name().to_string())
            .spawn(move || this.run_loop())
            .expect("failed to spawn poller thread");
        *self.inner.join_handle.lock().unwrap() = Some(handle);
    }

    /// Stop the loop, join the owned thread (when called from outside it)
    /// and drop all registrations. Further API calls fail fast.
    pub fn shutdown(&self) {
        self.inner.exit_flag.store(true, Ordering::Release);
        let _ = self.inner.waker.wake();
        if !self.is_current_thread() {
            if let Some(handle) = self.inner.join_handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }

    fn mutate_inline(&self) -> bool {
        !self.inner.running.load(Ordering::Acquire) || self.is_current_thread()
    }

    fn next_timeout_us(&self) -> i64 {
        let state = self.inner.state.lock().unwrap();
        match state.delay_heap.peek() {
            Some(entry) => {
                let now = util::now_micros();
                if entry.deadline_us <= now {
                    0
                } else {
                    (entry.deadline_us - now).min(i64::MAX as u64) as i64
                }
            }
            None => -1,
        }
    }

    fn dispatch(&self, fd: RawFd, events: PollEvent) {
        let cb = {
            let state = self.inner.state.lock().unwrap();
            state.fds.get(&fd).map(|entry| entry.cb.clone())
        };
        let Some(cb) = cb else {
            trace!("[{}] event for unregistered fd {}", self.name(), fd);
            return;
        };
        // A callback that panicked earlier leaves its mutex poisoned; keep
        // dispatching anyway.
        let mut cb = match cb.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (*cb)(events))) {
            error!("[{}] fd {} callback panicked: {:?}", self.name(), fd, panic);
        }
    }

    fn run_pending(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.inner.pending.lock().unwrap());
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                    error!("[{}] queued task panicked: {:?}", self.name(), panic);
                }
            }
        }
    }

    fn flush_delay_tasks(&self) {
        loop {
            let now = util::now_micros();
            let entry = {
                let mut state = self.inner.state.lock().unwrap();
                match state.delay_heap.peek() {
                    Some(entry) if entry.deadline_us <= now => state.delay_heap.pop(),
                    _ => None,
                }
            };
            let Some(mut entry) = entry else { return };
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (entry.task)())) {
                Ok(next_ms) if next_ms > 0 && !entry.cancelled.load(Ordering::Acquire) => {
                    entry.deadline_us =
                        util::now_micros().saturating_add(next_ms.saturating_mul(1000));
                    self.inner.state.lock().unwrap().delay_heap.push(entry);
                }
                Ok(_) => {}
                Err(panic) => {
                    error!("[{}] delay task panicked: {:?}", self.name(), panic);
                }
            }
        }
    }

    fn enqueue(&self, task: Task, first: bool, may_sync: bool) {
        if self.exited() {
            warn!("[{}] task dropped: poller has shut down", self.name());
            return;
        }
        if may_sync && self.is_current_thread() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(task)) {
                error!("[{}] inline task panicked: {:?}", self.name(), panic);
            }
            return;
        }
        {
            let mut pending = self.inner.pending.lock().unwrap();
            if first {
                pending.push_front(task);
            } else {
                pending.push_back(task);
            }
        }
        if let Err(err) = self.inner.waker.wake() {
            warn!("[{}] wake failed: {}", self.name(), err);
        }
    }

    pub(crate) fn load_percent(&self) -> usize {
        self.inner.load.load()
    }
}

impl TaskExecutor for EventPoller {
    fn async_task(&self, task: Task, may_sync: bool) {
        self.enqueue(task, false, may_sync);
    }

    fn async_first(&self, task: Task, may_sync: bool) {
        self.enqueue(task, true, may_sync);
    }

    fn load(&self) -> usize {
        self.load_percent()
    }
}

impl fmt::Debug for EventPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPoller")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

fn poller_gone() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "event poller has shut down")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn started_poller(name: &str) -> EventPoller {
        let poller = EventPoller::new(name).unwrap();
        poller.run();
        poller
    }

    #[test]
    fn async_tasks_run_in_fifo_order() {
        let poller = started_poller("test fifo");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = order.clone();
            poller.async_task(
                Box::new(move || {
                    order.lock().unwrap().push(i);
                }),
                false,
            );
        }
        let done = Semaphore::new();
        let done2 = done.clone();
        poller.async_task(Box::new(move || done2.post()), false);
        done.wait();
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
        poller.shutdown();
    }

    use crate::executor::Semaphore;

    #[test]
    fn sync_runs_inline_on_own_thread() {
        let poller = started_poller("test sync");
        let poller2 = poller.clone();
        // sync() into itself from the loop thread must not deadlock.
        poller.sync(Box::new(move || {
            let hit = Arc::new(AtomicBool::new(false));
            let hit2 = hit.clone();
            poller2.sync(Box::new(move || hit2.store(true, Ordering::SeqCst)));
            assert!(hit.load(Ordering::SeqCst));
        }));
        poller.shutdown();
    }

    #[test]
    fn delay_task_recurs_until_zero() {
        let poller = started_poller("test delay");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let _task = poller.do_delay_task(
            10,
            Box::new(move || {
                let n = fired2.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    0
                } else {
                    10
                }
            }),
        );
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        poller.shutdown();
    }

    #[test]
    fn delay_task_cancel_stops_it() {
        let poller = started_poller("test cancel");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let task = poller.do_delay_task(
            20,
            Box::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
                20
            }),
        );
        std::thread::sleep(Duration::from_millis(50));
        task.cancel();
        let after_cancel = fired.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        // At most one more firing may have been in flight.
        assert!(fired.load(Ordering::SeqCst) <= after_cancel + 1);
        poller.shutdown();
    }

    #[test]
    fn current_is_set_on_loop_thread() {
        let poller = started_poller("test current");
        let poller2 = poller.clone();
        poller.sync(Box::new(move || {
            let current = EventPoller::current().expect("current poller");
            assert_eq!(current.id(), poller2.id());
        }));
        assert!(EventPoller::current().is_none());
        poller.shutdown();
    }
}
