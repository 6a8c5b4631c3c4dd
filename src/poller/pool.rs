//! Process-wide pool of reactors, one loop thread each.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::info;

use super::EventPoller;

static POOL_SIZE: AtomicUsize = AtomicUsize::new(0);
static INSTANCE: OnceLock<EventPollerPool> = OnceLock::new();

/// N pollers, each bound to its own thread, shared by every server in the
/// process. Sessions are spread over the pool by picking the least-loaded
/// poller at accept/first-datagram time.
pub struct EventPollerPool {
    pollers: Vec<EventPoller>,
}

impl EventPollerPool {
    /// Set the pool size. Only effective before the first
    /// [`instance`](EventPollerPool::instance) call.
    pub fn set_pool_size(size: usize) {
        POOL_SIZE.store(size, Ordering::Relaxed);
    }

    pub fn instance() -> &'static EventPollerPool {
        INSTANCE.get_or_init(|| {
            let mut size = POOL_SIZE.load(Ordering::Relaxed);
            if size == 0 {
                size = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
            }
            let mut pollers = Vec::with_capacity(size);
            for i in 0..size {
                let poller =
                    EventPoller::new(format!("event poller {}", i)).expect("create event poller");
                poller.run();
                pollers.push(poller);
            }
            info!("event poller pool started with {} threads", size);
            EventPollerPool { pollers }
        })
    }

    pub fn size(&self) -> usize {
        self.pollers.len()
    }

    /// Pick a poller. With `prefer_current`, a caller already running on a
    /// pool thread gets its own poller back; otherwise the least-loaded one
    /// wins.
    pub fn get_poller(&self, prefer_current: bool) -> EventPoller {
        if prefer_current {
            if let Some(current) = EventPoller::current() {
                if self.pollers.iter().any(|p| p.id() == current.id()) {
                    return current;
                }
            }
        }
        self.pollers
            .iter()
            .min_by_key(|poller| poller.load_percent())
            .expect("pool is never empty")
            .clone()
    }

    /// The stable home poller for components that want one.
    pub fn first_poller(&self) -> EventPoller {
        self.pollers[0].clone()
    }

    pub fn for_each(&self, mut f: impl FnMut(&EventPoller)) {
        for poller in &self.pollers {
            f(poller);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskExecutor;

    #[test]
    fn prefer_current_returns_own_poller() {
        let pool = EventPollerPool::instance();
        let poller = pool.first_poller();
        let poller2 = poller.clone();
        poller.sync(Box::new(move || {
            let picked = EventPollerPool::instance().get_poller(true);
            assert_eq!(picked.id(), poller2.id());
        }));
    }

    #[test]
    fn for_each_visits_every_poller() {
        let pool = EventPollerPool::instance();
        let mut seen = 0;
        pool.for_each(|_| seen += 1);
        assert_eq!(seen, pool.size());
    }
}
