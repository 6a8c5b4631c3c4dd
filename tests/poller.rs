//! Reactor behavior across threads: task ordering, delayed tasks and the
//! cancellation contract.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use netkit::{EventPoller, TaskExecutor};

fn started(name: &str) -> EventPoller {
    let poller = EventPoller::new(name).unwrap();
    poller.run();
    poller
}

#[test]
fn cross_thread_tasks_keep_fifo_order() {
    let poller = started("order");
    let order = Arc::new(Mutex::new(Vec::new()));

    for i in 0..100 {
        let order = order.clone();
        poller.async_task(
            Box::new(move || {
                order.lock().unwrap().push(i);
            }),
            false,
        );
    }
    // sync() acts as a barrier behind the queued tasks.
    poller.sync(Box::new(|| {}));

    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    poller.shutdown();
}

#[test]
fn async_first_overtakes_queued_tasks() {
    let poller = started("first");
    let order = Arc::new(Mutex::new(Vec::new()));

    // Stall the loop so both submissions land in the same drain.
    let o1 = order.clone();
    let o2 = order.clone();
    poller.async_task(
        Box::new(move || {
            std::thread::sleep(Duration::from_millis(100));
        }),
        false,
    );
    // Make sure the loop is inside the stall task before queueing.
    std::thread::sleep(Duration::from_millis(30));
    poller.async_task(
        Box::new(move || {
            o1.lock().unwrap().push("tail");
        }),
        false,
    );
    poller.async_first(
        Box::new(move || {
            o2.lock().unwrap().push("head");
        }),
        false,
    );
    poller.sync(Box::new(|| {}));

    assert_eq!(*order.lock().unwrap(), vec!["head", "tail"]);
    poller.shutdown();
}

#[test]
fn delay_task_fires_at_most_once_after_cancel() {
    let poller = started("cancel race");
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();

    let task = poller.do_delay_task(
        50,
        Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
            50
        }),
    );

    std::thread::sleep(Duration::from_secs(1));
    task.cancel();
    let at_cancel = fired.load(Ordering::SeqCst);
    assert!(at_cancel >= 10, "task should have recurred, got {}", at_cancel);

    std::thread::sleep(Duration::from_millis(400));
    let after = fired.load(Ordering::SeqCst);
    assert!(
        after <= at_cancel + 1,
        "at most one firing may follow cancel: {} -> {}",
        at_cancel,
        after
    );

    // The poller is still alive and serving.
    let hit = Arc::new(AtomicUsize::new(0));
    let hit2 = hit.clone();
    poller.sync(Box::new(move || {
        hit2.store(1, Ordering::SeqCst);
    }));
    assert_eq!(hit.load(Ordering::SeqCst), 1);
    poller.shutdown();
}

#[test]
fn delay_task_deadline_is_respected() {
    let poller = started("deadline");
    let fired_at = Arc::new(Mutex::new(None));
    let fired_at2 = fired_at.clone();
    let start = Instant::now();

    poller.do_delay_task(
        120,
        Box::new(move || {
            *fired_at2.lock().unwrap() = Some(start.elapsed());
            0
        }),
    );

    std::thread::sleep(Duration::from_millis(300));
    let elapsed = fired_at.lock().unwrap().expect("task fired");
    assert!(elapsed >= Duration::from_millis(115), "fired early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(280), "fired late: {:?}", elapsed);
    poller.shutdown();
}

#[test]
fn huge_delay_never_fires() {
    let poller = started("never");
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    poller.do_delay_task(
        u64::MAX,
        Box::new(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
            0
        }),
    );
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    poller.shutdown();
}

#[test]
fn shutdown_is_idempotent_and_fails_fast() {
    let poller = started("shutdown");
    poller.shutdown();
    poller.shutdown();
    assert!(poller.has_shut_down());
    assert!(poller
        .add_event(0, netkit::PollEvent::READ, Box::new(|_| {}))
        .is_err());
}
