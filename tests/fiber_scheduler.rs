// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end scheduler scenarios.

use ::anyhow::Result;
use ::fiberkernel::{
    current_fiber,
    prepare_parking,
    run,
    runtime::scheduler::{
        DefaultPolicy,
        DispatchPolicy,
        SharedScheduler,
    },
    sleep_for,
    spawn,
    suspend_until_wakeup,
    wait_until,
    yield_now,
    FiberHandle,
};
use ::std::{
    cell::Cell,
    rc::Rc,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        mpsc,
        Arc,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Unit Tests
//======================================================================================================================

/// Two fibers on one scheduler: one parks on its own address, the other wakes it. The parked
/// fiber must resume exactly once and both must exit cleanly.
#[test]
fn ping_pong_wakes_parked_fiber() -> Result<()> {
    let resumed: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    run({
        let resumed = resumed.clone();
        move || {
            let sleeper: FiberHandle = spawn("sleeper", {
                let resumed = resumed.clone();
                move || {
                    prepare_parking();
                    suspend_until_wakeup();
                    resumed.fetch_add(1, Ordering::SeqCst);
                }
            });
            let waker: FiberHandle = spawn("waker", {
                let sleeper = sleeper.clone();
                move || {
                    sleeper.notify();
                }
            });

            sleeper.join();
            waker.join();
        }
    });

    assert_eq!(resumed.load(Ordering::SeqCst), 1);

    Ok(())
}

/// A fiber parked on scheduler S1 is woken from a foreign thread. The wakeup travels through the
/// remote-ready queue and resumes the fiber on its own scheduler.
#[test]
fn cross_thread_notify_resumes_fiber() -> Result<()> {
    let resumed: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel::<FiberHandle>();

    let notifier: thread::JoinHandle<()> = thread::spawn(move || {
        let handle: FiberHandle = rx.recv().unwrap();
        handle.notify();
    });

    run({
        let resumed = resumed.clone();
        move || {
            spawn("remote-waitee", move || {
                // Announce the park before the handle leaves this thread, so a racing notify is
                // guaranteed to either find us in the table or call the park off.
                prepare_parking();
                tx.send(current_fiber()).unwrap();
                suspend_until_wakeup();
                resumed.fetch_add(1, Ordering::SeqCst);
            });
            // Scheduler teardown waits for the worker to drain, which requires the remote wakeup
            // to arrive.
        }
    });

    notifier.join().unwrap();
    assert_eq!(resumed.load(Ordering::SeqCst), 1);

    Ok(())
}

/// A fiber sleeping on a timer is woken early by an explicit activation. It must run at the
/// activation, not at timer expiry, and must not be woken a second time by the stale timer.
#[test]
fn explicit_wake_beats_timer() -> Result<()> {
    run(|| {
        let woke_after: Rc<Cell<Option<Duration>>> = Rc::new(Cell::new(None));
        let wakeups: Rc<Cell<u32>> = Rc::new(Cell::new(0));
        let start: Instant = Instant::now();

        let sleeper: FiberHandle = spawn("sleeper", {
            let woke_after = woke_after.clone();
            let wakeups = wakeups.clone();
            move || {
                wait_until(Instant::now() + Duration::from_millis(500));
                wakeups.set(wakeups.get() + 1);
                woke_after.set(Some(start.elapsed()));
            }
        });
        spawn("waker", {
            let sleeper = sleeper.clone();
            move || {
                sleep_for(Duration::from_millis(10));
                sleeper.activate();
            }
        });

        sleeper.join();

        let elapsed: Duration = woke_after.get().expect("sleeper recorded its wake time");
        assert!(
            elapsed < Duration::from_millis(250),
            "sleeper woke at {:?}, after the timer instead of the explicit wake",
            elapsed
        );
        assert_eq!(wakeups.get(), 1);
    });

    Ok(())
}

/// Eight workers that re-schedule themselves once and exit must all drain through scheduler
/// teardown.
#[test]
fn shutdown_drains_workers() -> Result<()> {
    const NUM_WORKERS: usize = 8;

    let handles: Vec<FiberHandle> = run(|| {
        (0..NUM_WORKERS)
            .map(|i| {
                spawn(&format!("worker{}", i), || {
                    yield_now();
                })
            })
            .collect()
    });

    for handle in &handles {
        assert!(handle.is_done(), "{:?} did not reach termination", handle.name());
    }

    Ok(())
}

/// The lost-wakeup guard: a notify that lands between a fiber's parking announcement and its
/// actual park must call the park off entirely. If the guard failed, the fiber would park with
/// nobody left to wake it and teardown would hang.
#[test]
fn notify_before_park_prevents_parking() -> Result<()> {
    let completed: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    run({
        let completed = completed.clone();
        move || {
            let waitee: FiberHandle = spawn("waitee", {
                let completed = completed.clone();
                move || {
                    prepare_parking();
                    // Let the notifier run before we reach the parking table.
                    yield_now();
                    suspend_until_wakeup();
                    completed.fetch_add(1, Ordering::SeqCst);
                }
            });
            spawn("early-notifier", {
                let waitee = waitee.clone();
                move || {
                    waitee.notify();
                }
            });

            waitee.join();
        }
    });

    assert_eq!(completed.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Notifying a fiber twice after a single park yields exactly one wake and no duplicate enqueue.
#[test]
fn notify_is_idempotent() -> Result<()> {
    let resumed: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    run({
        let resumed = resumed.clone();
        move || {
            let sleeper: FiberHandle = spawn("sleeper", {
                let resumed = resumed.clone();
                move || {
                    prepare_parking();
                    suspend_until_wakeup();
                    resumed.fetch_add(1, Ordering::SeqCst);
                }
            });
            spawn("double-notifier", {
                let sleeper = sleeper.clone();
                move || {
                    sleeper.notify();
                    sleeper.notify();
                }
            });

            sleeper.join();
        }
    });

    assert_eq!(resumed.load(Ordering::SeqCst), 1);

    Ok(())
}

/// A fiber on one scheduler joins a fiber on another: the joiner parks on the target's join
/// token and the target's exit wakes it across threads.
#[test]
fn join_across_schedulers() -> Result<()> {
    let (tx, rx) = mpsc::channel::<FiberHandle>();

    let joiner: thread::JoinHandle<bool> = thread::spawn(move || {
        run(move || {
            let target: FiberHandle = rx.recv().unwrap();
            let observed: Rc<Cell<bool>> = Rc::new(Cell::new(false));
            let waiter: FiberHandle = spawn("remote-joiner", {
                let observed = observed.clone();
                move || {
                    target.join();
                    observed.set(target.is_done());
                }
            });
            waiter.join();
            observed.get()
        })
    });

    run(move || {
        let worker: FiberHandle = spawn("long-worker", || {
            sleep_for(Duration::from_millis(20));
        });
        tx.send(worker).unwrap();
    });

    assert!(joiner.join().unwrap());

    Ok(())
}

/// A custom dispatch policy receives cross-thread notifications through its own notify hook.
#[test]
fn custom_policy_receives_remote_notifications() -> Result<()> {
    struct CountingPolicy {
        inner: DefaultPolicy,
        notifies: AtomicUsize,
    }

    impl DispatchPolicy for CountingPolicy {
        fn run(&self, sched: SharedScheduler) {
            self.inner.run(sched);
        }

        fn notify(&self) {
            self.notifies.fetch_add(1, Ordering::SeqCst);
            self.inner.notify();
        }
    }

    let policy: Arc<CountingPolicy> = Arc::new(CountingPolicy {
        inner: DefaultPolicy::new(),
        notifies: AtomicUsize::new(0),
    });
    let (tx, rx) = mpsc::channel::<FiberHandle>();

    let notifier: thread::JoinHandle<()> = thread::spawn(move || {
        let handle: FiberHandle = rx.recv().unwrap();
        handle.notify();
    });

    run({
        let policy = policy.clone();
        move || {
            fiberkernel::attach_custom_policy(policy);
            spawn("remote-waitee", move || {
                prepare_parking();
                tx.send(current_fiber()).unwrap();
                suspend_until_wakeup();
            });
        }
    });

    notifier.join().unwrap();
    assert!(policy.notifies.load(Ordering::SeqCst) >= 1);

    Ok(())
}
