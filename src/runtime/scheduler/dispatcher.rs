// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Dispatch policies.
//!
//! The dispatcher fiber runs a [DispatchPolicy]. The default policy drives remote arrivals, timer
//! expiry and the ready queue, and blocks the hosting thread on a condition variable when there is
//! nothing to run. An I/O proactor can replace it through
//! [`crate::runtime::scheduler::SharedScheduler::attach_custom_policy`].

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fiber::FiberId,
    qsbr,
    scheduler::{
        context::SwitchTarget,
        SharedScheduler,
    },
};
use ::parking_lot::{
    Condvar,
    Mutex,
};
use ::std::time::Instant;

//======================================================================================================================
// Traits
//======================================================================================================================

/// A dispatcher body. `run` is invoked once, on the dispatcher fiber, and is expected to loop
/// until the scheduler shuts down and its worker count drains. `notify` is invoked from arbitrary
/// threads whenever a fiber is scheduled remotely and must wake a dispatcher blocked in `run`.
pub trait DispatchPolicy: Send + Sync {
    fn run(&self, sched: SharedScheduler);
    fn notify(&self);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// The built-in dispatch policy.
pub struct DefaultPolicy {
    /// Set by [DispatchPolicy::notify] to wake a suspended dispatcher; the wait predicate.
    wake_suspend: Mutex<bool>,
    cond: Condvar,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl DefaultPolicy {
    pub fn new() -> Self {
        Self {
            wake_suspend: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for DefaultPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchPolicy for DefaultPolicy {
    fn run(&self, mut sched: SharedScheduler) {
        debug!("run(): dispatcher started");
        let dispatcher: FiberId = sched.dispatcher_id();

        loop {
            if sched.is_shutdown() && sched.num_worker_fibers() == 0 {
                break;
            }

            sched.process_remote_ready();
            if sched.has_sleeping_fibers() {
                sched.process_sleep();
            }

            if let Some(id) = sched.pop_ready() {
                debug_assert_ne!(id, dispatcher, "dispatcher popped itself off the ready queue");

                // Re-enqueue ourselves before switching: when the chosen fiber preempts or
                // finishes, the dispatcher is resumed through the ordinary ready path without
                // being special-cased.
                let target: SwitchTarget = sched.as_target(id);
                sched.add_ready(dispatcher);
                trace!("run(): dispatching {:?}", id);
                sched.switch_to(target);
                debug_assert_eq!(sched.current_id(), dispatcher);
            } else {
                sched.destroy_terminated();

                let next_tp: Option<Instant> = sched.next_sleep_point();

                // The thread holds no parking-table references while it sleeps, so it must not
                // count as observing for reclamation.
                qsbr::offline();
                {
                    let mut wake_suspend = self.wake_suspend.lock();
                    match next_tp {
                        Some(deadline) => {
                            while !*wake_suspend {
                                if self.cond.wait_until(&mut wake_suspend, deadline).timed_out() {
                                    break;
                                }
                            }
                        },
                        None => {
                            while !*wake_suspend {
                                self.cond.wait(&mut wake_suspend);
                            }
                        },
                    }
                    *wake_suspend = false;
                }
                qsbr::online();
            }

            qsbr::checkpoint();
            sched.run_deferred();
        }

        sched.destroy_terminated();
        debug!("run(): dispatcher exiting");
    }

    fn notify(&self) {
        let mut wake_suspend = self.wake_suspend.lock();
        *wake_suspend = true;
        self.cond.notify_one();
    }
}
