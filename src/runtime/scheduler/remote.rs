// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Cross-thread face of a scheduler.
//!
//! Everything a foreign thread may do to a scheduler goes through this object: push a fiber onto
//! the remote-ready queue and wake the dispatcher. The queue is multi-producer (any thread) and
//! single-consumer (the owning dispatcher).

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fiber::SharedFiber,
    scheduler::dispatcher::DispatchPolicy,
};
use ::crossbeam_queue::SegQueue;
use ::parking_lot::RwLock;
use ::std::sync::Arc;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Thread-safe surface of a scheduler instance.
pub struct RemoteScheduler {
    /// Fibers made runnable from other threads, drained by the owning dispatcher.
    remote_ready_queue: SegQueue<Arc<SharedFiber>>,
    /// The dispatch policy to notify on remote arrivals. Cleared during scheduler teardown.
    policy: RwLock<Option<Arc<dyn DispatchPolicy>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl RemoteScheduler {
    pub(crate) fn new() -> Self {
        Self {
            remote_ready_queue: SegQueue::new(),
            policy: RwLock::new(None),
        }
    }

    /// Makes `fiber` runnable on the owning scheduler and wakes its dispatcher. Callable from any
    /// thread.
    pub fn schedule(&self, fiber: Arc<SharedFiber>) {
        trace!("schedule(): remote enqueue of {:?}", fiber.name());
        self.remote_ready_queue.push(fiber);

        match self.policy.read().as_ref() {
            Some(policy) => policy.notify(),
            None => warn!("schedule(): scheduler is shut down, wakeup dropped"),
        }
    }

    /// Pops one remote arrival. Only the owning dispatcher consumes this queue.
    pub(crate) fn pop(&self) -> Option<Arc<SharedFiber>> {
        self.remote_ready_queue.pop()
    }

    pub(crate) fn set_policy(&self, policy: Arc<dyn DispatchPolicy>) {
        *self.policy.write() = Some(policy);
    }

    pub(crate) fn clear_policy(&self) {
        *self.policy.write() = None;
    }

    pub(crate) fn policy(&self) -> Arc<dyn DispatchPolicy> {
        self.policy.read().clone().expect("scheduler has no dispatch policy")
    }
}
