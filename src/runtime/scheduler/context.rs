// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Context primitive.
//!
//! Fibers are stackful coroutines (corosensei). The hosting thread's native stack acts as the
//! switch trampoline: a fiber that wants to transfer control yields a [SwitchTarget] directive,
//! and the trampoline loop on the native stack resumes the named fiber. This simulates the
//! symmetric fiber-to-fiber transfer of the scheduling model on top of an asymmetric
//! suspend/resume primitive.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fiber::FiberId,
    scheduler,
};
use ::corosensei::{
    Coroutine,
    Yielder,
};
use ::std::ptr::NonNull;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Where a suspending fiber transfers control to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SwitchTarget {
    /// The hosting thread's native context.
    Main,
    /// Another fiber on the same scheduler.
    Fiber(FiberId),
}

/// A fiber's execution context.
pub type FiberCoroutine = Coroutine<(), SwitchTarget, ()>;

/// Suspension handle of a live fiber. Points at the yielder corosensei passes to the coroutine
/// body, which stays valid for as long as the coroutine exists.
#[derive(Clone, Copy)]
pub struct SuspendPoint {
    yielder: NonNull<Yielder<(), SwitchTarget>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SuspendPoint {
    fn new(yielder: &Yielder<(), SwitchTarget>) -> Self {
        Self {
            yielder: NonNull::from(yielder),
        }
    }

    /// Suspends the calling fiber, transferring control to `target` through the trampoline.
    /// Returns when some fiber (or the timer path) switches back to the caller.
    ///
    /// # Safety
    ///
    /// Must be called on the stack of the fiber this suspend point belongs to.
    pub(crate) unsafe fn suspend(&self, target: SwitchTarget) {
        self.yielder.as_ref().suspend(target);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Creates the execution context for fiber `id`. The context registers its suspend point with the
/// scheduler on first resume and then runs `body` to completion.
pub(crate) fn make_coroutine<F>(id: FiberId, body: F) -> FiberCoroutine
where
    F: FnOnce() + 'static,
{
    Coroutine::new(move |yielder: &Yielder<(), SwitchTarget>, ()| {
        scheduler::register_current_suspend_point(id, SuspendPoint::new(yielder));
        body();
    })
}
