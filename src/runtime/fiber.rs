// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Fiber records and the fiber-level synchronization surface.
//!
//! A fiber record is split in two: [SharedFiber] is the cross-thread half (atomic flags, park
//! token, owning-scheduler pointer) held through an `Arc` by queues, the parking table and user
//! handles; the owner-thread half (coroutine, queue links, wake time) lives in the scheduler's
//! fiber arena.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    parking,
    scheduler::{
        self,
        remote::RemoteScheduler,
        SharedScheduler,
    },
};
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU32,
            AtomicU64,
            Ordering,
        },
        Arc,
        OnceLock,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// The fiber has announced that it is about to park on its own address. Cleared by a notifier to
/// call off the parking before it happens.
const PARKING_IN_PROGRESS: u32 = 1 << 0;

/// The fiber's entry function has returned.
const DONE: u32 = 1 << 1;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Index of a fiber in its owning scheduler's arena.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug)]
pub struct FiberId(pub usize);

/// Role of a fiber, which determines scheduler accounting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FiberKind {
    /// The hosting thread's native context.
    Main,
    /// The per-scheduler dispatcher.
    Dispatcher,
    /// A user fiber. Contributes to the scheduler's worker count between attach and termination.
    Worker,
}

/// Cross-thread half of a fiber record.
pub struct SharedFiber {
    /// Arena index in the owning scheduler.
    id: FiberId,
    kind: FiberKind,
    /// Diagnostic name.
    name: String,
    /// Atomic state bits ([PARKING_IN_PROGRESS], [DONE]).
    flags: AtomicU32,
    /// Token this fiber is parked on. Set before parking; read under the parking bucket's lock.
    park_token: AtomicU64,
    /// Cross-thread surface of the owning scheduler. Set on attach, immutable afterwards.
    scheduler: OnceLock<Arc<RemoteScheduler>>,
}

/// Externally visible fiber handle. Cheap to clone and safe to send across threads.
#[derive(Clone)]
pub struct FiberHandle {
    shared: Arc<SharedFiber>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedFiber {
    pub(crate) fn new(id: FiberId, kind: FiberKind, name: &str) -> Self {
        Self {
            id,
            kind,
            name: name.to_string(),
            flags: AtomicU32::new(0),
            park_token: AtomicU64::new(0),
            scheduler: OnceLock::new(),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn kind(&self) -> FiberKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn park_token(&self) -> u64 {
        self.park_token.load(Ordering::Relaxed)
    }

    pub(crate) fn set_park_token(&self, token: u64) {
        self.park_token.store(token, Ordering::Relaxed);
    }

    pub(crate) fn set_parking_in_progress(&self) {
        self.flags.fetch_or(PARKING_IN_PROGRESS, Ordering::Relaxed);
    }

    pub(crate) fn clear_parking_in_progress(&self) {
        self.flags.fetch_and(!PARKING_IN_PROGRESS, Ordering::Relaxed);
    }

    pub(crate) fn parking_in_progress(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & PARKING_IN_PROGRESS != 0
    }

    pub(crate) fn mark_done(&self) {
        self.flags.fetch_or(DONE, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.flags.load(Ordering::Acquire) & DONE != 0
    }

    /// Binds this fiber to its owning scheduler. Callable once.
    pub(crate) fn attach_scheduler(&self, remote: Arc<RemoteScheduler>) {
        if self.scheduler.set(remote).is_err() {
            panic!("fiber {:?} attached to a scheduler twice", self.name);
        }
    }

    pub(crate) fn scheduler(&self) -> Option<Arc<RemoteScheduler>> {
        self.scheduler.get().cloned()
    }

    /// The token a fiber parks its own suspension on: its record address.
    pub(crate) fn address_token(this: &Arc<SharedFiber>) -> u64 {
        Arc::as_ptr(this) as usize as u64
    }

    /// The token joiners rendezvous on. The record address is pointer-aligned, so tagging the low
    /// bit keeps the join namespace disjoint from [Self::address_token].
    pub(crate) fn join_token(this: &Arc<SharedFiber>) -> u64 {
        Self::address_token(this) | 1
    }
}

impl FiberHandle {
    pub(crate) fn new(shared: Arc<SharedFiber>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> FiberId {
        self.shared.id()
    }

    pub fn kind(&self) -> FiberKind {
        self.shared.kind()
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Has this fiber's entry function returned?
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    pub(crate) fn shared(&self) -> &Arc<SharedFiber> {
        &self.shared
    }

    /// Wakes this fiber if it is parked on its own address; otherwise calls off its pending
    /// parking attempt. See [notify_parked].
    pub fn notify(&self) {
        notify_parked(self);
    }

    /// Makes this fiber runnable now: on the owning thread it goes straight onto the ready
    /// queue, from any other thread it goes through the remote-ready queue.
    pub fn activate(&self) {
        activate(&self.shared);
    }

    /// Suspends the calling fiber until this fiber's entry function has returned.
    pub fn join(&self) {
        let me: FiberHandle = current_fiber();
        assert!(
            !Arc::ptr_eq(&me.shared, &self.shared),
            "fiber {:?} cannot join itself",
            self.name()
        );

        let token: u64 = SharedFiber::join_token(&self.shared);
        while !self.shared.is_done() {
            // A false return means the validator saw the fiber exit; a true return means we
            // parked and were woken, so re-check.
            suspend_conditionally(token, || self.shared.is_done());
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns a handle to the fiber running on the calling thread.
pub fn current_fiber() -> FiberHandle {
    FiberHandle::new(scheduler::current().current_shared())
}

/// Announces that the calling fiber is about to park on its own address. Must precede publishing
/// the fiber to whatever agent will later call [notify_parked]; the flag is how a notify that
/// races ahead of the park gets observed.
pub fn prepare_parking() {
    let me: Arc<SharedFiber> = scheduler::current().current_shared();
    me.set_parking_in_progress();
}

/// Parks the calling fiber on its own address and suspends until a [notify_parked] wakes it. If a
/// concurrent notify already called the parking off, returns without suspending.
pub fn suspend_until_wakeup() {
    let mut sched: SharedScheduler = scheduler::current();
    let me: Arc<SharedFiber> = sched.current_shared();
    let token: u64 = SharedFiber::address_token(&me);

    let parked: bool = parking::table().emplace(token, &me, || !me.parking_in_progress());
    if parked {
        sched.preempt();
    }
}

/// Parks the calling fiber on `token` unless `validate` reports that the awaited condition has
/// already resolved. Returns whether the fiber parked (and was subsequently woken). Wakeups may
/// be spurious; callers re-check their predicate.
pub fn suspend_conditionally<F: FnMut() -> bool>(token: u64, validate: F) -> bool {
    let mut sched: SharedScheduler = scheduler::current();
    let me: Arc<SharedFiber> = sched.current_shared();

    let parked: bool = parking::table().emplace(token, &me, validate);
    if parked {
        sched.preempt();
    }
    parked
}

/// Wakes `target` from a park on its own address. Callable from any thread. If the target has not
/// parked yet, its parking-in-progress flag is cleared instead, which closes the lost-wakeup race:
/// the target's own [suspend_until_wakeup] validator will then refuse to park.
pub fn notify_parked(target: &FiberHandle) {
    let shared: &Arc<SharedFiber> = target.shared();
    let token: u64 = SharedFiber::address_token(shared);

    let removed: Option<Arc<SharedFiber>> = parking::table().remove(
        token,
        |fiber| fiber.clear_parking_in_progress(),
        || shared.clear_parking_in_progress(),
    );

    match removed {
        Some(fiber) => {
            assert!(Arc::ptr_eq(&fiber, shared), "park token collided with another fiber");
            let remote: Arc<RemoteScheduler> = fiber.scheduler().expect("parked fiber is not attached");
            remote.schedule(fiber);
        },
        // The fiber has not parked yet; the cleared flag makes it skip the suspension.
        None => (),
    }
}

/// Wakes the first fiber parked on `token`. Returns whether a fiber was woken.
pub fn notify_one(token: u64) -> bool {
    match parking::table().remove(token, |_| {}, || {}) {
        Some(fiber) => {
            activate(&fiber);
            true
        },
        None => false,
    }
}

/// Wakes every fiber parked on `token`. Returns the number of fibers woken.
pub fn notify_all(token: u64) -> usize {
    let mut woken: VecDeque<Arc<SharedFiber>> = VecDeque::new();
    parking::table().remove_all(token, &mut woken);
    let count: usize = woken.len();
    while let Some(fiber) = woken.pop_front() {
        activate(&fiber);
    }
    count
}

/// Makes `fiber` runnable: directly on the ready queue when the calling thread owns it, through
/// the remote-ready queue otherwise.
pub(crate) fn activate(fiber: &Arc<SharedFiber>) {
    let remote: Arc<RemoteScheduler> = fiber.scheduler().expect("fiber is not attached to a scheduler");

    if let Some(mut sched) = scheduler::try_current() {
        if sched.owns(&remote) {
            sched.add_ready_checked(fiber);
            return;
        }
    }

    remote.schedule(fiber.clone());
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        FiberId,
        FiberKind,
        SharedFiber,
    };
    use ::anyhow::Result;
    use ::std::sync::Arc;

    #[test]
    fn parking_flag_round_trips() -> Result<()> {
        let fiber: SharedFiber = SharedFiber::new(FiberId(3), FiberKind::Worker, "flags");

        crate::ensure_eq!(fiber.parking_in_progress(), false);
        fiber.set_parking_in_progress();
        crate::ensure_eq!(fiber.parking_in_progress(), true);
        fiber.clear_parking_in_progress();
        crate::ensure_eq!(fiber.parking_in_progress(), false);

        Ok(())
    }

    #[test]
    fn done_flag_does_not_disturb_parking_flag() -> Result<()> {
        let fiber: SharedFiber = SharedFiber::new(FiberId(0), FiberKind::Worker, "flags");

        fiber.set_parking_in_progress();
        fiber.mark_done();
        crate::ensure_eq!(fiber.parking_in_progress(), true);
        crate::ensure_eq!(fiber.is_done(), true);
        fiber.clear_parking_in_progress();
        crate::ensure_eq!(fiber.is_done(), true);

        Ok(())
    }

    #[test]
    fn join_token_is_disjoint_from_address_token() -> Result<()> {
        let fiber: Arc<SharedFiber> = Arc::new(SharedFiber::new(FiberId(0), FiberKind::Worker, "tokens"));

        let address: u64 = SharedFiber::address_token(&fiber);
        let join: u64 = SharedFiber::join_token(&fiber);
        crate::ensure_neq!(address, join);
        // The record is at least pointer-aligned, so the low bit is free for tagging.
        crate::ensure_eq!(address & 1, 0);
        crate::ensure_eq!(join & 1, 1);

        Ok(())
    }
}
