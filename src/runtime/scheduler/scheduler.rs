// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Per-thread cooperative scheduler.
//!
//! One scheduler instance exists per hosting thread. It owns an arena of fiber records plus the
//! ready, sleep and terminate queues, all single-threaded; the only cross-thread surface is the
//! remote-ready queue behind [`crate::runtime::scheduler::remote::RemoteScheduler`]. Queue
//! membership is tracked by an index tag on each record ([Link]), which makes the "is linked"
//! checks of the scheduling invariants O(1).

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fiber::{
        self,
        FiberHandle,
        FiberId,
        FiberKind,
        SharedFiber,
    },
    qsbr,
    scheduler::{
        context::{
            self,
            FiberCoroutine,
            SuspendPoint,
            SwitchTarget,
        },
        dispatcher::{
            DefaultPolicy,
            DispatchPolicy,
        },
        remote::RemoteScheduler,
    },
    SharedObject,
};
use ::corosensei::CoroutineResult;
use ::slab::Slab;
use ::std::{
    cell::RefCell,
    collections::{
        BTreeSet,
        VecDeque,
    },
    ops::{
        Deref,
        DerefMut,
    },
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which queue a fiber is linked into. A fiber is on at most one queue at any instant; a running
/// or parked fiber is [Link::None].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Link {
    None,
    Ready,
    Sleep,
    Terminate,
}

/// Sleep-queue key: wake time, ties broken by insertion order.
#[derive(Clone, Copy)]
struct SleepEntry {
    when: Instant,
    seq: u64,
    id: FiberId,
}

/// Owner-thread half of a fiber record.
struct FiberState {
    /// Cross-thread half.
    shared: Arc<SharedFiber>,
    /// Execution context. None for the main fiber, and taken out while the fiber runs.
    coroutine: Option<FiberCoroutine>,
    link: Link,
    /// Mirror of this fiber's sleep-queue key. Valid only while `link` is [Link::Sleep].
    wake_at: Option<(Instant, u64)>,
    /// Where to suspend this fiber from its own stack. Registered on first resume.
    suspend_point: Option<SuspendPoint>,
}

/// Per-thread scheduler state. Reachable only through [SharedScheduler].
pub struct Scheduler {
    /// Arena of fiber records.
    fibers: Slab<FiberState>,
    ready_queue: VecDeque<FiberId>,
    sleep_queue: BTreeSet<SleepEntry>,
    terminate_queue: VecDeque<FiberId>,
    /// Thread-safe face of this scheduler.
    remote: Arc<RemoteScheduler>,
    /// The fiber currently running on the hosting thread.
    current: FiberId,
    main_id: FiberId,
    dispatcher_id: FiberId,
    num_worker_fibers: usize,
    shutdown: bool,
    dispatcher_started: bool,
    dispatcher_terminated: bool,
    /// Whether a user policy replaced the default dispatcher body.
    custom_policy: bool,
    /// Sleep-queue insertion counter (FIFO tie-break).
    sleep_seq: u64,
    /// Deferred reclamation callbacks, newest last. An entry runs once every online thread has
    /// reached its epoch; entries retire in LIFO order because epochs are monotonic.
    deferred_callbacks: Vec<(qsbr::Epoch, Box<dyn FnOnce()>)>,
}

/// Clonable handle to the hosting thread's scheduler. The main context, the dispatcher and every
/// fiber re-enter the same scheduler state through handles like this one; see
/// [`crate::runtime::SharedObject`] for why the aliasing is sound here.
#[derive(Clone)]
pub struct SharedScheduler(SharedObject<Scheduler>);

//======================================================================================================================
// Thread-local State
//======================================================================================================================

thread_local! {
    /// The scheduler hosted on this thread, if any.
    static CURRENT_SCHEDULER: RefCell<Option<SharedScheduler>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Scheduler {
    fn new() -> Self {
        let remote: Arc<RemoteScheduler> = Arc::new(RemoteScheduler::new());
        remote.set_policy(Arc::new(DefaultPolicy::new()));

        let mut fibers: Slab<FiberState> = Slab::new();

        // The calling thread's native context becomes the main fiber.
        let main_entry = fibers.vacant_entry();
        let main_id: FiberId = FiberId(main_entry.key());
        let main_shared: Arc<SharedFiber> = Arc::new(SharedFiber::new(main_id, FiberKind::Main, "main"));
        main_shared.attach_scheduler(remote.clone());
        main_entry.insert(FiberState {
            shared: main_shared,
            coroutine: None,
            link: Link::None,
            wake_at: None,
            suspend_point: None,
        });

        // The dispatcher is created eagerly with the scheduler and destroyed last.
        let dispatcher_entry = fibers.vacant_entry();
        let dispatcher_id: FiberId = FiberId(dispatcher_entry.key());
        let dispatcher_shared: Arc<SharedFiber> =
            Arc::new(SharedFiber::new(dispatcher_id, FiberKind::Dispatcher, "_dispatch"));
        dispatcher_shared.attach_scheduler(remote.clone());
        let dispatcher_coroutine: FiberCoroutine = context::make_coroutine(dispatcher_id, || {
            let sched: SharedScheduler = current();
            let policy: Arc<dyn DispatchPolicy> = sched.policy();
            policy.run(sched);
        });
        dispatcher_entry.insert(FiberState {
            shared: dispatcher_shared,
            coroutine: Some(dispatcher_coroutine),
            link: Link::None,
            wake_at: None,
            suspend_point: None,
        });

        Self {
            fibers,
            ready_queue: VecDeque::new(),
            sleep_queue: BTreeSet::new(),
            terminate_queue: VecDeque::new(),
            remote,
            current: main_id,
            main_id,
            dispatcher_id,
            num_worker_fibers: 0,
            shutdown: false,
            dispatcher_started: false,
            dispatcher_terminated: false,
            custom_policy: false,
            sleep_seq: 0,
            deferred_callbacks: Vec::new(),
        }
    }

    fn state(&self, id: FiberId) -> &FiberState {
        self.fibers
            .get(id.0)
            .expect(format!("invalid fiber id: {:?}", id).as_str())
    }

    fn state_mut(&mut self, id: FiberId) -> &mut FiberState {
        self.fibers
            .get_mut(id.0)
            .expect(format!("invalid fiber id: {:?}", id).as_str())
    }

    /// Binds fiber `id` to this scheduler and accounts for it.
    fn attach(&mut self, id: FiberId) {
        let state: &FiberState = self.state(id);
        state.shared.attach_scheduler(self.remote.clone());
        if state.shared.kind() == FiberKind::Worker {
            self.num_worker_fibers += 1;
        }
    }

    /// Appends `id` to the ready queue. The fiber must not be on the ready or terminate queue; a
    /// sleeping fiber is unlinked from the sleep queue first (the notification-beats-timer case).
    pub fn add_ready(&mut self, id: FiberId) {
        let state: &mut FiberState = self.fibers.get_mut(id.0).expect("fiber is not in the arena");
        assert!(
            state.link != Link::Ready && state.link != Link::Terminate,
            "fiber {:?} is already linked",
            state.shared.name()
        );
        let sleep_key: Option<(Instant, u64)> = match state.link {
            Link::Sleep => state.wake_at.take(),
            _ => None,
        };
        state.link = Link::Ready;

        if let Some((when, seq)) = sleep_key {
            let removed: bool = self.sleep_queue.remove(&SleepEntry { when, seq, id });
            debug_assert!(removed, "sleeping fiber was not on the sleep queue");
        }
        self.ready_queue.push_back(id);
    }

    /// Ready-queue insertion for wakeups that travelled through a cross-thread handle: tolerates
    /// stale records (the arena slot was reused) and duplicates (the fiber is already ready).
    pub(crate) fn add_ready_checked(&mut self, shared: &Arc<SharedFiber>) {
        let id: FiberId = shared.id();
        match self.fibers.get(id.0) {
            None => warn!("add_ready_checked(): stale wakeup for {:?}", shared.name()),
            Some(state) if !Arc::ptr_eq(&state.shared, shared) => {
                warn!("add_ready_checked(): arena slot {:?} was reused, wakeup dropped", id)
            },
            Some(state) => match state.link {
                // A remote thread re-scheduled a fiber that is already on the ready queue.
                Link::Ready => trace!("add_ready_checked(): {:?} is already ready", shared.name()),
                Link::Terminate => trace!("add_ready_checked(): {:?} has terminated", shared.name()),
                _ => self.add_ready(id),
            },
        }
    }

    /// Makes `fiber` runnable on this scheduler from any thread.
    pub fn schedule_from_remote(&self, fiber: Arc<SharedFiber>) {
        self.remote.schedule(fiber);
    }

    /// Drains the remote-ready queue into the local ready queue, skipping duplicates.
    pub fn process_remote_ready(&mut self) {
        while let Some(fiber) = self.remote.pop() {
            self.add_ready_checked(&fiber);
        }
    }

    /// Moves every sleeper whose wake time has passed to the ready queue, in wake-time order.
    pub fn process_sleep(&mut self) {
        debug_assert!(!self.sleep_queue.is_empty());
        let now: Instant = Instant::now();

        while let Some(entry) = self.sleep_queue.iter().next().copied() {
            if entry.when > now {
                break;
            }
            self.sleep_queue.remove(&entry);

            let state: &mut FiberState = self.fibers.get_mut(entry.id.0).expect("sleeping fiber is in the arena");
            debug_assert_eq!(state.link, Link::Sleep);
            state.link = Link::Ready;
            state.wake_at = None;
            trace!("process_sleep(): timeout for {:?}", state.shared.name());
            self.ready_queue.push_back(entry.id);
        }
    }

    /// Moves the finished fiber `id` to the terminate queue and drops it from the worker count.
    /// Destruction is deferred to [Self::destroy_terminated]: the fiber cannot be released while
    /// the stack it was running on might still be current.
    pub fn schedule_termination(&mut self, id: FiberId) {
        let state: &mut FiberState = self.fibers.get_mut(id.0).expect("terminating fiber is in the arena");
        debug_assert_eq!(state.link, Link::None, "terminating fiber is still linked");
        state.link = Link::Terminate;
        let is_worker: bool = state.shared.kind() == FiberKind::Worker;
        self.terminate_queue.push_back(id);
        if is_worker {
            self.num_worker_fibers -= 1;
        }
    }

    /// Releases every fiber on the terminate queue: the arena slot, the stack and one record
    /// reference each.
    pub fn destroy_terminated(&mut self) {
        while let Some(id) = self.terminate_queue.pop_front() {
            let state: FiberState = self.fibers.remove(id.0);
            trace!("destroy_terminated(): releasing {:?}", state.shared.name());
        }
    }

    /// Pops the head of the ready queue.
    pub fn pop_ready(&mut self) -> Option<FiberId> {
        let id: FiberId = self.ready_queue.pop_front()?;
        let state: &mut FiberState = self.fibers.get_mut(id.0).expect("ready fiber is in the arena");
        debug_assert_eq!(state.link, Link::Ready);
        state.link = Link::None;
        Some(id)
    }

    /// The next fiber to run when the current one suspends: the head of the ready queue, or the
    /// dispatcher when no fiber is runnable.
    fn preempt_target(&mut self) -> SwitchTarget {
        match self.pop_ready() {
            Some(id) => self.as_target(id),
            None => SwitchTarget::Fiber(self.dispatcher_id),
        }
    }

    pub(crate) fn as_target(&self, id: FiberId) -> SwitchTarget {
        if id == self.main_id {
            SwitchTarget::Main
        } else {
            SwitchTarget::Fiber(id)
        }
    }

    /// Runs retireable deferred callbacks. Entries are retired newest-first: once the newest
    /// entry's epoch has been reached by every online thread, all older entries are retireable
    /// without re-checking, because epochs only grow.
    pub fn run_deferred(&mut self) {
        let mut skip_validation: bool = false;
        while let Some((epoch, _)) = self.deferred_callbacks.last() {
            if !skip_validation && !qsbr::sync(*epoch) {
                break;
            }
            let (_, callback) = self.deferred_callbacks.pop().expect("checked non-empty above");
            callback();
            skip_validation = true;
        }
    }

    /// Registers `callback` to run once every online thread has passed `epoch`.
    pub fn defer(&mut self, epoch: qsbr::Epoch, callback: Box<dyn FnOnce()>) {
        self.deferred_callbacks.push((epoch, callback));
    }

    /// Replaces the dispatcher's default body. Callable once, before the dispatcher first runs;
    /// the policy is owned by the scheduler and dropped on shutdown.
    pub fn attach_custom_policy(&mut self, policy: Arc<dyn DispatchPolicy>) {
        assert!(!self.custom_policy, "custom dispatch policy attached twice");
        assert!(
            !self.dispatcher_started,
            "cannot replace the dispatch policy after the dispatcher has started"
        );
        self.remote.set_policy(policy);
        self.custom_policy = true;
    }

    pub(crate) fn register_suspend_point(&mut self, id: FiberId, suspend_point: SuspendPoint) {
        self.state_mut(id).suspend_point = Some(suspend_point);
    }

    pub(crate) fn policy(&self) -> Arc<dyn DispatchPolicy> {
        self.remote.policy()
    }

    /// Does `remote` belong to this scheduler?
    pub(crate) fn owns(&self, remote: &Arc<RemoteScheduler>) -> bool {
        Arc::ptr_eq(&self.remote, remote)
    }

    pub(crate) fn current_shared(&self) -> Arc<SharedFiber> {
        self.state(self.current).shared.clone()
    }

    pub fn current_id(&self) -> FiberId {
        self.current
    }

    pub fn dispatcher_id(&self) -> FiberId {
        self.dispatcher_id
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn num_worker_fibers(&self) -> usize {
        self.num_worker_fibers
    }

    pub fn has_sleeping_fibers(&self) -> bool {
        !self.sleep_queue.is_empty()
    }

    /// Earliest wake time across all sleepers.
    pub fn next_sleep_point(&self) -> Option<Instant> {
        self.sleep_queue.iter().next().map(|entry| entry.when)
    }
}

impl SharedScheduler {
    fn new() -> Self {
        Self(SharedObject::new(Scheduler::new()))
    }

    /// Spawns a worker fiber: constructs its record and context, attaches it to this scheduler
    /// and makes it runnable.
    pub fn spawn<F: FnOnce() + 'static>(&mut self, name: &str, f: F) -> FiberHandle {
        let entry = self.0.deref_mut().fibers.vacant_entry();
        let id: FiberId = FiberId(entry.key());
        let shared: Arc<SharedFiber> = Arc::new(SharedFiber::new(id, FiberKind::Worker, name));
        let coroutine: FiberCoroutine = context::make_coroutine(id, f);
        entry.insert(FiberState {
            shared: shared.clone(),
            coroutine: Some(coroutine),
            link: Link::None,
            wake_at: None,
            suspend_point: None,
        });

        self.attach(id);
        self.add_ready(id);
        trace!("spawn(): name={:?}, id={:?}", name, id);
        FiberHandle::new(shared)
    }

    /// Suspends the current fiber until `tp` or until an explicit wakeup, whichever happens
    /// first. Early wakeups are allowed; callers that need the full duration re-check the clock.
    pub fn wait_until(&mut self, tp: Instant) {
        {
            let s: &mut Scheduler = &mut *self;
            let id: FiberId = s.current;
            let seq: u64 = s.sleep_seq;
            s.sleep_seq += 1;

            let state: &mut FiberState = s.state_mut(id);
            assert_eq!(state.link, Link::None, "sleeping fiber is already linked");
            state.wake_at = Some((tp, seq));
            state.link = Link::Sleep;
            s.sleep_queue.insert(SleepEntry { when: tp, seq, id });
        }
        self.preempt();
    }

    /// Yields the current fiber: switches to the next runnable fiber, or to the dispatcher when
    /// none is ready. Returns when something switches back to the caller.
    pub fn preempt(&mut self) {
        let target: SwitchTarget = self.preempt_target();
        self.switch_to(target);
    }

    /// Transfers control to `target`. On a fiber stack this suspends through the trampoline; on
    /// the main context it runs the trampoline itself.
    pub(crate) fn switch_to(&mut self, target: SwitchTarget) {
        let at_main: bool = self.current == self.main_id;

        if at_main {
            match target {
                // Trivial switch: the main fiber popped itself (e.g. a yield with an empty ready
                // queue in between).
                SwitchTarget::Main => (),
                SwitchTarget::Fiber(id) => self.run_chain(id),
            }
        } else {
            let suspend_point: SuspendPoint = self
                .state(self.current)
                .suspend_point
                .expect("running fiber has no suspend point");
            // Safety: we are on the stack of the fiber this suspend point belongs to.
            unsafe { suspend_point.suspend(target) };
        }
    }

    /// The trampoline: resumes fibers on the hosting thread's native stack until a directive
    /// transfers control back to the main fiber. Must only be called on the main context.
    fn run_chain(&mut self, first: FiberId) {
        let mut next: FiberId = first;
        loop {
            debug_assert_ne!(next, self.main_id, "the main context has no coroutine to resume");
            if next == self.dispatcher_id {
                self.dispatcher_started = true;
            }
            self.current = next;

            let mut coroutine: FiberCoroutine = self
                .state_mut(next)
                .coroutine
                .take()
                .expect("switch target has no runnable context");
            let result: CoroutineResult<SwitchTarget, ()> = coroutine.resume(());
            let resumed: FiberId = next;
            self.state_mut(resumed).coroutine = Some(coroutine);

            match result {
                CoroutineResult::Yield(SwitchTarget::Main) => {
                    self.current = self.main_id;
                    return;
                },
                CoroutineResult::Yield(SwitchTarget::Fiber(id)) => next = id,
                CoroutineResult::Return(()) => {
                    // The fiber's entry function returned. We are back on the native stack, so
                    // the fiber's own stack is no longer current and it can be queued for
                    // destruction.
                    let shared: Arc<SharedFiber> = self.state(resumed).shared.clone();
                    if shared.kind() == FiberKind::Dispatcher {
                        self.dispatcher_terminated = true;
                        self.current = self.main_id;
                        return;
                    }

                    trace!("run_chain(): fiber {:?} finished", shared.name());
                    shared.mark_done();
                    fiber::notify_all(SharedFiber::join_token(&shared));
                    self.schedule_termination(resumed);

                    match self.preempt_target() {
                        SwitchTarget::Main => {
                            self.current = self.main_id;
                            return;
                        },
                        SwitchTarget::Fiber(id) => next = id,
                    }
                },
            }
        }
    }

    /// Tears the scheduler down: obliges remaining runnable fibers to exit, lets the dispatcher
    /// observe the drained worker count, and releases everything but the main record.
    fn destroy(&mut self) {
        {
            let s: &mut Scheduler = &mut *self;
            debug_assert_eq!(s.current, s.main_id, "scheduler destroyed off its main context");
            s.shutdown = true;
        }

        // Runnable fibers get one more chance to observe the shutdown flag and exit.
        loop {
            let next: Option<FiberId> = {
                let s: &mut Scheduler = &mut *self;
                let mut picked: Option<FiberId> = None;
                while let Some(id) = s.pop_ready() {
                    if id != s.main_id {
                        picked = Some(id);
                        break;
                    }
                }
                picked
            };
            match next {
                Some(id) => self.run_chain(id),
                None => break,
            }
        }

        if !self.dispatcher_terminated {
            let dispatcher: FiberId = self.dispatcher_id;
            self.run_chain(dispatcher);
        }

        let s: &mut Scheduler = &mut *self;
        assert!(
            s.dispatcher_terminated,
            "dispatcher did not terminate during scheduler teardown"
        );
        s.remote.clear_policy();
        assert_eq!(s.num_worker_fibers, 0, "scheduler destroyed with live worker fibers");

        // The dispatcher goes last among fibers.
        let dispatcher_state: FiberState = s.fibers.remove(s.dispatcher_id.0);
        drop(dispatcher_state);
        s.destroy_terminated();

        // Whatever reclamation the rest of the process still blocks is leaked, not freed unsafely.
        s.run_deferred();
        if !s.deferred_callbacks.is_empty() {
            debug!(
                "destroy(): leaking {} deferred callbacks at scheduler teardown",
                s.deferred_callbacks.len()
            );
            s.deferred_callbacks.clear();
        }

        debug_assert_eq!(s.fibers.len(), 1, "fibers outlived scheduler teardown");
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Deref for SharedScheduler {
    type Target = Scheduler;

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

impl DerefMut for SharedScheduler {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.deref_mut()
    }
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &SleepEntry) -> bool {
        // Sequence numbers are unique per scheduler, so (when, seq) identifies an entry; the
        // fiber id does not participate in the ordering.
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for SleepEntry {}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &SleepEntry) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SleepEntry {
    fn cmp(&self, other: &SleepEntry) -> core::cmp::Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq))
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the scheduler hosted on the calling thread, if any.
pub(crate) fn try_current() -> Option<SharedScheduler> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
}

/// Returns the scheduler hosted on the calling thread.
pub(crate) fn current() -> SharedScheduler {
    try_current().expect("no scheduler is hosted on this thread")
}

pub(crate) fn register_current_suspend_point(id: FiberId, suspend_point: SuspendPoint) {
    current().register_suspend_point(id, suspend_point);
}

/// Registers a reclamation callback on the calling thread's scheduler. Without a scheduler the
/// retired state is leaked rather than freed unsafely.
pub(crate) fn defer<F: FnOnce() + 'static>(epoch: qsbr::Epoch, callback: F) {
    match try_current() {
        Some(mut sched) => sched.defer(epoch, Box::new(callback)),
        None => warn!("defer(): no scheduler on this thread, leaking retired state"),
    }
}

/// Hosts a scheduler on the calling thread for the duration of `f`: binds the thread's native
/// context as the main fiber, runs `f`, then drains and destroys the scheduler.
pub fn run<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    qsbr::online();
    let mut sched: SharedScheduler = SharedScheduler::new();
    CURRENT_SCHEDULER.with(|cell| {
        let mut current = cell.borrow_mut();
        assert!(current.is_none(), "a scheduler is already hosted on this thread");
        *current = Some(sched.clone());
    });

    let result: R = f();

    sched.destroy();
    CURRENT_SCHEDULER.with(|cell| {
        *cell.borrow_mut() = None;
    });
    qsbr::offline();
    result
}

/// Spawns a worker fiber on the calling thread's scheduler.
pub fn spawn<F: FnOnce() + 'static>(name: &str, f: F) -> FiberHandle {
    current().spawn(name, f)
}

/// Yields the calling fiber to the back of the ready queue.
pub fn yield_now() {
    let mut sched: SharedScheduler = current();
    let id: FiberId = sched.current_id();
    sched.add_ready(id);
    sched.preempt();
}

/// Suspends the calling fiber until `tp` or until an explicit wakeup (see
/// [SharedScheduler::wait_until]).
pub fn wait_until(tp: Instant) {
    current().wait_until(tp);
}

/// Sleeps the calling fiber until `tp`, re-arming the timer across early wakeups.
pub fn sleep_until(tp: Instant) {
    let mut sched: SharedScheduler = current();
    while Instant::now() < tp {
        sched.wait_until(tp);
    }
}

/// Sleeps the calling fiber for `duration`.
pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

/// Is the calling thread's scheduler shutting down? Long-running fibers check this and exit.
pub fn is_shutdown() -> bool {
    current().is_shutdown()
}

/// Replaces the dispatcher body of the calling thread's scheduler. See
/// [Scheduler::attach_custom_policy].
pub fn attach_custom_policy(policy: Arc<dyn DispatchPolicy>) {
    current().attach_custom_policy(policy);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        current,
        run,
        spawn,
        yield_now,
        Link,
        SharedScheduler,
    };
    use crate::runtime::fiber::FiberHandle;
    use ::anyhow::Result;
    use ::std::{
        cell::RefCell,
        rc::Rc,
        sync::Arc,
        time::{
            Duration,
            Instant,
        },
    };

    #[test]
    fn round_trip_releases_one_reference() -> Result<()> {
        let handle: FiberHandle = run(|| {
            let handle: FiberHandle = spawn("worker", || {});
            // Arena slot + this handle.
            assert_eq!(Arc::strong_count(handle.shared()), 2);
            handle.join();
            handle
        });

        crate::ensure_eq!(handle.is_done(), true);
        // The arena reference is gone; only this handle remains.
        crate::ensure_eq!(Arc::strong_count(handle.shared()), 1);

        Ok(())
    }

    #[test]
    fn ready_queue_is_fifo() -> Result<()> {
        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        run({
            let order = order.clone();
            move || {
                for i in 0..4u32 {
                    let order = order.clone();
                    spawn(&format!("worker{}", i), move || {
                        order.borrow_mut().push(i);
                    });
                }
            }
        });

        crate::ensure_eq!(*order.borrow(), vec![0, 1, 2, 3]);

        Ok(())
    }

    #[test]
    fn yield_interleaves_fibers() -> Result<()> {
        let trace: Rc<RefCell<Vec<(u32, u32)>>> = Rc::new(RefCell::new(Vec::new()));

        run({
            let trace = trace.clone();
            move || {
                for i in 0..2u32 {
                    let trace = trace.clone();
                    spawn(&format!("worker{}", i), move || {
                        for step in 0..3u32 {
                            trace.borrow_mut().push((i, step));
                            yield_now();
                        }
                    });
                }
            }
        });

        // Both fibers complete all steps, strictly interleaved by the FIFO ready queue.
        let observed: Vec<(u32, u32)> = trace.borrow().clone();
        crate::ensure_eq!(observed.len(), 6);
        crate::ensure_eq!(observed[0], (0, 0));
        crate::ensure_eq!(observed[1], (1, 0));
        crate::ensure_eq!(observed[2], (0, 1));
        crate::ensure_eq!(observed[3], (1, 1));

        Ok(())
    }

    #[test]
    fn wait_until_expires_in_deadline_order() -> Result<()> {
        let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        run({
            let order = order.clone();
            move || {
                let base: Instant = Instant::now();
                // Spawn in reverse deadline order to make FIFO insertion disagree with wake
                // order.
                for (i, offset_ms) in [(0u32, 30u64), (1, 20), (2, 10)] {
                    let order = order.clone();
                    spawn(&format!("sleeper{}", i), move || {
                        let mut sched: SharedScheduler = current();
                        sched.wait_until(base + Duration::from_millis(offset_ms));
                        order.borrow_mut().push(i);
                    });
                }
            }
        });

        crate::ensure_eq!(*order.borrow(), vec![2, 1, 0]);

        Ok(())
    }

    #[test]
    fn remote_duplicates_are_suppressed() -> Result<()> {
        run(|| {
            let mut sched: SharedScheduler = current();
            let handle: FiberHandle = sched.spawn("dup", || {});

            // The fiber is already on the local ready queue; two remote arrivals for it must
            // collapse into nothing.
            sched.schedule_from_remote(handle.shared().clone());
            sched.schedule_from_remote(handle.shared().clone());
            sched.process_remote_ready();

            let occurrences: usize = sched.ready_queue.iter().filter(|id| **id == handle.id()).count();
            assert_eq!(occurrences, 1);
        });

        Ok(())
    }

    #[test]
    fn hooks_are_exclusive() -> Result<()> {
        run(|| {
            let mut sched: SharedScheduler = current();
            let handle: FiberHandle = sched.spawn("linked", || {});

            // Spawn leaves the fiber on exactly one queue.
            assert_eq!(sched.state(handle.id()).link, Link::Ready);

            // A ready fiber must not be enqueued again.
            let id = handle.id();
            assert_eq!(sched.ready_queue.iter().filter(|i| **i == id).count(), 1);
        });

        Ok(())
    }

    #[test]
    fn shutdown_drains_self_scheduling_workers() -> Result<()> {
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
            crate::ensure_eq!(handle.is_done(), true);
        }

        Ok(())
    }
}
