// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Quiescent-state-based reclamation.
//!
//! Every thread that touches the parking table registers a local epoch in a process-wide list. The
//! global epoch is always odd and advances in increments of two; a local epoch of zero means the
//! thread is offline and holds no references to retired parking-table state. Memory retired at
//! epoch `E` may be freed once every online thread has published an epoch of at least `E`.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::parking_lot::Mutex;
use ::std::{
    cell::RefCell,
    sync::{
        atomic::{
            fence,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Epoch counter type.
pub type Epoch = u64;

/// Increment applied to the global epoch. Stepping by two keeps the global epoch odd, so a local
/// epoch can never alias the reserved offline value.
pub const EPOCH_INC: Epoch = 2;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Per-thread epoch slot. Zero means offline.
struct LocalEpoch {
    epoch: AtomicU64,
}

/// Keeps the owning thread's slot registered for the lifetime of the thread.
struct Registration {
    slot: Arc<LocalEpoch>,
}

/// Marks the calling thread as observing the parking table for the duration of one table
/// operation, unless the thread was already online.
pub struct Pin {
    was_online: bool,
}

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// The global epoch. Always odd, never zero.
static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(1);

/// All registered per-thread epoch slots.
static REGISTRY: Mutex<Vec<Arc<LocalEpoch>>> = Mutex::new(Vec::new());

thread_local! {
    /// This thread's registration, created lazily on first use.
    static REGISTRATION: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns this thread's epoch slot, registering the thread if needed.
fn local_slot() -> Arc<LocalEpoch> {
    REGISTRATION.with(|cell| {
        let mut registration = cell.borrow_mut();
        if registration.is_none() {
            let slot: Arc<LocalEpoch> = Arc::new(LocalEpoch {
                epoch: AtomicU64::new(0),
            });
            REGISTRY.lock().push(slot.clone());
            trace!("local_slot(): registered thread with qsbr");
            *registration = Some(Registration { slot });
        }
        registration.as_ref().unwrap().slot.clone()
    })
}

/// Reads the current global epoch.
pub fn global_epoch() -> Epoch {
    GLOBAL_EPOCH.load(Ordering::Relaxed)
}

/// Advances the global epoch and returns the new value.
pub fn advance_global_epoch() -> Epoch {
    GLOBAL_EPOCH.fetch_add(EPOCH_INC, Ordering::Relaxed) + EPOCH_INC
}

/// Publishes that this thread holds no references to state retired before the current global
/// epoch. Called by schedulers after operations that might retire parking-table state.
pub fn checkpoint() {
    fence(Ordering::SeqCst);
    local_slot().epoch.store(global_epoch(), Ordering::Relaxed);
}

/// Brings this thread online: from here on it must be counted as observing.
pub fn online() {
    local_slot().epoch.store(global_epoch(), Ordering::Relaxed);
    fence(Ordering::SeqCst);
}

/// Takes this thread offline. The thread must hold no references to parking-table state.
pub fn offline() {
    fence(Ordering::Release);
    local_slot().epoch.store(0, Ordering::Relaxed);
}

/// Checks whether every online thread has reached `target`. Uses a try-lock so that readers of the
/// parking table never block on reclamation; a contended lock simply reports "not yet".
pub fn sync(target: Epoch) -> bool {
    let registry = match REGISTRY.try_lock() {
        Some(registry) => registry,
        None => return false,
    };

    let me: Arc<LocalEpoch> = local_slot();
    me.epoch.store(target, Ordering::Relaxed);

    for slot in registry.iter() {
        if Arc::ptr_eq(slot, &me) {
            continue;
        }
        let local: Epoch = slot.epoch.load(Ordering::Relaxed);
        if local != 0 && local != target {
            return false;
        }
    }

    true
}

/// Marks the calling thread online for the duration of one parking-table operation. Threads that
/// were already online stay online and publish a checkpoint when the pin drops.
pub fn pin() -> Pin {
    let slot: Arc<LocalEpoch> = local_slot();
    let was_online: bool = slot.epoch.load(Ordering::Relaxed) != 0;
    if !was_online {
        online();
    }
    Pin { was_online }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Pin {
    fn drop(&mut self) {
        if self.was_online {
            checkpoint();
        } else {
            offline();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.slot.epoch.store(0, Ordering::Release);
        REGISTRY.lock().retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        trace!("drop(): deregistered thread from qsbr");
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
