// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::{
    cell::UnsafeCell,
    hint,
    ops::{
        Deref,
        DerefMut,
    },
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A test-and-test-and-set spin lock. Critical sections guarded by this lock must be short and must
/// never suspend the current fiber, so spinning is cheaper than parking the calling thread.
pub struct SpinLock<T> {
    /// Lock word.
    locked: AtomicBool,
    /// Protected data.
    data: UnsafeCell<T>,
}

/// Scoped ownership of a [SpinLock]. The lock is released when this guard drops.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires this lock, spinning until it becomes available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load to keep the cache line shared between waiters.
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire this lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        match self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => Some(SpinLockGuard { lock: self }),
            Err(_) => None,
        }
    }

    /// Returns a mutable reference to the protected data. Statically exclusive, so no locking is
    /// required.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// Safety: the lock word serializes all access to the protected data.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Safety: this guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safety: this guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use ::anyhow::Result;
    use ::std::{
        sync::Arc,
        thread,
    };

    #[test]
    fn lock_guards_data() -> Result<()> {
        let lock: SpinLock<u32> = SpinLock::new(0);

        {
            let mut guard = lock.lock();
            *guard += 1;
        }

        crate::ensure_eq!(*lock.lock(), 1);

        Ok(())
    }

    #[test]
    fn try_lock_fails_while_held() -> Result<()> {
        let lock: SpinLock<u32> = SpinLock::new(0);

        let guard = lock.lock();
        crate::ensure_eq!(lock.try_lock().is_none(), true);
        drop(guard);
        crate::ensure_eq!(lock.try_lock().is_some(), true);

        Ok(())
    }

    #[test]
    fn contended_increments_are_not_lost() -> Result<()> {
        const NUM_THREADS: usize = 4;
        const INCREMENTS: usize = 10_000;
        let lock: Arc<SpinLock<usize>> = Arc::new(SpinLock::new(0));

        let handles: Vec<thread::JoinHandle<()>> = (0..NUM_THREADS)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        crate::ensure_eq!(*lock.lock(), NUM_THREADS * INCREMENTS);

        Ok(())
    }
}
