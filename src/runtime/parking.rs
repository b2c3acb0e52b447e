// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Process-wide parking table.
//!
//! Maps arbitrary 64-bit tokens (commonly the address of a fiber or of a synchronization object)
//! to the fibers parked on them. Buckets are guarded by per-bucket spin locks; the bucket array
//! grows incrementally and old arrays are retired through the [`crate::runtime::qsbr`] protocol,
//! so readers never block on reclamation.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::spin_lock::{
        SpinLock,
        SpinLockGuard,
    },
    runtime::{
        fiber::SharedFiber,
        qsbr,
        scheduler,
    },
};
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicBool,
            AtomicPtr,
            AtomicU32,
            Ordering,
        },
        Arc,
        OnceLock,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// log2 of the initial number of buckets in the process-wide table.
const INITIAL_SHIFT: u32 = 6;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Mutable bucket state, guarded by the bucket's spin lock.
struct BucketInner {
    /// Fibers parked on tokens hashing into this bucket.
    waiters: VecDeque<Arc<SharedFiber>>,
    /// Tombstone: set once a rehash has drained this bucket. Accessors observing it must reload
    /// the bucket array and retry.
    was_rehashed: bool,
}

struct ParkingBucket {
    inner: SpinLock<BucketInner>,
}

/// A bucket array of power-of-two size.
struct SizedBuckets {
    num_buckets: usize,
    arr: Box<[ParkingBucket]>,
}

/// Address-keyed wait table. A process hosts a single instance (see [table]); separate instances
/// exist only in tests.
pub struct ParkingTable {
    /// Current bucket array. Written with release ordering by the rehasher, read with acquire
    /// ordering by everyone; superseded arrays are freed through qsbr.
    buckets: AtomicPtr<SizedBuckets>,
    /// Number of parked fibers across all buckets.
    num_entries: AtomicU32,
    /// Serializes rehash attempts.
    rehashing: AtomicBool,
}

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// The process-wide parking table.
static PARKING_TABLE: OnceLock<ParkingTable> = OnceLock::new();

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the process-wide parking table, initializing it on first use.
pub fn table() -> &'static ParkingTable {
    PARKING_TABLE.get_or_init(|| ParkingTable::with_shift(INITIAL_SHIFT))
}

/// Thomas Wang's 64 bit mix function. Tokens are often pointers, so the raw key distribution is
/// dominated by alignment; mixing spreads them across buckets.
fn mix_hash(mut key: u64) -> u64 {
    key = key.wrapping_add(!(key << 32));
    key ^= key >> 22;
    key = key.wrapping_add(!(key << 13));
    key ^= key >> 8;
    key = key.wrapping_add(key << 3);
    key ^= key >> 15;
    key = key.wrapping_add(!(key << 27));
    key ^= key >> 31;
    key
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SizedBuckets {
    fn new(shift: u32) -> Self {
        let num_buckets: usize = 1 << shift;
        let arr: Box<[ParkingBucket]> = (0..num_buckets)
            .map(|_| ParkingBucket {
                inner: SpinLock::new(BucketInner {
                    waiters: VecDeque::new(),
                    was_rehashed: false,
                }),
            })
            .collect();
        Self { num_buckets, arr }
    }

    fn get_bucket(&self, hash: u64) -> &ParkingBucket {
        &self.arr[(hash as usize) & (self.num_buckets - 1)]
    }
}

impl ParkingTable {
    /// Creates a table with `1 << shift` buckets. The process-wide instance uses
    /// [INITIAL_SHIFT]; tests use small shifts to force early rehashing.
    pub fn with_shift(shift: u32) -> Self {
        let sb: Box<SizedBuckets> = Box::new(SizedBuckets::new(shift));
        Self {
            buckets: AtomicPtr::new(Box::into_raw(sb)),
            num_entries: AtomicU32::new(0),
            rehashing: AtomicBool::new(false),
        }
    }

    /// Number of fibers currently parked in this table.
    pub fn len(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parks `fiber` on `token` unless `validate` returns true. The validator runs under the
    /// bucket lock, so it is atomic with respect to [Self::remove] callbacks on the same token.
    /// Returns whether the fiber was parked.
    pub fn emplace<F: FnMut() -> bool>(&self, token: u64, fiber: &Arc<SharedFiber>, mut validate: F) -> bool {
        let _pin: qsbr::Pin = qsbr::pin();
        let hash: u64 = mix_hash(token);
        let mut observed: *mut SizedBuckets;

        let (parked, num_items): (bool, u32) = loop {
            observed = self.buckets.load(Ordering::Acquire);
            // Safety: the array a pinned thread observes is not freed until the thread passes a
            // quiescent point (qsbr).
            let sb: &SizedBuckets = unsafe { &*observed };
            let mut inner: SpinLockGuard<'_, BucketInner> = sb.get_bucket(hash).inner.lock();

            if inner.was_rehashed {
                // A rehash moved this bucket from under us; chase the new array.
                continue;
            }

            if validate() {
                break (false, 0);
            }

            fiber.set_park_token(token);
            inner.waiters.push_back(fiber.clone());
            trace!("emplace(): token={} parked={:?}", token, fiber.name());
            break (true, self.num_entries.fetch_add(1, Ordering::Relaxed));
        };

        if parked {
            let sb: &SizedBuckets = unsafe { &*observed };
            if num_items as usize > sb.num_buckets {
                self.try_rehash(observed);
            }
        }

        parked
    }

    /// Removes and returns the first fiber parked on `token`. `on_hit` runs under the bucket lock
    /// with the removed fiber; `on_miss` runs under the bucket lock when no fiber matches. The
    /// callbacks let callers update fiber flags atomically with the removal.
    pub fn remove<H, M>(&self, token: u64, on_hit: H, on_miss: M) -> Option<Arc<SharedFiber>>
    where
        H: FnOnce(&Arc<SharedFiber>),
        M: FnOnce(),
    {
        let _pin: qsbr::Pin = qsbr::pin();
        let hash: u64 = mix_hash(token);

        loop {
            let observed: *mut SizedBuckets = self.buckets.load(Ordering::Acquire);
            // Safety: see [Self::emplace].
            let sb: &SizedBuckets = unsafe { &*observed };
            let mut inner: SpinLockGuard<'_, BucketInner> = sb.get_bucket(hash).inner.lock();

            if inner.was_rehashed {
                continue;
            }

            match inner.waiters.iter().position(|f| f.park_token() == token) {
                Some(index) => {
                    let fiber: Arc<SharedFiber> = inner.waiters.remove(index).expect("index is in bounds");
                    let prev: u32 = self.num_entries.fetch_sub(1, Ordering::Relaxed);
                    debug_assert!(prev > 0, "parking-table entry count went negative");
                    on_hit(&fiber);
                    trace!("remove(): token={} woke={:?}", token, fiber.name());
                    return Some(fiber);
                },
                None => {
                    on_miss();
                    return None;
                },
            }
        }
    }

    /// Removes every fiber parked on `token`, appending them to `sink` in park order.
    pub fn remove_all(&self, token: u64, sink: &mut VecDeque<Arc<SharedFiber>>) {
        let _pin: qsbr::Pin = qsbr::pin();
        let hash: u64 = mix_hash(token);

        loop {
            let observed: *mut SizedBuckets = self.buckets.load(Ordering::Acquire);
            // Safety: see [Self::emplace].
            let sb: &SizedBuckets = unsafe { &*observed };
            let mut inner: SpinLockGuard<'_, BucketInner> = sb.get_bucket(hash).inner.lock();

            if inner.was_rehashed {
                continue;
            }

            let mut index: usize = 0;
            while index < inner.waiters.len() {
                if inner.waiters[index].park_token() != token {
                    index += 1;
                    continue;
                }
                let fiber: Arc<SharedFiber> = inner.waiters.remove(index).expect("index is in bounds");
                let prev: u32 = self.num_entries.fetch_sub(1, Ordering::Relaxed);
                debug_assert!(prev > 0, "parking-table entry count went negative");
                sink.push_back(fiber);
            }
            return;
        }
    }

    /// Grows the table to twice the observed size. At most one rehash runs at a time; a rehash
    /// that observes a superseded array gives up, as the table has already grown.
    fn try_rehash(&self, observed: *mut SizedBuckets) {
        if self.rehashing.swap(true, Ordering::Acquire) {
            return;
        }

        let current: *mut SizedBuckets = self.buckets.load(Ordering::Relaxed);
        if current != observed {
            self.rehashing.store(false, Ordering::Release);
            return;
        }

        // Safety: `current` is published and cannot be freed while `rehashing` is held by us:
        // only a completed rehash retires an array.
        let old: &SizedBuckets = unsafe { &*current };
        debug!("try_rehash(): growing parking table from {} buckets", old.num_buckets);

        let new_shift: u32 = old.num_buckets.trailing_zeros() + 1;
        let mut new_sb: Box<SizedBuckets> = Box::new(SizedBuckets::new(new_shift));

        // Quiesce the old array: take every bucket lock in index order.
        let mut guards: Vec<SpinLockGuard<'_, BucketInner>> = old.arr.iter().map(|b| b.inner.lock()).collect();

        for guard in guards.iter_mut() {
            guard.was_rehashed = true;
            while let Some(fiber) = guard.waiters.pop_front() {
                let hash: u64 = mix_hash(fiber.park_token());
                let index: usize = (hash as usize) & (new_sb.num_buckets - 1);
                new_sb.arr[index].inner.get_mut().waiters.push_back(fiber);
            }
        }

        let new_ptr: *mut SizedBuckets = Box::into_raw(new_sb);
        self.buckets.store(new_ptr, Ordering::Release);

        // In-flight accessors still holding the old array either completed before we locked their
        // bucket or will observe the tombstone and retry against the new array.
        drop(guards);

        let next_epoch: qsbr::Epoch = qsbr::advance_global_epoch();
        let retired: usize = old.num_buckets;
        scheduler::defer(next_epoch, move || {
            debug!("freeing retired bucket array with {} buckets", retired);
            // Safety: qsbr guarantees no thread still references the retired array.
            unsafe { drop(Box::from_raw(current)) };
        });

        self.rehashing.store(false, Ordering::Release);
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for ParkingTable {
    fn drop(&mut self) {
        let sb: Box<SizedBuckets> = unsafe { Box::from_raw(self.buckets.load(Ordering::Relaxed)) };
        for bucket in sb.arr.iter() {
            let inner: SpinLockGuard<'_, BucketInner> = bucket.inner.lock();
            assert!(inner.waiters.is_empty(), "parking table dropped with parked fibers");
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
