// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 SUSE LLC
//
// Author: Joerg Roedel <jroedel@suse.de>

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

/// A guard that provides read access to the data protected by [`RWLock`]
#[derive(Debug)]
#[must_use = "if unused the RWLock will immediately unlock"]
pub struct ReadLockGuard<'a, T> {
    /// Reference to the associated `AtomicU64` in the [`RWLock`]
    rwlock: &'a AtomicU64,
    /// Pointer to the protected data. This relaxes the borrow checker
    /// and prevents introducing LLVM `noalias` violations, according to
    /// a comment in the equivalent guard structure in the standard
    /// library.
    data: NonNull<T>,
}

/// Implements the behavior of the [`ReadLockGuard`] when it is dropped
impl<T> Drop for ReadLockGuard<'_, T> {
    /// Release the read lock
    fn drop(&mut self) {
        self.rwlock.fetch_sub(compose_val(1, 0), Ordering::Release);
    }
}

/// Implements the behavior of dereferencing the [`ReadLockGuard`] to
/// access the protected data.
impl<T> Deref for ReadLockGuard<'_, T> {
    type Target = T;
    /// Allow reading the protected data through deref
    fn deref(&self) -> &T {
        // SAFETY: the pointer is valid by construction and never changed.
        // The guard guarantees no external mutable access.
        unsafe { self.data.as_ref() }
    }
}

/// A guard that provides exclusive write access to the data protected by
/// [`RWLock`]
#[derive(Debug)]
#[must_use = "if unused the RWLock will immediately unlock"]
pub struct WriteLockGuard<'a, T> {
    /// Reference to the associated `AtomicU64` in the [`RWLock`]
    rwlock: &'a AtomicU64,
    /// Pointer to the protected data.
    data: NonNull<T>,
    /// `NonNull` is covariant over `T`, so add a `PhantomData` field to
    /// enforce the correct invariance over `T`.
    _variance: PhantomData<&'a mut T>,
}

/// Implements the behavior of the [`WriteLockGuard`] when it is dropped
impl<T> Drop for WriteLockGuard<'_, T> {
    fn drop(&mut self) {
        self.rwlock.fetch_sub(compose_val(0, 1), Ordering::Release);
    }
}

/// Implements the behavior of dereferencing the [`WriteLockGuard`] to
/// access the protected data.
impl<T> Deref for WriteLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the pointer is valid by construction and never changed.
        // The guard guarantees exclusive access.
        unsafe { self.data.as_ref() }
    }
}

/// Implements the behavior of dereferencing the [`WriteLockGuard`] to
/// access the protected data in a mutable way.
impl<T> DerefMut for WriteLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the pointer is valid by construction and never changed.
        // The guard guarantees exclusive access.
        unsafe { self.data.as_mut() }
    }
}

/// A simple Read-Write Lock (RWLock) that allows multiple readers or
/// one exclusive writer.
#[derive(Debug)]
pub struct RWLock<T> {
    /// An atomic 64-bit integer used for synchronization
    rwlock: AtomicU64,
    /// An UnsafeCell for interior mutability
    data: UnsafeCell<T>,
}

// SAFETY: All well-formed locks are `Send`.
unsafe impl<T: Send> Send for RWLock<T> {}
// SAFETY: All well-formed locks are `Sync`.
unsafe impl<T: Send + Sync> Sync for RWLock<T> {}

const RW_BITS: u64 = 32;
const RW_MASK: u64 = (1 << RW_BITS) - 1;

/// Splits a 64-bit value into two parts: readers (low 32 bits) and
/// writers (high 32 bits).
#[inline]
fn split_val(val: u64) -> (u64, u64) {
    (val & RW_MASK, val >> RW_BITS)
}

/// Composes a 64-bit value by combining the number of readers (low 32
/// bits) and writers (high 32 bits).
#[inline]
fn compose_val(readers: u64, writers: u64) -> u64 {
    (readers & RW_MASK) | (writers << RW_BITS)
}

impl<T: Send> RWLock<T> {
    /// Creates a new [`RWLock`] instance with the provided initial data.
    pub const fn new(data: T) -> Self {
        Self {
            rwlock: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Waits until all writers have finished their operations and
    /// retrieves the current state of the [`RWLock`].
    #[inline]
    fn wait_for_writers(&self) -> u64 {
        loop {
            let val: u64 = self.rwlock.load(Ordering::Relaxed);
            let (_, writers) = split_val(val);

            if writers == 0 {
                return val;
            }
            core::hint::spin_loop();
        }
    }

    /// Waits until all readers have finished their operations and
    /// retrieves the current state of the [`RWLock`].
    #[inline]
    fn wait_for_readers(&self) -> u64 {
        loop {
            let val: u64 = self.rwlock.load(Ordering::Relaxed);
            let (readers, _) = split_val(val);

            if readers == 0 {
                return val;
            }
            core::hint::spin_loop();
        }
    }

    /// Ensures exclusive access for a single writer and waits for all
    /// readers to finish before granting access to the writer.
    pub fn lock_write(&self) -> WriteLockGuard<'_, T> {
        // Waiting for current writer to finish
        loop {
            let val = self.wait_for_writers();
            let (readers, _) = split_val(val);
            let new_val = compose_val(readers, 1);

            if self
                .rwlock
                .compare_exchange(val, new_val, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }

        // Now locked for write - wait until all readers finished
        let val: u64 = self.wait_for_readers();
        assert!(val == compose_val(0, 1));

        WriteLockGuard {
            rwlock: &self.rwlock,
            // SAFETY: the UnsafeCell is initialized on construction, so the
            // pointer can never be NULL
            data: unsafe { NonNull::new_unchecked(self.data.get()) },
            _variance: PhantomData,
        }
    }

    /// Attempts to acquire the lock for writing without blocking. If the
    /// access could not be granted at this time, `None` is returned.
    pub fn try_lock_write(&self) -> Option<WriteLockGuard<'_, T>> {
        let val = compose_val(0, 0);
        let new_val = compose_val(0, 1);
        self.rwlock
            .compare_exchange(val, new_val, Ordering::Acquire, Ordering::Relaxed)
            .ok()?;

        Some(WriteLockGuard {
            rwlock: &self.rwlock,
            // SAFETY: the UnsafeCell is initialized on construction, so the
            // pointer can never be NULL
            data: unsafe { NonNull::new_unchecked(self.data.get()) },
            _variance: PhantomData,
        })
    }
}

/// A lock can only be acquired for read access if its inner type implements
/// `Sync` as well as `Send`, because a read lock can be acquired
/// simultaneously by multiple threads.
impl<T: Send + Sync> RWLock<T> {
    /// Allows multiple readers to access the data concurrently.
    pub fn lock_read(&self) -> ReadLockGuard<'_, T> {
        loop {
            let val = self.wait_for_writers();
            let (readers, _) = split_val(val);
            let new_val = compose_val(readers + 1, 0);

            if self
                .rwlock
                .compare_exchange(val, new_val, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            core::hint::spin_loop();
        }

        ReadLockGuard {
            rwlock: &self.rwlock,
            // SAFETY: the UnsafeCell is initialized on construction, so the
            // pointer can never be NULL
            data: unsafe { NonNull::new_unchecked(self.data.get()) },
        }
    }

    /// Attempts to acquire the lock for reading without blocking. If the
    /// access could not be granted at this time, `None` is returned.
    pub fn try_lock_read(&self) -> Option<ReadLockGuard<'_, T>> {
        // Attempt to update the reader count by 1. Bail if a writer is
        // present.
        self.rwlock
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |val| {
                let (readers, writers) = split_val(val);
                (writers == 0).then(|| compose_val(readers + 1, 0))
            })
            .ok()?;

        Some(ReadLockGuard {
            rwlock: &self.rwlock,
            // SAFETY: the UnsafeCell is initialized on construction, so the
            // pointer can never be NULL
            data: unsafe { NonNull::new_unchecked(self.data.get()) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_rw() {
        let rwlock = RWLock::new(42);

        // Acquire a read lock and check the initial value
        let read_guard = rwlock.lock_read();
        assert_eq!(*read_guard, 42);

        drop(read_guard);

        let read_guard2 = rwlock.lock_read();
        assert_eq!(*read_guard2, 42);

        // Create another RWLock instance for modification
        let rwlock_modify = RWLock::new(0);

        let mut write_guard = rwlock_modify.lock_write();
        *write_guard = 99;
        assert_eq!(*write_guard, 99);

        drop(write_guard);

        let read_guard = rwlock.lock_read();
        assert_eq!(*read_guard, 42);
    }

    #[test]
    fn test_concurrent_readers() {
        let rwlock_concurrent = RWLock::new(123);

        let read_guard1 = rwlock_concurrent.lock_read();
        let read_guard2 = rwlock_concurrent.lock_read();

        // Assert that both readers can access the same value (123)
        assert_eq!(*read_guard1, 123);
        assert_eq!(*read_guard2, 123);

        drop(read_guard1);
        drop(read_guard2);
    }

    /// Tests the expected behavior for `RWLock::try_lock_write()`.
    #[test]
    fn test_try_write() {
        let lock = RWLock::new(123);
        let mut write = lock.try_lock_write().unwrap();

        // Reads should fail until writer is dropped
        assert!(lock.try_lock_read().is_none());
        *write = 321;
        drop(write);

        let read = lock.try_lock_read().unwrap();
        assert_eq!(*read, 321);
    }

    /// Tests the expected behavior for `RWLock::try_lock_read()`.
    #[test]
    fn test_try_read() {
        let lock = RWLock::new(123);
        let _read1 = lock.try_lock_read().unwrap();
        let _read2 = lock.try_lock_read().unwrap();

        // Writes should fail until all readers drop
        assert!(lock.try_lock_write().is_none());
        drop(_read1);
        assert!(lock.try_lock_write().is_none());
        drop(_read2);
        let _ = lock.try_lock_write().unwrap();
    }
}
