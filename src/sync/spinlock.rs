//! Preemption-masking spinlock.
//!
//! On a uniprocessor, a lock over scheduler state only has to keep the
//! holder from being preempted: no other user thread can run while the
//! holder is unpreemptable, so nobody else can observe the state mid-update.
//! The runtime follows exactly that discipline with [`PreemptGuard`].
//!
//! Every user thread is backed by its own OS thread, so the lock still
//! flips an atomic flag: it publishes the holder's writes to whichever
//! backing thread receives the run baton next. Contention is limited to the
//! short hand-off window of a context switch and is absorbed by
//! [`Backoff`].
use crate::preempt::PreemptGuard;
use crossbeam_utils::Backoff;
use std::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// A mutual exclusion primitive over runtime-internal data.
///
/// The data can only be accessed through the guard returned from [`lock`],
/// which keeps preemption masked for as long as it lives.
///
/// [`lock`]: Self::lock
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the spinlock, masking preemption first.
    ///
    /// Locking a spinlock that the calling thread already holds never
    /// returns.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let guard = PreemptGuard::new();
        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        SpinLockGuard {
            lock: self,
            _guard: guard,
        }
    }
}

/// An implementation of a "scoped lock" of a spinlock. The lock is released
/// and preemption unmasked when this structure is dropped.
///
/// This structure is created by [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    // Dropped after the flag is cleared in `Drop::drop`.
    _guard: PreemptGuard,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_masks_preemption() {
        let lock = SpinLock::new(3);
        {
            let mut guard = lock.lock();
            assert!(PreemptGuard::is_guarded());
            *guard += 1;
        }
        assert!(!PreemptGuard::is_guarded());
        assert_eq!(*lock.lock(), 4);
    }

    #[test]
    fn hands_over_between_os_threads() {
        let lock = std::sync::Arc::new(SpinLock::new(0usize));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
