//! # Semaphore.
//!
//! A counting semaphore regulates concurrent access to a finite set of
//! resources. It maintains a count of available permits; each permit grants a
//! thread the right to access the resource the semaphore is combined with.
//! The semaphore is built from a [`Mutex`] over the permit count and a
//! [`ConditionVariable`] that blocked waiters sleep on.
//!
//! [`Semaphore::wait`] returns a [`SemaphorePermits`] RAII guard that
//! releases the permit when dropped, also when the holder is cancelled and
//! its stack unwinds. A semaphore created with zero permits works as an event
//! signal: one thread waits, another calls [`Semaphore::signal`].
//!
//! ```rust
//! use std::sync::Arc;
//! use uthread::{sync::Semaphore, thread};
//!
//! uthread::run(|| {
//!     let done = Arc::new(Semaphore::new(0, ()));
//!     let worker = {
//!         let done = done.clone();
//!         thread::spawn(move || done.signal()).unwrap()
//!     };
//!     let permit = done.wait().unwrap();
//!     permit.forget();
//!     worker.join().unwrap();
//! })
//! .unwrap();
//! ```
use super::{condition_variable::ConditionVariable, mutex::Mutex};
use crate::{ThreadError, cancel};
use std::ops::Deref;

/// Counting semaphore.
///
/// A semaphore maintains a set of permits and a resource. A semaphore
/// differs from a mutex in that it can allow more than one concurrent caller
/// to access the shared resource at a time.
pub struct Semaphore<T> {
    permits: Mutex<usize>,
    available: ConditionVariable,
    resource: T,
}

impl<T> Semaphore<T> {
    /// Creates a new semaphore initialized with `permits` permits, guarding
    /// `resource`.
    pub fn new(permits: usize, resource: T) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: ConditionVariable::new(),
            resource,
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    ///
    /// This is a cancellation point, whether or not the caller has to wait.
    pub fn wait(&self) -> Result<SemaphorePermits<'_, T>, ThreadError> {
        cancel::test_cancel();
        let mut permits = self.available.wait_while(&self.permits, |n| *n == 0)?;
        *permits -= 1;
        drop(permits);
        Ok(SemaphorePermits { sema: self })
    }

    /// Acquires a permit if one is available.
    ///
    /// # Errors
    /// [`ThreadError::Busy`] if no permit is available.
    pub fn try_wait(&self) -> Result<SemaphorePermits<'_, T>, ThreadError> {
        let mut permits = self.permits.lock()?;
        if *permits == 0 {
            return Err(ThreadError::Busy);
        }
        *permits -= 1;
        drop(permits);
        Ok(SemaphorePermits { sema: self })
    }

    /// Releases a permit back to the semaphore, waking one waiter.
    ///
    /// Normally this is invoked when a [`SemaphorePermits`] is dropped; call
    /// it directly to signal an event with a zero-initialized semaphore.
    pub fn signal(&self) {
        match self.permits.lock() {
            Ok(mut permits) => {
                *permits += 1;
                drop(permits);
                self.available.signal();
            }
            Err(e) => log::warn!("semaphore signal dropped: {e}"),
        }
    }

    /// Number of permits available right now.
    pub fn available(&self) -> usize {
        self.permits.lock().map_or(0, |permits| *permits)
    }
}

/// An RAII implementation of a "scoped semaphore". When this structure is
/// dropped (falls out of scope), the semaphore is signaled.
///
/// The resource protected by the semaphore can be accessed through this
/// guard via its [`Deref`] implementation.
///
/// This structure is created by the [`wait`] method on [`Semaphore`].
///
/// [`wait`]: Semaphore::wait
pub struct SemaphorePermits<'a, T> {
    sema: &'a Semaphore<T>,
}

impl<T> SemaphorePermits<'_, T> {
    /// Consumes the permit without returning it to the semaphore.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl<T> Deref for SemaphorePermits<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.sema.resource
    }
}

impl<T> Drop for SemaphorePermits<'_, T> {
    fn drop(&mut self) {
        self.sema.signal()
    }
}
