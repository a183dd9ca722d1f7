//! # Condition Variable.
//!
//! A condition variable lets a thread block until some state guarded by a
//! [`Mutex`] changes, without consuming processor time. Waiting atomically
//! releases the mutex and links the thread into the condition variable's FIFO
//! queue in [`ThreadState::WaitCond`]; the mutex is reacquired before the wait
//! returns.
//!
//! A wait ends in exactly one of three ways:
//! - it is signaled: [`WaitOutcome::Signaled`];
//! - its deadline passes first: [`WaitOutcome::TimedOut`];
//! - the thread is cancelled: the call does not return. The mutex is
//!   reacquired, the cleanup handlers run and the thread terminates with
//!   [`ExitStatus::Canceled`](crate::ExitStatus::Canceled).
//!
//! [`ConditionVariable::wait_while`] checks the predicate, waits while it
//! holds and re-checks it upon wakeup:
//!
//! ```rust
//! use std::sync::Arc;
//! use uthread::{sync::{ConditionVariable, Mutex}, thread};
//!
//! uthread::run(|| {
//!     let pair = Arc::new((Mutex::new(false), ConditionVariable::new()));
//!     let waker = {
//!         let pair = pair.clone();
//!         thread::spawn(move || {
//!             *pair.0.lock().unwrap() = true;
//!             pair.1.signal();
//!         })
//!         .unwrap()
//!     };
//!     let (ready, cond) = &*pair;
//!     let guard = cond.wait_while(ready, |ready| !*ready).unwrap();
//!     assert!(*guard);
//!     drop(guard);
//!     waker.join().unwrap();
//! })
//! .unwrap();
//! ```
use super::mutex::{Mutex, MutexGuard, MutexInner, RawMutex};
use crate::{
    ThreadError, cancel, preempt,
    sync::spinlock::SpinLock,
    thread::{
        Context, ThreadState, Tid, WakeReason,
        table::ThreadTable,
        wait::{Blocker, WaitList, WaitSource},
    },
};
use std::{
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

/// How a successful condition wait ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The waiter was signaled.
    Signaled,
    /// The timeout elapsed first.
    TimedOut,
}

impl WaitOutcome {
    /// Returns true if the wait timed out.
    pub fn timed_out(self) -> bool {
        self == WaitOutcome::TimedOut
    }
}

struct CondInner {
    waiters: SpinLock<WaitList>,
}

impl WaitSource for CondInner {
    fn unlink(&self, threads: &mut ThreadTable, tid: Tid) -> bool {
        self.waiters.lock().remove(threads, tid)
    }
}

/// A Condition Variable.
///
/// Waiters are woken in the order they started waiting. Waiting is a
/// cancellation point; reacquiring the mutex afterwards is not.
pub struct ConditionVariable {
    inner: Arc<CondInner>,
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CondInner {
                waiters: SpinLock::new(WaitList::new()),
            }),
        }
    }

    /// Releases `mutex`, waits, and reacquires `mutex`.
    fn wait_on(
        &self,
        mutex: &Arc<MutexInner>,
        deadline: Option<Instant>,
    ) -> Result<(Rc<Context>, WakeReason), ThreadError> {
        preempt::preempt_point();
        let ctx = Context::current()?;
        let me = ctx.tid;
        let kernel = ctx.kernel();
        if mutex.owner() != Some(me) {
            return Err(ThreadError::NotOwner);
        }
        let mut kernel = ctx.cancel_point(kernel);
        let count = mutex.release_for_wait(&mut kernel, me)?;
        self.inner.waiters.lock().push_back(&mut kernel.threads, me);

        let (kernel, reason) = ctx.block_cancellable(
            kernel,
            ThreadState::WaitCond,
            Blocker::Queue(self.inner.clone()),
            deadline,
        );
        drop(kernel);
        mutex.reacquire(&ctx, count);
        Ok((ctx, reason))
    }

    fn wait_until<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Option<Instant>,
    ) -> Result<(MutexGuard<'a, T>, WaitOutcome), ThreadError> {
        let (ctx, reason) = self.wait_on(guard.mutex.raw().inner(), deadline)?;
        match reason {
            // `guard` unlocks the mutex while the stack unwinds.
            WakeReason::Cancelled => cancel::deliver(&ctx),
            WakeReason::TimedOut => Ok((guard, WaitOutcome::TimedOut)),
            WakeReason::Satisfied | WakeReason::Interrupted => Ok((guard, WaitOutcome::Signaled)),
        }
    }

    /// Blocks the current thread until this condition variable is signaled.
    ///
    /// The mutex behind `guard` is released while waiting and held again
    /// when the guard is returned. Spurious wakeups do not happen, but the
    /// guarded state may have changed again before the waiter runs; prefer
    /// [`wait_while`](Self::wait_while).
    pub fn wait<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
    ) -> Result<MutexGuard<'a, T>, ThreadError> {
        self.wait_until(guard, None).map(|(guard, _)| guard)
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> Result<(MutexGuard<'a, T>, WaitOutcome), ThreadError> {
        self.wait_until(guard, Some(Instant::now() + timeout))
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// This function locks `mutex` and checks the predicate. While it
    /// returns `true`, the thread waits with the mutex temporarily released,
    /// and re-evaluates the predicate with the mutex held upon wakeup.
    ///
    /// There is **no need to check the predicate before calling**
    /// `wait_while`.
    pub fn wait_while<'a, T: ?Sized>(
        &self,
        mutex: &'a Mutex<T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> Result<MutexGuard<'a, T>, ThreadError> {
        let mut guard = mutex.lock()?;
        while predicate(&mut *guard) {
            guard = self.wait(guard)?;
        }
        Ok(guard)
    }

    /// Waits with a [`RawMutex`] that the caller owns.
    ///
    /// On cancellation the mutex is held while the cleanup handlers run; a
    /// handler is expected to unlock it.
    ///
    /// # Errors
    /// [`ThreadError::NotOwner`] if the caller does not own `mutex`.
    pub fn wait_raw(&self, mutex: &RawMutex) -> Result<(), ThreadError> {
        self.wait_raw_until(mutex, None).map(drop)
    }

    /// Like [`wait_raw`](Self::wait_raw), giving up after `timeout`.
    pub fn wait_raw_timeout(
        &self,
        mutex: &RawMutex,
        timeout: Duration,
    ) -> Result<WaitOutcome, ThreadError> {
        self.wait_raw_until(mutex, Some(Instant::now() + timeout))
    }

    fn wait_raw_until(
        &self,
        mutex: &RawMutex,
        deadline: Option<Instant>,
    ) -> Result<WaitOutcome, ThreadError> {
        let (ctx, reason) = self.wait_on(mutex.inner(), deadline)?;
        match reason {
            WakeReason::Cancelled => cancel::deliver(&ctx),
            WakeReason::TimedOut => Ok(WaitOutcome::TimedOut),
            WakeReason::Satisfied | WakeReason::Interrupted => Ok(WaitOutcome::Signaled),
        }
    }

    /// Wakes up the longest waiter, if any. Signals are not buffered.
    pub fn signal(&self) {
        self.wake(false);
    }

    /// Wakes up every waiter. Broadcasts are not buffered.
    pub fn broadcast(&self) {
        self.wake(true);
    }

    fn wake(&self, all: bool) {
        // Outside a runtime nobody can be waiting.
        let Some(ctx) = Context::try_current() else {
            return;
        };
        let mut kernel = ctx.kernel();
        let woken = {
            let mut waiters = self.inner.waiters.lock();
            if all {
                waiters.drain(&mut kernel.threads)
            } else {
                waiters.pop(&mut kernel.threads).into_iter().collect()
            }
        };
        for tid in woken {
            kernel.resolve(tid, WakeReason::Satisfied);
        }
        drop(kernel);
        preempt::preempt_point();
    }

    /// Number of threads waiting on this condition variable.
    pub fn waiters(&self) -> usize {
        self.inner.waiters.lock().len()
    }
}
