//! # Mutex.
//!
//! A mutex allows **only one thread at a time** to access a critical
//! section. A thread that finds the mutex held is linked into the mutex's
//! FIFO wait queue in [`ThreadState::WaitMutex`] and gives up the processor.
//! Unlocking hands the ownership straight to the head of that queue, so the
//! mutex is granted in exactly the order the waiters arrived.
//!
//! Locking is not a cancellation point: a thread waiting for a mutex is only
//! pulled out of the wait by an asynchronous cancellation. A thread that
//! exits while owning mutexes releases them; that is logged as a warning.
//!
//! [`Mutex`] protects a value and hands out RAII [`MutexGuard`]s that unlock
//! on drop. [`RawMutex`] is the untyped primitive with explicit
//! [`lock`](RawMutex::lock)/[`unlock`](RawMutex::unlock) and a selectable
//! [`MutexKind`].
use crate::{
    ThreadError, cancel, preempt,
    sync::spinlock::SpinLock,
    thread::{
        Context, ThreadState, Tid, WakeReason,
        kern::{Kernel, fatal},
        table::ThreadTable,
        wait::{Blocker, WaitList, WaitSource},
    },
};
use std::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// Behavior of a mutex relocked by its owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MutexKind {
    /// Relocking fails with [`ThreadError::Deadlock`].
    #[default]
    ErrorCheck,
    /// Relocking increments a lock count; the mutex is released once it is
    /// unlocked as many times as it was locked.
    Recursive,
    /// Relocking blocks the owner for good.
    Normal,
}

struct MutexState {
    owner: Option<Tid>,
    count: usize,
    waiters: WaitList,
}

/// The shared part of a mutex. Owners keep a reference to it so that an
/// exiting thread can release what it holds.
pub(crate) struct MutexInner {
    state: SpinLock<MutexState>,
    kind: MutexKind,
}

impl WaitSource for MutexInner {
    fn unlink(&self, threads: &mut ThreadTable, tid: Tid) -> bool {
        self.state.lock().waiters.remove(threads, tid)
    }
}

impl MutexInner {
    fn new(kind: MutexKind) -> Self {
        Self {
            state: SpinLock::new(MutexState {
                owner: None,
                count: 0,
                waiters: WaitList::new(),
            }),
            kind,
        }
    }

    pub(crate) fn owner(&self) -> Option<Tid> {
        self.state.lock().owner
    }

    /// Locks the mutex for the calling thread, waiting in FIFO order.
    fn lock_as(self: &Arc<Self>, ctx: &Context) -> Result<(), ThreadError> {
        let me = ctx.tid;
        let mut kernel = ctx.kernel();
        {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    drop(state);
                    kernel.threads.linked_mut(me).owned.push(self.clone());
                    return Ok(());
                }
                Some(owner) if owner == me => match self.kind {
                    MutexKind::Recursive => {
                        state.count += 1;
                        return Ok(());
                    }
                    MutexKind::ErrorCheck => return Err(ThreadError::Deadlock),
                    MutexKind::Normal => log::warn!("thread {me} relocks a mutex it owns"),
                },
                Some(_) => {}
            }
            state.waiters.push_back(&mut kernel.threads, me);
        }

        let (mut kernel, reason) =
            ctx.block(kernel, ThreadState::WaitMutex, Blocker::Queue(self.clone()), None);
        if reason == WakeReason::Cancelled {
            // The mutex may have been handed over right before the request.
            if self.owner() == Some(me) {
                self.release(&mut kernel, me);
            }
            drop(kernel);
            cancel::deliver(ctx);
        }
        Ok(())
    }

    fn try_lock_as(self: &Arc<Self>, kernel: &mut Kernel, me: Tid) -> Result<(), ThreadError> {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.count = 1;
                drop(state);
                kernel.threads.linked_mut(me).owned.push(self.clone());
                Ok(())
            }
            Some(owner) if owner == me && self.kind == MutexKind::Recursive => {
                state.count += 1;
                Ok(())
            }
            Some(_) => Err(ThreadError::Busy),
        }
    }

    fn unlock_as(self: &Arc<Self>, kernel: &mut Kernel, me: Tid) -> Result<(), ThreadError> {
        {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(ThreadError::NotOwner);
            }
            state.count -= 1;
            if state.count > 0 {
                return Ok(());
            }
        }
        self.release(kernel, me);
        Ok(())
    }

    /// Drops the ownership of `me` and hands the mutex to the next waiter.
    fn release(self: &Arc<Self>, kernel: &mut Kernel, me: Tid) {
        let owned = &mut kernel.threads.linked_mut(me).owned;
        if let Some(pos) = owned.iter().position(|m| Arc::ptr_eq(m, self)) {
            owned.swap_remove(pos);
        }
        self.hand_off(kernel);
    }

    fn hand_off(self: &Arc<Self>, kernel: &mut Kernel) {
        let next = {
            let mut state = self.state.lock();
            let next = state.waiters.pop(&mut kernel.threads);
            state.owner = next;
            state.count = usize::from(next.is_some());
            next
        };
        if let Some(next) = next {
            log::trace!("mutex handed over to {next}");
            kernel.threads.linked_mut(next).owned.push(self.clone());
            kernel.resolve(next, WakeReason::Satisfied);
        }
    }

    /// Releases the mutex on behalf of `tid`, which is exiting. The caller
    /// already removed it from the thread's owned list.
    pub(crate) fn release_all(self: &Arc<Self>, kernel: &mut Kernel, tid: Tid) {
        {
            let mut state = self.state.lock();
            if state.owner != Some(tid) {
                return;
            }
            state.count = 0;
        }
        self.hand_off(kernel);
    }

    /// Fully releases the mutex before a condition wait. Returns the lock
    /// count to restore afterwards.
    pub(crate) fn release_for_wait(
        self: &Arc<Self>,
        kernel: &mut Kernel,
        me: Tid,
    ) -> Result<usize, ThreadError> {
        let count = {
            let mut state = self.state.lock();
            if state.owner != Some(me) {
                return Err(ThreadError::NotOwner);
            }
            std::mem::replace(&mut state.count, 0)
        };
        self.release(kernel, me);
        Ok(count)
    }

    /// Reacquires the mutex after a condition wait, with cancellation
    /// masked for the duration of the wait for the mutex.
    pub(crate) fn reacquire(self: &Arc<Self>, ctx: &Context, count: usize) {
        let masked = ctx.mask_cancel();
        let result = self.lock_as(ctx);
        ctx.unmask_cancel(masked);
        if let Err(e) = result {
            fatal(format_args!("thread {} cannot reacquire a mutex: {e}", ctx.tid));
        }
        self.state.lock().count = count;
    }
}

/// An untyped mutex with explicit lock and unlock.
///
/// # Examples
///
/// ```
/// use uthread::sync::{MutexKind, RawMutex};
///
/// uthread::run(|| {
///     let mutex = RawMutex::with_kind(MutexKind::Recursive);
///     mutex.lock().unwrap();
///     mutex.lock().unwrap();
///     mutex.unlock().unwrap();
///     assert!(mutex.is_locked());
///     mutex.unlock().unwrap();
///     assert!(!mutex.is_locked());
/// })
/// .unwrap();
/// ```
pub struct RawMutex {
    inner: Arc<MutexInner>,
}

impl RawMutex {
    /// Creates an unlocked [`MutexKind::ErrorCheck`] mutex.
    pub fn new() -> Self {
        Self::with_kind(MutexKind::default())
    }

    /// Creates an unlocked mutex of the given kind.
    pub fn with_kind(kind: MutexKind) -> Self {
        Self {
            inner: Arc::new(MutexInner::new(kind)),
        }
    }

    /// The kind this mutex was created with.
    pub fn kind(&self) -> MutexKind {
        self.inner.kind
    }

    /// Acquires the mutex, blocking the calling thread until it is granted.
    ///
    /// Waiters are granted the mutex in FIFO order.
    ///
    /// # Errors
    /// - [`ThreadError::Deadlock`] if the caller owns an
    ///   [`ErrorCheck`](MutexKind::ErrorCheck) mutex.
    /// - [`ThreadError::NoRuntime`] outside a runtime.
    pub fn lock(&self) -> Result<(), ThreadError> {
        preempt::preempt_point();
        let ctx = Context::current()?;
        self.inner.lock_as(&ctx)
    }

    /// Acquires the mutex if it is free.
    ///
    /// # Errors
    /// [`ThreadError::Busy`] if it is held, by the caller included unless the
    /// mutex is [`Recursive`](MutexKind::Recursive).
    pub fn try_lock(&self) -> Result<(), ThreadError> {
        preempt::preempt_point();
        let ctx = Context::current()?;
        let mut kernel = ctx.kernel();
        self.inner.try_lock_as(&mut kernel, ctx.tid)
    }

    /// Releases the mutex, handing it to the longest waiter if there is one.
    ///
    /// # Errors
    /// [`ThreadError::NotOwner`] if the caller does not own the mutex.
    pub fn unlock(&self) -> Result<(), ThreadError> {
        self.unlock_quiet()?;
        preempt::preempt_point();
        Ok(())
    }

    /// Unlock without a reentry point, for use from destructors.
    fn unlock_quiet(&self) -> Result<(), ThreadError> {
        let ctx = Context::current()?;
        let mut kernel = ctx.kernel();
        self.inner.unlock_as(&mut kernel, ctx.tid)
    }

    /// Returns true if some thread owns the mutex.
    pub fn is_locked(&self) -> bool {
        self.inner.owner().is_some()
    }

    pub(crate) fn inner(&self) -> &Arc<MutexInner> {
        &self.inner
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutual exclusion primitive useful for protecting shared data.
///
/// The data can only be accessed through the guards returned from [`lock`]
/// and [`try_lock`], which guarantees that the data is only ever accessed
/// when the mutex is locked. The mutex is released when the guard is
/// dropped, so a thread that is cancelled while holding a guard releases the
/// mutex while its stack unwinds.
///
/// Relocking by the owner fails with [`ThreadError::Deadlock`].
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use uthread::{sync::Mutex, thread};
///
/// const N: usize = 10;
///
/// let total = uthread::run(|| {
///     let data = Arc::new(Mutex::new(0));
///     let handles: Vec<_> = (0..N)
///         .map(|_| {
///             let data = Arc::clone(&data);
///             thread::spawn(move || {
///                 let mut data = data.lock().unwrap();
///                 *data += 1;
///             })
///             .unwrap()
///         })
///         .collect();
///     for handle in handles {
///         handle.join().unwrap();
///     }
///     let total = *data.lock().unwrap();
///     total
/// })
/// .unwrap();
/// assert_eq!(total, N);
/// ```
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            raw: RawMutex::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the mutex, blocking the current thread until it is granted.
    ///
    /// # Errors
    /// [`ThreadError::Deadlock`] if the calling thread already holds it.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>, ThreadError> {
        self.raw.lock()?;
        Ok(MutexGuard::new(self))
    }

    /// Attempts to acquire the mutex without blocking.
    ///
    /// # Errors
    /// [`ThreadError::Busy`] if the mutex is held.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, ThreadError> {
        self.raw.try_lock()?;
        Ok(MutexGuard::new(self))
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the mutex mutably, no locking takes place.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(crate) fn raw(&self) -> &RawMutex {
        &self.raw
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope), the mutex is unlocked.
///
/// The data protected by the mutex can be accessed through this guard.
///
/// This structure is created by the [`lock`] and [`try_lock`] methods on
/// [`Mutex`].
///
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
pub struct MutexGuard<'a, T: ?Sized + 'a> {
    pub(crate) mutex: &'a Mutex<T>,
    // Ownership belongs to the thread that locked.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>) -> Self {
        Self {
            mutex,
            _not_send: PhantomData,
        }
    }

    /// Releases the underlying [`Mutex`].
    ///
    /// Unlike dropping the guard, this is a reentry point.
    pub fn unlock(self) {
        drop(self);
        preempt::preempt_point();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.raw.unlock_quiet() {
            log::warn!("dropping a mutex guard: {e}");
        }
    }
}
