//! Thread abstraction.
//!
//! ## The threading model
//!
//! A running program consists of a collection of user threads multiplexed
//! onto a single flow of control. Only one user thread executes at any
//! instant; the others are runnable, waiting on some resource, suspended, or
//! dead and waiting to be reaped. A thread gives up the processor only at
//! well-defined points: when it blocks, when it yields, when a preemption
//! tick is observed at a reentry point, or when it exits.
//!
//! Each user thread owns a real stack. It is backed by an OS thread that
//! stays parked unless it holds the run baton, so switching from one user
//! thread to another hands the baton over and parks the previous owner.
//!
//! Threads are created with [`ThreadBuilder`] (or [`spawn`]) and are
//! identified by a [`Tid`]. A [`JoinHandle`] waits for a thread's
//! [`ExitStatus`].
pub(crate) mod kern;
pub(crate) mod scheduler;
pub(crate) mod table;
pub(crate) mod wait;

pub use wait::{Direction, WakeReason};

use crate::{
    ThreadError, cancel,
    preempt::{self, PreemptGuard},
    signal::{SigSet, Signal},
    sync::mutex::MutexInner,
};
use bitflags::bitflags;
use crossbeam_utils::sync::{Parker, Unparker};
use kern::{KernelGuard, Shared};
use nix::poll::PollFlags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::{
    any::Any,
    cell::OnceCell,
    fmt,
    os::fd::RawFd,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Instant,
};
use wait::{Blocker, Link, WaitList};

/// Identifier of a user thread.
///
/// A `Tid` names an arena slot together with the slot's generation. Once the
/// thread is reaped, the `Tid` goes stale and every operation on it reports
/// [`ThreadError::NoSuchThread`], even if a new thread reuses the slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid {
    slot: u32,
    generation: u32,
}

impl Tid {
    pub(crate) const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub(crate) fn slot(self) -> usize {
        self.slot as usize
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the identifier into an integer.
    pub const fn into_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    /// Rebuilds an identifier from [`Tid::into_raw`].
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            slot: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({}.{})", self.slot, self.generation)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

/// Scheduling priority of a thread. Larger values run first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    /// The lowest priority.
    pub const MIN: Priority = Priority(0);
    /// The highest priority.
    pub const MAX: Priority = Priority(31);
    /// Priority of threads that do not ask for one.
    pub const DEFAULT: Priority = Priority(15);

    pub(crate) const LEVELS: usize = Self::MAX.0 as usize + 1;

    /// Returns `None` if `value` is above [`Priority::MAX`].
    pub const fn new(value: u8) -> Option<Self> {
        if value <= Self::MAX.0 {
            Some(Priority(value))
        } else {
            None
        }
    }

    /// The numeric priority.
    pub const fn get(self) -> u8 {
        self.0
    }

    pub(crate) fn level(self) -> usize {
        self.0 as usize
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<u8> for Priority {
    type Error = ThreadError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value).ok_or(ThreadError::InvalidArgument)
    }
}

/// A possible state of the thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ThreadState {
    /// Thread is running. Exactly one thread is in this state.
    Running,
    /// Thread is in the run queue.
    Runnable,
    /// Thread waits for a mutex.
    WaitMutex,
    /// Thread waits on a condition variable.
    WaitCond,
    /// Thread waits for another thread to exit.
    WaitJoin,
    /// Thread waits until an fd becomes readable.
    WaitFdRead,
    /// Thread waits until an fd becomes writable.
    WaitFdWrite,
    /// Thread waits on a set of fds.
    WaitPoll,
    /// Thread sleeps until a deadline.
    WaitSleep,
    /// Thread waits in `sigsuspend`.
    WaitSigsuspend,
    /// Thread waits in `sigwait`.
    WaitSigwait,
    /// Thread is suspended.
    Suspended,
    /// Thread is tearing itself down.
    Exiting,
    /// Thread exited and waits to be reaped.
    Dead,
}

impl ThreadState {
    /// Returns true for the `Wait*` states.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            ThreadState::WaitMutex
                | ThreadState::WaitCond
                | ThreadState::WaitJoin
                | ThreadState::WaitFdRead
                | ThreadState::WaitFdWrite
                | ThreadState::WaitPoll
                | ThreadState::WaitSleep
                | ThreadState::WaitSigsuspend
                | ThreadState::WaitSigwait
        )
    }
}

bitflags! {
    /// Per-thread flags.
    pub(crate) struct TcbFlags: u16 {
        /// A cancellation request is pending.
        const CANCELLING = 1 << 0;
        /// Cancellation state is `Disabled`.
        const CANCEL_DISABLED = 1 << 1;
        /// Cancellation type is `Asynchronous`.
        const CANCEL_ASYNC = 1 << 2;
        /// The thread waits inside a cancellation point.
        const AT_CANCEL_POINT = 1 << 3;
        /// The thread began its own exit.
        const EXITING = 1 << 4;
        /// Nobody will join the thread.
        const DETACHED = 1 << 5;
        /// Suspend the thread as soon as its current wait resolves.
        const SUSPEND_PENDING = 1 << 6;
        /// The thread runs the closure passed to `Runtime::block_on`.
        const MAIN = 1 << 7;
    }
}

/// How a thread terminated.
#[derive(Clone)]
pub enum ExitStatus {
    /// The thread returned, or called [`Current::exit`], with a value.
    Exited(Arc<dyn Any + Send + Sync>),
    /// The thread acted on a cancellation request.
    Canceled,
    /// The thread panicked with the given message.
    Panicked(Arc<str>),
}

impl ExitStatus {
    /// Returns the exit value if the thread exited with a `T`.
    pub fn value<T: Any>(&self) -> Option<&T> {
        match self {
            ExitStatus::Exited(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// Returns true if the thread acted on a cancellation request.
    pub fn is_canceled(&self) -> bool {
        matches!(self, ExitStatus::Canceled)
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(_) => f.write_str("Exited(..)"),
            ExitStatus::Canceled => f.write_str("Canceled"),
            ExitStatus::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
        }
    }
}

pub(crate) type CleanupHandler = Box<dyn FnOnce() + Send>;

/// A thread control block.
pub(crate) struct Thread {
    pub(crate) tid: Tid,
    pub(crate) name: Option<String>,
    pub(crate) state: ThreadState,
    state_mirror: Arc<AtomicU8>,
    pub(crate) priority: Priority,
    pub(crate) flags: TcbFlags,
    pub(crate) link: Link,
    pub(crate) blocker: Option<Blocker>,
    pub(crate) wake: Option<WakeReason>,
    pub(crate) deadline: Option<Instant>,
    pub(crate) joiners: WaitList,
    pub(crate) join_slot: Option<ExitStatus>,
    pub(crate) exit_status: Option<ExitStatus>,
    pub(crate) cleanup: Vec<CleanupHandler>,
    pub(crate) owned: Vec<Arc<MutexInner>>,
    pub(crate) errno: i32,
    pub(crate) sig_pending: SigSet,
    pub(crate) sig_mask: SigSet,
    pub(crate) sig_wait: SigSet,
    pub(crate) sig_received: Option<Signal>,
    pub(crate) poll_set: Vec<(RawFd, PollFlags)>,
    pub(crate) unparker: Unparker,
}

impl Thread {
    pub(crate) fn new(
        tid: Tid,
        name: Option<String>,
        priority: Priority,
        flags: TcbFlags,
        unparker: Unparker,
    ) -> Self {
        Self {
            tid,
            name,
            state: ThreadState::Runnable,
            state_mirror: Arc::new(AtomicU8::new(ThreadState::Runnable.into())),
            priority,
            flags,
            link: Link::default(),
            blocker: None,
            wake: None,
            deadline: None,
            joiners: WaitList::new(),
            join_slot: None,
            exit_status: None,
            cleanup: Vec::new(),
            owned: Vec::new(),
            errno: 0,
            sig_pending: SigSet::empty(),
            sig_mask: SigSet::empty(),
            sig_wait: SigSet::empty(),
            sig_received: None,
            poll_set: Vec::new(),
            unparker,
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(tid: Tid, priority: Priority) -> Self {
        let parker = Parker::new();
        Self::new(tid, None, priority, TcbFlags::empty(), parker.unparker().clone())
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
        self.state_mirror.store(state.into(), Ordering::Release);
    }

    /// Cancellation is pending, enabled and the thread is not exiting yet.
    pub(crate) fn cancel_due(&self) -> bool {
        self.flags.contains(TcbFlags::CANCELLING)
            && !self
                .flags
                .intersects(TcbFlags::CANCEL_DISABLED | TcbFlags::EXITING)
    }

    /// Like [`Thread::cancel_due`], restricted to asynchronous cancellation.
    pub(crate) fn async_cancel_due(&self) -> bool {
        self.cancel_due() && self.flags.contains(TcbFlags::CANCEL_ASYNC)
    }

    fn handle(&self) -> JoinHandle {
        JoinHandle {
            tid: self.tid,
            state: self.state_mirror.clone(),
        }
    }
}

/// Execution context of the user thread backed by the calling OS thread.
pub(crate) struct Context {
    pub(crate) shared: Arc<Shared>,
    pub(crate) tid: Tid,
    pub(crate) parker: Parker,
}

thread_local! {
    static CONTEXT: OnceCell<Rc<Context>> = const { OnceCell::new() };
}

impl Context {
    fn install(shared: Arc<Shared>, tid: Tid, parker: Parker) -> Rc<Context> {
        let ctx = Rc::new(Context {
            shared,
            tid,
            parker,
        });
        CONTEXT.with(|cell| {
            if cell.set(ctx.clone()).is_err() {
                kern::fatal(format_args!("OS thread backs two user threads"));
            }
        });
        ctx
    }

    /// The context of the calling user thread, if it is one.
    pub(crate) fn try_current() -> Option<Rc<Context>> {
        CONTEXT.with(|cell| cell.get().cloned())
    }

    pub(crate) fn current() -> Result<Rc<Context>, ThreadError> {
        Self::try_current().ok_or(ThreadError::NoRuntime)
    }

    pub(crate) fn kernel(&self) -> KernelGuard<'_> {
        self.shared.kernel.lock()
    }
}

/// Run a function `f` with the current thread's context as an argument.
///
/// # Panics
/// Panics when called outside of a runtime.
#[inline]
pub(crate) fn with_current<R>(f: impl FnOnce(&Rc<Context>) -> R) -> R {
    match Context::try_current() {
        Some(ctx) => f(&ctx),
        None => panic!("uthread: called outside of a runtime; use `Runtime::block_on`"),
    }
}

pub(crate) type ThreadBody = Box<dyn FnOnce() -> Arc<dyn Any + Send + Sync> + Send>;

/// The very beginning of every user thread.
pub(crate) fn thread_start(shared: Arc<Shared>, tid: Tid, parker: Parker, body: ThreadBody) {
    while shared.running() != Some(tid) {
        parker.park();
    }
    let ctx = Context::install(shared, tid, parker);
    log::debug!("thread {tid} started");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        cancel::test_async(&ctx);
        body()
    }));
    let status = match outcome {
        Ok(value) => ExitStatus::Exited(value),
        Err(payload) => cancel::classify(payload),
    };
    finish(&ctx, status);
}

/// Tears the calling thread down and hands the processor away for good.
fn finish(ctx: &Context, status: ExitStatus) {
    let status = match cancel::run_cleanup(ctx) {
        Some(payload) => cancel::classify(payload),
        None => status,
    };
    log::debug!("thread {} exits: {status:?}", ctx.tid);
    let mut kernel = ctx.kernel();
    kernel.exit_thread(ctx.tid, status);
    ctx.exit_switch(kernel);
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: Option<String>,
    priority: Option<Priority>,
    detached: bool,
    stack_size: Option<usize>,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: Some(String::from(name)),
            ..Self::unnamed()
        }
    }

    /// Create a builder for a thread without a name.
    pub fn unnamed() -> Self {
        Self {
            name: None,
            priority: None,
            detached: false,
            stack_size: None,
        }
    }

    /// Scheduling priority of the new thread.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Creates the thread detached. A detached thread is reaped as soon as it
    /// exits and cannot be joined.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Stack size of the new thread, overriding the runtime default.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Spawn the thread.
    ///
    /// The new thread is runnable but does not preempt the caller. It fails
    /// with [`ThreadError::Again`] if the runtime's thread limit is reached
    /// or the OS refuses to provide a stack; the caller is unaffected then.
    pub fn spawn<F, T>(self, thread_fn: F) -> Result<JoinHandle, ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Any + Send + Sync,
    {
        preempt::preempt_point();
        let ctx = Context::current()?;
        let mut kernel = ctx.kernel();
        let tid = ctx.shared.spawn_thread(
            &mut kernel,
            self,
            TcbFlags::empty(),
            Box::new(move || Arc::new(thread_fn()) as Arc<dyn Any + Send + Sync>),
        )?;
        Ok(kernel.threads.linked(tid).handle())
    }

    pub(crate) fn into_parts(self) -> (Option<String>, Option<Priority>, bool, Option<usize>) {
        (self.name, self.priority, self.detached, self.stack_size)
    }
}

/// Spawns an unnamed thread with default attributes.
pub fn spawn<F, T>(thread_fn: F) -> Result<JoinHandle, ThreadError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Any + Send + Sync,
{
    ThreadBuilder::unnamed().spawn(thread_fn)
}

/// A handle to join thread.
#[derive(Debug)]
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: Tid,
    state: Arc<AtomicU8>,
}

impl JoinHandle {
    /// Join this handle and returns the exit status.
    pub fn join(self) -> Result<ExitStatus, ThreadError> {
        join(self.tid)
    }

    /// Last observed state of the underlying thread.
    ///
    /// Readable from any OS thread without entering the runtime.
    pub fn state(&self) -> ThreadState {
        ThreadState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(ThreadState::Dead)
    }

    /// Requests cancellation of the underlying thread.
    pub fn cancel(&self) -> Result<(), ThreadError> {
        cancel::cancel(self.tid)
    }

    /// Detaches the underlying thread.
    pub fn detach(self) -> Result<(), ThreadError> {
        detach(self.tid)
    }
}

/// Waits for thread `tid` to exit and returns its exit status.
///
/// The thread is reaped afterwards, so joining it again reports
/// [`ThreadError::NoSuchThread`]. This is a cancellation point.
pub fn join(tid: Tid) -> Result<ExitStatus, ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    if tid == ctx.tid {
        return Err(ThreadError::Deadlock);
    }
    let kernel = ctx.kernel();
    let target = kernel.threads.get(tid).ok_or(ThreadError::NoSuchThread)?;
    if target.flags.contains(TcbFlags::DETACHED) {
        return Err(ThreadError::InvalidArgument);
    }
    let mut kernel = ctx.cancel_point(kernel);

    if kernel.threads.linked(tid).state == ThreadState::Dead {
        return match kernel.threads.remove(tid).and_then(|th| th.exit_status) {
            Some(status) => Ok(status),
            None => kern::fatal(format_args!("dead thread {tid} has no exit status")),
        };
    }

    let mut joiners = kernel.threads.linked(tid).joiners;
    joiners.push_back(&mut kernel.threads, ctx.tid);
    kernel.threads.linked_mut(tid).joiners = joiners;

    let (mut kernel, reason) =
        ctx.block_cancellable(kernel, ThreadState::WaitJoin, Blocker::Join(tid), None);
    match reason {
        WakeReason::Cancelled => {
            drop(kernel);
            cancel::deliver(&ctx)
        }
        _ => match kernel.threads.linked_mut(ctx.tid).join_slot.take() {
            Some(status) => Ok(status),
            None => kern::fatal(format_args!("{} woke from join without a status", ctx.tid)),
        },
    }
}

/// Marks thread `tid` as detached; it is reaped as soon as it exits.
pub fn detach(tid: Tid) -> Result<(), ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    let th = kernel
        .threads
        .get_mut(tid)
        .ok_or(ThreadError::NoSuchThread)?;
    if th.flags.contains(TcbFlags::DETACHED) {
        return Err(ThreadError::InvalidArgument);
    }
    th.flags.insert(TcbFlags::DETACHED);
    if th.state == ThreadState::Dead {
        kernel.threads.remove(tid);
    }
    Ok(())
}

/// Returns the state of thread `tid`.
pub fn state_of(tid: Tid) -> Result<ThreadState, ThreadError> {
    let ctx = Context::current()?;
    let kernel = ctx.kernel();
    kernel
        .threads
        .get(tid)
        .map(|th| th.state)
        .ok_or(ThreadError::NoSuchThread)
}

/// Changes the priority of thread `tid`.
///
/// A runnable thread moves to the tail of its new priority level.
pub fn set_priority(tid: Tid, priority: Priority) -> Result<(), ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    kernel.set_priority(tid, priority)
}

/// Suspends thread `tid`.
///
/// A thread waiting for some resource keeps waiting and becomes suspended
/// once its wait resolves. Suspending the calling thread gives up the
/// processor until another thread resumes it.
pub fn suspend(tid: Tid) -> Result<(), ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    kernel.suspend(tid)?;
    if tid == ctx.tid {
        let kernel = ctx.reschedule(kernel);
        drop(ctx.async_cancel_point(kernel));
    }
    Ok(())
}

/// Resumes a suspended thread `tid`.
pub fn resume(tid: Tid) -> Result<(), ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    kernel.resume(tid)
}

/// The opaque structure indicating the running thread.
pub struct Current {
    _p: (),
}

impl Current {
    /// Get the current thread's id.
    ///
    /// # Panics
    /// Panics when called outside of a runtime.
    pub fn get_tid() -> Tid {
        with_current(|ctx| ctx.tid)
    }

    /// Exit the current thread with `value`.
    ///
    /// Registered cleanup handlers run first, most recent first, then the
    /// stack unwinds up to the thread's entry. Joiners observe
    /// [`ExitStatus::Exited`] holding `value`.
    ///
    /// Called from a cleanup handler, `value` replaces the status the thread
    /// was terminating with; the remaining handlers still run.
    ///
    /// # Panics
    /// Panics when called outside of a runtime.
    pub fn exit<T: Any + Send + Sync>(value: T) -> ! {
        let ctx = with_current(Rc::clone);
        cancel::exit_with(&ctx, Arc::new(value))
    }

    /// Gives up the processor to the next runnable thread of the same or a
    /// higher priority. This is a cancellation point.
    pub fn yield_now() {
        with_current(|ctx| {
            let mut kernel = ctx.kernel();
            kernel.poll_events(&ctx.shared.events);
            let kernel = ctx.cancel_point(kernel);
            let kernel = ctx.yield_current(kernel);
            drop(ctx.cancel_point(kernel));
        })
    }

    /// Pin current thread not to be preempted.
    ///
    /// When [`PreemptGuard`] is dropped, the current thread is unpinned.
    /// When you hold multiple guards, you **MUST** drop them in reverse order
    /// of creation.
    pub fn pin() -> PreemptGuard {
        PreemptGuard::new()
    }

    /// The current thread's error slot.
    pub fn errno() -> i32 {
        with_current(|ctx| ctx.kernel().threads.linked(ctx.tid).errno)
    }

    /// Overwrites the current thread's error slot.
    pub fn set_errno(errno: i32) {
        with_current(|ctx| ctx.kernel().threads.linked_mut(ctx.tid).errno = errno)
    }

    /// The current thread's priority.
    pub fn priority() -> Priority {
        with_current(|ctx| ctx.kernel().threads.linked(ctx.tid).priority)
    }

    /// Changes the current thread's priority.
    pub fn set_priority(priority: Priority) {
        with_current(|ctx| {
            // The running thread always exists.
            let _ = ctx.kernel().set_priority(ctx.tid, priority);
        })
    }

    /// The current thread's name, if it was given one.
    pub fn name() -> Option<String> {
        with_current(|ctx| ctx.kernel().threads.linked(ctx.tid).name.clone())
    }
}
