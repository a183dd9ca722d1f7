//! Scheduler core.
//!
//! [`Kernel`] holds every piece of mutable runtime state: the thread table,
//! the run queue, the timer set and the fd interest table. It lives behind a
//! single [`SpinLock`], and taking that lock masks preemption, so every
//! mutation of a queue or of a thread's state happens with preemption masked.
//!
//! Switching threads is a hand-over of the run baton. The outgoing thread
//! picks its successor, publishes it in [`Shared::running`], releases the
//! kernel lock and unparks the successor's OS thread. Then it parks until the
//! baton comes back.
use super::{
    Context, ExitStatus, Priority, TcbFlags, Thread, ThreadBody, ThreadBuilder, ThreadState, Tid,
    scheduler::{Fifo, PriorityRoundRobin, Scheduler},
    table::ThreadTable,
    wait::{Blocker, Direction, WaitList, WakeReason},
};
use crate::{
    ThreadError, cancel,
    config::{Config, SchedPolicy},
    preempt::{Event, EventQueue},
    sync::spinlock::{SpinLock, SpinLockGuard},
};
use crossbeam_utils::sync::{Parker, Unparker};
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, FdFlag, OFlag, fcntl},
    poll::{PollFd, PollFlags, poll},
    unistd,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

/// Locked view of the [`Kernel`].
pub(crate) type KernelGuard<'a> = SpinLockGuard<'a, Kernel>;

/// Reports a broken scheduler invariant and aborts the process.
#[cold]
pub(crate) fn fatal(what: fmt::Arguments<'_>) -> ! {
    log::error!("uthread: {what}");
    std::process::abort()
}

/// Events that wake readers of an fd.
fn readable() -> PollFlags {
    PollFlags::POLLIN | PollFlags::POLLPRI | always()
}

/// Events that wake writers of an fd.
fn writable() -> PollFlags {
    PollFlags::POLLOUT | always()
}

/// Events reported whether or not they were asked for.
fn always() -> PollFlags {
    PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL
}

/// Mutable runtime state.
pub(crate) struct Kernel {
    pub(crate) threads: ThreadTable,
    sched: Box<dyn Scheduler>,
    current: Option<Tid>,
    live: usize,
    max_threads: usize,
    timers: BTreeSet<(Instant, Tid)>,
    fd_waiters: BTreeMap<(RawFd, Direction), WaitList>,
    poll_waiters: WaitList,
    pending_ticks: usize,
    pub(crate) main_status: Option<ExitStatus>,
}

impl Kernel {
    pub(crate) fn new(config: &Config) -> Self {
        let sched: Box<dyn Scheduler> = match config.policy {
            SchedPolicy::Priority => Box::new(PriorityRoundRobin::new(config.time_slice)),
            SchedPolicy::Fifo => Box::new(Fifo::new()),
        };
        Self {
            threads: ThreadTable::new(),
            sched,
            current: None,
            live: 0,
            max_threads: config.max_threads,
            timers: BTreeSet::new(),
            fd_waiters: BTreeMap::new(),
            poll_waiters: WaitList::new(),
            pending_ticks: 0,
            main_status: None,
        }
    }

    fn pick_next(&mut self) -> Option<Tid> {
        self.sched.next_to_run(&mut self.threads)
    }

    fn dispatch(&mut self, tid: Tid) {
        self.threads.linked_mut(tid).set_state(ThreadState::Running);
        self.current = Some(tid);
        self.sched.dispatched(tid);
        self.pending_ticks = 0;
    }

    /// Puts `tid` at the tail of its run-queue level.
    pub(crate) fn make_runnable(&mut self, tid: Tid) {
        self.threads
            .linked_mut(tid)
            .set_state(ThreadState::Runnable);
        self.sched.push_to_queue(&mut self.threads, tid);
    }

    /// Ends the wait of `tid`, whose blocker was already detached.
    pub(crate) fn resolve(&mut self, tid: Tid, reason: WakeReason) {
        let th = self.threads.linked_mut(tid);
        th.blocker = None;
        th.poll_set.clear();
        th.wake = Some(reason);
        let deadline = th.deadline.take();
        let suspend = th.flags.contains(TcbFlags::SUSPEND_PENDING) && reason != WakeReason::Cancelled;
        th.flags.remove(TcbFlags::SUSPEND_PENDING);
        if suspend {
            th.set_state(ThreadState::Suspended);
            th.blocker = Some(Blocker::Suspend);
        }
        if let Some(deadline) = deadline {
            self.timers.remove(&(deadline, tid));
        }
        if !suspend {
            self.make_runnable(tid);
        }
    }

    /// Detaches `tid` from whatever it waits on.
    fn unlink_blocker(&mut self, tid: Tid) {
        let Some(blocker) = self.threads.linked_mut(tid).blocker.take() else {
            return;
        };
        match blocker {
            Blocker::Queue(source) => {
                source.unlink(&mut self.threads, tid);
            }
            Blocker::Join(target) => {
                if let Some(mut joiners) = self.threads.get(target).map(|th| th.joiners) {
                    joiners.remove(&mut self.threads, tid);
                    self.threads.linked_mut(target).joiners = joiners;
                }
            }
            Blocker::Fd(fd, dir) => {
                if let Some(list) = self.fd_waiters.get_mut(&(fd, dir)) {
                    list.remove(&mut self.threads, tid);
                    if list.is_empty() {
                        self.fd_waiters.remove(&(fd, dir));
                    }
                }
            }
            Blocker::Poll => {
                self.poll_waiters.remove(&mut self.threads, tid);
            }
            Blocker::Sleep | Blocker::Signal | Blocker::Suspend => {}
        }
    }

    /// Pulls `tid` out of its wait, regardless of what it waited for.
    pub(crate) fn force_wake(&mut self, tid: Tid, reason: WakeReason) {
        self.unlink_blocker(tid);
        self.resolve(tid, reason);
    }

    /// Returns the wake reason of `tid`, which just got the processor back.
    fn take_wake(&mut self, tid: Tid) -> WakeReason {
        let th = self.threads.linked_mut(tid);
        match th.wake.take().unwrap_or(WakeReason::Satisfied) {
            WakeReason::Satisfied if th.async_cancel_due() => WakeReason::Cancelled,
            wake => wake,
        }
    }

    pub(crate) fn arm_timer(&mut self, tid: Tid, deadline: Instant) {
        self.threads.linked_mut(tid).deadline = Some(deadline);
        self.timers.insert((deadline, tid));
    }

    fn expire_timers(&mut self, now: Instant) {
        while let Some(&(deadline, tid)) = self.timers.first() {
            if deadline > now {
                break;
            }
            self.timers.pop_first();
            self.threads.linked_mut(tid).deadline = None;
            self.force_wake(tid, WakeReason::TimedOut);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.first().map(|&(deadline, _)| deadline)
    }

    /// Queues `tid` until `fd` is ready in direction `dir`.
    pub(crate) fn register_fd(&mut self, tid: Tid, fd: RawFd, dir: Direction) {
        self.fd_waiters
            .entry((fd, dir))
            .or_default()
            .push_back(&mut self.threads, tid);
    }

    /// Queues `tid` until one of `set` reports an event.
    pub(crate) fn register_poll(&mut self, tid: Tid, set: Vec<(RawFd, PollFlags)>) {
        self.threads.linked_mut(tid).poll_set = set;
        self.poll_waiters.push_back(&mut self.threads, tid);
    }

    /// Union of all fd interests, one entry per fd.
    fn interests(&self) -> Vec<(RawFd, PollFlags)> {
        let mut merged: BTreeMap<RawFd, PollFlags> = BTreeMap::new();
        for &(fd, dir) in self.fd_waiters.keys() {
            *merged.entry(fd).or_insert(PollFlags::empty()) |= match dir {
                Direction::Read => PollFlags::POLLIN,
                Direction::Write => PollFlags::POLLOUT,
            };
        }
        for tid in self.poll_waiters.iter(&self.threads) {
            for &(fd, events) in &self.threads.linked(tid).poll_set {
                *merged.entry(fd).or_insert(PollFlags::empty()) |= events;
            }
        }
        merged.into_iter().collect()
    }

    fn wake_fd(&mut self, fd: RawFd, dir: Direction) {
        if let Some(mut list) = self.fd_waiters.remove(&(fd, dir)) {
            for tid in list.drain(&mut self.threads) {
                self.resolve(tid, WakeReason::Satisfied);
            }
        }
    }

    /// Wakes exactly the threads whose interest is met by `ready`.
    fn dispatch_readiness(&mut self, ready: &[(RawFd, PollFlags)]) {
        for &(fd, revents) in ready {
            if revents.intersects(readable()) {
                self.wake_fd(fd, Direction::Read);
            }
            if revents.intersects(writable()) {
                self.wake_fd(fd, Direction::Write);
            }
        }
        if self.poll_waiters.is_empty() || ready.is_empty() {
            return;
        }
        let hit: Vec<Tid> = self
            .poll_waiters
            .iter(&self.threads)
            .filter(|&tid| {
                self.threads.linked(tid).poll_set.iter().any(|&(fd, events)| {
                    ready
                        .iter()
                        .any(|&(rfd, revents)| rfd == fd && revents.intersects(events | always()))
                })
            })
            .collect();
        for tid in hit {
            self.poll_waiters.remove(&mut self.threads, tid);
            self.resolve(tid, WakeReason::Satisfied);
        }
    }

    /// Drains asynchronous events, expires timers and checks fd readiness
    /// without blocking.
    pub(crate) fn poll_events(&mut self, events: &EventQueue) {
        while let Some(event) = events.pop() {
            match event {
                Event::Tick => self.pending_ticks += 1,
                Event::Cancel(tid) => {
                    if let Err(e) = self.request_cancel(tid) {
                        log::debug!("remote cancellation of {tid} dropped: {e}");
                    }
                }
            }
        }
        self.expire_timers(Instant::now());
        if self.fd_waiters.is_empty() && self.poll_waiters.is_empty() {
            return;
        }
        let interests = self.interests();
        let mut fds: Vec<PollFd> = interests
            .iter()
            .map(|&(fd, events)| PollFd::new(fd, events))
            .collect();
        if let Ok(n) = poll(&mut fds, 0)
            && n > 0
        {
            let ready = ready_set(&interests, &fds);
            self.dispatch_readiness(&ready);
        }
    }

    /// Charges the pending ticks to the running thread. Returns true if its
    /// slice ran out.
    pub(crate) fn consume_ticks(&mut self) -> bool {
        let mut expired = false;
        while self.pending_ticks > 0 {
            self.pending_ticks -= 1;
            expired |= self.sched.timer_tick();
        }
        expired
    }

    /// Sets the pending cancellation flag of `tid` and, if the target is
    /// interruptible right now, pulls it out of its wait.
    pub(crate) fn request_cancel(&mut self, tid: Tid) -> Result<(), ThreadError> {
        let th = self.threads.get_mut(tid).ok_or(ThreadError::NoSuchThread)?;
        if th.state == ThreadState::Dead || th.flags.contains(TcbFlags::EXITING) {
            return Ok(());
        }
        th.flags.insert(TcbFlags::CANCELLING);
        let interrupt = !th.flags.contains(TcbFlags::CANCEL_DISABLED)
            && th
                .flags
                .intersects(TcbFlags::CANCEL_ASYNC | TcbFlags::AT_CANCEL_POINT)
            && (th.state.is_waiting() || th.state == ThreadState::Suspended);
        log::debug!("cancellation requested for {tid} ({:?})", th.state);
        if interrupt {
            self.force_wake(tid, WakeReason::Cancelled);
        }
        Ok(())
    }

    pub(crate) fn set_priority(&mut self, tid: Tid, priority: Priority) -> Result<(), ThreadError> {
        let th = self.threads.get_mut(tid).ok_or(ThreadError::NoSuchThread)?;
        if th.state == ThreadState::Runnable && self.sched.remove(&mut self.threads, tid) {
            self.threads.linked_mut(tid).priority = priority;
            self.sched.push_to_queue(&mut self.threads, tid);
        } else {
            self.threads.linked_mut(tid).priority = priority;
        }
        Ok(())
    }

    pub(crate) fn suspend(&mut self, tid: Tid) -> Result<(), ThreadError> {
        let th = self.threads.get_mut(tid).ok_or(ThreadError::NoSuchThread)?;
        match th.state {
            ThreadState::Dead | ThreadState::Exiting | ThreadState::Suspended => {}
            ThreadState::Running | ThreadState::Runnable => {
                if th.state == ThreadState::Runnable {
                    self.sched.remove(&mut self.threads, tid);
                }
                let th = self.threads.linked_mut(tid);
                th.set_state(ThreadState::Suspended);
                th.blocker = Some(Blocker::Suspend);
            }
            _ => th.flags.insert(TcbFlags::SUSPEND_PENDING),
        }
        Ok(())
    }

    pub(crate) fn resume(&mut self, tid: Tid) -> Result<(), ThreadError> {
        let th = self.threads.get_mut(tid).ok_or(ThreadError::NoSuchThread)?;
        if th.flags.contains(TcbFlags::SUSPEND_PENDING) {
            th.flags.remove(TcbFlags::SUSPEND_PENDING);
        } else if th.state == ThreadState::Suspended {
            th.blocker = None;
            self.make_runnable(tid);
        }
        Ok(())
    }

    /// Moves `tid` to `Dead`, hands its status to the joiners and reaps it if
    /// nobody else will.
    pub(crate) fn exit_thread(&mut self, tid: Tid, status: ExitStatus) {
        self.unlink_blocker(tid);
        let th = self.threads.linked_mut(tid);
        th.flags.insert(TcbFlags::EXITING);
        th.set_state(ThreadState::Exiting);
        let owned = std::mem::take(&mut th.owned);
        let deadline = th.deadline.take();
        for mutex in owned {
            log::warn!("thread {tid} exited while holding a mutex; releasing it");
            mutex.release_all(self, tid);
        }
        if let Some(deadline) = deadline {
            self.timers.remove(&(deadline, tid));
        }

        let th = self.threads.linked_mut(tid);
        th.flags.remove(TcbFlags::CANCELLING | TcbFlags::AT_CANCEL_POINT);
        th.set_state(ThreadState::Dead);
        th.exit_status = Some(status.clone());
        let reap_now = th.flags.contains(TcbFlags::DETACHED);
        let main = th.flags.contains(TcbFlags::MAIN);
        let mut joiners = std::mem::take(&mut th.joiners);

        let waiting = joiners.drain(&mut self.threads);
        for &joiner in &waiting {
            self.threads.linked_mut(joiner).join_slot = Some(status.clone());
            self.resolve(joiner, WakeReason::Satisfied);
        }
        if main {
            self.main_status = Some(status);
        }
        self.live -= 1;
        if self.current == Some(tid) {
            self.current = None;
        }
        if reap_now || !waiting.is_empty() {
            self.threads.remove(tid);
        }
    }
}

fn ready_set(interests: &[(RawFd, PollFlags)], fds: &[PollFd]) -> Vec<(RawFd, PollFlags)> {
    interests
        .iter()
        .zip(fds)
        .filter_map(|(&(fd, _), pfd)| {
            pfd.revents()
                .filter(|revents| !revents.is_empty())
                .map(|revents| (fd, revents))
        })
        .collect()
}

/// Milliseconds until `deadline`, rounded up.
fn poll_timeout(deadline: Instant) -> i32 {
    let left = deadline.saturating_duration_since(Instant::now());
    left.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as i32
}

const NO_THREAD: u64 = u64::MAX;

/// Runtime state shared by every backing OS thread.
pub(crate) struct Shared {
    pub(crate) kernel: SpinLock<Kernel>,
    pub(crate) events: Arc<EventQueue>,
    running: AtomicU64,
    wake_rx: RawFd,
    wake_tx: RawFd,
    pub(crate) config: Config,
    finished: AtomicBool,
    outer: Unparker,
    os_threads: SpinLock<Vec<std::thread::JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn new(config: Config, outer: Unparker) -> Result<Self, ThreadError> {
        let (wake_rx, wake_tx) = unistd::pipe()?;
        for fd in [wake_rx, wake_tx] {
            fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }
        Ok(Self {
            kernel: SpinLock::new(Kernel::new(&config)),
            events: Arc::new(EventQueue::new()),
            running: AtomicU64::new(NO_THREAD),
            wake_rx,
            wake_tx,
            config,
            finished: AtomicBool::new(false),
            outer,
            os_threads: SpinLock::new(Vec::new()),
        })
    }

    /// The thread holding the run baton.
    pub(crate) fn running(&self) -> Option<Tid> {
        match self.running.load(Ordering::Acquire) {
            NO_THREAD => None,
            raw => Some(Tid::from_raw(raw)),
        }
    }

    /// Hands the run baton to `tid` and wakes its OS thread.
    pub(crate) fn hand_over(&self, kernel: KernelGuard<'_>, tid: Tid) {
        let unparker = kernel.threads.linked(tid).unparker.clone();
        self.running.store(tid.into_raw(), Ordering::Release);
        drop(kernel);
        unparker.unpark();
    }

    /// Dispatches the first thread from outside the runtime.
    pub(crate) fn launch(&self) {
        let mut kernel = self.kernel.lock();
        match kernel.pick_next() {
            Some(first) => {
                kernel.dispatch(first);
                self.hand_over(kernel, first);
            }
            None => fatal(format_args!("runtime launched without a thread")),
        }
    }

    /// Interrupts an idle wait of the scheduler.
    pub(crate) fn poke(&self) {
        let _ = unistd::write(self.wake_tx, &[1]);
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = unistd::read(self.wake_rx, &mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn finish(&self) {
        log::debug!("all threads exited");
        self.running.store(NO_THREAD, Ordering::Release);
        self.finished.store(true, Ordering::Release);
        self.outer.unpark();
    }

    /// Takes the handles of every backing OS thread spawned so far.
    pub(crate) fn take_os_threads(&self) -> Vec<std::thread::JoinHandle<()>> {
        std::mem::take(&mut *self.os_threads.lock())
    }

    /// Creates a thread and its backing OS thread, and makes it runnable.
    pub(crate) fn spawn_thread(
        self: &Arc<Self>,
        kernel: &mut Kernel,
        builder: ThreadBuilder,
        flags: TcbFlags,
        body: ThreadBody,
    ) -> Result<Tid, ThreadError> {
        let (name, priority, detached, stack_size) = builder.into_parts();
        if kernel.threads.len() >= kernel.max_threads {
            log::debug!("thread limit of {} reached", kernel.max_threads);
            return Err(ThreadError::Again);
        }
        let flags = if detached {
            flags | TcbFlags::DETACHED
        } else {
            flags
        };
        let priority = priority.unwrap_or(Priority::DEFAULT);
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let tid = kernel
            .threads
            .insert_with(|tid| Thread::new(tid, name.clone(), priority, flags, unparker));

        let mut os = std::thread::Builder::new().stack_size(stack_size.unwrap_or(self.config.stack_size));
        if let Some(name) = name {
            os = os.name(name);
        }
        let shared = self.clone();
        match os.spawn(move || super::thread_start(shared, tid, parker, body)) {
            Ok(handle) => {
                let mut os_threads = self.os_threads.lock();
                os_threads.retain(|handle| !handle.is_finished());
                os_threads.push(handle);
            }
            Err(e) => {
                log::warn!("no backing OS thread for a new thread: {e}");
                kernel.threads.remove(tid);
                return Err(ThreadError::Again);
            }
        }
        kernel.live += 1;
        kernel.make_runnable(tid);
        log::debug!("thread {tid} spawned at priority {}", priority.get());
        Ok(tid)
    }

    /// Blocks in `poll(2)` until an interest resolves, the nearest deadline
    /// passes or somebody pokes the runtime.
    fn idle<'a>(&'a self, kernel: KernelGuard<'a>) -> KernelGuard<'a> {
        let interests = kernel.interests();
        let deadline = kernel.next_deadline();
        if interests.is_empty() && deadline.is_none() {
            for th in kernel.threads.iter() {
                log::error!("  thread {} ({:?}) blocked on {:?}", th.tid, th.state, th.blocker);
            }
            fatal(format_args!(
                "deadlock: {} live threads, none runnable and nothing to wait for",
                kernel.live
            ));
        }
        drop(kernel);

        let mut fds: Vec<PollFd> = std::iter::once(PollFd::new(self.wake_rx, PollFlags::POLLIN))
            .chain(interests.iter().map(|&(fd, events)| PollFd::new(fd, events)))
            .collect();
        let timeout = deadline.map_or(-1, poll_timeout);
        log::trace!("idle: {} fds, timeout {timeout}ms", interests.len());
        match poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => fatal(format_args!("idle poll failed: {e}")),
        }
        self.drain_wake_pipe();

        let ready = ready_set(&interests, &fds[1..]);
        let mut kernel = self.kernel.lock();
        kernel.dispatch_readiness(&ready);
        kernel
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = unistd::close(self.wake_rx);
        let _ = unistd::close(self.wake_tx);
    }
}

impl Context {
    /// Picks the next thread to run, idling until one becomes runnable.
    fn select_next<'a>(&'a self, mut kernel: KernelGuard<'a>) -> (KernelGuard<'a>, Tid) {
        kernel.current = None;
        loop {
            kernel.poll_events(&self.shared.events);
            if let Some(next) = kernel.pick_next() {
                return (kernel, next);
            }
            kernel = self.shared.idle(kernel);
        }
    }

    /// Gives up the processor. The caller already moved itself out of
    /// `Running`; the function returns once it is dispatched again.
    pub(crate) fn reschedule<'a>(&'a self, kernel: KernelGuard<'a>) -> KernelGuard<'a> {
        let (mut kernel, next) = self.select_next(kernel);
        kernel.dispatch(next);
        if next == self.tid {
            return kernel;
        }
        log::trace!("switch {} -> {next} ({} runnable)", self.tid, kernel.sched.len());
        self.shared.hand_over(kernel, next);
        while self.shared.running() != Some(self.tid) {
            self.parker.park();
        }
        self.kernel()
    }

    /// Hands the processor away for good. The calling thread is `Dead`.
    pub(crate) fn exit_switch(&self, kernel: KernelGuard<'_>) {
        if kernel.live == 0 {
            drop(kernel);
            self.shared.finish();
            return;
        }
        let (mut kernel, next) = self.select_next(kernel);
        kernel.dispatch(next);
        log::trace!("switch {} -> {next} (exit)", self.tid);
        self.shared.hand_over(kernel, next);
    }

    /// Moves the calling thread to the tail of its run-queue level and
    /// reschedules.
    pub(crate) fn yield_current<'a>(&'a self, mut kernel: KernelGuard<'a>) -> KernelGuard<'a> {
        kernel.make_runnable(self.tid);
        self.reschedule(kernel)
    }

    /// Blocks the calling thread in `state` until its wait resolves.
    ///
    /// The caller links itself into the queue that `blocker` names before
    /// calling this. With a `deadline`, the wait ends with
    /// [`WakeReason::TimedOut`] once it passes.
    pub(crate) fn block<'a>(
        &'a self,
        mut kernel: KernelGuard<'a>,
        state: ThreadState,
        blocker: Blocker,
        deadline: Option<Instant>,
    ) -> (KernelGuard<'a>, WakeReason) {
        let th = kernel.threads.linked_mut(self.tid);
        th.set_state(state);
        th.blocker = Some(blocker);
        th.wake = None;
        if let Some(deadline) = deadline {
            kernel.arm_timer(self.tid, deadline);
        }
        let mut kernel = self.reschedule(kernel);
        let reason = kernel.take_wake(self.tid);
        (kernel, reason)
    }

    /// [`Context::block`] inside a cancellation point.
    pub(crate) fn block_cancellable<'a>(
        &'a self,
        mut kernel: KernelGuard<'a>,
        state: ThreadState,
        blocker: Blocker,
        deadline: Option<Instant>,
    ) -> (KernelGuard<'a>, WakeReason) {
        let me = self.tid;
        kernel.threads.linked_mut(me).flags.insert(TcbFlags::AT_CANCEL_POINT);
        let (mut kernel, reason) = self.block(kernel, state, blocker, deadline);
        kernel.threads.linked_mut(me).flags.remove(TcbFlags::AT_CANCEL_POINT);
        (kernel, reason)
    }

    /// Disables cancellation of the calling thread. Returns whether it was
    /// disabled already.
    pub(crate) fn mask_cancel(&self) -> bool {
        let mut kernel = self.kernel();
        let flags = &mut kernel.threads.linked_mut(self.tid).flags;
        let disabled = flags.contains(TcbFlags::CANCEL_DISABLED);
        flags.insert(TcbFlags::CANCEL_DISABLED);
        disabled
    }

    /// Undoes [`Context::mask_cancel`].
    pub(crate) fn unmask_cancel(&self, disabled: bool) {
        if !disabled {
            self.kernel()
                .threads
                .linked_mut(self.tid)
                .flags
                .remove(TcbFlags::CANCEL_DISABLED);
        }
    }

    /// Acts on a pending cancellation, if it is enabled.
    ///
    /// Never acts while the thread is already unwinding.
    pub(crate) fn cancel_point<'a>(&'a self, kernel: KernelGuard<'a>) -> KernelGuard<'a> {
        if kernel.threads.linked(self.tid).cancel_due() && !std::thread::panicking() {
            drop(kernel);
            cancel::deliver(self);
        }
        kernel
    }

    /// Acts on a pending asynchronous cancellation.
    pub(crate) fn async_cancel_point<'a>(&'a self, kernel: KernelGuard<'a>) -> KernelGuard<'a> {
        if kernel.threads.linked(self.tid).async_cancel_due() && !std::thread::panicking() {
            drop(kernel);
            cancel::deliver(self);
        }
        kernel
    }
}
