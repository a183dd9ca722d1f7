//! Per-thread emulated signals.
//!
//! Every user thread carries its own pending set and signal mask. [`kill`]
//! adds a signal to a thread's pending set; the thread consumes pending
//! signals synchronously with [`sigwait`] or [`sigsuspend`]. There are no
//! asynchronous signal handlers: a signal nobody waits for stays pending.
//! Both waits are cancellation points.
//!
//! Signal numbers are those of [`nix::sys::signal`]; these functions never
//! touch the process's real signal disposition.
pub use nix::sys::signal::Signal;

use crate::{
    ThreadError, cancel, preempt,
    thread::{
        Context, TcbFlags, ThreadState, Tid, WakeReason,
        kern::{KernelGuard, fatal},
        wait::Blocker,
    },
};

use nix::sys::signal::SigSet as OsSigSet;
use std::fmt;

/// A set of signals.
///
/// Two sets are equal exactly when they hold the same signals. Convert
/// from and to [`nix::sys::signal::SigSet`] with [`From`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SigSet(u64);

impl SigSet {
    #[inline]
    fn bit(sig: Signal) -> u64 {
        1 << (sig as i32)
    }

    /// The set without any signal.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set of every signal.
    pub fn all() -> Self {
        Signal::iterator().collect()
    }

    /// Adds `sig` to the set.
    pub fn add(&mut self, sig: Signal) {
        self.0 |= Self::bit(sig);
    }

    /// Removes `sig` from the set.
    pub fn remove(&mut self, sig: Signal) {
        self.0 &= !Self::bit(sig);
    }

    /// Returns true if `sig` is in the set.
    pub fn contains(&self, sig: Signal) -> bool {
        self.0 & Self::bit(sig) != 0
    }

    /// Returns true if the set holds no signal.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The members of the set, lowest-numbered first.
    pub fn iter(&self) -> impl Iterator<Item = Signal> + '_ {
        Signal::iterator().filter(move |&sig| self.contains(sig))
    }
}

impl FromIterator<Signal> for SigSet {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
        let mut set = Self::empty();
        for sig in iter {
            set.add(sig);
        }
        set
    }
}

impl From<&OsSigSet> for SigSet {
    fn from(set: &OsSigSet) -> Self {
        Signal::iterator().filter(|&sig| set.contains(sig)).collect()
    }
}

impl From<SigSet> for OsSigSet {
    fn from(set: SigSet) -> Self {
        let mut os = OsSigSet::empty();
        for sig in set.iter() {
            os.add(sig);
        }
        os
    }
}

impl fmt::Debug for SigSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The lowest-numbered signal of `pending` accepted by `accept`.
fn first_pending(pending: &SigSet, accept: impl Fn(Signal) -> bool) -> Option<Signal> {
    pending.iter().find(|&sig| accept(sig))
}

/// Sends `sig` to thread `tid`.
///
/// A thread waiting for `sig` in [`sigwait`], or in [`sigsuspend`] with `sig`
/// outside its temporary mask, consumes it and becomes runnable. Signals sent
/// to a thread that is already exiting are discarded.
pub fn kill(tid: Tid, sig: Signal) -> Result<(), ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    let th = kernel
        .threads
        .get_mut(tid)
        .ok_or(ThreadError::NoSuchThread)?;
    if th.state == ThreadState::Dead || th.flags.contains(TcbFlags::EXITING) {
        return Ok(());
    }
    th.sig_pending.add(sig);
    let wake = match th.state {
        ThreadState::WaitSigwait if th.sig_wait.contains(sig) => Some(WakeReason::Satisfied),
        ThreadState::WaitSigsuspend if !th.sig_mask.contains(sig) => Some(WakeReason::Interrupted),
        _ => None,
    };
    if let Some(reason) = wake {
        th.sig_pending.remove(sig);
        th.sig_received = Some(sig);
        log::debug!("thread {tid} woken by {sig:?}");
        kernel.force_wake(tid, reason);
    }
    Ok(())
}

/// Blocks in `state` until [`kill`] hands over a signal.
fn wait_for_signal<'a>(
    ctx: &'a Context,
    kernel: KernelGuard<'a>,
    state: ThreadState,
) -> (KernelGuard<'a>, WakeReason, Option<Signal>) {
    let (mut kernel, reason) = ctx.block_cancellable(kernel, state, Blocker::Signal, None);
    let received = kernel.threads.linked_mut(ctx.tid).sig_received.take();
    (kernel, reason, received)
}

/// Waits until a signal in `set` is pending, consumes it and returns it.
///
/// If several are pending already, the lowest-numbered one is returned.
pub fn sigwait(set: &SigSet) -> Result<Signal, ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.cancel_point(ctx.kernel());
    let th = kernel.threads.linked_mut(ctx.tid);
    if let Some(sig) = first_pending(&th.sig_pending, |sig| set.contains(sig)) {
        th.sig_pending.remove(sig);
        return Ok(sig);
    }
    th.sig_wait = *set;

    let (mut kernel, reason, received) = wait_for_signal(&ctx, kernel, ThreadState::WaitSigwait);
    kernel.threads.linked_mut(ctx.tid).sig_wait = SigSet::empty();
    drop(kernel);
    match (reason, received) {
        (WakeReason::Cancelled, _) => cancel::deliver(&ctx),
        (_, Some(sig)) => Ok(sig),
        (_, None) => fatal(format_args!("thread {} left sigwait without a signal", ctx.tid)),
    }
}

/// Replaces the signal mask with `mask` until a signal outside `mask` is
/// pending, then restores the mask and returns the consumed signal.
pub fn sigsuspend(mask: &SigSet) -> Result<Signal, ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.cancel_point(ctx.kernel());
    let th = kernel.threads.linked_mut(ctx.tid);
    let saved = std::mem::replace(&mut th.sig_mask, *mask);
    if let Some(sig) = first_pending(&th.sig_pending, |sig| !mask.contains(sig)) {
        th.sig_pending.remove(sig);
        th.sig_mask = saved;
        return Ok(sig);
    }

    let (mut kernel, reason, received) =
        wait_for_signal(&ctx, kernel, ThreadState::WaitSigsuspend);
    kernel.threads.linked_mut(ctx.tid).sig_mask = saved;
    drop(kernel);
    match (reason, received) {
        (WakeReason::Cancelled, _) => cancel::deliver(&ctx),
        (_, Some(sig)) => Ok(sig),
        (_, None) => fatal(format_args!("thread {} left sigsuspend without a signal", ctx.tid)),
    }
}

/// Replaces the calling thread's signal mask and returns the previous one.
pub fn set_sigmask(mask: &SigSet) -> Result<SigSet, ThreadError> {
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    let th = kernel.threads.linked_mut(ctx.tid);
    Ok(std::mem::replace(&mut th.sig_mask, *mask))
}

/// Signals pending for the calling thread.
pub fn pending() -> Result<SigSet, ThreadError> {
    let ctx = Context::current()?;
    let kernel = ctx.kernel();
    Ok(kernel.threads.linked(ctx.tid).sig_pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_pending_signal_first() {
        let mut pending = SigSet::empty();
        pending.add(Signal::SIGUSR2);
        pending.add(Signal::SIGUSR1);
        pending.add(Signal::SIGHUP);
        assert_eq!(first_pending(&pending, |_| true), Some(Signal::SIGHUP));
        assert_eq!(
            first_pending(&pending, |sig| sig != Signal::SIGHUP),
            Some(Signal::SIGUSR1)
        );
        assert_eq!(first_pending(&pending, |sig| sig == Signal::SIGTERM), None);
    }

    #[test]
    fn sets_compare_by_membership() {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        set.add(Signal::SIGTERM);
        set.remove(Signal::SIGINT);
        assert_eq!(set, [Signal::SIGTERM].into_iter().collect());
        set.remove(Signal::SIGTERM);
        assert_eq!(set, SigSet::empty());
        assert!(set.is_empty());
        assert_eq!(format!("{:?}", SigSet::from_iter([Signal::SIGHUP])), "{SIGHUP}");
    }

    #[test]
    fn converts_to_and_from_os_sets() {
        let set: SigSet = [Signal::SIGUSR1, Signal::SIGCHLD].into_iter().collect();
        let os = OsSigSet::from(set);
        assert!(os.contains(Signal::SIGUSR1) && os.contains(Signal::SIGCHLD));
        assert!(!os.contains(Signal::SIGUSR2));
        assert_eq!(SigSet::from(&os), set);
        assert_eq!(SigSet::from(&OsSigSet::all()), SigSet::all());
    }
}
