//! Thread cancellation.
//!
//! A thread asks another one to terminate with [`cancel`]. The target acts on
//! the request depending on its cancel state and type:
//!
//! - While the state is [`CancelState::Disabled`], the request stays pending.
//! - With [`CancelType::Deferred`] (the default), the request is acted on at
//!   the next cancellation point: waiting on a condition variable, joining,
//!   waiting on an fd, polling, sleeping, waiting for a signal, waiting on a
//!   semaphore, [`Current::yield_now`](crate::Current::yield_now) and
//!   [`test_cancel`]. A thread already blocked in a cancellation point is
//!   pulled out of its wait.
//! - With [`CancelType::Asynchronous`], the request is acted on at the next
//!   reentry point, and a thread blocked anywhere (a mutex included) is
//!   pulled out of its wait.
//!
//! Acting on a request runs the thread's cleanup handlers, most recent first,
//! and then unwinds its stack up to the thread's entry; dropping the frames
//! releases whatever RAII guards they hold. Joiners observe
//! [`ExitStatus::Canceled`].
//!
//! The unwind uses [`std::panic::resume_unwind`] with a private payload. Code
//! that catches unwinds with [`std::panic::catch_unwind`] must resume them
//! if the payload is not its own.
use crate::{
    ThreadError,
    preempt,
    thread::{Context, ExitStatus, TcbFlags, Tid, with_current},
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// Whether cancellation requests are acted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelState {
    /// Requests are acted on according to the [`CancelType`].
    Enabled,
    /// Requests stay pending.
    Disabled,
}

/// When cancellation requests are acted on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelType {
    /// At cancellation points only.
    Deferred,
    /// At any reentry point.
    Asynchronous,
}

/// Payload of the unwind that terminates a thread.
enum Unwind {
    Canceled,
    Exit(Arc<dyn Any + Send + Sync>),
}

/// Runs the calling thread's cleanup handlers, most recent first.
///
/// A handler that exits or is canceled does not keep the remaining ones from
/// running. The termination of the last such handler is returned; it
/// replaces the thread's exit status.
pub(crate) fn run_cleanup(ctx: &Context) -> Option<Box<dyn Any + Send>> {
    let mut terminated = None;
    loop {
        let handler = ctx.kernel().threads.linked_mut(ctx.tid).cleanup.pop();
        let Some(handler) = handler else {
            break;
        };
        match panic::catch_unwind(AssertUnwindSafe(handler)) {
            Ok(()) => {}
            Err(payload) if payload.is::<Unwind>() => terminated = Some(payload),
            Err(_) => log::warn!("thread {}: cleanup handler panicked", ctx.tid),
        }
    }
    terminated
}

/// Marks the calling thread as exiting. Further requests are no-ops.
fn begin_exit(ctx: &Context) {
    let mut kernel = ctx.kernel();
    let th = kernel.threads.linked_mut(ctx.tid);
    th.flags.insert(TcbFlags::EXITING);
    th.flags
        .remove(TcbFlags::CANCELLING | TcbFlags::AT_CANCEL_POINT);
}

/// Acts on the pending cancellation of the calling thread.
///
/// Must be called without the kernel lock.
pub(crate) fn deliver(ctx: &Context) -> ! {
    log::debug!("thread {} acts on cancellation", ctx.tid);
    begin_exit(ctx);
    let payload = run_cleanup(ctx);
    panic::resume_unwind(payload.unwrap_or_else(|| Box::new(Unwind::Canceled)))
}

/// Terminates the calling thread with `value`.
pub(crate) fn exit_with(ctx: &Context, value: Arc<dyn Any + Send + Sync>) -> ! {
    begin_exit(ctx);
    let payload = run_cleanup(ctx);
    panic::resume_unwind(payload.unwrap_or_else(|| Box::new(Unwind::Exit(value))))
}

/// Turns the payload of an unwind that reached a thread's entry into its
/// exit status.
pub(crate) fn classify(payload: Box<dyn Any + Send>) -> ExitStatus {
    match payload.downcast::<Unwind>() {
        Ok(unwind) => match *unwind {
            Unwind::Canceled => ExitStatus::Canceled,
            Unwind::Exit(value) => ExitStatus::Exited(value),
        },
        Err(payload) => {
            let msg: Arc<str> = if let Some(msg) = payload.downcast_ref::<&str>() {
                (*msg).into()
            } else if let Some(msg) = payload.downcast_ref::<String>() {
                msg.as_str().into()
            } else {
                "Box<dyn Any>".into()
            };
            ExitStatus::Panicked(msg)
        }
    }
}

/// Acts on a pending asynchronous cancellation of the calling thread.
pub(crate) fn test_async(ctx: &Context) {
    drop(ctx.async_cancel_point(ctx.kernel()));
}

/// Requests cancellation of thread `tid`.
///
/// Returns immediately; use [`join`](crate::thread::join) to wait until the
/// target terminated. Requests against a thread that is already exiting or
/// dead are ignored. Cancelling the calling thread with the asynchronous type
/// acts on the request before returning.
pub fn cancel(tid: Tid) -> Result<(), ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    kernel.request_cancel(tid)?;
    if tid == ctx.tid {
        drop(ctx.async_cancel_point(kernel));
    }
    Ok(())
}

/// A cancellation point: acts on a pending, enabled cancellation request.
///
/// Does nothing outside a runtime.
pub fn test_cancel() {
    preempt::preempt_point();
    if let Some(ctx) = Context::try_current() {
        drop(ctx.cancel_point(ctx.kernel()));
    }
}

/// Sets the cancel state of the calling thread and returns the previous one.
///
/// Enabling cancellation while the type is asynchronous and a request is
/// pending acts on it before returning.
pub fn set_cancel_state(state: CancelState) -> Result<CancelState, ThreadError> {
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    let flags = &mut kernel.threads.linked_mut(ctx.tid).flags;
    let old = if flags.contains(TcbFlags::CANCEL_DISABLED) {
        CancelState::Disabled
    } else {
        CancelState::Enabled
    };
    flags.set(TcbFlags::CANCEL_DISABLED, state == CancelState::Disabled);
    drop(ctx.async_cancel_point(kernel));
    Ok(old)
}

/// Sets the cancel type of the calling thread and returns the previous one.
///
/// Switching to the asynchronous type while a request is pending and
/// cancellation is enabled acts on it before returning.
pub fn set_cancel_type(ty: CancelType) -> Result<CancelType, ThreadError> {
    let ctx = Context::current()?;
    let mut kernel = ctx.kernel();
    let flags = &mut kernel.threads.linked_mut(ctx.tid).flags;
    let old = if flags.contains(TcbFlags::CANCEL_ASYNC) {
        CancelType::Asynchronous
    } else {
        CancelType::Deferred
    };
    flags.set(TcbFlags::CANCEL_ASYNC, ty == CancelType::Asynchronous);
    drop(ctx.async_cancel_point(kernel));
    Ok(old)
}

/// Pushes a cleanup handler onto the calling thread's cleanup stack.
///
/// Handlers left on the stack run, most recent first, when the thread acts on
/// a cancellation request, calls [`Current::exit`](crate::Current::exit) or
/// returns.
///
/// # Panics
/// Panics when called outside of a runtime.
pub fn cleanup_push<F>(handler: F)
where
    F: FnOnce() + Send + 'static,
{
    with_current(|ctx| {
        ctx.kernel()
            .threads
            .linked_mut(ctx.tid)
            .cleanup
            .push(Box::new(handler));
    })
}

/// Pops the most recent cleanup handler, running it if `execute` is true.
///
/// Returns false if the cleanup stack was empty.
///
/// # Panics
/// Panics when called outside of a runtime.
pub fn cleanup_pop(execute: bool) -> bool {
    let handler = with_current(|ctx| ctx.kernel().threads.linked_mut(ctx.tid).cleanup.pop());
    match handler {
        Some(handler) => {
            if execute {
                handler();
            }
            true
        }
        None => false,
    }
}
