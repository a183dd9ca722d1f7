//! Blocking I/O and timers that block only the calling user thread.
//!
//! Every wrapped call first tries the operation without blocking; the fd is
//! switched to `O_NONBLOCK` on first use. If the operation would block, the
//! calling thread registers its interest in the fd and direction, moves to
//! [`ThreadState::WaitFdRead`] or [`ThreadState::WaitFdWrite`] and gives up
//! the processor. The scheduler folds the interests of all waiting threads
//! into a single `poll(2)` and wakes exactly the threads whose interest is
//! met; readers and writers of one fd resolve independently.
//!
//! All functions here are cancellation points. A failed call also stores its
//! errno in the thread's error slot, see [`Current::errno`].
//!
//! [`Current::errno`]: crate::Current::errno
pub use crate::thread::Direction;
pub use nix::poll::PollFlags;

use crate::{
    ThreadError, cancel, preempt,
    thread::{Context, ThreadState, WakeReason, wait::Blocker},
};
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, OFlag, fcntl},
    poll::PollFd,
    sys::socket::{self, SockaddrLike, sockopt},
    unistd,
};
use std::{
    os::fd::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

/// One fd of a [`poll`] set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollEntry {
    /// The polled fd.
    pub fd: RawFd,
    /// Events of interest.
    pub events: PollFlags,
    /// Events that occurred, filled in by [`poll`].
    pub revents: PollFlags,
}

impl PollEntry {
    /// Interest in `events` on `fd`.
    pub fn new(fd: RawFd, events: PollFlags) -> Self {
        Self {
            fd,
            events,
            revents: PollFlags::empty(),
        }
    }
}

/// Enters a wrapped call: a reentry point and a cancellation point.
fn enter() -> Result<Rc<Context>, ThreadError> {
    preempt::preempt_point();
    let ctx = Context::current()?;
    drop(ctx.cancel_point(ctx.kernel()));
    Ok(ctx)
}

/// Stores the errno of a failed call in the caller's error slot.
fn record<R>(result: Result<R, ThreadError>) -> Result<R, ThreadError> {
    if let Err(e) = &result
        && let Some(ctx) = Context::try_current()
    {
        ctx.kernel().threads.linked_mut(ctx.tid).errno = e.errno() as i32;
    }
    result
}

fn set_nonblocking(fd: RawFd) -> Result<(), ThreadError> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

/// Waits until `fd` is ready in direction `dir`.
fn block_on_fd(
    ctx: &Context,
    fd: RawFd,
    dir: Direction,
    deadline: Option<Instant>,
) -> Result<(), ThreadError> {
    let mut kernel = ctx.kernel();
    kernel.register_fd(ctx.tid, fd, dir);
    let state = match dir {
        Direction::Read => ThreadState::WaitFdRead,
        Direction::Write => ThreadState::WaitFdWrite,
    };
    let (kernel, reason) = ctx.block_cancellable(kernel, state, Blocker::Fd(fd, dir), deadline);
    drop(kernel);
    match reason {
        WakeReason::Cancelled => cancel::deliver(ctx),
        WakeReason::TimedOut => Err(Errno::ETIMEDOUT.into()),
        WakeReason::Satisfied | WakeReason::Interrupted => check_open(fd),
    }
}

/// Fails with `EBADF` if `fd` is not an open descriptor. `poll(2)` reports
/// such an fd as ready, with `POLLNVAL`.
fn check_open(fd: RawFd) -> Result<(), ThreadError> {
    let mut entry = [PollEntry::new(fd, PollFlags::empty())];
    poll_now(&mut entry)?;
    if entry[0].revents.contains(PollFlags::POLLNVAL) {
        return Err(Errno::EBADF.into());
    }
    Ok(())
}

/// Runs `op` until it stops reporting `EAGAIN`, waiting for `fd` in between.
fn retry<R>(
    fd: RawFd,
    dir: Direction,
    mut op: impl FnMut() -> nix::Result<R>,
) -> Result<R, ThreadError> {
    let ctx = enter()?;
    set_nonblocking(fd)?;
    loop {
        match op() {
            Ok(r) => return Ok(r),
            Err(Errno::EAGAIN) => block_on_fd(&ctx, fd, dir, None)?,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reads from `fd` into `buf`, blocking the calling thread until data is
/// available. Returns the number of bytes read; zero means end of file.
pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize, ThreadError> {
    record(retry(fd, Direction::Read, || unistd::read(fd, buf)))
}

/// Writes `buf` to `fd`, blocking the calling thread until some of it is
/// accepted. Returns the number of bytes written.
pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize, ThreadError> {
    record(retry(fd, Direction::Write, || unistd::write(fd, buf)))
}

/// Accepts a connection on the listening socket `fd`.
pub fn accept(fd: RawFd) -> Result<RawFd, ThreadError> {
    record(retry(fd, Direction::Read, || socket::accept(fd)))
}

/// Connects the socket `fd` to `addr`, blocking the calling thread until the
/// connection is established or fails.
pub fn connect(fd: RawFd, addr: &dyn SockaddrLike) -> Result<(), ThreadError> {
    record(connect_inner(fd, addr))
}

fn connect_inner(fd: RawFd, addr: &dyn SockaddrLike) -> Result<(), ThreadError> {
    let ctx = enter()?;
    set_nonblocking(fd)?;
    match socket::connect(fd, addr) {
        Ok(()) => return Ok(()),
        Err(Errno::EINPROGRESS | Errno::EINTR) => {}
        Err(e) => return Err(e.into()),
    }
    block_on_fd(&ctx, fd, Direction::Write, None)?;
    match socket::getsockopt(fd, sockopt::SocketError)? {
        0 => Ok(()),
        err => Err(Errno::from_i32(err).into()),
    }
}

/// Blocks the calling thread until `fd` is ready in direction `dir`.
///
/// # Errors
/// - `Sys(ETIMEDOUT)` if `timeout` elapses first.
/// - `Sys(EBADF)` if `fd` is not open.
pub fn wait_fd(fd: RawFd, dir: Direction, timeout: Option<Duration>) -> Result<(), ThreadError> {
    record(enter().and_then(|ctx| {
        block_on_fd(&ctx, fd, dir, timeout.map(|t| Instant::now() + t))
    }))
}

/// Checks `fds` without blocking.
fn poll_now(fds: &mut [PollEntry]) -> Result<usize, ThreadError> {
    let mut pfds: Vec<PollFd> = fds.iter().map(|e| PollFd::new(e.fd, e.events)).collect();
    let n = loop {
        match nix::poll::poll(&mut pfds, 0) {
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    };
    for (entry, pfd) in fds.iter_mut().zip(&pfds) {
        entry.revents = pfd.revents().unwrap_or(PollFlags::empty());
    }
    Ok(n as usize)
}

/// Waits until one of `fds` reports an event or `timeout` elapses.
///
/// Returns the number of entries with a non-empty `revents`; zero means the
/// timeout elapsed. `None` waits without limit. `select(2)`-style waits are
/// expressed with this function.
pub fn poll(fds: &mut [PollEntry], timeout: Option<Duration>) -> Result<usize, ThreadError> {
    record(poll_inner(fds, timeout))
}

fn poll_inner(fds: &mut [PollEntry], timeout: Option<Duration>) -> Result<usize, ThreadError> {
    let ctx = enter()?;
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let n = poll_now(fds)?;
        if n > 0 {
            return Ok(n);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(0);
        }
        let mut kernel = ctx.kernel();
        kernel.register_poll(ctx.tid, fds.iter().map(|e| (e.fd, e.events)).collect());
        let (kernel, reason) =
            ctx.block_cancellable(kernel, ThreadState::WaitPoll, Blocker::Poll, deadline);
        drop(kernel);
        match reason {
            WakeReason::Cancelled => cancel::deliver(&ctx),
            WakeReason::TimedOut => return Ok(0),
            WakeReason::Satisfied | WakeReason::Interrupted => {}
        }
    }
}

/// Puts the calling thread to sleep for `duration`.
pub fn sleep(duration: Duration) -> Result<(), ThreadError> {
    record(sleep_inner(duration))
}

fn sleep_inner(duration: Duration) -> Result<(), ThreadError> {
    let ctx = enter()?;
    let kernel = ctx.kernel();
    let (kernel, reason) = ctx.block_cancellable(
        kernel,
        ThreadState::WaitSleep,
        Blocker::Sleep,
        Some(Instant::now() + duration),
    );
    drop(kernel);
    match reason {
        WakeReason::Cancelled => cancel::deliver(&ctx),
        _ => Ok(()),
    }
}
