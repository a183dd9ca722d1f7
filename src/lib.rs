//! # uthread: user-level threads with POSIX-style cancellation
//!
//! `uthread` multiplexes many user threads onto a single flow of control. Only
//! one user thread runs at any instant; the runtime switches between them when
//! the running thread blocks, yields, is preempted at a reentry point, or
//! exits. On top of that scheduler the crate provides:
//!
//! - [`thread`]: creation, join, detach, priorities, suspension.
//! - [`sync`]: a FIFO-fair [`Mutex`](sync::Mutex), a
//!   [`ConditionVariable`](sync::ConditionVariable) and a
//!   [`Semaphore`](sync::Semaphore).
//! - [`io`]: blocking `read`/`write`/`accept`/`connect`/`poll`/`sleep` that
//!   block only the calling user thread.
//! - [`cancel`]: deferred and asynchronous cancellation with cleanup handlers.
//! - [`signal`]: per-thread emulated signals with `sigwait` and `sigsuspend`.
//!
//! ## Getting started
//!
//! ```rust
//! use uthread::{RuntimeBuilder, sync::Mutex, thread};
//! use std::sync::Arc;
//!
//! let total = RuntimeBuilder::new()
//!     .build()
//!     .unwrap()
//!     .block_on(|| {
//!         let counter = Arc::new(Mutex::new(0));
//!         let workers: Vec<_> = (0..4)
//!             .map(|_| {
//!                 let counter = counter.clone();
//!                 thread::spawn(move || *counter.lock().unwrap() += 1).unwrap()
//!             })
//!             .collect();
//!         for worker in workers {
//!             worker.join().unwrap();
//!         }
//!         let total = *counter.lock().unwrap();
//!         total
//!     })
//!     .unwrap();
//! assert_eq!(total, 4);
//! ```
//!
//! ## Preemption
//!
//! With a tick configured (see [`Config::tick`]), a ticker posts preemption
//! ticks that the scheduler observes at reentry points: every runtime call
//! and [`preempt_point`]. A thread that computes for a long time without
//! calling into the runtime should call [`preempt_point`] now and then.
//! [`Current::pin`] masks preemption for a critical section.
#![warn(missing_docs)]

pub mod cancel;
pub mod config;
pub mod io;
pub mod preempt;
pub mod runtime;
pub mod signal;
pub mod sync;
pub mod thread;

pub use config::{Config, SchedPolicy};
pub use preempt::preempt_point;
pub use runtime::{Handle, Runtime, RuntimeBuilder, run};
pub use thread::{
    Current, ExitStatus, JoinHandle, Priority, ThreadBuilder, ThreadState, Tid, spawn,
};

use nix::errno::Errno;

/// Enum representing errors that can occur during a runtime operation.
///
/// Each variant corresponds to the errno a POSIX threads implementation
/// reports for the same condition; see [`ThreadError::errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThreadError {
    /// No thread with the given id exists, or it was already reaped. (ESRCH)
    #[error("no such thread")]
    NoSuchThread,
    /// The caller does not own the mutex. (EPERM)
    #[error("mutex is not owned by the calling thread")]
    NotOwner,
    /// The operation would deadlock the caller. (EDEADLK)
    #[error("operation would deadlock")]
    Deadlock,
    /// Invalid argument. (EINVAL)
    #[error("invalid argument")]
    InvalidArgument,
    /// Resources to create a thread are temporarily exhausted. (EAGAIN)
    #[error("resource temporarily unavailable")]
    Again,
    /// The resource is held by another thread. (EBUSY)
    #[error("resource busy")]
    Busy,
    /// The main thread was canceled or exited before returning. (ECANCELED)
    #[error("main thread terminated before returning a value")]
    Terminated,
    /// Called from outside a runtime. (EPERM)
    #[error("not called from a uthread runtime")]
    NoRuntime,
    /// An OS call failed.
    #[error("system call failed: {0}")]
    Sys(#[from] Errno),
}

impl ThreadError {
    /// Converts the [`ThreadError`] into the corresponding errno.
    pub fn errno(self) -> Errno {
        match self {
            ThreadError::NoSuchThread => Errno::ESRCH,
            ThreadError::NotOwner | ThreadError::NoRuntime => Errno::EPERM,
            ThreadError::Deadlock => Errno::EDEADLK,
            ThreadError::InvalidArgument => Errno::EINVAL,
            ThreadError::Again => Errno::EAGAIN,
            ThreadError::Busy => Errno::EBUSY,
            ThreadError::Terminated => Errno::ECANCELED,
            ThreadError::Sys(e) => e,
        }
    }
}

impl From<ThreadError> for std::io::Error {
    fn from(e: ThreadError) -> Self {
        std::io::Error::from_raw_os_error(e.errno() as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(ThreadError::NoSuchThread.errno(), Errno::ESRCH);
        assert_eq!(ThreadError::NotOwner.errno(), Errno::EPERM);
        assert_eq!(ThreadError::Deadlock.errno(), Errno::EDEADLK);
        assert_eq!(ThreadError::Busy.errno(), Errno::EBUSY);
        assert_eq!(ThreadError::from(Errno::EBADF).errno(), Errno::EBADF);
        let io: std::io::Error = ThreadError::Again.into();
        assert_eq!(io.raw_os_error(), Some(Errno::EAGAIN as i32));
    }
}
