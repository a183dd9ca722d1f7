//! Wait queues.
//!
//! A [`WaitList`] is an intrusive FIFO of thread handles: the `prev`/`next`
//! fields live in each thread's [`Link`], while the head, the tail and the
//! length live in whatever owns the queue (a mutex, a condition variable, a
//! join target, an fd interest or a run-queue level). A thread sits in at
//! most one queue at a time, so one link pair per thread suffices.
use super::{Tid, kern::fatal, table::ThreadTable};
use std::{os::fd::RawFd, sync::Arc};

/// Intrusive queue linkage embedded in every thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Link {
    prev: Option<Tid>,
    next: Option<Tid>,
    queued: bool,
}

/// Head of an intrusive FIFO of threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct WaitList {
    head: Option<Tid>,
    tail: Option<Tid>,
    len: usize,
}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Appends `tid` to the tail of the queue.
    pub(crate) fn push_back(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let link = &mut threads.linked_mut(tid).link;
        if link.queued {
            fatal(format_args!("{tid} is queued twice"));
        }
        *link = Link {
            prev: self.tail,
            next: None,
            queued: true,
        };
        match self.tail {
            Some(tail) => threads.linked_mut(tail).link.next = Some(tid),
            None => self.head = Some(tid),
        }
        self.tail = Some(tid);
        self.len += 1;
    }

    /// Unlinks `tid` from this queue. Returns false if it was not queued.
    pub(crate) fn remove(&mut self, threads: &mut ThreadTable, tid: Tid) -> bool {
        let Some(th) = threads.get_mut(tid) else {
            return false;
        };
        let link = th.link;
        if !link.queued {
            return false;
        }
        th.link = Link::default();

        match link.prev {
            Some(prev) => threads.linked_mut(prev).link.next = link.next,
            None if self.head == Some(tid) => self.head = link.next,
            None => fatal(format_args!("{tid} has no predecessor but is not a head")),
        }
        match link.next {
            Some(next) => threads.linked_mut(next).link.prev = link.prev,
            None if self.tail == Some(tid) => self.tail = link.prev,
            None => fatal(format_args!("{tid} has no successor but is not a tail")),
        }
        if self.len == 0 {
            fatal(format_args!("unlinking {tid} from an empty queue"));
        }
        self.len -= 1;
        true
    }

    /// Detaches and returns the head of the queue.
    pub(crate) fn pop(&mut self, threads: &mut ThreadTable) -> Option<Tid> {
        let head = self.head?;
        self.remove(threads, head);
        Some(head)
    }

    /// Detaches every queued thread, returning them in FIFO order.
    pub(crate) fn drain(&mut self, threads: &mut ThreadTable) -> Vec<Tid> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(tid) = self.pop(threads) {
            out.push(tid);
        }
        out
    }

    /// Visits the queued threads in FIFO order.
    pub(crate) fn iter<'a>(&self, threads: &'a ThreadTable) -> impl Iterator<Item = Tid> + 'a {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let tid = cursor?;
            cursor = threads.linked(tid).link.next;
            Some(tid)
        })
    }
}

/// Why a blocked thread became runnable again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// The condition it waited for was met.
    Satisfied,
    /// Its deadline passed first.
    TimedOut,
    /// A cancellation request pulled it out of the wait.
    Cancelled,
    /// A signal it did not wait for interrupted the wait.
    Interrupted,
}

/// I/O readiness direction of an fd interest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    /// Waiting until the fd is readable.
    Read,
    /// Waiting until the fd is writable.
    Write,
}

/// A resource owning a wait queue that the runtime may need to pull a
/// thread out of, on cancellation or timeout.
pub(crate) trait WaitSource: Send + Sync {
    /// Unlinks `tid` from this resource's queue.
    fn unlink(&self, threads: &mut ThreadTable, tid: Tid) -> bool;
}

/// What a waiting thread is blocked on.
#[derive(Clone)]
pub(crate) enum Blocker {
    /// The wait queue of a mutex or a condition variable.
    Queue(Arc<dyn WaitSource>),
    /// The joiner list of the given thread.
    Join(Tid),
    /// The kernel fd interest table.
    Fd(RawFd, Direction),
    /// The kernel poll waiter list.
    Poll,
    /// Only a deadline.
    Sleep,
    /// The thread's own pending signal set.
    Signal,
    /// An explicit suspension.
    Suspend,
}

impl std::fmt::Debug for Blocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Blocker::Queue(_) => f.write_str("Queue"),
            Blocker::Join(tid) => write!(f, "Join({tid})"),
            Blocker::Fd(fd, dir) => write!(f, "Fd({fd}, {dir:?})"),
            Blocker::Poll => f.write_str("Poll"),
            Blocker::Sleep => f.write_str("Sleep"),
            Blocker::Signal => f.write_str("Signal"),
            Blocker::Suspend => f.write_str("Suspend"),
        }
    }
}
