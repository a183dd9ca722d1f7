//! Run-queue policies.
//!
//! The kernel keeps every runnable thread in exactly one run queue owned by
//! a [`Scheduler`]. Queues are intrusive [`WaitList`]s, so enqueueing and
//! unlinking a thread never allocates.
use super::{Priority, Tid, table::ThreadTable, wait::WaitList};

/// A trait for a run-queue policy.
///
/// The scheduler decides which runnable thread runs next and when the running
/// thread has used up its share of the processor. All methods are called with
/// the kernel lock held.
pub(crate) trait Scheduler: Send {
    /// Detaches and returns the next thread to run, if any is runnable.
    fn next_to_run(&mut self, threads: &mut ThreadTable) -> Option<Tid>;

    /// Pushes a runnable thread `tid` into the run queue.
    fn push_to_queue(&mut self, threads: &mut ThreadTable, tid: Tid);

    /// Unlinks `tid` from the run queue. Returns false if it was not queued.
    fn remove(&mut self, threads: &mut ThreadTable, tid: Tid) -> bool;

    /// Called when `tid` has been switched in.
    fn dispatched(&mut self, _tid: Tid) {}

    /// Called on every preemption tick that reaches the running thread.
    ///
    /// Returns true once the running thread has exhausted its time slice.
    fn timer_tick(&mut self) -> bool;

    /// Number of queued threads.
    fn len(&self) -> usize;
}

/// A first-in-first-out scheduler.
///
/// Priorities are ignored and a running thread is never sliced: it keeps the
/// processor until it blocks or yields.
pub(crate) struct Fifo {
    run_queue: WaitList,
}

impl Fifo {
    pub(crate) fn new() -> Self {
        Self {
            run_queue: WaitList::new(),
        }
    }
}

impl Scheduler for Fifo {
    fn next_to_run(&mut self, threads: &mut ThreadTable) -> Option<Tid> {
        self.run_queue.pop(threads)
    }

    fn push_to_queue(&mut self, threads: &mut ThreadTable, tid: Tid) {
        self.run_queue.push_back(threads, tid);
    }

    fn remove(&mut self, threads: &mut ThreadTable, tid: Tid) -> bool {
        self.run_queue.remove(threads, tid)
    }

    fn timer_tick(&mut self) -> bool {
        false
    }

    fn len(&self) -> usize {
        self.run_queue.len()
    }
}

/// A fixed-priority round robin scheduler.
///
/// Runnable threads are kept in one FIFO per priority level. A bitmap with one
/// bit per non-empty level finds the highest runnable priority in constant
/// time. The running thread is charged one tick per preemption tick and is
/// moved to the tail of its level when its slice runs out.
pub(crate) struct PriorityRoundRobin {
    levels: [WaitList; Priority::LEVELS],
    bitmap: u32,
    len: usize,
    time_slice: usize,
    remain: usize,
}

impl PriorityRoundRobin {
    pub(crate) fn new(time_slice: usize) -> Self {
        Self {
            levels: [WaitList::new(); Priority::LEVELS],
            bitmap: 0,
            len: 0,
            time_slice: time_slice.max(1),
            remain: time_slice.max(1),
        }
    }

    fn highest_level(&self) -> Option<usize> {
        match self.bitmap {
            0 => None,
            bits => Some(31 - bits.leading_zeros() as usize),
        }
    }
}

impl Scheduler for PriorityRoundRobin {
    fn next_to_run(&mut self, threads: &mut ThreadTable) -> Option<Tid> {
        let level = self.highest_level()?;
        let tid = self.levels[level].pop(threads)?;
        if self.levels[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
        self.len -= 1;
        Some(tid)
    }

    fn push_to_queue(&mut self, threads: &mut ThreadTable, tid: Tid) {
        let level = threads.linked(tid).priority.level();
        self.levels[level].push_back(threads, tid);
        self.bitmap |= 1 << level;
        self.len += 1;
    }

    fn remove(&mut self, threads: &mut ThreadTable, tid: Tid) -> bool {
        let level = threads.linked(tid).priority.level();
        if !self.levels[level].remove(threads, tid) {
            return false;
        }
        if self.levels[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
        self.len -= 1;
        true
    }

    fn dispatched(&mut self, _tid: Tid) {
        self.remain = self.time_slice;
    }

    fn timer_tick(&mut self) -> bool {
        self.remain = self.remain.saturating_sub(1);
        self.remain == 0
    }

    fn len(&self) -> usize {
        self.len
    }
}
