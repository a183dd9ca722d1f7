//! Preemption masking and the tick source.
//!
//! The runtime emulates an asynchronous timer interrupt with a ticker thread
//! that posts [`Event::Tick`] into a single-consumer queue. The scheduler only
//! drains the queue at well-defined reentry points, and only while
//! preemption is not masked on the running thread. Every mutation of the run
//! queue, a wait queue or a thread's state happens while a [`PreemptGuard`]
//! is alive.
use crate::thread::{Context, Tid};
use crossbeam_queue::SegQueue;
use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// An RAII-based guard that masks preemption of the running thread.
///
/// While any guard is alive, pending ticks are not delivered; they are kept
/// and acted on at the next reentry point after the last guard is dropped.
///
/// **Important:**
/// - [`PreemptGuard`] instances **must be dropped in reverse order of their
///   creation**.
/// - The guard is bound to the OS thread backing the current user thread and
///   therefore is neither [`Send`] nor [`Sync`].
///
/// This structure is created using [`PreemptGuard::new`].
pub struct PreemptGuard {
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    /// Creates a new `PreemptGuard`, masking preemption.
    ///
    /// # Example
    /// ```rust
    /// let _guard = uthread::preempt::PreemptGuard::new();
    /// // Critical section...
    /// // Preemption is unmasked when `_guard` goes out of scope.
    /// ```
    pub fn new() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    /// Returns true if preemption is masked on the calling thread.
    pub fn is_guarded() -> bool {
        Self::depth() != 0
    }

    pub(crate) fn depth() -> usize {
        DEPTH.with(Cell::get)
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| {
            let prev = depth.get();
            assert!(prev > 0, "Mismatched PreemptGuard drop calls: {prev}");
            depth.set(prev - 1);
        });
    }
}

/// A reentry point: acts on pending ticks and asynchronous cancellation.
///
/// If the running thread's time slice ran out, it moves behind the other
/// runnable threads of its priority and the processor is handed over. If an
/// asynchronous cancellation is pending and enabled, it is acted on and this
/// function does not return. Does nothing while preemption is masked or
/// outside a runtime.
pub fn preempt_point() {
    if PreemptGuard::is_guarded() {
        return;
    }
    let Some(ctx) = Context::try_current() else {
        return;
    };
    let mut kernel = ctx.kernel();
    kernel.poll_events(&ctx.shared.events);
    if kernel.consume_ticks() {
        log::trace!("thread {}: time slice expired", ctx.tid);
        kernel = ctx.yield_current(kernel);
    }
    drop(ctx.async_cancel_point(kernel));
}

/// An asynchronous event posted to the scheduler from outside the running
/// flow of control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    /// A virtual-timer tick.
    Tick,
    /// A cancellation request issued through a [`Handle`](crate::Handle).
    Cancel(Tid),
}

/// Queue of events, drained only by the thread holding the kernel lock.
pub(crate) type EventQueue = SegQueue<Event>;

/// The periodic tick source.
pub(crate) struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Starts posting a tick into `events` every `period`.
    pub(crate) fn start(period: Duration, events: Arc<EventQueue>) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("uthread-ticker".into())
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        std::thread::sleep(period);
                        events.push(Event::Tick);
                    }
                })?
        };
        log::debug!("preemption ticker started: period {period:?}");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the tick source and waits for it to finish.
    pub(crate) fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
