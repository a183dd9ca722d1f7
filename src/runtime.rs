//! Runtime startup and shutdown.
//!
//! A [`Runtime`] owns one scheduler. [`Runtime::block_on`] turns the given
//! closure into the runtime's main thread, runs until **every** user thread
//! has exited and returns the closure's value. The calling OS thread is not
//! a user thread; it sleeps while the runtime runs.
//!
//! ```rust
//! use std::time::Duration;
//! use uthread::{RuntimeBuilder, SchedPolicy};
//!
//! let answer = RuntimeBuilder::new()
//!     .policy(SchedPolicy::Priority)
//!     .tick(Some(Duration::from_millis(5)))
//!     .time_slice(4)
//!     .build()
//!     .unwrap()
//!     .block_on(|| 6 * 7)
//!     .unwrap();
//! assert_eq!(answer, 42);
//! ```
use crate::{
    ThreadError,
    config::{Config, SchedPolicy},
    preempt::{Event, Ticker},
    sync::spinlock::SpinLock,
    thread::{ExitStatus, Priority, TcbFlags, ThreadBody, ThreadBuilder, Tid, kern::Shared},
};
use crossbeam_utils::sync::Parker;
use std::{any::Any, panic, sync::Arc, time::Duration};

/// Builds a [`Runtime`] with custom configuration values.
#[derive(Clone, Debug, Default)]
pub struct RuntimeBuilder {
    config: Config,
}

impl RuntimeBuilder {
    /// A builder starting from [`Config::default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder starting from [`Config::from_env`].
    pub fn from_env() -> Self {
        Self {
            config: Config::from_env(),
        }
    }

    /// Period of the preemption tick; `None` disables preemption.
    pub fn tick(mut self, tick: Option<Duration>) -> Self {
        self.config.tick = tick;
        self
    }

    /// Ticks per time slice.
    pub fn time_slice(mut self, ticks: usize) -> Self {
        self.config.time_slice = ticks.max(1);
        self
    }

    /// Run-queue policy.
    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Default stack size of new threads.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = size;
        self
    }

    /// Maximum number of threads that exist at once.
    pub fn max_threads(mut self, max: usize) -> Self {
        self.config.max_threads = max.max(1);
        self
    }

    /// Priority of the main thread.
    pub fn main_priority(mut self, priority: Priority) -> Self {
        self.config.main_priority = priority;
        self
    }

    /// The configuration built so far.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates the runtime.
    ///
    /// # Errors
    /// `Sys(_)` if the runtime's wake pipe cannot be created.
    pub fn build(self) -> Result<Runtime, ThreadError> {
        let parker = Parker::new();
        let shared = Shared::new(self.config, parker.unparker().clone())?;
        Ok(Runtime {
            shared: Arc::new(shared),
            parker,
        })
    }
}

/// A user-level thread runtime.
pub struct Runtime {
    shared: Arc<Shared>,
    parker: Parker,
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    pub fn new() -> Result<Self, ThreadError> {
        RuntimeBuilder::new().build()
    }

    /// The runtime's configuration.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// A handle to reach the runtime from other OS threads.
    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Runs `f` as the main thread and waits until every thread exited.
    ///
    /// The main thread is detached and runs at [`Config::main_priority`].
    ///
    /// # Errors
    /// - [`ThreadError::Terminated`] if the main thread was cancelled or
    ///   called [`Current::exit`](crate::Current::exit) instead of returning.
    /// - [`ThreadError::Again`] if the main thread or the tick source cannot
    ///   be started.
    ///
    /// # Panics
    /// Resumes the panic of a main thread that panicked.
    pub fn block_on<F, T>(self, f: F) -> Result<T, ThreadError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let Runtime { shared, parker } = self;
        let mut ticker = match shared.config.tick {
            Some(period) => Some(Ticker::start(period, shared.events.clone()).map_err(|e| {
                log::warn!("cannot start the preemption ticker: {e}");
                ThreadError::Again
            })?),
            None => None,
        };

        let slot = Arc::new(SpinLock::new(None));
        let body: ThreadBody = {
            let slot = slot.clone();
            Box::new(move || {
                let value = f();
                *slot.lock() = Some(value);
                Arc::new(()) as Arc<dyn Any + Send + Sync>
            })
        };
        {
            let mut kernel = shared.kernel.lock();
            let builder = ThreadBuilder::new("main")
                .priority(shared.config.main_priority)
                .detached(true);
            shared.spawn_thread(&mut kernel, builder, TcbFlags::MAIN, body)?;
        }

        log::debug!("runtime started: {:?}", shared.config);
        shared.launch();
        while !shared.is_finished() {
            parker.park();
        }
        for os_thread in shared.take_os_threads() {
            let _ = os_thread.join();
        }
        if let Some(ticker) = ticker.as_mut() {
            ticker.stop();
        }
        log::debug!("runtime finished");

        let status = shared.kernel.lock().main_status.take();
        match status {
            Some(ExitStatus::Exited(_)) => slot.lock().take().ok_or(ThreadError::Terminated),
            Some(ExitStatus::Panicked(msg)) => panic::resume_unwind(Box::new(msg.to_string())),
            Some(ExitStatus::Canceled) | None => Err(ThreadError::Terminated),
        }
    }
}

/// Runs `f` on a runtime configured from the environment.
///
/// Shorthand for `RuntimeBuilder::from_env().build()?.block_on(f)`.
pub fn run<F, T>(f: F) -> Result<T, ThreadError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    RuntimeBuilder::from_env().build()?.block_on(f)
}

/// A handle to a runtime, usable from any OS thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Requests cancellation of thread `tid` from outside the runtime.
    ///
    /// The request is applied at the scheduler's next reentry point; an idle
    /// scheduler is woken up for it. Requests for threads that no longer
    /// exist by then are dropped.
    ///
    /// # Errors
    /// [`ThreadError::NoSuchThread`] if the runtime already finished.
    pub fn cancel(&self, tid: Tid) -> Result<(), ThreadError> {
        if self.shared.is_finished() {
            return Err(ThreadError::NoSuchThread);
        }
        self.shared.events.push(Event::Cancel(tid));
        self.shared.poke();
        Ok(())
    }

    /// Returns true once every thread of the runtime exited.
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }
}
