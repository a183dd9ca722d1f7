//! Runtime configuration.
//!
//! A [`Config`] fixes the scheduling policy and the resource limits of one
//! runtime. It is usually assembled with a
//! [`RuntimeBuilder`](crate::RuntimeBuilder); [`Config::from_env`] starts from
//! the defaults and applies the `UTHREAD_*` environment variables on top.
use crate::thread::Priority;
use std::time::Duration;

/// Default stack size of a thread.
pub const STACK_SIZE: usize = 0x100000;

/// Default period of the preemption tick.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Default number of ticks in a time slice.
pub const DEFAULT_TIME_SLICE: usize = 10;

/// Default limit on the number of unreaped threads.
pub const DEFAULT_MAX_THREADS: usize = 1024;

/// Run-queue policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Highest priority first, FIFO within a priority, round robin on
    /// time-slice expiry.
    #[default]
    Priority,
    /// One FIFO queue, priorities ignored, no time slicing.
    Fifo,
}

/// Configuration of a runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Period of the preemption tick. `None` disables preemption, so threads
    /// switch only when they block or yield.
    pub tick: Option<Duration>,
    /// Number of ticks a thread may run before it is moved behind the other
    /// runnable threads of its priority.
    pub time_slice: usize,
    /// Run-queue policy.
    pub policy: SchedPolicy,
    /// Stack size of threads that do not ask for one.
    pub stack_size: usize,
    /// Upper bound on threads that exist at once, dead-but-unreaped included.
    pub max_threads: usize,
    /// Priority of the thread running the closure given to
    /// [`Runtime::block_on`](crate::Runtime::block_on).
    pub main_priority: Priority,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick: Some(DEFAULT_TICK),
            time_slice: DEFAULT_TIME_SLICE,
            policy: SchedPolicy::default(),
            stack_size: STACK_SIZE,
            max_threads: DEFAULT_MAX_THREADS,
            main_priority: Priority::DEFAULT,
        }
    }
}

impl Config {
    /// The default configuration overridden by the environment.
    ///
    /// | Variable              | Field          | Note                    |
    /// |-----------------------|----------------|-------------------------|
    /// | `UTHREAD_TICK_MS`     | [`tick`]       | `0` disables preemption |
    /// | `UTHREAD_TIME_SLICE`  | [`time_slice`] |                         |
    /// | `UTHREAD_STACK_SIZE`  | [`stack_size`] | bytes                   |
    /// | `UTHREAD_MAX_THREADS` | [`max_threads`]|                         |
    ///
    /// Unparsable values are ignored with a warning.
    ///
    /// [`tick`]: Config::tick
    /// [`time_slice`]: Config::time_slice
    /// [`stack_size`]: Config::stack_size
    /// [`max_threads`]: Config::max_threads
    pub fn from_env() -> Self {
        Self::default().with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| -> Option<usize> {
            let value = var(key)?;
            match value.trim().parse() {
                Ok(n) => Some(n),
                Err(e) => {
                    log::warn!("ignoring {key}={value:?}: {e}");
                    None
                }
            }
        };
        if let Some(ms) = number("UTHREAD_TICK_MS") {
            self.tick = (ms != 0).then(|| Duration::from_millis(ms as u64));
        }
        if let Some(slice) = number("UTHREAD_TIME_SLICE") {
            self.time_slice = slice.max(1);
        }
        if let Some(size) = number("UTHREAD_STACK_SIZE") {
            self.stack_size = size;
        }
        if let Some(max) = number("UTHREAD_MAX_THREADS") {
            self.max_threads = max.max(1);
        }
        self
    }
}
