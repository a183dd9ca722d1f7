//! # Synchronization primitives.
//!
//! User threads coordinate through primitives that block only the calling
//! user thread. A blocked thread sits in the primitive's FIFO wait queue and
//! is handed the resource directly when it is released, so no thread can
//! overtake one that already waits.
//!
//! | Primitive             | Blocks Thread? | Fair? | Cancellation point? |
//! |-----------------------|----------------|-------|---------------------|
//! | [`Mutex`]             | Yes            | FIFO  | No                  |
//! | [`ConditionVariable`] | Yes            | FIFO  | Yes                 |
//! | [`Semaphore`]         | Yes            | FIFO  | Yes                 |
//!
//! - **Mutex** grants exclusive access to the data it protects. Unlocking
//!   hands ownership to the longest waiter. A thread waiting for a mutex is
//!   interrupted only by an asynchronous cancellation.
//! - **ConditionVariable** atomically releases a mutex and waits for a
//!   signal, then reacquires the mutex before returning.
//! - **Semaphore** tracks a count of permits guarding a resource.
//!
//! [`RawMutex`] exposes the untyped mutex with selectable [`MutexKind`]s for
//! callers that manage the protected state themselves.
pub mod condition_variable;
pub mod mutex;
pub mod semaphore;
pub(crate) mod spinlock;

pub use condition_variable::{ConditionVariable, WaitOutcome};
pub use mutex::{Mutex, MutexGuard, MutexKind, RawMutex};
pub use semaphore::{Semaphore, SemaphorePermits};
