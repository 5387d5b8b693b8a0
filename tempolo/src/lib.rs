//! Delayed and periodic task execution on a pool of OS threads.
//!
//! Tasks are submitted to a [`ScheduledExecutor`] and observed through a
//! [`TaskHandle`], a single-assignment result cell that any number of threads
//! can block on. Queued tasks live in a [`DelayQueue`](queue::DelayQueue)
//! ordered by trigger time.

mod context;

pub mod interrupt;

pub mod queue;

pub mod runtime;
pub use runtime::{Builder, PeriodicFailurePolicy, ScheduledExecutor};

pub mod task;
pub use task::{Runnable, TaskError, TaskHandle, TaskState};

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
