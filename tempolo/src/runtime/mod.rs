//! Delayed and periodic execution on a fixed pool of worker threads.

mod builder;
pub use builder::{Builder, PeriodicFailurePolicy, TaskDecorator};
pub(crate) use builder::ExecutorConfig;

mod executor;
pub use executor::ScheduledExecutor;

mod pool;

pub(crate) mod scheduled;

mod worker;

#[cfg(test)]
mod tests;
