use crate::runtime::ScheduledExecutor;
use crate::task::Runnable;
use crate::time::{Clock, MonotonicClock, Period};
use anyhow::{Result, bail};
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Upper bound on the size of the worker pool.
const MAX_WORKER_THREADS: usize = 32_768;

/// What happens to a periodic task whose run failed.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicFailurePolicy {
    /// The failure is recorded on the task handle and the task is never run
    /// again. Every observer sees the failure.
    #[default]
    Abort,

    /// The failure is logged and the task keeps its schedule. Observers only
    /// ever see the task complete through cancellation.
    Reschedule,
}

/// Wraps every task right before it is queued.
///
/// The decorator receives the period the task was scheduled with and the
/// type-erased task, and returns what the workers will run in its place. The
/// returned [`Runnable`] must forward every call to the one it wraps.
#[derive(Clone)]
pub struct TaskDecorator(
    pub(crate) Arc<dyn Fn(&Period, Arc<dyn Runnable>) -> Arc<dyn Runnable> + Send + Sync + 'static>,
);

impl TaskDecorator {
    pub(crate) fn decorate(&self, period: &Period, task: Arc<dyn Runnable>) -> Arc<dyn Runnable> {
        (self.0)(period, task)
    }
}

impl fmt::Debug for TaskDecorator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskDecorator").field(&"<function>").finish()
    }
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("tempolo-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and starts a [`ScheduledExecutor`].
///
/// ```
/// use std::time::Duration;
/// use tempolo::Builder;
///
/// let executor = Builder::new()
///     .worker_threads(2)
///     .remove_on_cancel(true)
///     .try_build()
///     .unwrap();
///
/// let handle = executor.schedule(|| Ok(1 + 1), Duration::from_millis(5)).unwrap();
/// assert_eq!(handle.get().unwrap(), 2);
/// ```
#[derive(Debug)]
pub struct Builder {
    /// Size of the worker pool. Defaults to 1 per core.
    worker_threads: Option<usize>,

    thread_name: ThreadNameFn,

    /// Source of every trigger time.
    clock: Arc<dyn Clock>,

    /// Unlink cancelled tasks from the queue right away instead of letting a
    /// worker discard them when they come due.
    remove_on_cancel: bool,

    /// Keep running periodic tasks after `shutdown`.
    continue_existing_periodic_tasks_after_shutdown: bool,

    /// Run one-shot delayed tasks that are already queued after `shutdown`.
    execute_existing_delayed_tasks_after_shutdown: bool,

    periodic_failure_policy: PeriodicFailurePolicy,

    task_decorator: Option<TaskDecorator>,
}

impl Builder {
    pub fn new() -> Builder {
        Self {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            clock: Arc::new(MonotonicClock::new()),
            remove_on_cancel: false,
            continue_existing_periodic_tasks_after_shutdown: false,
            execute_existing_delayed_tasks_after_shutdown: true,
            periodic_failure_policy: PeriodicFailurePolicy::default(),
            task_decorator: None,
        }
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Uses `clock` for every trigger time computed by the executor.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn remove_on_cancel(mut self, val: bool) -> Self {
        self.remove_on_cancel = val;
        self
    }

    pub fn continue_existing_periodic_tasks_after_shutdown(mut self, val: bool) -> Self {
        self.continue_existing_periodic_tasks_after_shutdown = val;
        self
    }

    pub fn execute_existing_delayed_tasks_after_shutdown(mut self, val: bool) -> Self {
        self.execute_existing_delayed_tasks_after_shutdown = val;
        self
    }

    pub fn periodic_failure_policy(mut self, policy: PeriodicFailurePolicy) -> Self {
        self.periodic_failure_policy = policy;
        self
    }

    pub fn task_decorator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Period, Arc<dyn Runnable>) -> Arc<dyn Runnable> + Send + Sync + 'static,
    {
        self.task_decorator = Some(TaskDecorator(Arc::new(f)));
        self
    }

    /// Spawns the worker threads and returns the running executor.
    pub fn try_build(self) -> Result<ScheduledExecutor> {
        let cfg = ExecutorConfig::try_from(self)?;
        ScheduledExecutor::start(cfg)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen [`Builder`], shared by the executor and its workers.
#[derive(Debug, Clone)]
pub(crate) struct ExecutorConfig {
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) remove_on_cancel: bool,
    pub(crate) continue_existing_periodic_tasks_after_shutdown: bool,
    pub(crate) execute_existing_delayed_tasks_after_shutdown: bool,
    pub(crate) periodic_failure_policy: PeriodicFailurePolicy,
    pub(crate) task_decorator: Option<TaskDecorator>,
}

impl ExecutorConfig {
    fn validate(&self) -> Result<()> {
        if self.worker_threads > MAX_WORKER_THREADS {
            bail!(
                "worker_threads ({}) exceeds the maximum of {}",
                self.worker_threads,
                MAX_WORKER_THREADS
            );
        }

        Ok(())
    }
}

impl TryFrom<Builder> for ExecutorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let cfg = ExecutorConfig {
            worker_threads,
            thread_name: builder.thread_name,
            clock: builder.clock,
            remove_on_cancel: builder.remove_on_cancel,
            continue_existing_periodic_tasks_after_shutdown: builder
                .continue_existing_periodic_tasks_after_shutdown,
            execute_existing_delayed_tasks_after_shutdown: builder
                .execute_existing_delayed_tasks_after_shutdown,
            periodic_failure_policy: builder.periodic_failure_policy,
            task_decorator: builder.task_decorator,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ExecutorConfig: Send, Sync, Clone);
    assert_impl_all!(Builder: Send);

    #[test]
    fn test_defaults() -> Result<()> {
        let cfg = ExecutorConfig::try_from(Builder::new())?;

        assert_eq!(cfg.worker_threads, thread::available_parallelism()?.get());
        assert!(!cfg.remove_on_cancel);
        assert!(!cfg.continue_existing_periodic_tasks_after_shutdown);
        assert!(cfg.execute_existing_delayed_tasks_after_shutdown);
        assert_eq!(cfg.periodic_failure_policy, PeriodicFailurePolicy::Abort);
        assert!(cfg.task_decorator.is_none());
        Ok(())
    }

    #[test]
    fn test_thread_names_are_numbered() {
        let names = default_thread_name_fn();
        assert_eq!((names.0)(), "tempolo-0");
        assert_eq!((names.0)(), "tempolo-1");
    }

    #[rstest]
    #[case(1, true)]
    #[case(MAX_WORKER_THREADS, true)]
    #[case(MAX_WORKER_THREADS + 1, false)]
    fn test_validate_worker_threads(#[case] n: usize, #[case] ok: bool) {
        let res = ExecutorConfig::try_from(Builder::new().worker_threads(n));
        assert_eq!(res.is_ok(), ok);
    }

    #[test]
    #[should_panic(expected = "worker_threads must be greater than 0")]
    fn test_zero_workers_panics() {
        let _ = Builder::new().worker_threads(0);
    }
}
