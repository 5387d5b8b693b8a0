use crate::runtime::scheduled::ScheduledTask;
use crate::task::cell::TaskCell;
use crate::task::{Id, Runnable, TaskError, TaskState};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A single-assignment result cell observable from any number of threads.
///
/// A handle is either created standalone with [`TaskHandle::new`], in which
/// case any thread may [`run`](TaskHandle::run) it, or returned by a
/// [`ScheduledExecutor`](crate::ScheduledExecutor), in which case the
/// executor's worker threads run it when it is due.
///
/// Cloning a handle is cheap; all clones observe the same outcome.
///
/// # Examples
///
/// ```
/// use std::thread;
/// use tempolo::TaskHandle;
///
/// let handle = TaskHandle::new(|| Ok(6 * 7));
///
/// let runner = handle.clone();
/// thread::spawn(move || runner.run());
///
/// assert_eq!(handle.get().unwrap(), 42);
/// ```
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,

    /// Present when the handle was returned by an executor.
    scheduled: Option<Arc<ScheduledTask>>,
}

impl<T: Send + Sync + 'static> TaskHandle<T> {
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::from_cell(Arc::new(TaskCell::once(work)))
    }

    /// Like [`new`](Self::new), with a hook called exactly once with the
    /// terminal state, after every waiter has been released.
    pub fn with_done_hook<F, H>(work: F, hook: H) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        H: FnOnce(TaskState) + Send + 'static,
    {
        let cell = TaskCell::once(work);
        cell.set_done_hook(Box::new(hook));
        Self::from_cell(Arc::new(cell))
    }

    pub(crate) fn from_cell(cell: Arc<TaskCell<T>>) -> Self {
        Self {
            cell,
            scheduled: None,
        }
    }

    pub(crate) fn scheduled(cell: Arc<TaskCell<T>>, task: Arc<ScheduledTask>) -> Self {
        Self {
            cell,
            scheduled: Some(task),
        }
    }

    pub(crate) fn cell(&self) -> &Arc<TaskCell<T>> {
        &self.cell
    }

    /// Runs the task on the current thread, if nobody ran or cancelled it yet.
    ///
    /// A periodic task runs a single period and is not rescheduled.
    pub fn run(&self) {
        if self.is_periodic() {
            self.cell.run_and_reset();
        } else {
            self.cell.run();
        }
    }

    /// Type-erased view of the task, as seen by task decorators.
    pub fn runnable(&self) -> Arc<dyn Runnable> {
        self.cell.clone()
    }

    /// Attempts to cancel the task. Fails if the task already completed or
    /// was cancelled.
    ///
    /// With `may_interrupt`, the thread running the task (if any) gets its
    /// [interrupt flag](crate::interrupt) raised. A scheduled task is removed
    /// from its executor's queue when the executor was built with
    /// `remove_on_cancel`.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        match &self.scheduled {
            Some(task) => task.cancel(may_interrupt),
            None => self.cell.cancel(may_interrupt),
        }
    }

    pub fn id(&self) -> Id {
        self.cell.id()
    }

    pub fn state(&self) -> TaskState {
        self.cell.state()
    }

    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    pub fn is_periodic(&self) -> bool {
        self.scheduled
            .as_ref()
            .is_some_and(|task| task.period().is_periodic())
    }

    /// Time left until the next scheduled run, zero once it is due. `None` for
    /// standalone handles.
    pub fn delay(&self) -> Option<Duration> {
        self.scheduled.as_ref().map(|task| task.delay())
    }

    /// Blocks until the task has an outcome and borrows it.
    pub fn wait(&self) -> Result<&T, TaskError> {
        self.cell.wait()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Timing out does
    /// not affect the task.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<&T, TaskError> {
        self.cell.wait_timeout(timeout)
    }

    /// The outcome, if there is one already.
    pub fn try_get(&self) -> Option<Result<&T, TaskError>> {
        self.cell.try_get()
    }
}

impl<T: Clone + Send + Sync + 'static> TaskHandle<T> {
    /// Blocks until the task has an outcome.
    pub fn get(&self) -> Result<T, TaskError> {
        self.wait().cloned()
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        self.wait_timeout(timeout).cloned()
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            scheduled: self.scheduled.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("cell", &self.cell)
            .field("scheduled", &self.scheduled)
            .finish()
    }
}
