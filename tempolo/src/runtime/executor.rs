use crate::interrupt::InterruptFlag;
use crate::queue::DelayQueue;
use crate::runtime::pool::ThreadPool;
use crate::runtime::scheduled::ScheduledTask;
use crate::runtime::ExecutorConfig;
use crate::task::{Id, RejectReason, Runnable, TaskCell, TaskError, TaskHandle, Work};
use crate::time::{Clock, Period, deadline_after};
use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[cfg(test)]
use crate::utils::tracker::Tracker;

/// Lifecycle of an executor. Only ever moves forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RunState {
    /// Accepts new tasks and runs queued ones.
    Running = 0,

    /// Rejects new tasks; queued ones run according to the shutdown policies.
    Shutdown = 1,

    /// Rejects new tasks, runs nothing, interrupts running tasks.
    Stop = 2,

    /// Every worker exited.
    Terminated = 3,
}

impl RunState {
    fn from_u8(v: u8) -> RunState {
        match v {
            0 => RunState::Running,
            1 => RunState::Shutdown,
            2 => RunState::Stop,
            3 => RunState::Terminated,
            _ => unreachable!("invalid run state: {v}"),
        }
    }
}

/// State shared between the executor handle, its workers and its queued
/// tasks.
pub(crate) struct Shared {
    pub(crate) cfg: ExecutorConfig,

    pub(crate) queue: DelayQueue<ScheduledTask>,

    run_state: AtomicU8,

    /// Source of `ScheduledTask::sequence`.
    sequencer: AtomicU64,

    /// Task runs finished by workers, periodic runs included.
    completed: AtomicU64,

    /// Interrupt flags of the live workers, raised by `shutdown_now`.
    workers: Mutex<Vec<Arc<InterruptFlag>>>,

    live_workers: AtomicUsize,

    terminated: Mutex<bool>,
    termination: Condvar,

    #[cfg(test)]
    pub(crate) tracker: Tracker,
}

impl Shared {
    fn new(cfg: ExecutorConfig) -> Self {
        let queue = DelayQueue::with_clock(Arc::clone(&cfg.clock));

        Self {
            cfg,
            queue,
            run_state: AtomicU8::new(RunState::Running as u8),
            sequencer: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            live_workers: AtomicUsize::new(0),
            terminated: Mutex::new(false),
            termination: Condvar::new(),
            #[cfg(test)]
            tracker: Tracker::new(),
        }
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.cfg.clock
    }

    pub(crate) fn run_state(&self) -> RunState {
        RunState::from_u8(self.run_state.load(Ordering::SeqCst))
    }

    /// Moves the run state forward to `target`. Returns `false` if it was
    /// already there or beyond.
    fn advance_run_state(&self, target: RunState) -> bool {
        let prev = self.run_state.fetch_max(target as u8, Ordering::SeqCst);
        prev < target as u8
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.run_state() >= RunState::Stop
    }

    /// Whether `task` may still run given the current run state.
    pub(crate) fn can_run_in_current_state(&self, task: &ScheduledTask) -> bool {
        match self.run_state() {
            RunState::Running => true,
            RunState::Shutdown if task.period().is_periodic() => {
                self.cfg.continue_existing_periodic_tasks_after_shutdown
            }
            RunState::Shutdown => {
                self.cfg.execute_existing_delayed_tasks_after_shutdown || task.delay().is_zero()
            }
            RunState::Stop | RunState::Terminated => false,
        }
    }

    fn delayed_execute(&self, task: &Arc<ScheduledTask>) -> Result<(), TaskError> {
        if self.run_state() != RunState::Running {
            return Err(RejectReason::Shutdown.into());
        }

        self.queue.offer(Arc::clone(task));
        tracing::trace!(task.id = %task.id(), period = ?task.period(), "task scheduled");

        // A shutdown may have slipped in between the check and the offer.
        if !self.can_run_in_current_state(task) && self.queue.remove(task) {
            task.runnable().cancel(false);
        }

        Ok(())
    }

    /// Puts a periodic task back in the queue for its next run, or cancels it
    /// if the executor no longer runs it.
    pub(crate) fn reexecute_periodic(&self, task: &Arc<ScheduledTask>) {
        if self.can_run_in_current_state(task) {
            self.queue.offer(Arc::clone(task));
            tracing::trace!(task.id = %task.id(), "periodic task rescheduled");

            if self.can_run_in_current_state(task) || !self.queue.remove(task) {
                return;
            }
        }

        tracing::warn!(task.id = %task.id(), "periodic task cancelled by shutdown");
        task.runnable().cancel(false);
    }

    pub(crate) fn remove_cancelled(&self, task: &Arc<ScheduledTask>) {
        if self.cfg.remove_on_cancel && self.queue.remove(task) {
            tracing::trace!(task.id = %task.id(), "cancelled task unlinked");
        }
    }

    /// Drops the queued tasks the shutdown policies do not keep.
    fn on_shutdown(&self) {
        let keep_delayed = self.cfg.execute_existing_delayed_tasks_after_shutdown;
        let keep_periodic = self.cfg.continue_existing_periodic_tasks_after_shutdown;

        for task in self.queue.snapshot() {
            let dropped = if task.period().is_periodic() {
                !keep_periodic
            } else {
                !keep_delayed && !task.delay().is_zero()
            };

            if (dropped || task.runnable().state().is_cancelled()) && self.queue.remove(&task) {
                task.runnable().cancel(false);
            }
        }
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequencer.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn task_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_started(&self, flag: Arc<InterruptFlag>) {
        self.live_workers.fetch_add(1, Ordering::SeqCst);
        self.workers.lock().push(flag);
    }

    pub(crate) fn worker_exited(&self, flag: &Arc<InterruptFlag>) {
        self.workers.lock().retain(|f| !Arc::ptr_eq(f, flag));

        if self.live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.terminate();
        }
    }

    fn terminate(&self) {
        self.advance_run_state(RunState::Terminated);

        let mut terminated = self.terminated.lock();
        *terminated = true;
        self.termination.notify_all();

        tracing::debug!("executor terminated");
    }

    fn interrupt_workers(&self) {
        for flag in self.workers.lock().iter() {
            flag.interrupt();
        }
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("run_state", &self.run_state())
            .field("queue", &self.queue)
            .field("live_workers", &self.live_workers.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Runs tasks after a delay, or periodically, on a fixed pool of threads.
///
/// Tasks are ordered by trigger time; tasks due at the same time run in
/// submission order. Dropping the executor stops it like
/// [`shutdown_now`](Self::shutdown_now) and joins the worker threads.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tempolo::Builder;
///
/// let executor = Builder::new().worker_threads(1).try_build().unwrap();
/// let ticks = Arc::new(AtomicUsize::new(0));
///
/// let counter = ticks.clone();
/// let ticker = executor
///     .schedule_at_fixed_rate(
///         move || {
///             counter.fetch_add(1, Ordering::SeqCst);
///             Ok(())
///         },
///         Duration::ZERO,
///         Duration::from_millis(5),
///     )
///     .unwrap();
///
/// while ticks.load(Ordering::SeqCst) < 3 {
///     std::thread::sleep(Duration::from_millis(1));
/// }
///
/// ticker.cancel(false);
/// assert!(ticker.get().unwrap_err().is_cancelled());
/// ```
pub struct ScheduledExecutor {
    shared: Arc<Shared>,
    pool: ThreadPool,
}

impl ScheduledExecutor {
    pub(crate) fn start(cfg: ExecutorConfig) -> Result<ScheduledExecutor> {
        let shared = Arc::new(Shared::new(cfg));
        let pool = ThreadPool::spawn(&shared)?;

        tracing::debug!(workers = shared.cfg.worker_threads, "executor started");
        Ok(ScheduledExecutor { shared, pool })
    }

    /// Runs `work` as soon as a worker is available.
    pub fn submit<T, F>(&self, work: F) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.schedule(work, Duration::ZERO)
    }

    /// Runs `work` once, `delay` from now.
    pub fn schedule<T, F>(&self, work: F, delay: Duration) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let cell = Arc::new(TaskCell::once(work));
        self.schedule_cell(cell, delay, Period::Once)
    }

    /// Runs `work` after `initial_delay`, then every `period`.
    ///
    /// Runs never overlap: a run that takes longer than `period` delays the
    /// next one, which then starts late. The schedule itself does not drift.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        work: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<TaskHandle<()>, TaskError>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(RejectReason::NonPositivePeriod.into());
        }

        let cell = Arc::new(self.periodic_cell(Box::new(work)));
        self.schedule_cell(cell, initial_delay, Period::FixedRate(period))
    }

    /// Runs `work` after `initial_delay`, then `delay` after the end of each
    /// run.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        work: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<TaskHandle<()>, TaskError>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        if delay.is_zero() {
            return Err(RejectReason::NonPositivePeriod.into());
        }

        let cell = Arc::new(self.periodic_cell(Box::new(work)));
        self.schedule_cell(cell, initial_delay, Period::FixedDelay(delay))
    }

    fn periodic_cell(&self, work: Work<()>) -> TaskCell<()> {
        TaskCell::new(work, self.shared.cfg.periodic_failure_policy)
    }

    fn schedule_cell<T>(
        &self,
        cell: Arc<TaskCell<T>>,
        delay: Duration,
        period: Period,
    ) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + Sync + 'static,
    {
        let shared = &self.shared;
        let trigger = deadline_after(shared.clock().now_nanos(), delay);

        let runnable: Arc<dyn Runnable> = cell.clone();
        let runnable = match &shared.cfg.task_decorator {
            Some(decorator) => decorator.decorate(&period, runnable),
            None => runnable,
        };

        let task = Arc::new(ScheduledTask::new(
            cell.id(),
            shared.next_sequence(),
            trigger,
            period,
            runnable,
            shared,
        ));

        shared.delayed_execute(&task)?;
        Ok(TaskHandle::scheduled(cell, task))
    }

    /// Stops accepting tasks. Queued tasks run or get cancelled according to
    /// the shutdown policies of the builder. Does not wait.
    pub fn shutdown(&self) {
        let shared = &self.shared;

        if shared.advance_run_state(RunState::Shutdown) {
            tracing::debug!(queued = shared.queue.len(), "executor shutting down");
        }

        shared.on_shutdown();
        shared.queue.close();
    }

    /// Stops accepting tasks, cancels every queued task and interrupts the
    /// running ones. Returns the ids of the tasks that never started.
    pub fn shutdown_now(&self) -> Vec<Id> {
        let shared = &self.shared;

        if shared.advance_run_state(RunState::Stop) {
            tracing::debug!(queued = shared.queue.len(), "executor stopping");
        }

        shared.queue.close();
        shared.interrupt_workers();

        shared
            .queue
            .drain()
            .into_iter()
            .map(|task| {
                task.runnable().cancel(false);
                task.id()
            })
            .collect()
    }

    /// Blocks until every worker exited after a shutdown, or `timeout`
    /// elapsed. Returns whether the executor terminated.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        let deadline = Instant::now().checked_add(timeout);
        let mut terminated = shared.terminated.lock();

        while !*terminated {
            match deadline {
                Some(deadline) => {
                    if shared
                        .termination
                        .wait_until(&mut terminated, deadline)
                        .timed_out()
                    {
                        return *terminated;
                    }
                }
                None => shared.termination.wait(&mut terminated),
            }
        }

        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.run_state() >= RunState::Shutdown
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.run_state() == RunState::Terminated
    }

    /// Number of tasks waiting in the queue, cancelled ones included until
    /// they are discarded.
    pub fn queued_task_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of task runs the workers finished, each period of a periodic
    /// task counting once.
    pub fn completed_task_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn worker_threads(&self) -> usize {
        self.shared.cfg.worker_threads
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl fmt::Debug for ScheduledExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledExecutor")
            .field("shared", &self.shared)
            .finish_non_exhaustive()
    }
}

impl Drop for ScheduledExecutor {
    fn drop(&mut self) {
        self.shutdown_now();

        if let Err(e) = self.pool.join_all() {
            tracing::error!(error = %e, "error during executor shutdown");
        }
    }
}
