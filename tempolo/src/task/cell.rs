use crate::context;
use crate::interrupt::InterruptFlag;
use crate::runtime::PeriodicFailurePolicy;
use crate::task::id::TaskIdGuard;
use crate::task::state::State;
use crate::task::waiters::{WaitNode, WaitStack};
use crate::task::{Id, TaskError, TaskState};
use crate::utils::ScopeGuard;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// The body of a task. One-shot work is adapted to `FnMut` by
/// [`TaskCell::once`].
pub(crate) type Work<T> = Box<dyn FnMut() -> anyhow::Result<T> + Send>;

pub(crate) type DoneHook = Box<dyn FnOnce(TaskState) + Send>;

/// Shared core of a [`TaskHandle`](crate::TaskHandle).
///
/// The state machine decides who owns the outcome: whoever moves the state out
/// of `New` first is the only writer of `outcome`, the only one allowed to
/// drain `waiters`, and the only one calling the done hook.
pub(crate) struct TaskCell<T> {
    id: Id,

    state: State,

    /// Taken out while running. Dropped once the cell is done.
    work: Mutex<Option<Work<T>>>,

    /// Written once, before a terminal state is published.
    outcome: OnceLock<Result<T, TaskError>>,

    /// Interrupt flag of the thread currently executing `work`. Doubles as the
    /// claim that makes concurrent `run` calls mutually exclusive.
    runner: Mutex<Option<Arc<InterruptFlag>>>,

    waiters: WaitStack,

    done_hook: Mutex<Option<DoneHook>>,

    failure_policy: PeriodicFailurePolicy,
}

impl<T: Send + Sync + 'static> TaskCell<T> {
    pub(crate) fn new(work: Work<T>, failure_policy: PeriodicFailurePolicy) -> Self {
        Self {
            id: Id::next(),
            state: State::new(),
            work: Mutex::new(Some(work)),
            outcome: OnceLock::new(),
            runner: Mutex::new(None),
            waiters: WaitStack::new(),
            done_hook: Mutex::new(None),
            failure_policy,
        }
    }

    pub(crate) fn once<F>(work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let mut work = Some(work);
        let work: Work<T> = Box::new(move || match work.take() {
            Some(work) => work(),
            None => Err(anyhow::anyhow!("one-shot task executed twice")),
        });

        Self::new(work, PeriodicFailurePolicy::default())
    }

    pub(crate) fn set_done_hook(&self, hook: DoneHook) {
        *self.done_hook.lock() = Some(hook);
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    /// Runs the work unless the cell already left `New` or another thread is
    /// running it.
    pub(crate) fn run(&self) {
        if self.state.load() != TaskState::New || !self.claim_runner() {
            return;
        }

        let _release = ScopeGuard::new(|| self.release_runner());

        // A cancel may have won between the first check and the claim.
        if self.state.load() != TaskState::New {
            return;
        }

        let work = self.work.lock().take();
        let Some(mut work) = work else {
            return;
        };

        let outcome = self.execute(&mut work);
        drop(work);
        self.complete(outcome);
    }

    /// Runs the work without recording an outcome, leaving the cell in `New`
    /// so it can run again. Returns `true` if the task should run again.
    pub(crate) fn run_and_reset(&self) -> bool {
        if self.state.load() != TaskState::New || !self.claim_runner() {
            return false;
        }

        let _release = ScopeGuard::new(|| self.release_runner());

        if self.state.load() != TaskState::New {
            return false;
        }

        let work = self.work.lock().take();
        let Some(mut work) = work else {
            return false;
        };

        let ran = match self.execute(&mut work) {
            Ok(_) => true,
            Err(error) => match self.failure_policy {
                PeriodicFailurePolicy::Abort => {
                    self.complete(Err(error));
                    false
                }
                PeriodicFailurePolicy::Reschedule => {
                    tracing::warn!(task.id = %self.id, %error, "periodic run failed, rescheduling");
                    true
                }
            },
        };

        // Hand the work back for the next run. A cancel that won in the
        // meantime already emptied the slot and must not see it refilled.
        let mut slot = self.work.lock();
        if self.state.load() == TaskState::New {
            *slot = Some(work);
        }
        drop(slot);

        ran && self.state.load() == TaskState::New
    }

    /// Attempts `New -> Cancelled`, or `New -> Interrupting -> Interrupted`
    /// when `may_interrupt` is set. Fails once the cell left `New`.
    pub(crate) fn cancel(&self, may_interrupt: bool) -> bool {
        let (transient, terminal) = if may_interrupt {
            (TaskState::Interrupting, TaskState::Interrupted)
        } else {
            (TaskState::Cancelled, TaskState::Cancelled)
        };

        if !self.state.transition(TaskState::New, transient) {
            return false;
        }

        if may_interrupt {
            let runner = self.runner.lock().clone();
            if let Some(flag) = runner {
                flag.interrupt();
            }

            self.state.publish(TaskState::Interrupted);
        }

        self.finish_completion(terminal);
        true
    }

    /// Blocks until an outcome is decided and returns it.
    pub(crate) fn wait(&self) -> Result<&T, TaskError> {
        let state = self.await_done(None)?;
        self.report(state)
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Result<&T, TaskError> {
        let state = self.await_done(Some(timeout))?;
        self.report(state)
    }

    pub(crate) fn try_get(&self) -> Option<Result<&T, TaskError>> {
        let state = self.state.load();
        state.is_done().then(|| self.report(state))
    }

    fn claim_runner(&self) -> bool {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return false;
        }

        *runner = Some(context::interrupt_flag());
        true
    }

    fn release_runner(&self) {
        self.runner.lock().take();

        // An interrupt is being delivered to this thread. Let it land before
        // the thread moves on to something else.
        while self.state.load() == TaskState::Interrupting {
            thread::yield_now();
        }
    }

    fn execute(&self, work: &mut Work<T>) -> Result<T, TaskError> {
        let _id = TaskIdGuard::enter(self.id);

        match panic::catch_unwind(AssertUnwindSafe(|| work())) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(TaskError::failed(self.id, error)),
            Err(payload) => Err(TaskError::panicked(self.id, payload)),
        }
    }

    fn complete(&self, outcome: Result<T, TaskError>) -> bool {
        if !self.state.transition(TaskState::New, TaskState::Completing) {
            return false;
        }

        let terminal = match outcome {
            Ok(_) => TaskState::Normal,
            Err(_) => TaskState::Exceptional,
        };

        // Only the winner of the transition above gets here.
        let _ = self.outcome.set(outcome);
        self.state.publish(terminal);

        self.finish_completion(terminal);
        true
    }

    fn finish_completion(&self, terminal: TaskState) {
        self.waiters.release_all();

        let work = self.work.lock().take();
        drop(work);

        let hook = self.done_hook.lock().take();
        if let Some(hook) = hook {
            hook(terminal);
        }
    }

    fn await_done(&self, timeout: Option<Duration>) -> Result<TaskState, TaskError> {
        // An unrepresentable deadline is as good as no deadline.
        let limit = timeout.and_then(|t| Instant::now().checked_add(t).map(|d| (t, d)));
        let deadline = limit.map(|(_, d)| d);
        let mut node: Option<Arc<WaitNode>> = None;
        let mut queued = false;

        loop {
            let state = self.state.load();

            if state.is_done() {
                if let Some(node) = &node {
                    node.deactivate();
                }
                return Ok(state);
            }

            if state == TaskState::Completing {
                // The outcome is a few instructions away.
                thread::yield_now();
                continue;
            }

            let now = Instant::now();
            match limit {
                Some((timeout, deadline)) if now >= deadline => {
                    if let Some(node) = &node {
                        node.deactivate();
                        self.remove_waiters();
                    }

                    let state = self.state.load();
                    return if state.is_done() {
                        Ok(state)
                    } else {
                        Err(TaskError::Timeout(timeout))
                    };
                }
                _ => {}
            }

            match &node {
                None => node = Some(WaitNode::for_current_thread()),
                Some(waiter) if !queued => {
                    self.waiters.push(Arc::clone(waiter));
                    queued = true;
                }
                Some(_) => match deadline {
                    Some(deadline) => thread::park_timeout(deadline - now),
                    None => thread::park(),
                },
            }
        }
    }

    /// Unlinks deactivated waiters. A completer may have drained the stack
    /// while it was being pruned, release again if that happened.
    fn remove_waiters(&self) {
        self.waiters.prune();

        if self.state.load().is_done() {
            self.waiters.release_all();
        }
    }

    fn report(&self, state: TaskState) -> Result<&T, TaskError> {
        match state {
            TaskState::Normal | TaskState::Exceptional => match self.outcome.get() {
                Some(Ok(value)) => Ok(value),
                Some(Err(error)) => Err(error.clone()),
                None => unreachable!("task {} published {state:?} without an outcome", self.id),
            },
            _ => Err(TaskError::Cancelled(self.id)),
        }
    }

    #[cfg(test)]
    pub(crate) fn num_waiters(&self) -> usize {
        self.waiters.len()
    }

    #[cfg(test)]
    pub(crate) fn has_runner(&self) -> bool {
        self.runner.lock().is_some()
    }
}

impl<T> fmt::Debug for TaskCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCell")
            .field("id", &self.id)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// Type-erased view of a task that a worker thread can drive.
///
/// Task decorators receive and return this trait object; a decorator must
/// forward every call to the runnable it wraps.
pub trait Runnable: Send + Sync + 'static {
    fn id(&self) -> Id;

    /// Runs a one-shot task.
    fn run(&self);

    /// Runs one period of a periodic task. Returns `true` if it should run
    /// again.
    fn run_and_reset(&self) -> bool;

    fn cancel(&self, may_interrupt: bool) -> bool;

    fn state(&self) -> TaskState;
}

impl<T: Send + Sync + 'static> Runnable for TaskCell<T> {
    fn id(&self) -> Id {
        TaskCell::id(self)
    }

    fn run(&self) {
        TaskCell::run(self)
    }

    fn run_and_reset(&self) -> bool {
        TaskCell::run_and_reset(self)
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        TaskCell::cancel(self, may_interrupt)
    }

    fn state(&self) -> TaskState {
        TaskCell::state(self)
    }
}
