use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a task.
///
/// Possible transitions:
///
/// ```text
/// New -> Completing -> Normal
/// New -> Completing -> Exceptional
/// New -> Cancelled
/// New -> Interrupting -> Interrupted
/// ```
///
/// The discriminants are ordered: any state greater than `Completing` means
/// the outcome of the task is decided, any state from `Cancelled` on means the
/// task was cancelled.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskState {
    /// Not started, or a periodic task between two runs.
    New = 0,

    /// The outcome is being stored. Lasts only a few instructions.
    Completing = 1,

    /// Completed with a value.
    Normal = 2,

    /// Completed with a failure.
    Exceptional = 3,

    /// Cancelled without interrupting the runner.
    Cancelled = 4,

    /// Cancelled, an interrupt is being delivered to the runner.
    Interrupting = 5,

    /// Cancelled, the runner was interrupted.
    Interrupted = 6,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::New,
            1 => TaskState::Completing,
            2 => TaskState::Normal,
            3 => TaskState::Exceptional,
            4 => TaskState::Cancelled,
            5 => TaskState::Interrupting,
            6 => TaskState::Interrupted,
            _ => unreachable!("invalid task state: {v}"),
        }
    }

    /// The outcome is decided. `Interrupting` counts as decided: the task is
    /// cancelled, only the bookkeeping is still in progress.
    pub fn is_done(self) -> bool {
        self > TaskState::Completing
    }

    pub fn is_cancelled(self) -> bool {
        self >= TaskState::Cancelled
    }

    /// Final states; no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Normal
                | TaskState::Exceptional
                | TaskState::Cancelled
                | TaskState::Interrupted
        )
    }
}

/// Atomic cell holding a [`TaskState`].
///
/// All accesses are `SeqCst`: waiters push themselves on the waiter stack and
/// then load the state, while completers store the state and then drain the
/// stack. Both sides must agree on a single order of these two operations.
#[derive(Debug)]
pub(crate) struct State(AtomicU8);

impl State {
    pub(crate) fn new() -> State {
        State(AtomicU8::new(TaskState::New as u8))
    }

    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Performs `from -> to` if the current state is `from`.
    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Publishes the final state after a successful `transition` out of `New`.
    /// Only the thread that won that transition may call this.
    pub(crate) fn publish(&self, to: TaskState) {
        debug_assert!(
            matches!(
                (self.load(), to),
                (TaskState::Completing, TaskState::Normal)
                    | (TaskState::Completing, TaskState::Exceptional)
                    | (TaskState::Interrupting, TaskState::Interrupted)
            ),
            "invalid publish to {to:?}"
        );
        self.0.store(to as u8, Ordering::SeqCst);
    }
}
