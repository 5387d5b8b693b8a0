//! Thread-local state of the threads that execute tasks.

use crate::interrupt::InterruptFlag;
use crate::task::Id;
use std::cell::Cell;
use std::sync::Arc;

thread_local! {
    /// Id of the task currently running on this thread.
    static CURRENT_TASK_ID: Cell<Option<Id>> = const { Cell::new(None) };

    /// Interrupt flag of this thread. Cloned into a task's runner slot while
    /// the thread executes it, so that `cancel(true)` can reach it.
    static INTERRUPT_FLAG: Arc<InterruptFlag> = Arc::new(InterruptFlag::for_current_thread());
}

pub(crate) fn current_task_id() -> Option<Id> {
    CURRENT_TASK_ID.with(|id| id.get())
}

/// Returns the previous task id so that nested executions can restore it.
pub(crate) fn set_current_task_id(id: Option<Id>) -> Option<Id> {
    CURRENT_TASK_ID.with(|cell| cell.replace(id))
}

pub(crate) fn interrupt_flag() -> Arc<InterruptFlag> {
    INTERRUPT_FLAG.with(Arc::clone)
}

pub(crate) fn with_interrupt_flag<R>(f: impl FnOnce(&InterruptFlag) -> R) -> R {
    INTERRUPT_FLAG.with(|flag| f(flag))
}
