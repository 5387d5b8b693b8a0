use crate::queue::{Delayed, HeapIndex};
use crate::runtime::executor::Shared;
use crate::task::{Id, Runnable};
use crate::time::{Clock, Period};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A queued task: when it fires, how it repeats, and what to run.
pub(crate) struct ScheduledTask {
    id: Id,

    /// Tie-break between equal trigger times, in submission order.
    sequence: u64,

    /// Absolute deadline in clock nanoseconds. Only updated by the worker that
    /// popped the task, while the task is out of the queue.
    trigger: AtomicU64,

    period: Period,

    heap_index: HeapIndex,

    /// Possibly decorated view of the task cell.
    runnable: Arc<dyn Runnable>,

    clock: Arc<dyn Clock>,

    /// Used to unlink the task on cancel. Does not keep the executor alive.
    shared: Weak<Shared>,
}

impl ScheduledTask {
    pub(crate) fn new(
        id: Id,
        sequence: u64,
        trigger: u64,
        period: Period,
        runnable: Arc<dyn Runnable>,
        shared: &Arc<Shared>,
    ) -> Self {
        Self {
            id,
            sequence,
            trigger: AtomicU64::new(trigger),
            period,
            heap_index: HeapIndex::new(),
            runnable,
            clock: Arc::clone(shared.clock()),
            shared: Arc::downgrade(shared),
        }
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn period(&self) -> Period {
        self.period
    }

    pub(crate) fn runnable(&self) -> &Arc<dyn Runnable> {
        &self.runnable
    }

    /// Time left until the task is due, zero once it is.
    pub(crate) fn delay(&self) -> Duration {
        let now = self.clock.now_nanos();
        Duration::from_nanos(self.trigger_time().saturating_sub(now))
    }

    /// Moves the trigger to the next period once a run ended at `now`.
    pub(crate) fn set_next_trigger(&self, now: u64) -> Option<u64> {
        let next = self.period.next_trigger(self.trigger_time(), now)?;
        self.trigger.store(next, Ordering::Release);
        Some(next)
    }

    /// Cancels the task and, if the executor asks for it, unlinks it from
    /// the queue right away.
    pub(crate) fn cancel(self: &Arc<Self>, may_interrupt: bool) -> bool {
        let cancelled = self.runnable.cancel(may_interrupt);

        if cancelled && self.heap_index.is_resident() {
            if let Some(shared) = self.shared.upgrade() {
                shared.remove_cancelled(self);
            }
        }

        cancelled
    }
}

impl Delayed for ScheduledTask {
    fn trigger_time(&self) -> u64 {
        self.trigger.load(Ordering::Acquire)
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn heap_index(&self) -> &HeapIndex {
        &self.heap_index
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("sequence", &self.sequence)
            .field("trigger", &self.trigger_time())
            .field("period", &self.period)
            .field("heap_index", &self.heap_index.get())
            .finish()
    }
}
