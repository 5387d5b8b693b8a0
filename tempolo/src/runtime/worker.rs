use crate::context;
use crate::runtime::executor::Shared;
use crate::runtime::scheduled::ScheduledTask;
use crate::task::panic_payload_as_str;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;

#[cfg(test)]
use crate::{
    queue::Delayed,
    utils::tracker::{Call, Method},
};

/// Worker thread body: pulls due tasks until the queue is closed and drained.
pub(super) fn run(shared: Arc<Shared>, ready: mpsc::Sender<()>) {
    let flag = context::interrupt_flag();
    shared.worker_started(Arc::clone(&flag));

    // The pool stops waiting on the first failed send, nothing to do.
    let _ = ready.send(());
    drop(ready);

    tracing::debug!("worker started");

    while let Some(task) = shared.queue.take() {
        // A stopping executor wants its tasks interrupted, otherwise a stale
        // interrupt must not leak into the next task. Recheck after clearing
        // in case `shutdown_now` raced with us.
        if shared.is_stopping() {
            flag.interrupt();
        } else {
            flag.clear();
            if shared.is_stopping() {
                flag.interrupt();
            }
        }

        #[cfg(test)]
        shared.tracker.record(
            Method::Run,
            Call::Run {
                id: task.id(),
                trigger: task.trigger_time(),
                started: shared.clock().now_nanos(),
            },
        );

        // Task cells catch panics of the work itself, this only catches
        // panicking decorators.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| run_task(&shared, &task))) {
            tracing::error!(
                task.id = %task.id(),
                panic = panic_payload_as_str(&*payload),
                "task panicked outside of its work"
            );
        }

        shared.task_completed();
    }

    tracing::debug!("worker exiting");
    shared.worker_exited(&flag);
}

fn run_task(shared: &Shared, task: &Arc<ScheduledTask>) {
    let runnable = task.runnable();

    if !shared.can_run_in_current_state(task) {
        runnable.cancel(false);
        return;
    }

    if !task.period().is_periodic() {
        runnable.run();
        return;
    }

    if runnable.run_and_reset() {
        task.set_next_trigger(shared.clock().now_nanos());
        shared.reexecute_periodic(task);
    }
}
