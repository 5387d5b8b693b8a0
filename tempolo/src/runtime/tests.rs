use super::*;
use crate::interrupt;
use crate::task::{Id, RejectReason, Runnable, TaskError, TaskState, try_id};
use crate::test_utils::{ManualClock, init_tracing};
use crate::time::{Clock, MonotonicClock, Period};
use crate::utils::tracker::{Call, Method};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

assert_impl_all!(ScheduledExecutor: Send, Sync);
assert_impl_all!(Builder: Send);

const MS: u64 = 1_000_000;

fn executor(workers: usize) -> Result<ScheduledExecutor> {
    Builder::new().worker_threads(workers).try_build()
}

/// Spins until `cond` holds or `timeout` elapsed.
fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Trigger times of the recorded runs of task `id`, in run order.
fn run_triggers(executor: &ScheduledExecutor, id: Id) -> Vec<u64> {
    executor
        .shared()
        .tracker
        .get_calls(&Method::Run)
        .into_iter()
        .filter_map(|call| match call {
            Call::Run { id: ran, trigger, .. } if ran == id => Some(trigger),
            _ => None,
        })
        .collect()
}

fn counter_task(runs: &Arc<AtomicUsize>) -> impl FnMut() -> Result<()> + Send + 'static {
    let runs = Arc::clone(runs);
    move || {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_workers_start_and_terminate() -> Result<()> {
    let _trace = init_tracing();
    let executor = executor(3)?;

    assert_eq!(executor.worker_threads(), 3);
    assert!(!executor.is_shutdown());
    assert!(!executor.await_termination(Duration::from_millis(10)));

    executor.shutdown();
    assert!(executor.is_shutdown());
    assert!(executor.await_termination(Duration::from_secs(5)));
    assert!(executor.is_terminated());
    Ok(())
}

#[test]
fn test_submit_runs_on_worker() -> Result<()> {
    let executor = executor(2)?;

    let handle = executor.submit(|| Ok(thread::current().name().map(String::from)))?;
    let name = handle.get()?.expect("workers are named");

    assert!(name.starts_with("tempolo-"));
    assert!(wait_until(Duration::from_secs(5), || executor.completed_task_count() == 1));
    Ok(())
}

#[test]
fn test_task_id_visible_inside_scheduled_work() -> Result<()> {
    let executor = executor(1)?;

    let handle = executor.submit(|| Ok(try_id()))?;
    assert_eq!(handle.get()?, Some(handle.id()));
    Ok(())
}

/// A one-shot task scheduled 50ms out blocks `get` for at least that long.
#[test]
fn test_one_shot_delay() -> Result<()> {
    let executor = executor(2)?;

    let start = Instant::now();
    let handle = executor.schedule(|| Ok("ready"), Duration::from_millis(50))?;

    assert!(!handle.is_periodic());
    assert!(handle.delay().is_some_and(|d| d <= Duration::from_millis(50)));

    assert_eq!(handle.get()?, "ready");
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(handle.delay(), Some(Duration::ZERO));
    Ok(())
}

/// Fixed-rate runs are spaced by exactly one period, regardless of how long
/// each run takes.
#[test]
fn test_fixed_rate_spacing() -> Result<()> {
    let executor = executor(2)?;
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let handle = executor.schedule_at_fixed_rate(
        move || {
            // Uneven but always shorter than the period.
            let n = counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(2 * (n as u64 % 4)));
            Ok(())
        },
        Duration::ZERO,
        Duration::from_millis(20),
    )?;

    assert!(handle.is_periodic());
    assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) >= 5));
    assert!(handle.cancel(false));

    let triggers = run_triggers(&executor, handle.id());
    assert!(triggers.len() >= 5);

    for pair in triggers[..5].windows(2) {
        assert_eq!(pair[1] - pair[0], 20 * MS);
    }

    assert!(handle.get().expect_err("cancelled").is_cancelled());
    Ok(())
}

/// Fixed-delay runs start one delay after the previous run completed.
#[test]
fn test_fixed_delay_measured_from_completion() -> Result<()> {
    let clock = MonotonicClock::new();
    let executor = Builder::new().worker_threads(2).clock(clock).try_build()?;
    let ends = Arc::new(Mutex::new(Vec::new()));

    let finished = Arc::clone(&ends);
    let handle = executor.schedule_with_fixed_delay(
        move || {
            thread::sleep(Duration::from_millis(30));
            finished.lock().push(clock.now_nanos());
            Ok(())
        },
        Duration::ZERO,
        Duration::from_millis(20),
    )?;

    assert!(wait_until(Duration::from_secs(5), || ends.lock().len() >= 3));
    handle.cancel(false);

    let triggers = run_triggers(&executor, handle.id());
    let ends = ends.lock().clone();

    for (i, end) in ends.iter().enumerate().take(2) {
        assert!(triggers[i + 1] >= end + 20 * MS, "run {} started too early", i + 1);
    }
    Ok(())
}

/// A task cancelled before any worker claimed it never runs.
#[rstest]
#[case::kept_in_queue(false, 1)]
#[case::removed(true, 0)]
fn test_cancel_before_claim(#[case] remove_on_cancel: bool, #[case] queued: usize) -> Result<()> {
    let executor = Builder::new()
        .worker_threads(1)
        .remove_on_cancel(remove_on_cancel)
        .try_build()?;
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let handle = executor.schedule(
        move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
        Duration::from_millis(100),
    )?;

    assert!(handle.cancel(false));
    assert_eq!(executor.queued_task_count(), queued);

    let start = Instant::now();
    assert!(handle.get().expect_err("cancelled").is_cancelled());
    assert!(start.elapsed() < Duration::from_millis(100));

    // Let the trigger pass; a worker discards the cancelled task if it is
    // still queued.
    assert!(wait_until(Duration::from_secs(5), || executor.queued_task_count() == 0));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(handle.state(), TaskState::Cancelled);
    Ok(())
}

/// Cancelling with interrupt while a worker runs the task reaches the worker.
#[test]
fn test_cancel_interrupts_worker() -> Result<()> {
    let executor = executor(1)?;
    let (started_tx, started_rx) = mpsc::channel();
    let (seen_tx, seen_rx) = mpsc::channel();

    let handle = executor.submit(move || {
        started_tx.send(())?;
        let interrupted = interrupt::sleep(Duration::from_secs(10)).is_err();
        seen_tx.send(interrupted)?;
        Ok(())
    })?;

    started_rx.recv_timeout(Duration::from_secs(5))?;
    assert!(handle.cancel(true));

    assert!(seen_rx.recv_timeout(Duration::from_secs(5))?);
    assert!(wait_until(Duration::from_secs(5), || handle.state() == TaskState::Interrupted));
    assert!(handle.get().expect_err("cancelled").is_cancelled());

    // The interrupt does not leak into the next task on that worker.
    let next = executor.submit(|| Ok(interrupt::is_interrupted()))?;
    assert!(!next.get()?);
    Ok(())
}

#[test]
fn test_equal_triggers_run_in_submission_order() -> Result<()> {
    let executor = Builder::new()
        .worker_threads(1)
        .clock(ManualClock::new(0))
        .try_build()?;
    let order = Arc::new(Mutex::new(Vec::new()));

    // Hold the only worker until everything is queued.
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate = executor.submit(move || Ok(gate_rx.recv()?))?;

    let handles = (0..5)
        .map(|i| {
            let order = Arc::clone(&order);
            executor.submit(move || {
                order.lock().push(i);
                Ok(())
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    gate_tx.send(())?;
    gate.get()?;
    for handle in &handles {
        handle.get()?;
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[rstest]
#[case::rate(true)]
#[case::delay(false)]
fn test_zero_period_rejected(#[case] fixed_rate: bool) -> Result<()> {
    let executor = executor(1)?;

    let res = if fixed_rate {
        executor.schedule_at_fixed_rate(|| Ok(()), Duration::ZERO, Duration::ZERO)
    } else {
        executor.schedule_with_fixed_delay(|| Ok(()), Duration::ZERO, Duration::ZERO)
    };

    let err = res.expect_err("zero period");
    assert!(matches!(err, TaskError::Rejected(RejectReason::NonPositivePeriod)));
    assert_eq!(executor.queued_task_count(), 0);
    Ok(())
}

#[test]
fn test_rejects_after_shutdown() -> Result<()> {
    let executor = executor(1)?;
    executor.shutdown();

    let err = executor.submit(|| Ok(1)).expect_err("executor is shut down");
    assert!(matches!(err, TaskError::Rejected(RejectReason::Shutdown)));
    Ok(())
}

#[rstest]
#[case::executes(true)]
#[case::cancels(false)]
fn test_delayed_tasks_after_shutdown(#[case] keep: bool) -> Result<()> {
    let executor = Builder::new()
        .worker_threads(1)
        .execute_existing_delayed_tasks_after_shutdown(keep)
        .try_build()?;

    let handle = executor.schedule(|| Ok(7), Duration::from_millis(30))?;
    executor.shutdown();

    if keep {
        assert_eq!(handle.get()?, 7);
    } else {
        assert!(handle.get().expect_err("dropped on shutdown").is_cancelled());
    }

    assert!(executor.await_termination(Duration::from_secs(5)));
    Ok(())
}

#[test]
fn test_periodic_tasks_cancelled_on_shutdown_by_default() -> Result<()> {
    let executor = executor(1)?;
    let runs = Arc::new(AtomicUsize::new(0));

    let handle = executor.schedule_at_fixed_rate(
        counter_task(&runs),
        Duration::from_millis(50),
        Duration::from_millis(10),
    )?;

    executor.shutdown();
    assert!(handle.get().expect_err("dropped on shutdown").is_cancelled());
    assert!(executor.await_termination(Duration::from_secs(5)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_periodic_tasks_continue_after_shutdown_when_asked() -> Result<()> {
    let executor = Builder::new()
        .worker_threads(1)
        .continue_existing_periodic_tasks_after_shutdown(true)
        .try_build()?;
    let runs = Arc::new(AtomicUsize::new(0));

    let handle = executor.schedule_with_fixed_delay(
        counter_task(&runs),
        Duration::ZERO,
        Duration::from_millis(5),
    )?;

    executor.shutdown();
    let before = runs.load(Ordering::SeqCst);
    assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) >= before + 3));
    assert!(!executor.is_terminated());

    let never_started = executor.shutdown_now();
    assert!(executor.await_termination(Duration::from_secs(5)));
    assert!(handle.get().expect_err("stopped").is_cancelled());
    assert!(never_started.len() <= 1);
    Ok(())
}

#[test]
fn test_shutdown_now_cancels_queue_and_interrupts() -> Result<()> {
    let _trace = init_tracing();
    let executor = executor(1)?;
    let (started_tx, started_rx) = mpsc::channel();

    let running = executor.submit(move || {
        started_tx.send(())?;
        interrupt::sleep(Duration::from_secs(10))?;
        Ok("slept")
    })?;
    started_rx.recv_timeout(Duration::from_secs(5))?;

    let queued = (0..3)
        .map(|_| executor.schedule(|| Ok(()), Duration::from_secs(60)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut ids = executor.shutdown_now();
    ids.sort();
    let mut expected = queued.iter().map(|h| h.id()).collect::<Vec<_>>();
    expected.sort();
    assert_eq!(ids, expected);

    for handle in &queued {
        assert!(handle.get().expect_err("drained").is_cancelled());
    }

    // The running task saw the interrupt and failed with it.
    let err = running.get().expect_err("interrupted");
    assert!(err.failure().is_some_and(|e| e.is::<interrupt::Interrupted>()));

    assert!(executor.await_termination(Duration::from_secs(5)));
    assert!(executor.is_terminated());
    Ok(())
}

#[rstest]
#[case::abort(PeriodicFailurePolicy::Abort)]
#[case::reschedule(PeriodicFailurePolicy::Reschedule)]
fn test_periodic_failure_policy(#[case] policy: PeriodicFailurePolicy) -> Result<()> {
    let _trace = init_tracing();
    let executor = Builder::new()
        .worker_threads(1)
        .periodic_failure_policy(policy)
        .try_build()?;
    let runs = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&runs);
    let handle = executor.schedule_at_fixed_rate(
        move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                Err(anyhow!("third run failed"))
            } else {
                Ok(())
            }
        },
        Duration::ZERO,
        Duration::from_millis(5),
    )?;

    match policy {
        PeriodicFailurePolicy::Abort => {
            let err = handle.get().expect_err("aborted");
            assert!(err.is_execution_failure());
            assert_eq!(handle.state(), TaskState::Exceptional);

            thread::sleep(Duration::from_millis(30));
            assert_eq!(runs.load(Ordering::SeqCst), 3);
            assert_eq!(executor.queued_task_count(), 0);
        }
        PeriodicFailurePolicy::Reschedule => {
            assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) >= 6));
            assert_eq!(handle.state(), TaskState::New);
            assert!(handle.cancel(false));
        }
    }
    Ok(())
}

struct Counted {
    inner: Arc<dyn Runnable>,
    runs: Arc<AtomicUsize>,
}

impl Runnable for Counted {
    fn id(&self) -> Id {
        self.inner.id()
    }

    fn run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.run()
    }

    fn run_and_reset(&self) -> bool {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.run_and_reset()
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        self.inner.cancel(may_interrupt)
    }

    fn state(&self) -> TaskState {
        self.inner.state()
    }
}

#[test]
fn test_decorator_wraps_every_task() -> Result<()> {
    let runs = Arc::new(AtomicUsize::new(0));
    let periods = Arc::new(Mutex::new(Vec::new()));

    let executor = {
        let runs = Arc::clone(&runs);
        let periods = Arc::clone(&periods);

        Builder::new()
            .worker_threads(1)
            .task_decorator(move |period, inner| {
                periods.lock().push(*period);
                Arc::new(Counted {
                    inner,
                    runs: Arc::clone(&runs),
                })
            })
            .try_build()?
    };

    executor.submit(|| Ok(()))?.get()?;

    let ticks = Arc::new(AtomicUsize::new(0));
    let periodic = executor.schedule_at_fixed_rate(
        counter_task(&ticks),
        Duration::ZERO,
        Duration::from_millis(5),
    )?;
    assert!(wait_until(Duration::from_secs(5), || ticks.load(Ordering::SeqCst) >= 2));
    assert!(periodic.cancel(false));

    assert_eq!(
        *periods.lock(),
        vec![Period::Once, Period::FixedRate(Duration::from_millis(5))]
    );
    assert!(runs.load(Ordering::SeqCst) >= 3);
    Ok(())
}

#[test]
fn test_single_worker_waits_once_per_head() -> Result<()> {
    let executor = executor(4)?;

    let handle = executor.schedule(|| Ok(()), Duration::from_millis(40))?;
    handle.get()?;

    assert_eq!(executor.shared().queue.tracker().max_timed_waiters(), 1);
    Ok(())
}

#[test]
fn test_drop_stops_periodic_tasks() -> Result<()> {
    let runs = Arc::new(AtomicUsize::new(0));

    let handle = {
        let executor = executor(2)?;
        let handle = executor.schedule_at_fixed_rate(
            counter_task(&runs),
            Duration::ZERO,
            Duration::from_millis(1),
        )?;
        assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) > 0));
        handle
    };

    // Workers are joined, nothing runs anymore.
    let after_drop = runs.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(runs.load(Ordering::SeqCst), after_drop);
    assert!(handle.get().expect_err("stopped").is_cancelled());
    Ok(())
}
