//! Cooperative interruption of running tasks.
//!
//! Threads cannot be stopped from the outside. Instead every thread owns an
//! [`InterruptFlag`]; [`TaskHandle::cancel(true)`] and
//! [`ScheduledExecutor::shutdown_now`] raise the flag of the thread running the
//! task and unpark it. Long-running work is expected to poll
//! [`is_interrupted`], or to block through [`sleep`], and return early.
//!
//! ```
//! use std::time::Duration;
//! use tempolo::interrupt;
//!
//! let handle = tempolo::TaskHandle::new(|| {
//!     while interrupt::sleep(Duration::from_millis(5)).is_ok() {
//!         // do a slice of work
//!     }
//!     Ok("stopped")
//! });
//! # let _ = handle;
//! ```
//!
//! [`TaskHandle::cancel(true)`]: crate::task::TaskHandle::cancel
//! [`ScheduledExecutor::shutdown_now`]: crate::runtime::ScheduledExecutor::shutdown_now

use crate::context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Returned by blocking helpers when the current thread was interrupted.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("thread was interrupted")]
pub struct Interrupted;

/// Interrupt status of one thread.
#[derive(Debug)]
pub struct InterruptFlag {
    thread: Thread,
    raised: AtomicBool,
}

impl InterruptFlag {
    pub(crate) fn for_current_thread() -> Self {
        Self {
            thread: thread::current(),
            raised: AtomicBool::new(false),
        }
    }

    /// Raises the flag and unparks the owning thread so that it notices.
    pub fn interrupt(&self) {
        self.raised.store(true, Ordering::Release);
        self.thread.unpark();
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Lowers the flag, returning whether it was raised.
    pub(crate) fn clear(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }
}

/// Whether the current thread has been interrupted. The flag is left as is.
pub fn is_interrupted() -> bool {
    context::with_interrupt_flag(|flag| flag.is_raised())
}

/// Tests and clears the interrupt flag of the current thread.
pub fn interrupted() -> bool {
    context::with_interrupt_flag(|flag| flag.clear())
}

/// Interrupts the current thread.
pub fn interrupt_current() {
    context::with_interrupt_flag(|flag| flag.interrupt())
}

/// Sleeps for `dur` unless the current thread gets interrupted first.
///
/// On interruption the flag is cleared and `Err(Interrupted)` is returned.
pub fn sleep(dur: Duration) -> Result<(), Interrupted> {
    // An unrepresentable deadline is as good as no deadline.
    let deadline = Instant::now().checked_add(dur);

    context::with_interrupt_flag(|flag| {
        loop {
            if flag.clear() {
                return Err(Interrupted);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(());
                    }

                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::sync::Arc;
    use std::sync::mpsc;

    assert_impl_all!(InterruptFlag: Send, Sync);

    #[test]
    fn test_interrupted_clears_flag() {
        interrupt_current();
        assert!(is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
        assert!(!is_interrupted());
    }

    #[test]
    fn test_sleep_runs_to_completion() {
        let start = Instant::now();
        assert_eq!(sleep(Duration::from_millis(20)), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_sleep_returns_early_when_interrupted() -> Result<()> {
        let (tx, rx) = mpsc::channel::<Arc<InterruptFlag>>();

        let sleeper = thread::spawn(move || {
            tx.send(context::interrupt_flag()).expect("receiver alive");
            let start = Instant::now();
            let res = sleep(Duration::from_secs(10));
            (res, start.elapsed(), is_interrupted())
        });

        let flag = rx.recv()?;
        thread::sleep(Duration::from_millis(20));
        flag.interrupt();

        let (res, elapsed, still_raised) = sleeper.join().expect("sleeper panicked");
        assert_eq!(res, Err(Interrupted));
        assert!(elapsed < Duration::from_secs(5));
        assert!(!still_raised, "sleep consumes the interrupt");
        Ok(())
    }

    #[test]
    fn test_unbounded_sleep_until_interrupted() -> Result<()> {
        let (tx, rx) = mpsc::channel::<Arc<InterruptFlag>>();

        let sleeper = thread::spawn(move || {
            tx.send(context::interrupt_flag()).expect("receiver alive");
            sleep(Duration::MAX)
        });

        let flag = rx.recv()?;
        thread::sleep(Duration::from_millis(20));
        flag.interrupt();

        assert_eq!(sleeper.join().expect("sleeper panicked"), Err(Interrupted));
        Ok(())
    }
}
