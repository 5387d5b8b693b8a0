//! Time sources and period arithmetic used by the delay queue.
//!
//! Every ordering decision made by the executor is expressed in nanoseconds of
//! a monotonic [`Clock`]. Wall-clock time is never consulted.

use std::fmt;
use std::time::{Duration, Instant};

/// A monotonic nanosecond time source.
///
/// Values are relative to an arbitrary origin chosen by the implementation and
/// must never go backwards.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    fn now_nanos(&self) -> u64;
}

/// Default [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        duration_as_nanos(self.origin.elapsed())
    }
}

/// Saturating conversion, a delay of several centuries is as good as forever.
pub(crate) fn duration_as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Absolute deadline `delay` after `now`.
pub(crate) fn deadline_after(now: u64, delay: Duration) -> u64 {
    now.saturating_add(duration_as_nanos(delay))
}

/// How a scheduled task repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    /// Runs once.
    Once,

    /// The next trigger is computed from the previous trigger:
    /// `trigger += period`. Late runs do not shift the schedule.
    FixedRate(Duration),

    /// The next trigger is computed from the end of the previous run:
    /// `trigger = now + delay`.
    FixedDelay(Duration),
}

impl Period {
    pub fn is_periodic(&self) -> bool {
        !matches!(self, Period::Once)
    }

    /// Signed encoding of the period: `0` for one-shot tasks, a positive value
    /// for fixed-rate and a negative value for fixed-delay tasks.
    pub fn as_signed_nanos(&self) -> i64 {
        let clamp = |d: &Duration| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);

        match self {
            Period::Once => 0,
            Period::FixedRate(d) => clamp(d),
            Period::FixedDelay(d) => -clamp(d),
        }
    }

    /// Next trigger time once a run that was due at `previous` ended at `now`.
    /// Returns `None` for one-shot tasks.
    pub(crate) fn next_trigger(&self, previous: u64, now: u64) -> Option<u64> {
        match self {
            Period::Once => None,
            Period::FixedRate(period) => Some(deadline_after(previous, *period)),
            Period::FixedDelay(delay) => Some(deadline_after(now, *delay)),
        }
    }
}
