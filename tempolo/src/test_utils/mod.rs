use crate::queue::{Delayed, HeapIndex};
use crate::time::Clock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a thread-local subscriber for the duration of the returned guard.
///
/// Set `RUST_LOG=tempolo=trace` to see the events of a failing test.
#[must_use]
pub(crate) fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .with_test_writer()
        .set_default()
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub(crate) struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub(crate) fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.now
            .fetch_add(crate::time::duration_as_nanos(by), Ordering::SeqCst);
    }

    pub(crate) fn set(&self, nanos: u64) {
        self.now.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Minimal queue element.
#[derive(Debug)]
pub(crate) struct TestEntry {
    pub(crate) trigger: u64,
    pub(crate) sequence: u64,
    index: HeapIndex,
}

impl TestEntry {
    pub(crate) fn new(trigger: u64, sequence: u64) -> Self {
        Self {
            trigger,
            sequence,
            index: HeapIndex::new(),
        }
    }
}

impl Delayed for TestEntry {
    fn trigger_time(&self) -> u64 {
        self.trigger
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn heap_index(&self) -> &HeapIndex {
        &self.index
    }
}
