use crate::task::Id;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Offer,
    Wait,
    TimedWait,
    Run,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Offer {
        sequence: u64,
        trigger: u64,
        became_head: bool,
    },
    Wait,
    TimedWait {
        nanos: u64,
    },
    Run {
        id: Id,
        trigger: u64,
        started: u64,
    },
}

/// Records calls made on the delay queue and the executor so tests can check
/// wakeup and scheduling decisions after the fact.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,

    /// Threads currently inside a timed wait, and the maximum ever observed.
    timed_waiters: Arc<AtomicUsize>,
    max_timed_waiters: Arc<AtomicUsize>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::Offer, Vec::new());
        map.insert(Method::Wait, Vec::new());
        map.insert(Method::TimedWait, Vec::new());
        map.insert(Method::Run, Vec::new());

        Self {
            calls: Arc::new(map),
            timed_waiters: Arc::new(AtomicUsize::new(0)),
            max_timed_waiters: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }

    pub(crate) fn enter_timed_wait(&self) {
        let now = self.timed_waiters.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_timed_waiters.fetch_max(now, Ordering::SeqCst);
    }

    pub(crate) fn exit_timed_wait(&self) {
        self.timed_waiters.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn max_timed_waiters(&self) -> usize {
        self.max_timed_waiters.load(Ordering::SeqCst)
    }
}
