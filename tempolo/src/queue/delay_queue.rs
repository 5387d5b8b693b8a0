use crate::queue::{Delayed, fires_before};
use crate::time::{Clock, MonotonicClock, deadline_after};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

#[cfg(test)]
use crate::utils::tracker::{Call, Method, Tracker};

const INITIAL_CAPACITY: usize = 16;

/// Blocking min-heap of delayed elements.
///
/// Consumers follow the leader/follower pattern: at most one thread, the
/// leader, waits with a timeout for the head to become due. Every other
/// consumer waits without a timeout until the leader hands over, or until an
/// element that fires earlier than the current head is offered.
///
/// All the state lives behind a single mutex so that every consumer agrees on
/// which element is the head.
pub struct DelayQueue<E: Delayed> {
    inner: Mutex<Inner<E>>,

    /// Signalled when a new head is available or a leader steps down.
    available: Condvar,

    clock: Arc<dyn Clock>,

    #[cfg(test)]
    tracker: Tracker,
}

struct Inner<E: Delayed> {
    /// Binary heap, `entries[0]` fires first.
    entries: Vec<Arc<E>>,

    /// Consumer currently in a timed wait for the head.
    leader: Option<ThreadId>,

    /// Set by `close`. Consumers return `None` once the queue is drained.
    closed: bool,
}

impl<E: Delayed> DelayQueue<E> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: Vec::with_capacity(INITIAL_CAPACITY),
                leader: None,
                closed: false,
            }),
            available: Condvar::new(),
            clock,
            #[cfg(test)]
            tracker: Tracker::new(),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Inserts `elem`. Returns `true` if it became the head of the queue.
    ///
    /// Offering to a closed queue is allowed; the element is handed out to the
    /// remaining consumers like any other.
    pub fn offer(&self, elem: Arc<E>) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(!elem.heap_index().is_resident(), "element already queued");

        #[cfg(test)]
        let (sequence, trigger) = (elem.sequence(), elem.trigger_time());

        let became_head = inner.push(elem) == 0;

        #[cfg(test)]
        self.tracker.record(
            Method::Offer,
            Call::Offer {
                sequence,
                trigger,
                became_head,
            },
        );

        if became_head {
            // The current leader waits for a later deadline, let someone
            // re-evaluate the new head.
            inner.leader = None;
            self.available.notify_one();
        }

        became_head
    }

    /// Pops the head if it is due.
    pub fn poll(&self) -> Option<Arc<E>> {
        let mut inner = self.inner.lock();

        let trigger = inner.entries.first()?.trigger_time();
        if trigger > self.clock.now_nanos() {
            return None;
        }

        let head = inner.remove_at(0);
        self.notify_on_exit(&inner);
        Some(head)
    }

    /// Blocks until the head is due and pops it.
    ///
    /// Returns `None` only once the queue is closed and empty.
    pub fn take(&self) -> Option<Arc<E>> {
        let mut inner = self.inner.lock();
        let me = thread::current().id();

        let res = loop {
            let Some(trigger) = inner.entries.first().map(|head| head.trigger_time()) else {
                if inner.closed {
                    break None;
                }

                self.wait(&mut inner);
                continue;
            };

            let now = self.clock.now_nanos();
            if trigger <= now {
                break Some(inner.remove_at(0));
            }

            if inner.leader.is_some() {
                self.wait(&mut inner);
                continue;
            }

            inner.leader = Some(me);
            self.wait_for(&mut inner, trigger - now);

            if inner.leader == Some(me) {
                inner.leader = None;
            }
        };

        self.notify_on_exit(&inner);
        res
    }

    /// Like [`take`](Self::take) but gives up after `timeout`, measured on the
    /// queue's clock.
    pub fn poll_timeout(&self, timeout: Duration) -> Option<Arc<E>> {
        let mut inner = self.inner.lock();
        let me = thread::current().id();
        let deadline = deadline_after(self.clock.now_nanos(), timeout);

        let res = loop {
            let now = self.clock.now_nanos();
            let remaining = deadline.saturating_sub(now);

            let Some(trigger) = inner.entries.first().map(|head| head.trigger_time()) else {
                if inner.closed || remaining == 0 {
                    break None;
                }

                self.wait_for(&mut inner, remaining);
                continue;
            };

            if trigger <= now {
                break Some(inner.remove_at(0));
            }

            if remaining == 0 {
                break None;
            }

            let delay = trigger - now;
            if remaining < delay || inner.leader.is_some() {
                self.wait_for(&mut inner, remaining);
                continue;
            }

            inner.leader = Some(me);
            self.wait_for(&mut inner, delay);

            if inner.leader == Some(me) {
                inner.leader = None;
            }
        };

        self.notify_on_exit(&inner);
        res
    }

    /// Unlinks `elem` wherever it is in the heap. Returns `false` if it was
    /// not queued here.
    pub fn remove(&self, elem: &Arc<E>) -> bool {
        let mut inner = self.inner.lock();

        let Some(idx) = elem.heap_index().get() else {
            return false;
        };

        match inner.entries.get(idx) {
            Some(found) if Arc::ptr_eq(found, elem) => {}
            _ => return false,
        }

        inner.remove_at(idx);

        if idx == 0 {
            // The leader was waiting for the element we just removed.
            inner.leader = None;
            self.available.notify_one();
        }

        if inner.closed && inner.entries.is_empty() {
            self.available.notify_all();
        }

        true
    }

    pub fn peek(&self) -> Option<Arc<E>> {
        self.inner.lock().entries.first().cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Copy of the queued elements, in heap order.
    pub fn snapshot(&self) -> Vec<Arc<E>> {
        self.inner.lock().entries.clone()
    }

    /// Removes every element, in heap order.
    pub fn drain(&self) -> Vec<Arc<E>> {
        let mut inner = self.inner.lock();

        let drained = std::mem::replace(&mut inner.entries, Vec::with_capacity(INITIAL_CAPACITY));
        for elem in &drained {
            elem.heap_index().clear();
        }

        inner.leader = None;
        self.available.notify_all();
        drained
    }

    /// Wakes every consumer. From now on `take` returns `None` as soon as the
    /// queue is empty.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn wait(&self, inner: &mut MutexGuard<'_, Inner<E>>) {
        #[cfg(test)]
        self.tracker.record(Method::Wait, Call::Wait);

        self.available.wait(inner);
    }

    fn wait_for(&self, inner: &mut MutexGuard<'_, Inner<E>>, nanos: u64) {
        #[cfg(test)]
        {
            self.tracker.record(Method::TimedWait, Call::TimedWait { nanos });
            self.tracker.enter_timed_wait();
        }

        self.available.wait_for(inner, Duration::from_nanos(nanos));

        #[cfg(test)]
        self.tracker.exit_timed_wait();
    }

    /// A consumer leaving with the lock held hands over to a follower.
    fn notify_on_exit(&self, inner: &Inner<E>) {
        if inner.leader.is_none() && !inner.entries.is_empty() {
            self.available.notify_one();
        }

        if inner.closed && inner.entries.is_empty() {
            self.available.notify_all();
        }
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    #[cfg(test)]
    pub(crate) fn leader(&self) -> Option<ThreadId> {
        self.inner.lock().leader
    }

    /// Panics if the heap order or any cached index is broken.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let inner = self.inner.lock();

        for (i, elem) in inner.entries.iter().enumerate() {
            assert_eq!(elem.heap_index().get(), Some(i), "stale heap index");

            if i > 0 {
                let parent = &inner.entries[(i - 1) / 2];
                assert!(
                    !fires_before(&**elem, &**parent),
                    "child {i} fires before its parent"
                );
            }
        }
    }
}

impl<E: Delayed> Inner<E> {
    /// Returns the final position of `elem`.
    fn push(&mut self, elem: Arc<E>) -> usize {
        let len = self.entries.len();
        if len == self.entries.capacity() {
            // Grow by 50%.
            self.entries.reserve_exact((len / 2).max(1));
        }

        self.entries.push(elem);
        self.sift_up(len)
    }

    fn remove_at(&mut self, idx: usize) -> Arc<E> {
        let removed = self.entries.swap_remove(idx);
        removed.heap_index().clear();

        if idx < self.entries.len() {
            let moved = Arc::clone(&self.entries[idx]);
            self.sift_down(idx);

            // The moved element did not go down, it may have to go up.
            if Arc::ptr_eq(&self.entries[idx], &moved) {
                self.sift_up(idx);
            }
        }

        removed
    }

    fn sift_up(&mut self, mut idx: usize) -> usize {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !fires_before(&*self.entries[idx], &*self.entries[parent]) {
                break;
            }

            self.entries.swap(idx, parent);
            self.entries[idx].heap_index().set(idx);
            idx = parent;
        }

        self.entries[idx].heap_index().set(idx);
        idx
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();

        loop {
            let left = 2 * idx + 1;
            if left >= len {
                break;
            }

            let right = left + 1;
            let child = if right < len && fires_before(&*self.entries[right], &*self.entries[left])
            {
                right
            } else {
                left
            };

            if !fires_before(&*self.entries[child], &*self.entries[idx]) {
                break;
            }

            self.entries.swap(idx, child);
            self.entries[idx].heap_index().set(idx);
            idx = child;
        }

        self.entries[idx].heap_index().set(idx);
    }
}

impl<E: Delayed> Default for DelayQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Delayed> fmt::Debug for DelayQueue<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DelayQueue")
            .field("len", &inner.entries.len())
            .field("leader", &inner.leader)
            .field("closed", &inner.closed)
            .finish()
    }
}
