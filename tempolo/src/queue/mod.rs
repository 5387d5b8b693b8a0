//! Time-ordered blocking priority queue.
//!
//! [`DelayQueue`] is a binary min-heap of [`Delayed`] elements ordered by
//! `(trigger_time, sequence)`. Every element caches its own position in the
//! heap ([`HeapIndex`]) so that it can be removed from the middle of the heap
//! in `O(log n)` when it gets cancelled.

use std::sync::atomic::{AtomicIsize, Ordering};

mod delay_queue;
pub use delay_queue::DelayQueue;


/// An element that becomes available at an absolute point of a monotonic
/// clock.
pub trait Delayed: Send + Sync {
    /// Absolute deadline in clock nanoseconds. Must not change while the
    /// element is resident in a queue.
    fn trigger_time(&self) -> u64;

    /// Tie-break between equal deadlines; lower sequences come out first.
    fn sequence(&self) -> u64;

    /// Position of the element inside the queue that currently holds it.
    fn heap_index(&self) -> &HeapIndex;
}

/// `(trigger_time, sequence)` ordering used by the heap.
#[inline]
pub(crate) fn fires_before<E: Delayed + ?Sized>(a: &E, b: &E) -> bool {
    (a.trigger_time(), a.sequence()) < (b.trigger_time(), b.sequence())
}

const NOT_RESIDENT: isize = -1;

/// Cached heap position of an element, `-1` when it is not in a queue.
///
/// Only written by the queue while holding its lock.
#[derive(Debug)]
pub struct HeapIndex(AtomicIsize);

impl HeapIndex {
    pub fn new() -> Self {
        HeapIndex(AtomicIsize::new(NOT_RESIDENT))
    }

    pub fn get(&self) -> Option<usize> {
        usize::try_from(self.0.load(Ordering::Relaxed)).ok()
    }

    pub fn is_resident(&self) -> bool {
        self.get().is_some()
    }

    pub(crate) fn set(&self, idx: usize) {
        // A Vec never holds more than isize::MAX elements.
        self.0.store(idx as isize, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self) {
        self.0.store(NOT_RESIDENT, Ordering::Relaxed);
    }
}

impl Default for HeapIndex {
    fn default() -> Self {
        Self::new()
    }
}
