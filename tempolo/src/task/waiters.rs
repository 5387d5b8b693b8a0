use smallvec::SmallVec;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::thread::{self, Thread};

/// Most tasks have a handful of observers at most.
const INLINE_WAITERS: usize = 4;

/// A thread blocked in `TaskHandle::get`.
///
/// The node is owned by the waiting call frame; the stack only holds an extra
/// strong reference obtained with `Arc::into_raw` while the node is linked.
#[derive(Debug)]
pub(super) struct WaitNode {
    thread: Thread,

    /// Cleared by the waiter when it stops waiting (timeout or completion), so
    /// that pruning can unlink it.
    active: AtomicBool,

    /// Only written while the node is private to the pushing thread.
    next: AtomicPtr<WaitNode>,
}

impl WaitNode {
    pub(super) fn for_current_thread() -> Arc<WaitNode> {
        Arc::new(WaitNode {
            thread: thread::current(),
            active: AtomicBool::new(true),
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub(super) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

type Drained = SmallVec<[Arc<WaitNode>; INLINE_WAITERS]>;

/// Lock-free LIFO stack of waiting threads (Treiber stack).
///
/// Nodes are pushed with a CAS on `head` and only ever removed all at once
/// with a single swap, so there is no ABA hazard.
#[derive(Debug)]
pub(super) struct WaitStack {
    head: AtomicPtr<WaitNode>,
}

impl WaitStack {
    pub(super) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(super) fn push(&self, node: Arc<WaitNode>) {
        let raw = Arc::into_raw(node).cast_mut();
        let mut head = self.head.load(Ordering::SeqCst);

        loop {
            // Safety: `raw` is not published yet, we are the only ones touching it.
            unsafe { (*raw).next.store(head, Ordering::Relaxed) };

            match self
                .head
                .compare_exchange_weak(head, raw, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Unlinks every node and returns them in LIFO order.
    fn take_all(&self) -> Drained {
        let mut cur = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
        let mut nodes = Drained::new();

        while !cur.is_null() {
            // Safety: every linked pointer was produced by `Arc::into_raw` in
            // `push`, and the swap above transferred its reference to us.
            let node = unsafe { Arc::from_raw(cur) };
            cur = node.next.swap(ptr::null_mut(), Ordering::Relaxed);
            nodes.push(node);
        }

        nodes
    }

    /// Wakes every linked waiter. Returns how many threads were unparked.
    pub(super) fn release_all(&self) -> usize {
        self.take_all()
            .into_iter()
            .filter(|node| node.is_active())
            .map(|node| node.thread.unpark())
            .count()
    }

    /// Drops inactive nodes and re-links the rest.
    ///
    /// A completer may drain the stack while the nodes are unlinked here. The
    /// caller must therefore check the task state afterwards and call
    /// `release_all` itself if the outcome is already decided.
    pub(super) fn prune(&self) {
        for node in self.take_all().into_iter().rev() {
            if node.is_active() {
                self.push(node);
            }
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head.load(Ordering::SeqCst);

        while !cur.is_null() {
            n += 1;
            // Safety: test-only, callers ensure no concurrent drain.
            cur = unsafe { (*cur).next.load(Ordering::Relaxed) };
        }

        n
    }
}

impl Drop for WaitStack {
    fn drop(&mut self) {
        // Releases the references held on nodes that were pushed after the
        // final drain.
        drop(self.take_all());
    }
}
