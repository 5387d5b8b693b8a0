use std::marker::PhantomData;

/// A guard that executes a closure when it goes out of scope.
///
/// Used wherever bookkeeping has to happen whether a scope is left by a
/// normal return, an early return or a panic (e.g. releasing a task's runner
/// slot after its work ran).
pub(crate) struct ScopeGuard<'a, F: FnOnce()> {
    // Taken on drop so the closure runs at most once.
    closure: Option<F>,

    _p: PhantomData<&'a ()>,
}

impl<'a, F: FnOnce()> ScopeGuard<'a, F> {
    /// Creates a `ScopeGuard` that runs `closure` on drop.
    ///
    /// ```ignore
    /// let mut released = false;
    /// {
    ///     let _guard = ScopeGuard::new(|| released = true);
    /// }
    /// assert!(released);
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
            _p: PhantomData,
        }
    }
}

impl<'a, F: FnOnce()> Drop for ScopeGuard<'a, F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
