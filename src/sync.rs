//! Small synchronization helpers shared by the socket and channel internals.
//!
//! [`SyncArray`] is a read-copy-update list: readers take an `Arc` snapshot
//! and iterate it without holding any lock, writers rebuild the vector under
//! a write lock. Dispatch paths snapshot first and invoke callbacks after
//! releasing the lock, so user callbacks may freely register or remove
//! bindings from inside a callback.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A concurrent-read / barrier-write list.
///
/// Reads return an immutable snapshot; every mutation builds a new vector
/// and swaps it in atomically.
pub(crate) struct SyncArray<T> {
    inner: RwLock<Arc<Vec<T>>>,
}

impl<T: Clone> SyncArray<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// An immutable snapshot of the current contents.
    pub(crate) fn snapshot(&self) -> Arc<Vec<T>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Append an element.
    pub(crate) fn push(&self, item: T) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        next.push(item);
        *guard = Arc::new(next);
    }

    /// Keep only the elements for which `keep` returns `true`.
    pub(crate) fn retain(&self, keep: impl Fn(&T) -> bool) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        next.retain(|item| keep(item));
        *guard = Arc::new(next);
    }

    /// Remove all elements.
    pub(crate) fn clear(&self) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(Vec::new());
    }
}

impl<T> std::fmt::Debug for SyncArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("SyncArray").field("len", &len).finish()
    }
}
