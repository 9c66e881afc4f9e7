use std::sync::Arc;

use parking_lot::Mutex;

/// Concurrent, thread-safe stack. All accesses are blocking.
///
/// Used for the radix tree's deferred-reclamation garbage list (MT mode):
/// retired nodes are pushed here instead of freed immediately, and
/// `garbage_collect` drains the whole stack once no reader can still see
/// them.
pub struct ConcurrentStack<T> {
    vec: Arc<Mutex<Vec<T>>>,
}

impl<T> ConcurrentStack<T> {
    pub fn new() -> Self {
        ConcurrentStack {
            vec: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, value: T) {
        self.vec.lock().push(value);
    }

    pub fn pop(&self) -> Option<T> {
        self.vec.lock().pop()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.vec.lock().len()
    }

    pub fn truncate(&self, size: usize) {
        self.vec.lock().truncate(size);
    }

    /// Remove and return everything currently on the stack.
    pub fn drain_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.vec.lock())
    }

    #[inline(always)]
    pub fn clear(&self) {
        self.truncate(0);
    }
}

impl<T> Default for ConcurrentStack<T> {
    fn default() -> Self {
        Self::new()
    }
}
