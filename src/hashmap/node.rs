//! Hash map node.

use parking_lot::RwLock;

use crate::relptr::AtomicRelPtr;

/// A single chain entry. `key` is immutable once constructed and is read
/// without locking while walking a chain; `next` is mutated only while the
/// owning bucket's write lock is held — it is an
/// [`AtomicRelPtr`] rather than a plain field purely so that readers
/// crossing thread boundaries through raw pool pointers never trigger data
/// races in the eyes of the compiler, not because it is ever updated
/// lock-free. `value` is behind its own lock so an accessor can pin just the
/// value without blocking concurrent key comparisons on the same node.
pub struct Node<K, V> {
    pub next: AtomicRelPtr<Node<K, V>>,
    pub key: K,
    pub value: RwLock<V>,
}

impl<K, V> Node<K, V> {
    pub fn new(key: K, value: V, next: crate::relptr::RelPtr<Node<K, V>>) -> Self {
        Self {
            next: AtomicRelPtr::new(next),
            key,
            value: RwLock::new(value),
        }
    }
}
