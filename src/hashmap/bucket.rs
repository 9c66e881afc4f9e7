//! Hash map bucket.

use parking_lot::RwLock;

use super::node::Node;
use crate::relptr::RelPtr;

/// One segment-table slot. `chain` guards both the head pointer and every
/// `next` pointer reachable from it (invariant B: mutating the node list
/// requires holding this lock for write); `rehashed` is the lazy-growth flag
/// a lookup consults before trusting the chain is complete for the current
/// mask.
pub struct Bucket<K, V> {
    pub chain: RwLock<RelPtr<Node<K, V>>>,
    pub rehashed: std::sync::atomic::AtomicU8,
}

impl<K, V> Bucket<K, V> {
    /// `rehashed` starts true for buckets present since container creation
    /// (the embedded segment, and any segment enabled while the container
    /// was still empty) and false for buckets grown under an already
    /// populated container, which still owe a lazy rehash from their parent.
    pub fn new(rehashed: bool) -> Self {
        Self {
            chain: RwLock::new(RelPtr::NULL),
            rehashed: std::sync::atomic::AtomicU8::new(rehashed as u8),
        }
    }
}
