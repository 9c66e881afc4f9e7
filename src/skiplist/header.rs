//! Persistent skip list header, kept as an ordinary heap value for the
//! same reason as the hash map's and radix tree's headers — see
//! `hashmap::header`'s module doc.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::concurrency::stack::ConcurrentStack;
use crate::layout::LayoutFeatures;
use crate::relptr::{AtomicRelPtr, RelPtr};

use super::node::{SkipNode, MAX_LEVEL};

pub const PHASE_IDLE: u8 = 0;
pub const PHASE_NOT_STARTED: u8 = 1;
pub const PHASE_IN_PROGRESS: u8 = 2;

/// The single writer-owned "insert in progress" slot used by
/// `runtime_initialize_mt` to finish or discard a node link that may not
/// have been fully published before a restart. Mirrors the radix tree's
/// `WriteProgress`.
///
/// `pending` names the node allocated for this insert — freed outright if
/// the restart finds `PHASE_NOT_STARTED` (never linked into any forward
/// chain). `height`/`preds` record the full predecessor chain captured by
/// `locate()` before the publish loop started: `preds[level]` is the
/// predecessor node's own relative address, or `RelPtr::NULL` for the
/// virtual head. `PHASE_IN_PROGRESS` replays the publish loop over exactly
/// these predecessors (idempotent: each level's store just sets a forward
/// pointer to `pending` again) so a restart completes every remaining level
/// link instead of discarding the insert.
pub struct WriteProgress<V> {
    pending: AtomicRelPtr<SkipNode<V>>,
    height: AtomicU8,
    preds: [AtomicRelPtr<SkipNode<V>>; MAX_LEVEL],
    phase: AtomicU8,
}

impl<V> WriteProgress<V> {
    pub fn new() -> Self {
        Self {
            pending: AtomicRelPtr::null(),
            height: AtomicU8::new(0),
            preds: std::array::from_fn(|_| AtomicRelPtr::null()),
            phase: AtomicU8::new(PHASE_IDLE),
        }
    }

    pub fn begin(&self, pending: crate::relptr::RelPtr<SkipNode<V>>) {
        self.pending.store(pending, Ordering::Release);
        self.phase.store(PHASE_NOT_STARTED, Ordering::Release);
    }

    /// Record the predecessor chain about to be published and flip to
    /// `PHASE_IN_PROGRESS`. Called immediately before the caller performs
    /// the same stores.
    pub fn mark_in_progress(&self, height: u8, preds: &[RelPtr<SkipNode<V>>; MAX_LEVEL]) {
        self.height.store(height, Ordering::Release);
        for (level, pred) in preds.iter().enumerate() {
            self.preds[level].store(*pred, Ordering::Release);
        }
        self.phase.store(PHASE_IN_PROGRESS, Ordering::Release);
    }

    pub fn clear(&self) {
        self.phase.store(PHASE_IDLE, Ordering::Release);
        self.pending.store(crate::relptr::RelPtr::NULL, Ordering::Release);
        self.height.store(0, Ordering::Release);
    }

    pub fn phase(&self) -> u8 {
        self.phase.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> crate::relptr::RelPtr<SkipNode<V>> {
        self.pending.load(Ordering::Acquire)
    }

    pub fn height(&self) -> u8 {
        self.height.load(Ordering::Acquire)
    }

    pub fn pred(&self, level: usize) -> RelPtr<SkipNode<V>> {
        self.preds[level].load(Ordering::Acquire)
    }
}

impl<V> Default for WriteProgress<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SkipListHeader<V> {
    /// Forward pointers out of the (virtual) head, one per level. There is
    /// no allocated dummy head node: the header itself is never pool-
    /// resident (see module doc), so a plain array does the same job with
    /// one fewer allocation.
    pub head: [AtomicRelPtr<SkipNode<V>>; MAX_LEVEL],
    pub size: AtomicU64,
    /// Runtime-only; always reset to `false` by `runtime_initialize` and
    /// only flipped by an explicit `runtime_initialize_mt` call.
    pub mt_enabled: AtomicBool,
    pub garbage: ConcurrentStack<crate::relptr::RelPtr<SkipNode<V>>>,
    pub layout_features: LayoutFeatures,
    pub write_progress: WriteProgress<V>,
    /// Debug-mode tripwire for the single-writer contract — see
    /// `radix::header::RadixHeader`'s field of the same name.
    write_guard: Mutex<()>,
}

impl<V> SkipListHeader<V> {
    pub fn new() -> Self {
        Self {
            head: std::array::from_fn(|_| AtomicRelPtr::null()),
            size: AtomicU64::new(0),
            mt_enabled: AtomicBool::new(false),
            garbage: ConcurrentStack::new(),
            layout_features: LayoutFeatures::new(0),
            write_progress: WriteProgress::new(),
            write_guard: Mutex::new(()),
        }
    }

    #[cfg(debug_assertions)]
    pub(super) fn writer_tripwire(&self) -> MutexGuard<'_, ()> {
        self.write_guard
            .try_lock()
            .expect("concurrent writers on a single-writer skip list")
    }

    #[cfg(not(debug_assertions))]
    pub(super) fn writer_tripwire(&self) {}
}

impl<V> Default for SkipListHeader<V> {
    fn default() -> Self {
        Self::new()
    }
}
