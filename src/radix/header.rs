//! Persistent radix tree header, kept as an ordinary heap value
//! for the same reason as the hash map's header — see its module doc.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::concurrency::stack::ConcurrentStack;
use crate::layout::LayoutFeatures;
use crate::relptr::{AtomicRelPtr, AtomicTaggedRelPtr, RelPtr, TaggedRelPtr};

use super::node::{ChildMarker, RadixNode};

/// Sentinel `target_slot` value meaning "attach to `target_parent`'s
/// `embedded_entry`" rather than one of its 16 indexed children.
pub const TARGET_EMBEDDED: u8 = 16;

/// The single writer-owned "insert in progress" slot used by
/// `runtime_initialize_mt` to finish or discard a leaf link that may not
/// have been fully published before a restart.
///
/// `pending` names the leaf allocated for this insert — freed outright if
/// the restart finds `PHASE_NOT_STARTED` (the leaf was never attached to
/// anything reachable). `attach`/`target_parent`/`target_slot` record the
/// one outer-slot store that publishes the insert (attaching either the new
/// leaf directly, or the branching node wrapping it, depending on which
/// case `insert_if_absent` took) — replayed on `PHASE_IN_PROGRESS` so a
/// restart completes the link instead of discarding it. `target_parent`
/// null means the root slot; otherwise `target_slot` is a child index
/// (`0..16`) or [`TARGET_EMBEDDED`].
pub struct WriteProgress<V> {
    pending: AtomicTaggedRelPtr<ChildMarker<V>>,
    attach: AtomicTaggedRelPtr<ChildMarker<V>>,
    target_parent: AtomicRelPtr<RadixNode<V>>,
    target_slot: AtomicU8,
    phase: AtomicU8,
}

pub const PHASE_IDLE: u8 = 0;
pub const PHASE_NOT_STARTED: u8 = 1;
pub const PHASE_IN_PROGRESS: u8 = 2;

impl<V> WriteProgress<V> {
    pub fn new() -> Self {
        Self {
            pending: AtomicTaggedRelPtr::null(),
            attach: AtomicTaggedRelPtr::null(),
            target_parent: AtomicRelPtr::null(),
            target_slot: AtomicU8::new(0),
            phase: AtomicU8::new(PHASE_IDLE),
        }
    }

    pub fn begin(&self, pending: TaggedRelPtr<ChildMarker<V>>) {
        self.pending.store(pending, Ordering::Release);
        self.phase.store(PHASE_NOT_STARTED, Ordering::Release);
    }

    /// Record the outer-slot store about to publish this insert and flip to
    /// `PHASE_IN_PROGRESS`. Called immediately before the caller performs
    /// that same store.
    pub fn mark_in_progress(
        &self,
        attach: TaggedRelPtr<ChildMarker<V>>,
        target_parent: RelPtr<RadixNode<V>>,
        target_slot: u8,
    ) {
        self.attach.store(attach, Ordering::Release);
        self.target_parent.store(target_parent, Ordering::Release);
        self.target_slot.store(target_slot, Ordering::Release);
        self.phase.store(PHASE_IN_PROGRESS, Ordering::Release);
    }

    pub fn clear(&self) {
        self.phase.store(PHASE_IDLE, Ordering::Release);
        self.pending.store(TaggedRelPtr::NULL, Ordering::Release);
        self.attach.store(TaggedRelPtr::NULL, Ordering::Release);
        self.target_parent.store(RelPtr::NULL, Ordering::Release);
    }

    pub fn phase(&self) -> u8 {
        self.phase.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> TaggedRelPtr<ChildMarker<V>> {
        self.pending.load(Ordering::Acquire)
    }

    pub fn attach(&self) -> TaggedRelPtr<ChildMarker<V>> {
        self.attach.load(Ordering::Acquire)
    }

    pub fn target_parent(&self) -> RelPtr<RadixNode<V>> {
        self.target_parent.load(Ordering::Acquire)
    }

    pub fn target_slot(&self) -> u8 {
        self.target_slot.load(Ordering::Acquire)
    }
}

impl<V> Default for WriteProgress<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RadixHeader<V> {
    pub root: AtomicTaggedRelPtr<ChildMarker<V>>,
    pub size: AtomicU64,
    /// Runtime-only; always reset to `false`
    /// by `runtime_initialize` and only flipped by an explicit
    /// `runtime_initialize_mt` call.
    pub mt_enabled: AtomicBool,
    pub garbage: ConcurrentStack<crate::relptr::TaggedRelPtr<ChildMarker<V>>>,
    pub layout_features: LayoutFeatures,
    pub write_progress: WriteProgress<V>,
    /// Debug-mode tripwire for MT mode's single-writer contract: callers
    /// must ensure only one thread ever mutates the tree concurrently, but
    /// this build does not enforce that in release (an uncontended
    /// `try_lock` is as cheap as a fetch_add). Acquired for the duration of
    /// every mutating call.
    write_guard: Mutex<()>,
}

impl<V> RadixHeader<V> {
    pub fn new() -> Self {
        Self {
            root: AtomicTaggedRelPtr::null(),
            size: AtomicU64::new(0),
            mt_enabled: AtomicBool::new(false),
            garbage: ConcurrentStack::new(),
            layout_features: LayoutFeatures::new(0),
            write_progress: WriteProgress::new(),
            write_guard: Mutex::new(()),
        }
    }

    /// Held for the duration of a mutating call. Panics in debug builds if
    /// another thread is already holding it; a no-op guard in release.
    #[cfg(debug_assertions)]
    pub(super) fn writer_tripwire(&self) -> MutexGuard<'_, ()> {
        self.write_guard
            .try_lock()
            .expect("concurrent writers on a single-writer radix tree")
    }

    #[cfg(not(debug_assertions))]
    pub(super) fn writer_tripwire(&self) {}
}

impl<V> Default for RadixHeader<V> {
    fn default() -> Self {
        Self::new()
    }
}
