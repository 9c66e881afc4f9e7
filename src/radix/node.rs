//! Radix tree internal node and the leaf/internal child union.

use std::marker::PhantomData;

use crate::relptr::{AtomicRelPtr, AtomicTaggedRelPtr, RelPtr, Tag, TaggedRelPtr};

use super::leaf::RadixLeaf;

/// Never instantiated. Exists only to give [`AtomicTaggedRelPtr`] a type
/// parameter distinct from both [`RadixNode<V>`] and [`RadixLeaf<V>`] — the
/// tag bit tells a reader which of the two the offset actually points to.
pub struct ChildMarker<V>(PhantomData<V>);

pub enum ChildRef<'a, V> {
    Leaf(&'a RadixLeaf<V>),
    Node(&'a RadixNode<V>),
}

/// An internal node. `byte`/`bit` name the 4-bit nibble of the key this node
/// discriminates on; children are ordered by that nibble's value. Padded to
/// a cache line so each node occupies one cache-aligned unit.
#[repr(align(64))]
pub struct RadixNode<V> {
    pub parent: AtomicRelPtr<RadixNode<V>>,
    pub embedded_entry: AtomicTaggedRelPtr<ChildMarker<V>>,
    pub child: [AtomicTaggedRelPtr<ChildMarker<V>>; 16],
    pub byte: u64,
    pub bit: u8,
}

impl<V> RadixNode<V> {
    pub fn new(byte: u64, bit: u8) -> Self {
        Self {
            parent: AtomicRelPtr::null(),
            embedded_entry: AtomicTaggedRelPtr::null(),
            child: std::array::from_fn(|_| AtomicTaggedRelPtr::null()),
            byte,
            bit,
        }
    }

    /// Number of non-null direct children (ignoring `embedded_entry`), used
    /// by erase's collapse rule.
    pub fn child_count(&self) -> usize {
        self.child
            .iter()
            .filter(|c| !c.load(std::sync::atomic::Ordering::Acquire).is_null())
            .count()
    }

    pub fn only_child_index(&self) -> Option<usize> {
        let mut found = None;
        for (i, c) in self.child.iter().enumerate() {
            if !c.load(std::sync::atomic::Ordering::Acquire).is_null() {
                if found.is_some() {
                    return None;
                }
                found = Some(i);
            }
        }
        found
    }
}

pub fn leaf_ref<V>(t: TaggedRelPtr<ChildMarker<V>>) -> RelPtr<RadixLeaf<V>> {
    RelPtr::from_raw_offset(t.ptr().raw_offset())
}

pub fn node_ref<V>(t: TaggedRelPtr<ChildMarker<V>>) -> RelPtr<RadixNode<V>> {
    RelPtr::from_raw_offset(t.ptr().raw_offset())
}

pub fn tag_leaf<V>(ptr: RelPtr<RadixLeaf<V>>) -> TaggedRelPtr<ChildMarker<V>> {
    TaggedRelPtr::new(RelPtr::from_raw_offset(ptr.raw_offset()), Tag::Zero)
}

pub fn tag_node<V>(ptr: RelPtr<RadixNode<V>>) -> TaggedRelPtr<ChildMarker<V>> {
    TaggedRelPtr::new(RelPtr::from_raw_offset(ptr.raw_offset()), Tag::One)
}

/// Resolve a tagged child pointer to the concrete node or leaf it names.
///
/// # Safety
/// `pool` must be the pool the pointer's offset was computed against, and
/// the pointee must still be live.
pub unsafe fn resolve<'a, V>(
    t: TaggedRelPtr<ChildMarker<V>>,
    pool: &impl crate::relptr::PoolBase,
) -> Option<ChildRef<'a, V>> {
    if t.is_null() {
        return None;
    }
    match t.tag() {
        Tag::Zero => leaf_ref(t).get(pool).map(ChildRef::Leaf),
        Tag::One => node_ref(t).get(pool).map(ChildRef::Node),
    }
}
