//! Concurrent radix (PATRICIA) tree, ordered by key bytes.
//!
//! Two concurrency modes, chosen at runtime and never persisted: single-
//! threaded (the default — mutations free memory immediately) and
//! multi-reader/single-writer (entered via
//! [`RadixTree::runtime_initialize_mt`] — lock-free reads coexist with one
//! writer, which retires nodes onto a garbage list instead of freeing them
//! until [`RadixTree::garbage_collect`] is called at a safe point).
//!
//! The mapped value is restricted to `V: Copy` (see `leaf.rs`), so this
//! implementation only builds the fixed-size-value half of the
//! assign-in-place rule; the inline-growable-string half is not
//! implemented (see `DESIGN.md`).

pub mod header;
pub mod leaf;
pub mod node;

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use header::RadixHeader;
use leaf::RadixLeaf;
use node::{ChildMarker, ChildRef, RadixNode};

use crate::error::{CoreError, Result};
use crate::pool::{Pool, Transaction};
use crate::relptr::{PoolBase, RelPtr, TaggedRelPtr};
use crate::restart::RuntimeInit;

/// Nibble position `pos` (0 = high nibble of byte 0) a node discriminates
/// on, as a single integer rather than a `(byte, bit)` pair.
fn pos_of<V>(n: &RadixNode<V>) -> u64 {
    n.byte * 2 + if n.bit == 4 { 0 } else { 1 }
}

fn pos_to_byte_bit(pos: u64) -> (u64, u8) {
    (pos / 2, if pos % 2 == 0 { 4 } else { 0 })
}

fn nibble_at(key: &[u8], pos: u64) -> Option<u8> {
    let byte_idx = (pos / 2) as usize;
    let b = *key.get(byte_idx)?;
    Some(if pos % 2 == 0 { b >> 4 } else { b & 0x0F })
}

/// First nibble position at which `a` and `b` differ, or
/// `min(a.len(), b.len()) * 2` if one is a prefix of the other.
fn diverge_at(a: &[u8], b: &[u8]) -> u64 {
    let max_bytes = a.len().max(b.len());
    for byte in 0..max_bytes {
        let av = a.get(byte).copied();
        let bv = b.get(byte).copied();
        if av != bv {
            if av.is_none() || bv.is_none() {
                return byte as u64 * 2;
            }
            let (av, bv) = (av.unwrap(), bv.unwrap());
            return if (av >> 4) != (bv >> 4) {
                byte as u64 * 2
            } else {
                byte as u64 * 2 + 1
            };
        }
    }
    max_bytes as u64 * 2
}

#[derive(Clone, Copy)]
enum Slot<'a, V> {
    Root,
    Child { parent: &'a RadixNode<V>, index: usize },
    Embedded { parent: &'a RadixNode<V> },
}

impl<'a, V> Slot<'a, V> {
    fn store(&self, header: &RadixHeader<V>, value: TaggedRelPtr<ChildMarker<V>>) {
        match *self {
            Slot::Root => header.root.store(value, Ordering::Release),
            Slot::Child { parent, index } => parent.child[index].store(value, Ordering::Release),
            Slot::Embedded { parent } => parent.embedded_entry.store(value, Ordering::Release),
        }
    }

    /// Encode as `(target_parent, target_slot)` for `WriteProgress`: null
    /// parent means root, otherwise `target_slot` is a child index or
    /// [`header::TARGET_EMBEDDED`].
    fn for_write_progress(&self, pool: &impl crate::relptr::PoolBase) -> (RelPtr<RadixNode<V>>, u8) {
        match *self {
            Slot::Root => (RelPtr::NULL, 0),
            Slot::Child { parent, index } => (RelPtr::from_ptr(pool, parent as *const RadixNode<V>), index as u8),
            Slot::Embedded { parent } => (
                RelPtr::from_ptr(pool, parent as *const RadixNode<V>),
                header::TARGET_EMBEDDED,
            ),
        }
    }

    /// Reconstruct from a `WriteProgress`-encoded target, for restart recovery.
    fn from_write_progress(pool: &'a impl crate::relptr::PoolBase, target_parent: RelPtr<RadixNode<V>>, target_slot: u8) -> Option<Self> {
        if target_parent.is_null() {
            return Some(Slot::Root);
        }
        let parent = unsafe { target_parent.get(pool) }?;
        Some(if target_slot == header::TARGET_EMBEDDED {
            Slot::Embedded { parent }
        } else {
            Slot::Child { parent, index: target_slot as usize }
        })
    }
}

struct Descent<'a, V> {
    representative: &'a RadixLeaf<V>,
    stop_slot: Slot<'a, V>,
    /// Current contents of `stop_slot`: null for a direct-attach insert,
    /// otherwise the tagged pointer to `representative` itself.
    stop_ptr: TaggedRelPtr<ChildMarker<V>>,
}

struct ExactFound<'a, V> {
    leaf: &'a RadixLeaf<V>,
    leaf_slot: Slot<'a, V>,
    parent: Option<&'a RadixNode<V>>,
    parent_slot: Option<Slot<'a, V>>,
}

pub struct Entry<'a, V> {
    pub key: &'a [u8],
    pub value: &'a V,
}

impl<'a, V> From<&'a RadixLeaf<V>> for Entry<'a, V> {
    fn from(l: &'a RadixLeaf<V>) -> Self {
        Entry {
            key: l.key(),
            value: &l.value,
        }
    }
}

pub struct RadixTree<V, P: Pool> {
    pool: Arc<P>,
    header: RadixHeader<V>,
}

impl<V: Copy, P: Pool> RadixTree<V, P> {
    pub fn new(pool: Arc<P>) -> Self {
        Self {
            pool,
            header: RadixHeader::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.header.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn mt_enabled(&self) -> bool {
        self.header.mt_enabled.load(Ordering::Acquire)
    }

    fn leftmost_leaf<'a>(
        &self,
        pool: &'a P,
        ptr: TaggedRelPtr<ChildMarker<V>>,
    ) -> Option<&'a RadixLeaf<V>> {
        let mut cur = ptr;
        loop {
            match unsafe { node::resolve::<V>(cur, pool) }? {
                ChildRef::Leaf(l) => return Some(l),
                ChildRef::Node(n) => {
                    let emb = n.embedded_entry.load(Ordering::Acquire);
                    if !emb.is_null() {
                        cur = emb;
                        continue;
                    }
                    let next = n.child.iter().map(|c| c.load(Ordering::Acquire)).find(|c| !c.is_null());
                    cur = next?;
                }
            }
        }
    }

    fn rightmost_leaf<'a>(
        &self,
        pool: &'a P,
        ptr: TaggedRelPtr<ChildMarker<V>>,
    ) -> Option<&'a RadixLeaf<V>> {
        let mut cur = ptr;
        loop {
            match unsafe { node::resolve::<V>(cur, pool) }? {
                ChildRef::Leaf(l) => return Some(l),
                ChildRef::Node(n) => {
                    let next = n
                        .child
                        .iter()
                        .rev()
                        .map(|c| c.load(Ordering::Acquire))
                        .find(|c| !c.is_null());
                    cur = match next {
                        Some(n) => n,
                        None => {
                            let emb = n.embedded_entry.load(Ordering::Acquire);
                            if emb.is_null() {
                                return None;
                            }
                            emb
                        }
                    };
                }
            }
        }
    }

    fn find_leaf<'a>(&self, pool: &'a P, key: &[u8]) -> Option<&'a RadixLeaf<V>> {
        let mut cur = self.header.root.load(Ordering::Acquire);
        if cur.is_null() {
            return None;
        }
        loop {
            match unsafe { node::resolve::<V>(cur, pool) }? {
                ChildRef::Leaf(leaf) => return if leaf.key() == key { Some(leaf) } else { None },
                ChildRef::Node(n) => {
                    let pos = pos_of(n);
                    cur = match nibble_at(key, pos) {
                        Some(nib) => n.child[nib as usize].load(Ordering::Acquire),
                        None => n.embedded_entry.load(Ordering::Acquire),
                    };
                    if cur.is_null() {
                        return None;
                    }
                }
            }
        }
    }

    /// Common-prefix descent: follows the query's own nibbles
    /// through existing structure, reporting where it had to stop along
    /// with a representative leaf sharing the tree's maximal common prefix
    /// with the query.
    fn descend<'a>(&self, pool: &'a P, key: &[u8]) -> Option<Descent<'a, V>> {
        let root = self.header.root.load(Ordering::Acquire);
        if root.is_null() {
            return None;
        }
        let mut parent: Option<&'a RadixNode<V>> = None;
        let mut cur = root;
        loop {
            match unsafe { node::resolve::<V>(cur, pool) }? {
                ChildRef::Leaf(leaf) => {
                    let slot = match parent {
                        None => Slot::Root,
                        Some(p) => slot_of(p, cur),
                    };
                    return Some(Descent {
                        representative: leaf,
                        stop_slot: slot,
                        stop_ptr: cur,
                    });
                }
                ChildRef::Node(n) => {
                    let pos = pos_of(n);
                    match nibble_at(key, pos) {
                        Some(nib) => {
                            let child = n.child[nib as usize].load(Ordering::Acquire);
                            if child.is_null() {
                                let rep = self.leftmost_leaf(pool, cur)?;
                                return Some(Descent {
                                    representative: rep,
                                    stop_slot: Slot::Child { parent: n, index: nib as usize },
                                    stop_ptr: TaggedRelPtr::NULL,
                                });
                            }
                            parent = Some(n);
                            cur = child;
                        }
                        None => {
                            let emb = n.embedded_entry.load(Ordering::Acquire);
                            if emb.is_null() {
                                let rep = self.leftmost_leaf(pool, cur)?;
                                return Some(Descent {
                                    representative: rep,
                                    stop_slot: Slot::Embedded { parent: n },
                                    stop_ptr: TaggedRelPtr::NULL,
                                });
                            }
                            parent = Some(n);
                            cur = emb;
                        }
                    }
                }
            }
        }
    }

    fn exact_descend<'a>(&self, pool: &'a P, key: &[u8]) -> Option<ExactFound<'a, V>> {
        let root = self.header.root.load(Ordering::Acquire);
        if root.is_null() {
            return None;
        }
        let mut parent: Option<&'a RadixNode<V>> = None;
        let mut parent_slot: Option<Slot<'a, V>> = None;
        let mut cur = root;
        let mut cur_slot: Slot<'a, V> = Slot::Root;
        loop {
            match unsafe { node::resolve::<V>(cur, pool) }? {
                ChildRef::Leaf(leaf) => {
                    if leaf.key() != key {
                        return None;
                    }
                    return Some(ExactFound {
                        leaf,
                        leaf_slot: cur_slot,
                        parent,
                        parent_slot,
                    });
                }
                ChildRef::Node(n) => {
                    let pos = pos_of(n);
                    let (next, next_slot) = match nibble_at(key, pos) {
                        Some(nib) => {
                            let child = n.child[nib as usize].load(Ordering::Acquire);
                            if child.is_null() {
                                return None;
                            }
                            (child, Slot::Child { parent: n, index: nib as usize })
                        }
                        None => {
                            let emb = n.embedded_entry.load(Ordering::Acquire);
                            if emb.is_null() {
                                return None;
                            }
                            (emb, Slot::Embedded { parent: n })
                        }
                    };
                    parent_slot = Some(cur_slot);
                    parent = Some(n);
                    cur_slot = next_slot;
                    cur = next;
                }
            }
        }
    }

    fn successor<'a>(&self, pool: &'a P, leaf: &'a RadixLeaf<V>) -> Option<&'a RadixLeaf<V>> {
        let mut child_tagged = node::tag_leaf(RelPtr::from_ptr(pool, leaf as *const RadixLeaf<V>));
        loop {
            let parent_ptr = match unsafe { node::resolve::<V>(child_tagged, pool) } {
                Some(ChildRef::Leaf(l)) => l.parent.load(Ordering::Acquire),
                Some(ChildRef::Node(n)) => n.parent.load(Ordering::Acquire),
                None => return None,
            };
            if parent_ptr.is_null() {
                return None;
            }
            let parent = unsafe { parent_ptr.get(pool) }?;
            if parent.embedded_entry.load(Ordering::Acquire).raw() == child_tagged.raw() {
                if let Some(first) = parent.child.iter().map(|c| c.load(Ordering::Acquire)).find(|c| !c.is_null()) {
                    return self.leftmost_leaf(pool, first);
                }
            } else if let Some(idx) = (0..16).find(|&i| parent.child[i].load(Ordering::Acquire).raw() == child_tagged.raw()) {
                if let Some(next) = parent.child[idx + 1..]
                    .iter()
                    .map(|c| c.load(Ordering::Acquire))
                    .find(|c| !c.is_null())
                {
                    return self.leftmost_leaf(pool, next);
                }
            }
            child_tagged = node::tag_node(RelPtr::from_ptr(pool, parent as *const RadixNode<V>));
        }
    }

    fn predecessor<'a>(&self, pool: &'a P, leaf: &'a RadixLeaf<V>) -> Option<&'a RadixLeaf<V>> {
        let mut child_tagged = node::tag_leaf(RelPtr::from_ptr(pool, leaf as *const RadixLeaf<V>));
        loop {
            let parent_ptr = match unsafe { node::resolve::<V>(child_tagged, pool) } {
                Some(ChildRef::Leaf(l)) => l.parent.load(Ordering::Acquire),
                Some(ChildRef::Node(n)) => n.parent.load(Ordering::Acquire),
                None => return None,
            };
            if parent_ptr.is_null() {
                return None;
            }
            let parent = unsafe { parent_ptr.get(pool) }?;
            if parent.embedded_entry.load(Ordering::Acquire).raw() != child_tagged.raw() {
                if let Some(idx) = (0..16).find(|&i| parent.child[i].load(Ordering::Acquire).raw() == child_tagged.raw()) {
                    if let Some(prev) = parent.child[..idx]
                        .iter()
                        .rev()
                        .map(|c| c.load(Ordering::Acquire))
                        .find(|c| !c.is_null())
                    {
                        return self.rightmost_leaf(pool, prev);
                    }
                }
                let emb = parent.embedded_entry.load(Ordering::Acquire);
                if !emb.is_null() {
                    return match unsafe { node::resolve::<V>(emb, pool) } {
                        Some(ChildRef::Leaf(l)) => Some(l),
                        _ => None,
                    };
                }
            }
            child_tagged = node::tag_node(RelPtr::from_ptr(pool, parent as *const RadixNode<V>));
        }
    }

    pub fn find(&self, key: &[u8]) -> Option<Entry<'_, V>> {
        self.find_leaf(&self.pool, key).map(Entry::from)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find_leaf(&self.pool, key).is_some()
    }

    /// `1` if `key` is present, `0` otherwise — keys are unique, so this is
    /// just `contains` in `u64` form.
    pub fn count(&self, key: &[u8]) -> u64 {
        self.contains(key) as u64
    }

    /// Smallest stored key `>= key`. Relies on the
    /// well-known PATRICIA property that the representative a common-prefix
    /// descent returns is always the predecessor or successor of the query
    /// among stored keys — see `DESIGN.md` for why that lets this skip the
    /// literal per-case bounded-descent recipe.
    pub fn lower_bound(&self, key: &[u8]) -> Option<Entry<'_, V>> {
        let pool = &*self.pool;
        let d = self.descend(pool, key)?;
        match key.cmp(d.representative.key()) {
            CmpOrdering::Less | CmpOrdering::Equal => Some(Entry::from(d.representative)),
            CmpOrdering::Greater => self.successor(pool, d.representative).map(Entry::from),
        }
    }

    /// Smallest stored key `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> Option<Entry<'_, V>> {
        let pool = &*self.pool;
        let d = self.descend(pool, key)?;
        match key.cmp(d.representative.key()) {
            CmpOrdering::Less => Some(Entry::from(d.representative)),
            CmpOrdering::Equal | CmpOrdering::Greater => self.successor(pool, d.representative).map(Entry::from),
        }
    }

    fn alloc_leaf(&self, key: &[u8], value: V) -> Result<RelPtr<RadixLeaf<V>>> {
        let size = RadixLeaf::<V>::alloc_size(key.len());
        let align = RadixLeaf::<V>::align();
        let offset = self.pool.run(|tx| {
            let offset = tx.alloc_bytes(size, align)?;
            unsafe {
                let ptr = tx.pool().base_ptr().add(offset as usize) as *mut RadixLeaf<V>;
                RadixLeaf::init(ptr, key, value);
            }
            Ok(offset)
        })?;
        Ok(RelPtr::from_raw_offset(offset))
    }

    fn alloc_node(&self, byte: u64, bit: u8) -> Result<RelPtr<RadixNode<V>>> {
        let offset = self.pool.run(|tx| {
            let offset = tx.alloc_bytes(
                std::mem::size_of::<RadixNode<V>>(),
                std::mem::align_of::<RadixNode<V>>(),
            )?;
            unsafe {
                let ptr = tx.pool().base_ptr().add(offset as usize) as *mut RadixNode<V>;
                ptr.write(RadixNode::new(byte, bit));
            }
            Ok(offset)
        })?;
        Ok(RelPtr::from_raw_offset(offset))
    }

    /// Insert `key`/`value` if absent. Returns `true` iff a new leaf was
    /// created; the three named entrypoints below are thin
    /// aliases over this, matching the source API surface even though this
    /// realization gives them identical behavior.
    fn insert_if_absent(&self, key: &[u8], value: V) -> Result<bool> {
        let _writer = self.header.writer_tripwire();
        let pool = &*self.pool;
        let root = self.header.root.load(Ordering::Acquire);
        if root.is_null() {
            let new_leaf = self.alloc_leaf(key, value)?;
            let attach = node::tag_leaf(new_leaf);
            self.header.write_progress.begin(attach);
            self.header.write_progress.mark_in_progress(attach, RelPtr::NULL, 0);
            self.header.root.store(attach, Ordering::Release);
            self.header.write_progress.clear();
            self.header.size.fetch_add(1, Ordering::AcqRel);
            return Ok(true);
        }

        let d = self
            .descend(pool, key)
            .expect("non-null root implies a representative leaf exists");
        let div_pos = diverge_at(key, d.representative.key());
        let query_ends = div_pos as usize == key.len() * 2;
        let rep_ends = div_pos as usize == d.representative.key().len() * 2;

        if query_ends && rep_ends {
            return Ok(false);
        }

        let new_leaf = self.alloc_leaf(key, value)?;
        self.header.write_progress.begin(node::tag_leaf(new_leaf));

        if d.stop_ptr.is_null() {
            // Case (a): an existing node already discriminates exactly at
            // the divergence point and has a free slot for this key.
            let parent = match d.stop_slot {
                Slot::Child { parent, .. } | Slot::Embedded { parent } => parent,
                Slot::Root => unreachable!("a null stop slot is never the root"),
            };
            unsafe { new_leaf.get(pool) }
                .expect("just-allocated leaf must resolve")
                .parent
                .store(RelPtr::from_ptr(pool, parent as *const RadixNode<V>), Ordering::Release);
            let attach = node::tag_leaf(new_leaf);
            let (target_parent, target_slot) = d.stop_slot.for_write_progress(pool);
            self.header.write_progress.mark_in_progress(attach, target_parent, target_slot);
            d.stop_slot.store(&self.header, attach);
        } else {
            // Cases (b)/(c)/(d): interpose a new branching node.
            let (byte, bit) = pos_to_byte_bit(div_pos);
            let new_node = self.alloc_node(byte, bit)?;
            let new_node_ref = unsafe { new_node.get(pool) }.expect("just-allocated node must resolve");
            let outer_parent = match d.stop_slot {
                Slot::Root => RelPtr::NULL,
                Slot::Child { parent, .. } | Slot::Embedded { parent } => {
                    RelPtr::from_ptr(pool, parent as *const RadixNode<V>)
                }
            };
            new_node_ref.parent.store(outer_parent, Ordering::Release);

            let rep_tagged = node::tag_leaf(RelPtr::from_ptr(pool, d.representative as *const RadixLeaf<V>));
            let new_tagged = node::tag_leaf(new_leaf);

            if query_ends && !rep_ends {
                new_node_ref.embedded_entry.store(new_tagged, Ordering::Release);
                let rep_nib = nibble_at(d.representative.key(), div_pos).expect("representative continues past divergence");
                new_node_ref.child[rep_nib as usize].store(rep_tagged, Ordering::Release);
            } else if rep_ends && !query_ends {
                new_node_ref.embedded_entry.store(rep_tagged, Ordering::Release);
                let key_nib = nibble_at(key, div_pos).expect("query continues past divergence");
                new_node_ref.child[key_nib as usize].store(new_tagged, Ordering::Release);
            } else {
                let rep_nib = nibble_at(d.representative.key(), div_pos).expect("representative continues past divergence");
                let key_nib = nibble_at(key, div_pos).expect("query continues past divergence");
                new_node_ref.child[rep_nib as usize].store(rep_tagged, Ordering::Release);
                new_node_ref.child[key_nib as usize].store(new_tagged, Ordering::Release);
            }

            d.representative.parent.store(
                RelPtr::from_raw_offset(new_node.raw_offset()),
                Ordering::Release,
            );
            unsafe { new_leaf.get(pool) }
                .expect("just-allocated leaf must resolve")
                .parent
                .store(RelPtr::from_raw_offset(new_node.raw_offset()), Ordering::Release);

            let attach = node::tag_node(new_node);
            let (target_parent, target_slot) = d.stop_slot.for_write_progress(pool);
            self.header.write_progress.mark_in_progress(attach, target_parent, target_slot);
            d.stop_slot.store(&self.header, attach);
        }

        self.header.write_progress.clear();
        self.header.size.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    pub fn emplace(&self, key: &[u8], value: V) -> Result<bool> {
        self.insert_if_absent(key, value)
    }

    pub fn insert(&self, key: &[u8], value: V) -> Result<bool> {
        self.insert_if_absent(key, value)
    }

    pub fn try_emplace(&self, key: &[u8], value: V) -> Result<bool> {
        self.insert_if_absent(key, value)
    }

    /// Insert, or overwrite the value if `key` already exists. Returns
    /// `true` iff a new leaf was created.
    pub fn insert_or_assign(&self, key: &[u8], value: V) -> Result<bool> {
        let pool = &*self.pool;
        if let Some(leaf) = self.find_leaf(pool, key) {
            let _writer = self.header.writer_tripwire();
            if self.mt_enabled() {
                self.replace_leaf(leaf, key, value)?;
            } else {
                let leaf_ptr = RelPtr::from_ptr(pool, leaf as *const RadixLeaf<V>);
                self.pool.run(|_tx| {
                    let leaf_mut = unsafe { leaf_ptr.get_mut(pool) }.expect("leaf must resolve");
                    leaf_mut.value = value;
                    Ok(())
                })?;
            }
            Ok(false)
        } else {
            self.insert_if_absent(key, value)
        }
    }

    fn replace_leaf(&self, old: &RadixLeaf<V>, key: &[u8], value: V) -> Result<()> {
        let pool = &*self.pool;
        let old_ptr = RelPtr::from_ptr(pool, old as *const RadixLeaf<V>);
        let old_tagged = node::tag_leaf(old_ptr);
        let parent_ptr = old.parent.load(Ordering::Acquire);

        let new_ptr = self.alloc_leaf(key, value)?;
        unsafe { new_ptr.get(pool) }
            .expect("just-allocated leaf must resolve")
            .parent
            .store(parent_ptr, Ordering::Release);

        if parent_ptr.is_null() {
            self.header.root.store(node::tag_leaf(new_ptr), Ordering::Release);
        } else {
            let parent = unsafe { parent_ptr.get(pool) }.expect("parent must resolve");
            if parent.embedded_entry.load(Ordering::Acquire).raw() == old_tagged.raw() {
                parent.embedded_entry.store(node::tag_leaf(new_ptr), Ordering::Release);
            } else if let Some(idx) = (0..16).find(|&i| parent.child[i].load(Ordering::Acquire).raw() == old_tagged.raw()) {
                parent.child[idx].store(node::tag_leaf(new_ptr), Ordering::Release);
            }
        }
        self.pool.run(|tx| self.retire(pool, old_tagged, tx))
    }

    fn retire(&self, pool: &P, t: TaggedRelPtr<ChildMarker<V>>, tx: &Transaction<'_, P>) -> Result<()> {
        if t.is_null() {
            return Ok(());
        }
        if self.header.mt_enabled.load(Ordering::Acquire) {
            self.header.garbage.push(t);
            return Ok(());
        }
        match unsafe { node::resolve::<V>(t, pool) } {
            Some(ChildRef::Leaf(leaf)) => {
                tx.free_bytes(node::leaf_ref(t).raw_offset(), RadixLeaf::<V>::alloc_size(leaf.key_len as usize))
            }
            Some(ChildRef::Node(_)) => {
                tx.free_bytes(node::node_ref(t).raw_offset(), std::mem::size_of::<RadixNode<V>>())
            }
            None => Ok(()),
        }
    }

    /// Free everything retired while in MT mode. The application must call
    /// this only at a point it knows no reader still holds a reference
    /// into the retired subtrees.
    pub fn garbage_collect(&self) -> Result<()> {
        let drained = self.header.garbage.drain_all();
        if drained.is_empty() {
            return Ok(());
        }
        let pool = &*self.pool;
        self.pool.run(|tx| {
            for t in &drained {
                match unsafe { node::resolve::<V>(*t, pool) } {
                    Some(ChildRef::Leaf(leaf)) => {
                        tx.free_bytes(node::leaf_ref(*t).raw_offset(), RadixLeaf::<V>::alloc_size(leaf.key_len as usize))?
                    }
                    Some(ChildRef::Node(_)) => {
                        tx.free_bytes(node::node_ref(*t).raw_offset(), std::mem::size_of::<RadixNode<V>>())?
                    }
                    None => {}
                }
            }
            Ok(())
        })
    }

    /// Remove `key`. Collapses its parent if removal leaves
    /// that node in a structurally invalid state (fewer than 2 children and
    /// no `embedded_entry`).
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        let _writer = self.header.writer_tripwire();
        let pool = &*self.pool;
        let Some(found) = self.exact_descend(pool, key) else {
            return Ok(false);
        };
        let leaf_tagged = node::tag_leaf(RelPtr::from_ptr(pool, found.leaf as *const RadixLeaf<V>));

        self.pool.run(|tx| {
            found.leaf_slot.store(&self.header, TaggedRelPtr::NULL);
            self.retire(pool, leaf_tagged, tx)?;

            if let Some(parent) = found.parent {
                let child_count = parent.child_count();
                let embedded = parent.embedded_entry.load(Ordering::Acquire);
                let valid = child_count >= 2 || (child_count == 1 && !embedded.is_null());
                if !valid {
                    let replacement = if child_count == 1 {
                        parent.only_child_index().map(|i| parent.child[i].load(Ordering::Acquire))
                    } else if !embedded.is_null() {
                        Some(embedded)
                    } else {
                        None
                    };
                    let parent_tagged = node::tag_node(RelPtr::from_ptr(pool, parent as *const RadixNode<V>));
                    let grandparent_ptr = parent.parent.load(Ordering::Acquire);
                    let slot = found.parent_slot.expect("non-root parent must occupy a slot");

                    match replacement {
                        Some(rep) => {
                            if let Some(r) = unsafe { node::resolve::<V>(rep, pool) } {
                                match r {
                                    ChildRef::Leaf(l) => l.parent.store(grandparent_ptr, Ordering::Release),
                                    ChildRef::Node(n) => n.parent.store(grandparent_ptr, Ordering::Release),
                                }
                            }
                            slot.store(&self.header, rep);
                        }
                        None => slot.store(&self.header, TaggedRelPtr::NULL),
                    }
                    self.retire(pool, parent_tagged, tx)?;
                }
            }
            Ok(())
        })?;
        self.header.size.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Erase the entry at `key`, as if `key` were an iterator position, and
    /// return the entry that would follow it — mirroring the source API's
    /// `erase(const_iterator)` advancing past the removed element.
    pub fn erase_iter(&self, key: &[u8]) -> Result<Option<Entry<'_, V>>> {
        let pool = &*self.pool;
        let next_key = self
            .find_leaf(pool, key)
            .and_then(|leaf| self.successor(pool, leaf))
            .map(|leaf| leaf.key().to_vec());
        self.erase(key)?;
        Ok(next_key.and_then(|k| self.find_leaf(pool, &k)).map(Entry::from))
    }

    /// Erase every stored key in `[start, end)`. Returns the number of
    /// entries removed. Single-threaded, like the rest of iteration.
    pub fn erase_range(&self, start: &[u8], end: &[u8]) -> Result<usize> {
        let keys: Vec<Vec<u8>> = self
            .iter()
            .skip_while(|e| e.key < start)
            .take_while(|e| e.key < end)
            .map(|e| e.key.to_vec())
            .collect();
        let mut erased = 0;
        for key in &keys {
            if self.erase(key)? {
                erased += 1;
            }
        }
        Ok(erased)
    }

    fn free_subtree(&self, tx: &Transaction<'_, P>, t: TaggedRelPtr<ChildMarker<V>>) -> Result<()> {
        if t.is_null() {
            return Ok(());
        }
        let pool = &*self.pool;
        match unsafe { node::resolve::<V>(t, pool) } {
            Some(ChildRef::Leaf(leaf)) => {
                tx.free_bytes(node::leaf_ref(t).raw_offset(), RadixLeaf::<V>::alloc_size(leaf.key_len as usize))?;
            }
            Some(ChildRef::Node(n)) => {
                self.free_subtree(tx, n.embedded_entry.load(Ordering::Acquire))?;
                for c in n.child.iter() {
                    self.free_subtree(tx, c.load(Ordering::Acquire))?;
                }
                tx.free_bytes(node::node_ref(t).raw_offset(), std::mem::size_of::<RadixNode<V>>())?;
            }
            None => {}
        }
        Ok(())
    }

    /// Remove every entry. Single-threaded.
    pub fn clear(&mut self) -> Result<()> {
        let _writer = self.header.writer_tripwire();
        let root = self.header.root.load(Ordering::Acquire);
        self.pool.run(|tx| self.free_subtree(tx, root))?;
        self.header.root.store(TaggedRelPtr::NULL, Ordering::Release);
        self.header.size.store(0, Ordering::Release);
        self.header.garbage.clear();
        Ok(())
    }

    pub fn first(&self) -> Option<Entry<'_, V>> {
        let root = self.header.root.load(Ordering::Acquire);
        if root.is_null() {
            return None;
        }
        self.leftmost_leaf(&self.pool, root).map(Entry::from)
    }

    pub fn iter(&self) -> Iter<'_, V, P> {
        Iter {
            tree: self,
            next: self.leftmost_leaf(&self.pool, self.header.root.load(Ordering::Acquire)),
        }
    }

    /// Enable multi-reader/single-writer mode and finish or discard
    /// whatever leaf insert was pending at the last clean open.
    pub fn runtime_initialize_mt(&self) -> Result<()> {
        let pool = &*self.pool;
        match self.header.write_progress.phase() {
            header::PHASE_IN_PROGRESS => {
                let attach = self.header.write_progress.attach();
                if !attach.is_null() {
                    let target_parent = self.header.write_progress.target_parent();
                    let target_slot = self.header.write_progress.target_slot();
                    if let Some(slot) = Slot::from_write_progress(pool, target_parent, target_slot) {
                        slot.store(&self.header, attach);
                        self.header.size.fetch_add(1, Ordering::AcqRel);
                    }
                }
                self.header.write_progress.clear();
            }
            header::PHASE_NOT_STARTED => {
                let pending = self.header.write_progress.pending();
                if !pending.is_null() {
                    self.pool.run(|tx| self.retire(pool, pending, tx))?;
                }
                self.header.write_progress.clear();
            }
            _ => {}
        }
        self.header.mt_enabled.store(true, Ordering::Release);
        Ok(())
    }
}

fn slot_of<'a, V>(parent: &'a RadixNode<V>, cur: TaggedRelPtr<ChildMarker<V>>) -> Slot<'a, V> {
    if parent.embedded_entry.load(Ordering::Acquire).raw() == cur.raw() {
        return Slot::Embedded { parent };
    }
    for (i, c) in parent.child.iter().enumerate() {
        if c.load(Ordering::Acquire).raw() == cur.raw() {
            return Slot::Child { parent, index: i };
        }
    }
    unreachable!("cur must be reachable from its own parent")
}

impl<V: Copy, P: Pool> RuntimeInit<P> for RadixTree<V, P> {
    fn runtime_initialize(&self, _pool: &P) -> Result<()> {
        if self.header.layout_features.incompat != crate::layout::HEADER_INCOMPAT {
            return Err(CoreError::Layout(self.header.layout_features.incompat));
        }
        self.header.mt_enabled.store(false, Ordering::Release);
        Ok(())
    }
}

/// Single-threaded forward iterator over entries in key order.
pub struct Iter<'a, V, P: Pool> {
    tree: &'a RadixTree<V, P>,
    next: Option<&'a RadixLeaf<V>>,
}

impl<'a, V: Copy, P: Pool> Iterator for Iter<'a, V, P> {
    type Item = Entry<'a, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = self.tree.successor(&self.tree.pool, cur);
        Some(Entry::from(cur))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryPool;

    fn new_tree() -> RadixTree<u64, MemoryPool> {
        RadixTree::new(Arc::new(MemoryPool::new(1)))
    }

    #[test]
    fn insert_find_erase_roundtrip() {
        let tree = new_tree();
        assert!(tree.insert(b"apple", 1).unwrap());
        assert!(tree.insert(b"app", 2).unwrap());
        assert!(tree.insert(b"application", 3).unwrap());
        assert!(!tree.insert(b"app", 99).unwrap());

        assert_eq!(tree.find(b"app").map(|e| *e.value), Some(2));
        assert_eq!(tree.find(b"apple").map(|e| *e.value), Some(1));
        assert_eq!(tree.find(b"application").map(|e| *e.value), Some(3));
        assert!(tree.find(b"banana").is_none());

        assert!(tree.erase(b"app").unwrap());
        assert!(!tree.erase(b"app").unwrap());
        assert!(tree.find(b"app").is_none());
        assert_eq!(tree.find(b"apple").map(|e| *e.value), Some(1));
    }

    #[test]
    fn iteration_is_in_lexicographic_order() {
        let tree = new_tree();
        for (k, v) in [("banana", 2u64), ("apple", 1), ("cherry", 3), ("app", 4)] {
            tree.insert(k.as_bytes(), v).unwrap();
        }
        let keys: Vec<Vec<u8>> = tree.iter().map(|e| e.key.to_vec()).collect();
        assert_eq!(
            keys,
            vec![
                b"app".to_vec(),
                b"apple".to_vec(),
                b"banana".to_vec(),
                b"cherry".to_vec(),
            ]
        );
    }

    #[test]
    fn bound_queries_find_nearest_keys() {
        let tree = new_tree();
        for k in ["b", "d", "f"] {
            tree.insert(k.as_bytes(), 0u64).unwrap();
        }
        assert_eq!(tree.lower_bound(b"a").map(|e| e.key.to_vec()), Some(b"b".to_vec()));
        assert_eq!(tree.lower_bound(b"d").map(|e| e.key.to_vec()), Some(b"d".to_vec()));
        assert_eq!(tree.upper_bound(b"d").map(|e| e.key.to_vec()), Some(b"f".to_vec()));
        assert_eq!(tree.lower_bound(b"g"), None);
    }

    #[test]
    fn count_and_contains_reflect_membership() {
        let tree = new_tree();
        tree.insert(b"k", 1u64).unwrap();
        assert!(tree.contains(b"k"));
        assert_eq!(tree.count(b"k"), 1);
        assert!(!tree.contains(b"missing"));
        assert_eq!(tree.count(b"missing"), 0);
    }

    #[test]
    fn erase_iter_returns_the_following_entry() {
        let tree = new_tree();
        for (k, v) in [("a", 1u64), ("b", 2), ("c", 3)] {
            tree.insert(k.as_bytes(), v).unwrap();
        }
        let next = tree.erase_iter(b"b").unwrap();
        assert_eq!(next.map(|e| e.key.to_vec()), Some(b"c".to_vec()));
        assert!(tree.find(b"b").is_none());

        let next = tree.erase_iter(b"c").unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn erase_range_removes_the_half_open_interval() {
        let tree = new_tree();
        for i in 0..10u64 {
            tree.insert(format!("k{i}").as_bytes(), i).unwrap();
        }
        let erased = tree.erase_range(b"k3", b"k7").unwrap();
        assert_eq!(erased, 4);
        for i in [3, 4, 5, 6] {
            assert!(tree.find(format!("k{i}").as_bytes()).is_none());
        }
        for i in [0, 1, 2, 7, 8, 9] {
            assert!(tree.find(format!("k{i}").as_bytes()).is_some());
        }
    }

    #[test]
    fn insert_or_assign_overwrites_existing_value() {
        let tree = new_tree();
        assert!(tree.insert_or_assign(b"k", 1).unwrap());
        assert!(!tree.insert_or_assign(b"k", 2).unwrap());
        assert_eq!(tree.find(b"k").map(|e| *e.value), Some(2));
    }

    #[test]
    fn clear_empties_the_tree() {
        let mut tree = new_tree();
        for i in 0..20u64 {
            tree.insert(format!("k{i}").as_bytes(), i).unwrap();
        }
        tree.clear().unwrap();
        assert_eq!(tree.size(), 0);
        assert!(tree.find(b"k0").is_none());
    }

    #[test]
    fn mt_mode_retires_instead_of_freeing_until_collected() {
        let tree = new_tree();
        tree.insert(b"k1", 1).unwrap();
        tree.insert(b"k2", 2).unwrap();
        tree.runtime_initialize_mt().unwrap();
        assert!(tree.mt_enabled());
        tree.erase(b"k1").unwrap();
        assert!(!tree.header.garbage.is_empty());
        tree.garbage_collect().unwrap();
        assert!(tree.header.garbage.is_empty());
    }

    #[test]
    fn restart_completes_an_in_progress_root_link() {
        let tree = new_tree();
        let new_leaf = tree.alloc_leaf(b"resumed", 7u64).unwrap();
        let attach = node::tag_leaf(new_leaf);
        tree.header.write_progress.begin(attach);
        // Simulate a crash between recording the write-progress intent and
        // the store that actually publishes it: nothing is reachable yet.
        tree.header.write_progress.mark_in_progress(attach, RelPtr::NULL, 0);
        assert!(tree.find(b"resumed").is_none());

        tree.runtime_initialize_mt().unwrap();

        assert_eq!(tree.find(b"resumed").map(|e| *e.value), Some(7));
        assert_eq!(tree.size(), 1);
        assert_eq!(tree.header.write_progress.phase(), header::PHASE_IDLE);
    }

    #[test]
    fn restart_completes_an_in_progress_child_link() {
        let tree = new_tree();
        tree.insert(b"app", 1u64).unwrap();

        // Build a second leaf ("apple") the way `insert_if_absent` would,
        // stopping right before the outer-slot store that publishes it, to
        // simulate a crash in that window.
        let pool = &*tree.pool;
        let d = tree.descend(pool, b"apple").unwrap();
        let new_leaf = tree.alloc_leaf(b"apple", 2u64).unwrap();
        let parent = match d.stop_slot {
            Slot::Child { parent, .. } | Slot::Embedded { parent } => parent,
            Slot::Root => unreachable!(),
        };
        unsafe { new_leaf.get(pool) }
            .unwrap()
            .parent
            .store(RelPtr::from_ptr(pool, parent as *const RadixNode<u64>), Ordering::Release);
        let attach = node::tag_leaf(new_leaf);
        tree.header.write_progress.begin(attach);
        let (target_parent, target_slot) = d.stop_slot.for_write_progress(pool);
        tree.header.write_progress.mark_in_progress(attach, target_parent, target_slot);
        assert!(tree.find(b"apple").is_none());

        tree.runtime_initialize_mt().unwrap();

        assert_eq!(tree.find(b"apple").map(|e| *e.value), Some(2));
        assert_eq!(tree.find(b"app").map(|e| *e.value), Some(1));
        assert_eq!(tree.size(), 2);
    }
}
