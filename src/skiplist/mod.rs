//! Concurrent skip list, ordered by key bytes.
//!
//! Grounded in the same single-writer/multi-reader discipline as the radix
//! tree: one writer at a time (enforced by a debug-mode tripwire, see
//! `header::SkipListHeader`), lock-free readers that walk `AtomicRelPtr`
//! chains without ever taking a lock, and the same two-mode garbage
//! handling — free immediately by default, or retire onto a garbage list
//! once [`SkipList::runtime_initialize_mt`] has been called, drained later
//! by [`SkipList::garbage_collect`].
//!
//! Insert builds the new node's own forward array bottom-up before any
//! other thread can observe it, then publishes by swinging each
//! predecessor's forward pointer from the highest populated level down to
//! level 0. Level 0 is swung last because every search, regardless of
//! which level it starts scanning from, always narrows down to a level-0
//! step before returning a result — so until that last store, a concurrent
//! reader sees either the old chain or nothing of the new node, never a
//! node reachable at some levels but not others. Erase unlinks in the same
//! top-down order for the mirror-image reason: the node stays reachable
//! until its level-0 predecessor is repointed.
//!
//! The mapped value is restricted to `V: Copy`, for the same leak-safety
//! reason as the radix tree (see `radix` module doc and `DESIGN.md`).

pub mod header;
pub mod node;

use std::cell::Cell;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use header::SkipListHeader;
use node::{SkipNode, MAX_LEVEL};

use crate::error::{CoreError, Result};
use crate::pool::{Pool, Transaction};
use crate::relptr::{PoolBase, RelPtr};
use crate::restart::RuntimeInit;

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(seed_for_current_thread());
}

fn seed_for_current_thread() -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() | 1
}

fn next_rng_word() -> u64 {
    RNG_STATE.with(|cell| {
        let mut x = cell.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        cell.set(x);
        x
    })
}

/// Coin-flip height selection: level 1 always, each additional level
/// granted with probability 1/2, capped at `MAX_LEVEL`.
fn random_height() -> u8 {
    let mut height = 1u8;
    while (height as usize) < MAX_LEVEL && next_rng_word() & 1 == 1 {
        height += 1;
    }
    height
}

/// Where a forward pointer at some level currently lives: either the
/// header's virtual head, or a real node's own forward array.
#[derive(Clone, Copy)]
enum Pred<'a, V> {
    Head,
    Node(&'a SkipNode<V>),
}

impl<'a, V> Pred<'a, V> {
    fn forward(&self, header: &'a SkipListHeader<V>, level: usize) -> &'a crate::relptr::AtomicRelPtr<SkipNode<V>> {
        match *self {
            Pred::Head => &header.head[level],
            Pred::Node(n) => n.forward(level),
        }
    }

    /// Encode this predecessor as a persistable pointer: `RelPtr::NULL` for
    /// the virtual head, the node's own address otherwise.
    fn to_relptr(&self, pool: &impl PoolBase) -> RelPtr<SkipNode<V>> {
        match *self {
            Pred::Head => RelPtr::NULL,
            Pred::Node(n) => RelPtr::from_ptr(pool, n as *const SkipNode<V>),
        }
    }
}

pub struct Entry<'a, V> {
    pub key: &'a [u8],
    pub value: &'a V,
}

impl<'a, V> From<&'a SkipNode<V>> for Entry<'a, V> {
    fn from(n: &'a SkipNode<V>) -> Self {
        Entry {
            key: n.key(),
            value: &n.value,
        }
    }
}

pub struct SkipList<V, P: Pool> {
    pool: Arc<P>,
    header: SkipListHeader<V>,
}

impl<V: Copy, P: Pool> SkipList<V, P> {
    pub fn new(pool: Arc<P>) -> Self {
        Self {
            pool,
            header: SkipListHeader::new(),
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

    /// Descend from the top level to level 0, recording the immediate
    /// predecessor at every level and an exact key match if one exists.
    /// Used by every mutating operation, which needs the predecessor chain
    /// to publish or unlink against.
    fn locate<'a>(&'a self, pool: &'a P, key: &[u8]) -> ([Pred<'a, V>; MAX_LEVEL], Option<&'a SkipNode<V>>) {
        let mut preds: [Pred<'a, V>; MAX_LEVEL] = [Pred::Head; MAX_LEVEL];
        let mut cur = Pred::Head;
        let mut found = None;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next_ptr = cur.forward(&self.header, level).load(Ordering::Acquire);
                match unsafe { next_ptr.get(pool) } {
                    Some(next) if next.key() < key => cur = Pred::Node(next),
                    Some(next) if next.key() == key => {
                        found = Some(next);
                        break;
                    }
                    _ => break,
                }
            }
            preds[level] = cur;
        }
        (preds, found)
    }

    /// Lock-free read path: no predecessor bookkeeping, just a walk down
    /// `AtomicRelPtr` chains.
    fn find_node<'a>(&self, pool: &'a P, key: &[u8]) -> Option<&'a SkipNode<V>> {
        let mut cur: Option<&'a SkipNode<V>> = None;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next_ptr = match cur {
                    None => self.header.head[level].load(Ordering::Acquire),
                    Some(n) => n.forward(level).load(Ordering::Acquire),
                };
                match unsafe { next_ptr.get(pool) } {
                    Some(next) if next.key() < key => cur = Some(next),
                    Some(next) if next.key() == key => return Some(next),
                    _ => break,
                }
            }
        }
        None
    }

    /// The first node whose key is `>= key`, found by descending to the
    /// last node strictly less than `key` and reading its level-0
    /// successor.
    fn ceiling_node<'a>(&self, pool: &'a P, key: &[u8]) -> Option<&'a SkipNode<V>> {
        let mut cur: Option<&'a SkipNode<V>> = None;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next_ptr = match cur {
                    None => self.header.head[level].load(Ordering::Acquire),
                    Some(n) => n.forward(level).load(Ordering::Acquire),
                };
                match unsafe { next_ptr.get(pool) } {
                    Some(next) if next.key() < key => cur = Some(next),
                    _ => break,
                }
            }
        }
        let next_ptr = match cur {
            None => self.header.head[0].load(Ordering::Acquire),
            Some(n) => n.forward(0).load(Ordering::Acquire),
        };
        unsafe { next_ptr.get(pool) }
    }

    pub fn find(&self, key: &[u8]) -> Option<Entry<'_, V>> {
        self.find_node(&self.pool, key).map(Entry::from)
    }

    /// Smallest stored key `>= key`.
    pub fn lower_bound(&self, key: &[u8]) -> Option<Entry<'_, V>> {
        self.ceiling_node(&self.pool, key).map(Entry::from)
    }

    /// Smallest stored key `> key`.
    pub fn upper_bound(&self, key: &[u8]) -> Option<Entry<'_, V>> {
        let pool = &*self.pool;
        let mut node = self.ceiling_node(pool, key);
        if let Some(n) = node {
            if n.key() == key {
                node = unsafe { n.forward(0).load(Ordering::Acquire).get(pool) };
            }
        }
        node.map(Entry::from)
    }

    fn alloc_node(&self, height: u8, key: &[u8], value: V) -> Result<RelPtr<SkipNode<V>>> {
        let size = SkipNode::<V>::alloc_size(height as usize, key.len());
        let align = SkipNode::<V>::align();
        let offset = self.pool.run(|tx| {
            let offset = tx.alloc_bytes(size, align)?;
            unsafe {
                let ptr = tx.pool().base_ptr().add(offset as usize) as *mut SkipNode<V>;
                SkipNode::init(ptr, height, key, value);
            }
            Ok(offset)
        })?;
        Ok(RelPtr::from_raw_offset(offset))
    }

    /// Insert `key`/`value` if absent. Returns `true` iff a new node was
    /// created; `emplace`/`try_emplace` below are thin aliases over this.
    fn insert_if_absent(&self, key: &[u8], value: V) -> Result<bool> {
        let _writer = self.header.writer_tripwire();
        let pool = &*self.pool;
        let (preds, found) = self.locate(pool, key);
        if found.is_some() {
            return Ok(false);
        }

        let height = random_height();
        let new_ptr = self.alloc_node(height, key, value)?;
        let new_ref = unsafe { new_ptr.get(pool) }.expect("just-allocated node must resolve");
        for level in 0..height as usize {
            let succ = preds[level].forward(&self.header, level).load(Ordering::Acquire);
            new_ref.forward(level).store(succ, Ordering::Release);
        }

        let pred_ptrs: [RelPtr<SkipNode<V>>; MAX_LEVEL] =
            std::array::from_fn(|level| if level < height as usize { preds[level].to_relptr(pool) } else { RelPtr::NULL });

        self.header.write_progress.begin(new_ptr);
        self.header.write_progress.mark_in_progress(height, &pred_ptrs);
        for level in (0..height as usize).rev() {
            preds[level].forward(&self.header, level).store(new_ptr, Ordering::Release);
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
    /// `true` iff a new node was created.
    pub fn insert_or_assign(&self, key: &[u8], value: V) -> Result<bool> {
        let pool = &*self.pool;
        let (preds, found) = self.locate(pool, key);
        if let Some(node) = found {
            let _writer = self.header.writer_tripwire();
            if self.mt_enabled() {
                self.replace_node(pool, &preds, node, key, value)?;
            } else {
                let node_ptr = RelPtr::from_ptr(pool, node as *const SkipNode<V>);
                self.pool.run(|_tx| {
                    let node_mut = unsafe { node_ptr.get_mut(pool) }.expect("node must resolve");
                    node_mut.value = value;
                    Ok(())
                })?;
            }
            Ok(false)
        } else {
            self.insert_if_absent(key, value)
        }
    }

    fn replace_node(
        &self,
        pool: &P,
        preds: &[Pred<'_, V>; MAX_LEVEL],
        old: &SkipNode<V>,
        key: &[u8],
        value: V,
    ) -> Result<()> {
        let height = old.height();
        let old_ptr = RelPtr::from_ptr(pool, old as *const SkipNode<V>);
        let new_ptr = self.alloc_node(height as u8, key, value)?;
        let new_ref = unsafe { new_ptr.get(pool) }.expect("just-allocated node must resolve");
        for level in 0..height {
            new_ref.forward(level).store(old.forward(level).load(Ordering::Acquire), Ordering::Release);
        }
        for level in (0..height).rev() {
            preds[level].forward(&self.header, level).store(new_ptr, Ordering::Release);
        }
        self.pool.run(|tx| self.retire(pool, old_ptr, tx))
    }

    fn free_node(&self, pool: &P, ptr: RelPtr<SkipNode<V>>, tx: &Transaction<'_, P>) -> Result<()> {
        let node = unsafe { ptr.get(pool) }.expect("node must resolve before free");
        let size = SkipNode::<V>::alloc_size(node.height(), node.key_len as usize);
        tx.free_bytes(ptr.raw_offset(), size)
    }

    fn retire(&self, pool: &P, ptr: RelPtr<SkipNode<V>>, tx: &Transaction<'_, P>) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        if self.header.mt_enabled.load(Ordering::Acquire) {
            self.header.garbage.push(ptr);
            return Ok(());
        }
        self.free_node(pool, ptr, tx)
    }

    /// Free everything retired while in MT mode. The application must call
    /// this only at a point it knows no reader still holds a reference
    /// into a retired node.
    pub fn garbage_collect(&self) -> Result<()> {
        let drained = self.header.garbage.drain_all();
        if drained.is_empty() {
            return Ok(());
        }
        let pool = &*self.pool;
        self.pool.run(|tx| {
            for ptr in &drained {
                self.free_node(pool, *ptr, tx)?;
            }
            Ok(())
        })
    }

    /// Remove `key`. Unlinks top-down (highest populated level first,
    /// level 0 last) so the node is only unreachable for new traversals
    /// once its level-0 predecessor is repointed.
    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        let _writer = self.header.writer_tripwire();
        let pool = &*self.pool;
        let (preds, found) = self.locate(pool, key);
        let Some(node) = found else {
            return Ok(false);
        };
        let height = node.height();
        let node_ptr = RelPtr::from_ptr(pool, node as *const SkipNode<V>);

        for level in (0..height).rev() {
            let succ = node.forward(level).load(Ordering::Acquire);
            preds[level].forward(&self.header, level).store(succ, Ordering::Release);
        }

        self.pool.run(|tx| self.retire(pool, node_ptr, tx))?;
        self.header.size.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Remove every entry. Single-threaded.
    pub fn clear(&mut self) -> Result<()> {
        let _writer = self.header.writer_tripwire();
        let pool = &*self.pool;
        let mut cur = self.header.head[0].load(Ordering::Acquire);
        self.pool.run(|tx| {
            while !cur.is_null() {
                let node = unsafe { cur.get(pool) }.expect("chain pointer must be valid");
                let next = node.forward(0).load(Ordering::Acquire);
                let size = SkipNode::<V>::alloc_size(node.height(), node.key_len as usize);
                tx.free_bytes(cur.raw_offset(), size)?;
                cur = next;
            }
            Ok(())
        })?;
        for level in 0..MAX_LEVEL {
            self.header.head[level].store(RelPtr::NULL, Ordering::Release);
        }
        self.header.size.store(0, Ordering::Release);
        self.header.garbage.clear();
        Ok(())
    }

    pub fn first(&self) -> Option<Entry<'_, V>> {
        self.first_node().map(Entry::from)
    }

    fn first_node(&self) -> Option<&SkipNode<V>> {
        unsafe { self.header.head[0].load(Ordering::Acquire).get(&*self.pool) }
    }

    pub fn iter(&self) -> Iter<'_, V, P> {
        Iter {
            list: self,
            next: self.first_node(),
        }
    }

    /// Enable multi-reader/single-writer mode and finish or discard
    /// whatever node insert was pending at the last clean open.
    pub fn runtime_initialize_mt(&self) -> Result<()> {
        let pool = &*self.pool;
        match self.header.write_progress.phase() {
            header::PHASE_IN_PROGRESS => {
                let new_ptr = self.header.write_progress.pending();
                let height = self.header.write_progress.height();
                if unsafe { new_ptr.get(pool) }.is_some() {
                    for level in (0..height as usize).rev() {
                        let pred_ptr = self.header.write_progress.pred(level);
                        let slot = match unsafe { pred_ptr.get(pool) } {
                            Some(pred_node) => pred_node.forward(level),
                            None => &self.header.head[level],
                        };
                        slot.store(new_ptr, Ordering::Release);
                    }
                    self.header.size.fetch_add(1, Ordering::AcqRel);
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

impl<V: Copy, P: Pool> RuntimeInit<P> for SkipList<V, P> {
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
    list: &'a SkipList<V, P>,
    next: Option<&'a SkipNode<V>>,
}

impl<'a, V: Copy, P: Pool> Iterator for Iter<'a, V, P> {
    type Item = Entry<'a, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = unsafe { cur.forward(0).load(Ordering::Acquire).get(&*self.list.pool) };
        Some(Entry::from(cur))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryPool;

    fn new_list() -> SkipList<u64, MemoryPool> {
        SkipList::new(Arc::new(MemoryPool::new(1)))
    }

    #[test]
    fn insert_find_erase_roundtrip() {
        let list = new_list();
        assert!(list.insert(b"apple", 1).unwrap());
        assert!(list.insert(b"banana", 2).unwrap());
        assert!(list.insert(b"cherry", 3).unwrap());
        assert!(!list.insert(b"banana", 99).unwrap());

        assert_eq!(list.find(b"apple").map(|e| *e.value), Some(1));
        assert_eq!(list.find(b"banana").map(|e| *e.value), Some(2));
        assert!(list.find(b"date").is_none());

        assert!(list.erase(b"banana").unwrap());
        assert!(!list.erase(b"banana").unwrap());
        assert!(list.find(b"banana").is_none());
        assert_eq!(list.size(), 2);
    }

    #[test]
    fn iteration_is_in_key_order() {
        let list = new_list();
        for (k, v) in [("banana", 2u64), ("apple", 1), ("cherry", 3), ("app", 4)] {
            list.insert(k.as_bytes(), v).unwrap();
        }
        let keys: Vec<Vec<u8>> = list.iter().map(|e| e.key.to_vec()).collect();
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
        let list = new_list();
        for k in ["b", "d", "f"] {
            list.insert(k.as_bytes(), 0u64).unwrap();
        }
        assert_eq!(list.lower_bound(b"a").map(|e| e.key.to_vec()), Some(b"b".to_vec()));
        assert_eq!(list.lower_bound(b"d").map(|e| e.key.to_vec()), Some(b"d".to_vec()));
        assert_eq!(list.upper_bound(b"d").map(|e| e.key.to_vec()), Some(b"f".to_vec()));
        assert_eq!(list.lower_bound(b"g"), None);
    }

    #[test]
    fn insert_or_assign_overwrites_existing_value() {
        let list = new_list();
        assert!(list.insert_or_assign(b"k", 1).unwrap());
        assert!(!list.insert_or_assign(b"k", 2).unwrap());
        assert_eq!(list.find(b"k").map(|e| *e.value), Some(2));
    }

    #[test]
    fn clear_empties_the_list() {
        let mut list = new_list();
        for i in 0..50u64 {
            list.insert(format!("k{i:03}").as_bytes(), i).unwrap();
        }
        list.clear().unwrap();
        assert_eq!(list.size(), 0);
        assert!(list.find(b"k000").is_none());
        assert!(list.first().is_none());
    }

    #[test]
    fn mt_mode_retires_instead_of_freeing_until_collected() {
        let list = new_list();
        list.insert(b"k1", 1).unwrap();
        list.insert(b"k2", 2).unwrap();
        list.runtime_initialize_mt().unwrap();
        assert!(list.mt_enabled());
        list.erase(b"k1").unwrap();
        assert!(!list.header.garbage.is_empty());
        list.garbage_collect().unwrap();
        assert!(list.header.garbage.is_empty());
    }

    #[test]
    fn restart_completes_an_in_progress_insert() {
        let list = new_list();
        list.insert(b"app", 1).unwrap();
        list.insert(b"cherry", 3).unwrap();

        // Build a node the way `insert_if_absent` would, stopping right
        // before the publish loop that swings each predecessor's forward
        // pointer, to simulate a crash in that window.
        let pool = &*list.pool;
        let (preds, found) = list.locate(pool, b"banana");
        assert!(found.is_none());
        let height = 2u8;
        let new_ptr = list.alloc_node(height, b"banana", 2u64).unwrap();
        let new_ref = unsafe { new_ptr.get(pool) }.unwrap();
        for level in 0..height as usize {
            let succ = preds[level].forward(&list.header, level).load(Ordering::Acquire);
            new_ref.forward(level).store(succ, Ordering::Release);
        }
        let pred_ptrs: [RelPtr<SkipNode<u64>>; MAX_LEVEL] =
            std::array::from_fn(|level| if level < height as usize { preds[level].to_relptr(pool) } else { RelPtr::NULL });
        list.header.write_progress.begin(new_ptr);
        list.header.write_progress.mark_in_progress(height, &pred_ptrs);
        assert!(list.find(b"banana").is_none());

        list.runtime_initialize_mt().unwrap();

        assert_eq!(list.find(b"banana").map(|e| *e.value), Some(2));
        assert_eq!(list.find(b"app").map(|e| *e.value), Some(1));
        assert_eq!(list.find(b"cherry").map(|e| *e.value), Some(3));
        assert_eq!(list.size(), 3);
        assert_eq!(list.header.write_progress.phase(), header::PHASE_IDLE);
    }

    #[test]
    fn handles_many_inserts_across_random_heights() {
        let list = new_list();
        for i in 0..500u64 {
            list.insert(format!("key-{i:05}").as_bytes(), i).unwrap();
        }
        assert_eq!(list.size(), 500);
        let keys: Vec<Vec<u8>> = list.iter().map(|e| e.key.to_vec()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        for i in (0..500u64).step_by(7) {
            assert_eq!(list.find(format!("key-{i:05}").as_bytes()).map(|e| *e.value), Some(i));
        }
    }
}
