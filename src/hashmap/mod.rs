//! Concurrent, persistent hash map.
//!
//! Layered directly on [`crate::segment::SegmentTable`] for bucket addressing
//! and [`crate::pool::Pool`] for the allocator/transaction surface. Multiple
//! threads may look up, insert into, and erase from the same map
//! concurrently; `clear`, `rehash`, `swap`, and iteration are single-threaded
//! operations the caller must not interleave with anything else.

pub mod accessor;
pub mod bucket;
pub mod header;
pub mod node;

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use accessor::{ReadAccessor, WriteAccessor};
use bucket::Bucket;
use header::HashMapHeader;
use node::Node;

use crate::error::{CoreError, Result};
use crate::pool::Pool;
use crate::relptr::RelPtr;
use crate::restart::RuntimeInit;
use crate::segment;

/// The bucket index this bucket's contents were split out of the last time
/// the map grew, or itself if it predates any growth.
fn parent_of(h: u64) -> u64 {
    let seg = segment::segment_of(h);
    if seg == 0 {
        h
    } else {
        h & (segment::segment_base(seg) - 1)
    }
}

pub struct HashMap<K, V, P: Pool, S = RandomState> {
    pool: Arc<P>,
    header: HashMapHeader<K, V>,
    hasher: S,
}

impl<K, V, P: Pool> HashMap<K, V, P, RandomState> {
    pub fn new(pool: Arc<P>) -> Self {
        Self::with_hasher(pool, RandomState::new())
    }
}

impl<K, V, P, S> HashMap<K, V, P, S>
where
    K: Hash + Eq,
    P: Pool,
    S: BuildHasher,
{
    pub fn with_hasher(pool: Arc<P>, hasher: S) -> Self {
        // Used only for diagnostics; any
        // stable-for-this-process value identifying the backing pool works.
        let pool_uuid = Arc::as_ptr(&pool) as u64;
        Self {
            pool,
            header: HashMapHeader::new(pool_uuid),
            hasher,
        }
    }

    fn hash_value<Q: Hash + ?Sized>(&self, value: &Q) -> u64 {
        let mut h = self.hasher.build_hasher();
        value.hash(&mut h);
        h.finish()
    }

    /// Resolve `key` to its bucket, ensuring that bucket has absorbed
    /// whatever lazy rehash it owes its parent before returning it.
    fn locate<Q>(&self, key: &Q) -> (u64, &Bucket<K, V>)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_value(key);
        loop {
            let mask = self.header.mask.load(Ordering::Acquire);
            let h = hash & mask;
            let bucket = self.header.segment_table.get_bucket(
                &*self.pool,
                &self.header.embedded_buckets,
                h,
            );
            if bucket.rehashed.load(Ordering::Acquire) == 0 {
                self.rehash_bucket(h);
                continue;
            }
            return (h, bucket);
        }
    }

    /// Move every node belonging under `h`'s current mask out of its parent
    /// bucket and into `h`'s own chain, then mark `h` rehashed. Holds the
    /// parent bucket's write lock for the whole walk,
    /// which rules out the mid-walk restart the un-simplified algorithm
    /// needs to handle concurrent erasure of a not-yet-moved node.
    fn rehash_bucket(&self, h: u64) {
        let pool = &*self.pool;
        let bucket =
            self.header
                .segment_table
                .get_bucket(pool, &self.header.embedded_buckets, h);
        let mut h_guard = bucket.chain.write();
        if bucket.rehashed.load(Ordering::Acquire) == 1 {
            return;
        }
        let h_parent = parent_of(h);
        if h_parent == h {
            bucket.rehashed.store(1, Ordering::Release);
            return;
        }
        let new_mask = self.header.mask.load(Ordering::Acquire);
        let parent_bucket =
            self.header
                .segment_table
                .get_bucket(pool, &self.header.embedded_buckets, h_parent);
        let mut p_guard = parent_bucket.chain.write();

        let mut prev: Option<&Node<K, V>> = None;
        let mut cur = *p_guard;
        let mut moved_head = RelPtr::NULL;
        let mut moved_tail: Option<&Node<K, V>> = None;

        while !cur.is_null() {
            let node = unsafe { cur.get(pool) }.expect("bucket chain pointer must be valid");
            let next = node.next.load(Ordering::Acquire);
            if (self.hash_value(&node.key) & new_mask) == h {
                match prev {
                    Some(p) => p.next.store(next, Ordering::Release),
                    None => *p_guard = next,
                }
                node.next.store(RelPtr::NULL, Ordering::Release);
                match moved_tail {
                    Some(t) => t.next.store(cur, Ordering::Release),
                    None => moved_head = cur,
                }
                moved_tail = Some(node);
            } else {
                prev = Some(node);
            }
            cur = next;
        }
        drop(p_guard);
        *h_guard = moved_head;
        bucket.rehashed.store(1, Ordering::Release);
    }

    /// Look up `key`, returning a read-locked handle onto its value.
    pub fn find<Q>(&self, key: &Q) -> Option<ReadAccessor<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (_h, bucket) = self.locate(key);
        let chain_guard = bucket.chain.read();
        let mut cur = *chain_guard;
        while !cur.is_null() {
            let node = unsafe { cur.get(&*self.pool) }.expect("chain pointer must be valid");
            if node.key.borrow() == key {
                let guard = node.value.read();
                return Some(ReadAccessor::new(&node.key, guard));
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Look up `key`, returning a write-locked handle onto its value.
    pub fn find_mut<Q>(&self, key: &Q) -> Option<WriteAccessor<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (_h, bucket) = self.locate(key);
        let chain_guard = bucket.chain.read();
        let mut cur = *chain_guard;
        while !cur.is_null() {
            let node = unsafe { cur.get(&*self.pool) }.expect("chain pointer must be valid");
            if node.key.borrow() == key {
                let guard = node.value.write();
                return Some(WriteAccessor::new(&node.key, guard));
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// `1` if `key` is present, `0` otherwise — the map has no multi-key
    /// entries, so this is just a boolean membership test in `usize` form.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some() as usize
    }

    /// Insert `key`/`value` if absent, otherwise return the existing entry
    /// write-locked. The `bool` is `true` iff a new node was created.
    pub fn insert(&self, key: K, value: V) -> Result<(WriteAccessor<'_, K, V>, bool)> {
        let (_h, bucket) = self.locate(&key);

        if let Some(found) = Self::find_write_in_chain(&*self.pool, &bucket.chain.read(), &key) {
            return Ok((found, false));
        }

        let mut chain_guard = bucket.chain.write();
        if let Some(found) = Self::find_write_in_chain(&*self.pool, &chain_guard, &key) {
            return Ok((found, false));
        }

        let old_head = *chain_guard;
        let node_size = std::mem::size_of::<Node<K, V>>();
        let node_align = std::mem::align_of::<Node<K, V>>();
        let offset = self.pool.run(|tx| {
            let offset = tx.alloc_bytes(node_size, node_align)?;
            unsafe {
                let ptr = tx.pool().base_ptr().add(offset as usize) as *mut Node<K, V>;
                ptr.write(Node::new(key, value, old_head));
            }
            Ok(offset)
        })?;
        let new_ptr = RelPtr::from_raw_offset(offset);
        *chain_guard = new_ptr;
        drop(chain_guard);

        self.header.tls.increment(&*self.pool);
        let new_size = self.header.size.fetch_add(1, Ordering::AcqRel) + 1;
        if new_size as u64 > self.header.mask.load(Ordering::Acquire) {
            self.maybe_grow();
        }

        let node = unsafe { new_ptr.get(&*self.pool) }.expect("just-inserted node must resolve");
        let guard = node.value.write();
        Ok((WriteAccessor::new(&node.key, guard), true))
    }

    fn find_write_in_chain<'a>(
        pool: &'a P,
        chain: &RelPtr<Node<K, V>>,
        key: &K,
    ) -> Option<WriteAccessor<'a, K, V>> {
        let mut cur = *chain;
        while !cur.is_null() {
            let node = unsafe { cur.get(pool) }.expect("chain pointer must be valid");
            if &node.key == key {
                let guard = node.value.write();
                return Some(WriteAccessor::new(&node.key, guard));
            }
            cur = node.next.load(Ordering::Acquire);
        }
        None
    }

    /// Remove `key`. Returns `true` if a node was actually removed.
    pub fn erase<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (_h, bucket) = self.locate(key);
        let mut chain_guard = bucket.chain.write();
        let mut prev: Option<&Node<K, V>> = None;
        let mut cur = *chain_guard;
        while !cur.is_null() {
            let node = unsafe { cur.get(&*self.pool) }.expect("chain pointer must be valid");
            if node.key.borrow() == key {
                // Acquiring (and immediately dropping) the value lock drains
                // any accessor that was already in flight before we took the
                // bucket lock.
                drop(node.value.write());
                let removed_offset = cur.raw_offset();
                let next = node.next.load(Ordering::Acquire);
                let freed = self
                    .pool
                    .run(|tx| tx.free_bytes(removed_offset, std::mem::size_of::<Node<K, V>>()));
                if freed.is_err() {
                    return false;
                }
                match prev {
                    Some(p) => p.next.store(next, Ordering::Release),
                    None => *chain_guard = next,
                }
                drop(chain_guard);
                self.header.tls.decrement(&*self.pool);
                self.header.size.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
            prev = Some(node);
            cur = node.next.load(Ordering::Acquire);
        }
        false
    }

    pub fn size(&self) -> usize {
        self.header.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Enable one more segment if the map has filled its current bucket
    /// count. A `try_lock` means only one thread actually
    /// performs any given growth; everyone else just moves on, since the
    /// insert that triggered this check already succeeded.
    fn maybe_grow(&self) {
        let Some(_guard) = self.header.segment_enable_mutex.try_lock() else {
            return;
        };
        let mask = self.header.mask.load(Ordering::Acquire);
        let size = self.header.size.load(Ordering::Acquire) as u64;
        if size <= mask {
            return;
        }
        let next_seg = self.header.segment_table.highest_enabled() + 1;
        if next_seg as usize > segment::MAX_SEGMENTS {
            tracing::warn!(next_seg, "hash map at maximum segment count, cannot grow");
            return;
        }
        let was_initial_reserve = size == 0;
        let result = self.pool.run(|tx| {
            self.header
                .segment_table
                .enable(tx, next_seg, |_| Bucket::new(was_initial_reserve))
        });
        match result {
            Ok(()) => {
                let new_mask = segment::total_after(next_seg) - 1;
                self.header.mask.store(new_mask, Ordering::Release);
                tracing::debug!(next_seg, new_mask, "hash map grew");
            }
            Err(err) => tracing::warn!(%err, next_seg, "hash map growth failed"),
        }
    }

    /// Eagerly grow until the map can hold at least `additional` more
    /// entries without growing again. Single-threaded.
    pub fn rehash(&mut self, additional: usize) -> Result<()> {
        let target = self.size() as u64 + additional as u64;
        loop {
            let mask = self.header.mask.load(Ordering::Acquire);
            if mask + 1 >= target.max(1) {
                return Ok(());
            }
            let next_seg = self.header.segment_table.highest_enabled() + 1;
            if next_seg as usize > segment::MAX_SEGMENTS {
                return Err(CoreError::Length {
                    requested: target as usize,
                    max: (segment::total_after(segment::MAX_SEGMENTS as u32 - 1)) as usize,
                });
            }
            let was_initial_reserve = self.is_empty();
            self.pool.run(|tx| {
                self.header
                    .segment_table
                    .enable(tx, next_seg, |_| Bucket::new(was_initial_reserve))
            })?;
            let new_mask = segment::total_after(next_seg) - 1;
            self.header.mask.store(new_mask, Ordering::Release);
        }
    }

    /// Remove every entry and release every enabled segment's backing
    /// storage. Single-threaded: the caller must guarantee no
    /// other thread is concurrently looking up, inserting into, or erasing
    /// from this map.
    pub fn clear(&mut self) -> Result<()> {
        let pool = &*self.pool;
        let highest = self.header.segment_table.highest_enabled();
        self.pool.run(|tx| {
            for seg in (1..=highest).rev() {
                self.free_segment_chains(pool, tx, seg)?;
                self.header.segment_table.disable(tx, seg)?;
            }
            self.free_bucket_chain(pool, tx, &self.header.embedded_buckets[0])?;
            self.free_bucket_chain(pool, tx, &self.header.embedded_buckets[1])?;
            self.header.tls.reconcile(pool);
            Ok(())
        })?;
        self.header.mask.store(segment::total_after(0) - 1, Ordering::Release);
        self.header.size.store(0, Ordering::Release);
        self.header.on_init_size.store(0, Ordering::Release);
        Ok(())
    }

    fn free_segment_chains(
        &self,
        pool: &P,
        tx: &crate::pool::Transaction<'_, P>,
        seg: u32,
    ) -> Result<()> {
        let count = segment::segment_size(seg) as usize;
        for offset in 0..count as u64 {
            let h = segment::segment_base(seg) + offset;
            let bucket = self
                .header
                .segment_table
                .get_bucket(pool, &self.header.embedded_buckets, h);
            self.free_bucket_chain(pool, tx, bucket)?;
        }
        Ok(())
    }

    fn free_bucket_chain(
        &self,
        pool: &P,
        tx: &crate::pool::Transaction<'_, P>,
        bucket: &Bucket<K, V>,
    ) -> Result<()> {
        let mut chain = bucket.chain.write();
        let mut cur = *chain;
        while !cur.is_null() {
            let node = unsafe { cur.get(pool) }.expect("chain pointer must be valid");
            let next = node.next.load(Ordering::Acquire);
            tx.free_bytes(cur.raw_offset(), std::mem::size_of::<Node<K, V>>())?;
            cur = next;
        }
        *chain = RelPtr::NULL;
        Ok(())
    }

    /// Exchange the internal state of `self` and `other` in place.
    /// Single-threaded; the caller must guarantee no accessor from either
    /// map outlives the swap.
    pub fn swap(&mut self, other: &mut Self) {
        debug_assert!(
            Arc::ptr_eq(&self.pool, &other.pool),
            "swap is only meaningful between maps drawn from the same pool"
        );
        std::mem::swap(&mut self.header, &mut other.header);
    }

    /// Opportunistically relocate live entries in buckets
    /// `[start_pct, start_pct + amount_pct)%` of the table, to hand back
    /// space to the pool's defragmentation facility. This crate's in-process
    /// pool stand-in has no physical compaction to delegate to, so this
    /// walks the selected range in descending bucket order (the opposite of
    /// lazy-rehash order, so it can never deadlock against a concurrent
    /// on-demand rehash) and reports what it saw.
    pub fn defragment(&self, start_pct: u32, amount_pct: u32) -> Result<usize> {
        if start_pct > 100 || amount_pct > 100 || start_pct + amount_pct > 100 {
            return Err(CoreError::OutOfRange {
                value: (start_pct + amount_pct) as i64,
                range: 0..101,
            });
        }
        let total = self.header.mask.load(Ordering::Acquire) + 1;
        let first = (total * start_pct as u64) / 100;
        let count = (total * amount_pct as u64) / 100;
        let mut visited = 0usize;
        for h in (first..first + count).rev() {
            let bucket = self.header.segment_table.get_bucket(
                &*self.pool,
                &self.header.embedded_buckets,
                h,
            );
            let Some(chain) = bucket.chain.try_read() else {
                continue;
            };
            let mut cur = *chain;
            while !cur.is_null() {
                let node = unsafe { cur.get(&*self.pool) }.expect("chain pointer must be valid");
                visited += 1;
                cur = node.next.load(Ordering::Acquire);
            }
        }
        Ok(visited)
    }

    /// Visit every live entry. Single-threaded.
    pub fn iter(&self) -> Iter<'_, K, V, P> {
        Iter {
            pool: &self.pool,
            header: &self.header,
            seg: 0,
            offset_in_seg: 0,
            cur: RelPtr::NULL,
        }
    }
}

impl<K, V, P, S> RuntimeInit<P> for HashMap<K, V, P, S>
where
    K: Hash + Eq,
    P: Pool,
{
    fn runtime_initialize(&self, pool: &P) -> Result<()> {
        if self.header.layout_features.incompat != header::HEADER_INCOMPAT {
            return Err(CoreError::Layout(self.header.layout_features.incompat));
        }
        let mask = self.header.segment_table.recompute_mask();
        self.header.mask.store(mask, Ordering::Release);
        let delta = pool.run(|_tx| Ok(self.header.tls.reconcile(pool)))?;
        let on_init = (self.header.on_init_size.load(Ordering::Acquire) as i64 + delta).max(0);
        self.header.on_init_size.store(on_init as usize, Ordering::Release);
        self.header.size.store(on_init as usize, Ordering::Release);
        Ok(())
    }
}

/// Single-threaded iterator over live `(key, value)` pairs.
pub struct Iter<'a, K, V, P: Pool> {
    pool: &'a P,
    header: &'a HashMapHeader<K, V>,
    seg: u32,
    offset_in_seg: u64,
    cur: RelPtr<Node<K, V>>,
}

impl<'a, K, V, P: Pool> Iterator for Iter<'a, K, V, P> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if !self.cur.is_null() {
                let node = unsafe { self.cur.get(self.pool) }.expect("chain pointer must be valid");
                self.cur = node.next.load(Ordering::Acquire);
                // SAFETY: iteration is documented single-threaded, so no
                // writer can hold `value`'s lock concurrently;
                // reading through the raw pointer avoids tying the returned
                // reference's lifetime to a guard local to this call.
                return Some((&node.key, unsafe { &*node.value.data_ptr() }));
            }
            let highest = self.header.segment_table.highest_enabled();
            if self.seg > highest {
                return None;
            }
            let count = segment::segment_size(self.seg);
            if self.offset_in_seg >= count {
                self.seg += 1;
                self.offset_in_seg = 0;
                continue;
            }
            let h = segment::segment_base(self.seg) + self.offset_in_seg;
            self.offset_in_seg += 1;
            let bucket = self
                .header
                .segment_table
                .get_bucket(self.pool, &self.header.embedded_buckets, h);
            self.cur = *bucket.chain.read();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryPool;

    fn new_map() -> HashMap<String, u64, MemoryPool> {
        HashMap::new(Arc::new(MemoryPool::new(1)))
    }

    #[test]
    fn insert_find_erase_roundtrip() {
        let map = new_map();
        let (acc, created) = map.insert("alpha".to_string(), 1).unwrap();
        assert!(created);
        assert_eq!(*acc.value(), 1);
        drop(acc);

        assert_eq!(map.find("alpha").map(|a| *a.value()), Some(1));
        assert!(map.find("missing").is_none());

        let (acc, created) = map.insert("alpha".to_string(), 99).unwrap();
        assert!(!created);
        assert_eq!(*acc.value(), 1);
        drop(acc);

        assert!(map.erase("alpha"));
        assert!(!map.erase("alpha"));
        assert!(map.find("alpha").is_none());
    }

    #[test]
    fn grows_under_many_inserts_and_finds_them_all() {
        let map = new_map();
        for i in 0..2000u64 {
            map.insert(format!("key{i}"), i).unwrap();
        }
        assert_eq!(map.size(), 2000);
        for i in 0..2000u64 {
            assert_eq!(map.find(&format!("key{i}")).map(|a| *a.value()), Some(i));
        }
    }

    #[test]
    fn concurrent_inserts_from_many_threads_all_land() {
        let map = Arc::new(new_map());
        std::thread::scope(|s| {
            for t in 0..8 {
                let map = Arc::clone(&map);
                s.spawn(move || {
                    for i in 0..200u64 {
                        map.insert(format!("t{t}-{i}"), t * 1000 + i).unwrap();
                    }
                });
            }
        });
        assert_eq!(map.size(), 1600);
    }

    #[test]
    fn clear_empties_the_map() {
        let mut map = new_map();
        for i in 0..50u64 {
            map.insert(format!("k{i}"), i).unwrap();
        }
        map.clear().unwrap();
        assert_eq!(map.size(), 0);
        assert!(map.find("k0").is_none());
    }

    #[test]
    fn iterates_every_inserted_entry_exactly_once() {
        let map = new_map();
        for i in 0..64u64 {
            map.insert(format!("k{i}"), i).unwrap();
        }
        let mut seen: Vec<u64> = map.iter().map(|(_, v)| *v).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..64u64).collect::<Vec<_>>());
    }

    #[test]
    fn count_and_find_mut_reflect_membership() {
        let map = new_map();
        map.insert("alpha".to_string(), 1).unwrap();

        assert_eq!(map.count("alpha"), 1);
        assert_eq!(map.count("missing"), 0);

        let mut acc = map.find_mut("alpha").expect("alpha must be present");
        *acc.value_mut() += 41;
        drop(acc);

        assert_eq!(map.find("alpha").map(|a| *a.value()), Some(42));
        assert!(map.find_mut("missing").is_none());
    }
}
