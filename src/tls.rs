//! Thread-local size accumulator.
//!
//! Each thread that mutates a container's size gets (lazily) a slot holding
//! a signed delta. The slots themselves live in the pool so they survive a
//! restart; the thread-to-slot mapping is process-lifetime only and is
//! rebuilt from scratch (empty) after every open.
//! `reconcile` sums every slot into the caller-supplied base and clears the
//! slots inside a transaction, which is what `runtime_initialize` uses to
//! fold deltas back into `on_init_size`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::Result;
use crate::pool::Pool;
use crate::relptr::AtomicRelPtr;

const INITIAL_SLOTS: usize = 8;

/// A persistent, growable array of `i64` deltas.
pub struct TlsVector {
    ptr: AtomicRelPtr<AtomicI64>,
    cap: AtomicUsize,
    growth_lock: Mutex<()>,
}

impl TlsVector {
    pub fn new() -> Self {
        Self {
            ptr: AtomicRelPtr::null(),
            cap: AtomicUsize::new(0),
            growth_lock: Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Acquire)
    }

    fn slot<P: Pool>(&self, pool: &P, idx: usize) -> &AtomicI64 {
        let base = self.ptr.load(Ordering::Acquire);
        debug_assert!(!base.is_null());
        unsafe {
            let array = pool.base_ptr().add(base.raw_offset() as usize) as *const AtomicI64;
            &*array.add(idx)
        }
    }

    /// Ensure at least `needed` slots are allocated, growing (doubling, or
    /// to `needed` if larger) inside a transaction if not.
    pub fn ensure_capacity<P: Pool>(&self, pool: &P, needed: usize) -> Result<()> {
        if self.capacity() >= needed {
            return Ok(());
        }
        let _guard = self.growth_lock.lock();
        if self.capacity() >= needed {
            return Ok(());
        }
        let old_cap = self.capacity();
        let new_cap = needed.max(old_cap.max(INITIAL_SLOTS) * 2);
        let old_ptr = self.ptr.load(Ordering::Acquire);

        let new_offset = pool.run(|tx| {
            let bytes = new_cap * std::mem::size_of::<AtomicI64>();
            let offset = tx.alloc_bytes(bytes, std::mem::align_of::<AtomicI64>())?;
            unsafe {
                let new_array = pool.base_ptr().add(offset as usize) as *mut AtomicI64;
                for i in 0..new_cap {
                    let value = if i < old_cap {
                        self.slot(pool, i).load(Ordering::Relaxed)
                    } else {
                        0
                    };
                    new_array.add(i).write(AtomicI64::new(value));
                }
            }
            if !old_ptr.is_null() {
                tx.free_bytes(
                    old_ptr.raw_offset(),
                    old_cap * std::mem::size_of::<AtomicI64>(),
                )?;
            }
            Ok(offset)
        })?;

        self.ptr.store(
            crate::relptr::RelPtr::from_raw_offset(new_offset),
            Ordering::Release,
        );
        self.cap.store(new_cap, Ordering::Release);
        Ok(())
    }

    pub fn add<P: Pool>(&self, pool: &P, idx: usize, delta: i64) {
        self.slot(pool, idx).fetch_add(delta, Ordering::AcqRel);
    }

    pub fn sum<P: Pool>(&self, pool: &P) -> i64 {
        let cap = self.capacity();
        (0..cap).map(|i| self.slot(pool, i).load(Ordering::Acquire)).sum()
    }

    /// Zero every slot. Must be called from inside a transaction so the
    /// zeroing is itself reversible.
    pub fn clear_all<P: Pool>(&self, pool: &P) {
        let cap = self.capacity();
        for i in 0..cap {
            self.slot(pool, i).store(0, Ordering::Release);
        }
    }
}

impl Default for TlsVector {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread size bookkeeping for one container instance.
///
/// `thread_slots` is intentionally *not* part of the persisted layout: it is
/// rebuilt empty on every open, with slot contents reconciled by
/// `runtime_initialize` before any thread claims a slot.
pub struct SizeAccumulator {
    tls: TlsVector,
    thread_slots: Mutex<HashMap<ThreadId, usize>>,
    next_slot: AtomicUsize,
}

impl SizeAccumulator {
    pub fn new() -> Self {
        Self {
            tls: TlsVector::new(),
            thread_slots: Mutex::new(HashMap::new()),
            next_slot: AtomicUsize::new(0),
        }
    }

    fn slot_for_current_thread<P: Pool>(&self, pool: &P) -> Result<usize> {
        let tid = std::thread::current().id();
        if let Some(&idx) = self.thread_slots.lock().get(&tid) {
            return Ok(idx);
        }
        let mut map = self.thread_slots.lock();
        if let Some(&idx) = map.get(&tid) {
            return Ok(idx);
        }
        let idx = self.next_slot.fetch_add(1, Ordering::AcqRel);
        self.tls.ensure_capacity(pool, idx + 1)?;
        map.insert(tid, idx);
        Ok(idx)
    }

    pub fn increment<P: Pool>(&self, pool: &P) {
        if let Ok(idx) = self.slot_for_current_thread(pool) {
            self.tls.add(pool, idx, 1);
        }
    }

    pub fn decrement<P: Pool>(&self, pool: &P) {
        if let Ok(idx) = self.slot_for_current_thread(pool) {
            self.tls.add(pool, idx, -1);
        }
    }

    /// Sum every slot without clearing (used by diagnostics/tests).
    pub fn sum<P: Pool>(&self, pool: &P) -> i64 {
        self.tls.sum(pool)
    }

    /// Fold every slot's delta into `on_init_size`, clearing the slots and
    /// the process-lifetime thread map. Must run inside a transaction.
    pub fn reconcile<P: Pool>(&self, pool: &P) -> i64 {
        debug_assert!(pool.in_transaction(), "reconcile must run inside a transaction");
        let total = self.tls.sum(pool);
        self.tls.clear_all(pool);
        self.thread_slots.lock().clear();
        self.next_slot.store(0, Ordering::Release);
        total
    }
}

impl Default for SizeAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::memory::MemoryPool;

    #[test]
    fn increments_across_threads_sum_correctly() {
        let pool = MemoryPool::new(1);
        let acc = SizeAccumulator::new();
        acc.increment(&pool);
        acc.increment(&pool);
        assert_eq!(acc.sum(&pool), 2);

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| acc.increment(&pool));
            }
        });
        assert_eq!(acc.sum(&pool), 6);
    }

    #[test]
    fn reconcile_clears_and_returns_total() {
        let pool = MemoryPool::new(1);
        let acc = SizeAccumulator::new();
        acc.increment(&pool);
        acc.decrement(&pool);
        acc.increment(&pool);
        let total = pool.run(|_tx| Ok(acc.reconcile(&pool))).unwrap();
        assert_eq!(total, 1);
        assert_eq!(acc.sum(&pool), 0);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let pool = MemoryPool::new(1);
        let acc = SizeAccumulator::new();
        let mut handles = vec![];
        std::thread::scope(|s| {
            for _ in 0..(INITIAL_SLOTS * 3) {
                handles.push(s.spawn(|| acc.increment(&pool)));
            }
        });
        assert_eq!(acc.sum(&pool), (INITIAL_SLOTS * 3) as i64);
    }
}
