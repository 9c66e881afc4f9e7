//! An in-process stand-in for a persistent-memory pool manager.
//!
//! The real system this core is written against maps a pool from a file on
//! durable storage and hands back a stable base address on every open. No
//! such manager is available to link against here, so this module reserves one
//! large anonymous `mmap` region up front and bump-allocates out of it with
//! a first-fit free list for reuse. The mapping's base address never
//! changes for the process's lifetime, so [`RelPtr`](crate::relptr::RelPtr)
//! offsets computed against it stay valid the way they would across a real
//! pool reopen at a different address.
//!
//! Transactions are tracked per-thread as a stack of undo frames so nested
//! `run` calls compose: a child transaction's undo entries and staged
//! allocations/frees are folded into the parent's frame on commit, and
//! unwound independently on abort.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::relptr::PoolBase;

use super::{Pool, Transaction};

/// Default size of the reserved virtual address range (2 GiB).
pub const DEFAULT_POOL_CAPACITY: usize = 2 * 1024 * 1024 * 1024;

struct UndoEntry {
    offset: u64,
    original: Vec<u8>,
}

#[derive(Default)]
struct TxFrame {
    undo: Vec<UndoEntry>,
    staged_allocs: Vec<(u64, usize)>,
    staged_frees: Vec<(u64, usize)>,
}

thread_local! {
    static TX_STACK: RefCell<Vec<TxFrame>> = RefCell::new(Vec::new());
}

/// A byte-addressed persistent-memory pool stand-in. Offset `0` is reserved
/// so it can serve as the null sentinel for [`RelPtr`](crate::relptr::RelPtr).
pub struct MemoryPool {
    base: *mut u8,
    capacity: usize,
    bump: AtomicUsize,
    free_list: Mutex<Vec<(u64, usize)>>,
    pool_uuid: u64,
}

// SAFETY: `base` points at memory owned exclusively by this `MemoryPool` for
// its entire lifetime; all access to the region is mediated by the
// allocator's bookkeeping (`bump`, `free_list`) or by the caller's own
// locks once a sub-range has been handed out, exactly as a real pmem pool
// manager would require of its callers.
unsafe impl Send for MemoryPool {}
unsafe impl Sync for MemoryPool {}

impl MemoryPool {
    pub fn new(pool_uuid: u64) -> Self {
        Self::with_capacity(pool_uuid, DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity(pool_uuid: u64, capacity: usize) -> Self {
        let base = unsafe {
            let m = libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            );
            if m == libc::MAP_FAILED {
                panic!("memory pool: mmap failed for {capacity} bytes");
            }
            m as *mut u8
        };
        tracing::debug!(capacity, pool_uuid, "memory pool reserved");
        Self {
            base,
            capacity,
            // offset 0 is the null sentinel; start the bump cursor at a
            // cache line so the first real allocation never lands at 0.
            bump: AtomicUsize::new(64),
            free_list: Mutex::new(Vec::new()),
            pool_uuid,
        }
    }

    pub fn pool_uuid(&self) -> u64 {
        self.pool_uuid
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn raw_alloc(&self, size: usize, align: usize) -> Result<u64> {
        debug_assert!(align.is_power_of_two());
        {
            let mut free_list = self.free_list.lock();
            if let Some(idx) = free_list
                .iter()
                .position(|&(off, len)| len >= size && off % align as u64 == 0)
            {
                let (off, len) = free_list.swap_remove(idx);
                if len > size {
                    free_list.push((off + size as u64, len - size));
                }
                return Ok(off);
            }
        }
        loop {
            let cur = self.bump.load(Ordering::Relaxed);
            let aligned = (cur + align - 1) & !(align - 1);
            let next = aligned
                .checked_add(size)
                .ok_or(CoreError::TransactionAlloc)?;
            if next > self.capacity {
                tracing::warn!(size, capacity = self.capacity, "memory pool exhausted");
                return Err(CoreError::TransactionAlloc);
            }
            if self
                .bump
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(aligned as u64);
            }
        }
    }

    fn with_top_frame<R>(&self, f: impl FnOnce(&mut TxFrame) -> R) -> Option<R> {
        TX_STACK.with(|stack| stack.borrow_mut().last_mut().map(f))
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}

impl PoolBase for MemoryPool {
    fn base_ptr(&self) -> *mut u8 {
        self.base
    }
}

impl Pool for MemoryPool {
    fn in_transaction(&self) -> bool {
        TX_STACK.with(|stack| !stack.borrow().is_empty())
    }

    fn persist(&self, offset: u64, len: usize) {
        // A real pool manager would flush CPU caches / call msync here; the
        // in-process stand-in has nothing durable to flush to.
        let _ = (offset, len);
    }

    fn flush(&self, offset: u64, len: usize) {
        let _ = (offset, len);
    }

    fn drain(&self) {}

    fn run<F, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_, Self>) -> Result<T>,
        Self: Sized,
    {
        debug_assert!(
            !crate::concurrency::accessor_held_on_this_thread(),
            "a hash map accessor is still held on this thread; release it before starting a transaction"
        );
        TX_STACK.with(|stack| stack.borrow_mut().push(TxFrame::default()));
        let tx = Transaction { pool: self };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(&tx)));
        match result {
            Ok(Ok(value)) => {
                self.commit_top_frame();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.abort_top_frame();
                Err(err)
            }
            Err(payload) => {
                self.abort_top_frame();
                std::panic::resume_unwind(payload);
            }
        }
    }

    fn alloc_in_tx(&self, size: usize, align: usize) -> Result<u64> {
        debug_assert!(self.in_transaction(), "alloc_in_tx outside a transaction");
        let offset = self.raw_alloc(size, align)?;
        self.with_top_frame(|frame| frame.staged_allocs.push((offset, size)));
        Ok(offset)
    }

    fn free_in_tx(&self, offset: u64, size: usize) -> Result<()> {
        debug_assert!(self.in_transaction(), "free_in_tx outside a transaction");
        self.with_top_frame(|frame| frame.staged_frees.push((offset, size)));
        Ok(())
    }

    fn snapshot_in_tx(&self, offset: u64, len: usize) -> Result<()> {
        debug_assert!(self.in_transaction(), "snapshot_in_tx outside a transaction");
        if offset as usize + len > self.capacity {
            return Err(CoreError::Pool);
        }
        let original = unsafe {
            std::slice::from_raw_parts(self.base.add(offset as usize), len).to_vec()
        };
        self.with_top_frame(|frame| frame.undo.push(UndoEntry { offset, original }));
        Ok(())
    }
}

impl MemoryPool {
    fn commit_top_frame(&self) {
        let frame = TX_STACK.with(|stack| stack.borrow_mut().pop());
        let Some(frame) = frame else { return };
        let is_outermost = TX_STACK.with(|stack| stack.borrow().is_empty());
        if is_outermost {
            if !frame.staged_frees.is_empty() {
                let mut free_list = self.free_list.lock();
                free_list.extend(frame.staged_frees);
            }
        } else {
            // fold this frame's effects into the parent so an outer abort
            // still unwinds everything a committed nested transaction did.
            TX_STACK.with(|stack| {
                let mut stack = stack.borrow_mut();
                let parent = stack.last_mut().expect("parent frame must exist");
                parent.undo.extend(frame.undo);
                parent.staged_allocs.extend(frame.staged_allocs);
                parent.staged_frees.extend(frame.staged_frees);
            });
        }
    }

    fn abort_top_frame(&self) {
        let frame = TX_STACK.with(|stack| stack.borrow_mut().pop());
        let Some(frame) = frame else { return };
        for entry in frame.undo.into_iter().rev() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    entry.original.as_ptr(),
                    self.base.add(entry.offset as usize),
                    entry.original.len(),
                );
            }
        }
        if !frame.staged_allocs.is_empty() {
            let mut free_list = self.free_list.lock();
            free_list.extend(frame.staged_allocs);
        }
        // staged_frees are simply dropped: the memory was never actually
        // returned to the allocator, so nothing needs reversing.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_roundtrip() {
        let pool = MemoryPool::new(1);
        let off = pool
            .run(|tx| tx.alloc_bytes(64, 8))
            .expect("alloc committed");
        assert!(off >= 64);
        pool.run(|tx| tx.free_bytes(off, 64)).unwrap();
    }

    #[test]
    fn abort_reverses_alloc_and_undo() {
        let pool = MemoryPool::new(1);
        let off = pool.run(|tx| tx.alloc_bytes(8, 8)).unwrap();
        unsafe {
            *pool.base_ptr().add(off as usize) = 7;
        }
        let result: Result<()> = pool.run(|tx| {
            tx.snapshot(off, 1)?;
            unsafe {
                *pool.base_ptr().add(off as usize) = 9;
            }
            Err(CoreError::TransactionAlloc)
        });
        assert!(result.is_err());
        unsafe {
            assert_eq!(*pool.base_ptr().add(off as usize), 7);
        }
    }

    #[test]
    fn nested_transactions_fold_into_parent() {
        let pool = MemoryPool::new(1);
        pool.run(|_outer| {
            pool.run(|inner| inner.alloc_bytes(16, 8).map(|_| ()))?;
            assert!(pool.in_transaction());
            Ok(())
        })
        .unwrap();
        assert!(!pool.in_transaction());
    }
}
