//! The pool / transaction surface consumed by every container.
//!
//! This module defines the *contract* the containers are written against —
//! [`Pool`] and [`Transaction`] — plus one concrete, in-process
//! implementation ([`memory::MemoryPool`]) used for running and testing the
//! crate. A real deployment would replace `memory::MemoryPool` with a
//! pmem-backed pool manager; container code never names `MemoryPool`
//! directly, only the `Pool` trait, so that swap costs nothing here.

pub mod memory;

use crate::error::Result;
use crate::relptr::PoolBase;

/// Operations the containers need from the pool manager.
///
/// All of `alloc`/`free`/`snapshot` are only ever called through a
/// [`Transaction`], which is the only way to obtain one — this mirrors the
/// source library's rule that structural mutation always happens inside a
/// transaction scope.
pub trait Pool: PoolBase + Send + Sync {
    /// True if the calling thread is currently inside a `run` body
    /// (possibly nested). Used to assert the "accessors must be released
    /// before starting a transaction on the same thread" rule.
    fn in_transaction(&self) -> bool;

    /// Persist a byte range that was modified outside a transaction's
    /// automatic snapshot set (e.g. a release-stored atomic field).
    fn persist(&self, offset: u64, len: usize);

    /// Flush a byte range to the durability domain without waiting.
    fn flush(&self, offset: u64, len: usize);

    /// Block until all outstanding flushes have drained.
    fn drain(&self);

    /// Run `body` inside a new (or, if already inside one, nested)
    /// transaction. On success the transaction commits and staged
    /// allocations/frees take effect. On error or panic, every snapshotted
    /// byte range is restored, every staged allocation is released, and
    /// every staged free is cancelled, then the error is re-raised (or the
    /// panic resumes).
    fn run<F, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_, Self>) -> Result<T>,
        Self: Sized;

    /// Allocate within the active transaction (called only via
    /// [`Transaction::alloc_bytes`]).
    fn alloc_in_tx(&self, size: usize, align: usize) -> Result<u64>;

    /// Stage a free within the active transaction (called only via
    /// [`Transaction::free_bytes`]).
    fn free_in_tx(&self, offset: u64, size: usize) -> Result<()>;

    /// Record an undo entry within the active transaction (called only via
    /// [`Transaction::snapshot`]).
    fn snapshot_in_tx(&self, offset: u64, len: usize) -> Result<()>;
}

/// A handle to the currently active transaction. Obtained only as the
/// argument to a [`Pool::run`] closure.
pub struct Transaction<'p, P: Pool> {
    pub(crate) pool: &'p P,
}

impl<'p, P: Pool> Transaction<'p, P> {
    /// Allocate `size` bytes aligned to `align`, returning the pool-relative
    /// offset of the new allocation. Reversed automatically if the
    /// transaction aborts.
    pub fn alloc_bytes(&self, size: usize, align: usize) -> Result<u64> {
        self.pool.alloc_in_tx(size, align)
    }

    /// Stage a free of the allocation at `offset`/`size`. The memory is not
    /// actually returned to the allocator until this transaction commits.
    pub fn free_bytes(&self, offset: u64, size: usize) -> Result<()> {
        self.pool.free_in_tx(offset, size)
    }

    /// Record the current contents of `[offset, offset+len)` in the undo
    /// log so they are restored verbatim if this transaction aborts.
    pub fn snapshot(&self, offset: u64, len: usize) -> Result<()> {
        self.pool.snapshot_in_tx(offset, len)
    }

    pub fn pool(&self) -> &'p P {
        self.pool
    }
}
