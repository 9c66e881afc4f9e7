//! Shared "pool just opened" recovery hook.
//!
//! Every container implements [`RuntimeInit`] instead of a constructor that
//! re-derives its own volatile state, so application code calling into a
//! freshly opened pool has one uniform step to run before touching any
//! container: check the layout is understood, recompute whatever cached
//! state was not itself persisted (the mask; MT garbage lists), and fold any
//! thread-local size deltas back into the durable counter. `runtime_initialize`
//! must be idempotent — calling it twice on an already-initialized container
//! must be a no-op, since a process can crash between opening a pool and
//! finishing initialization and simply retry from the top.

use crate::error::Result;
use crate::pool::Pool;

pub trait RuntimeInit<P: Pool> {
    /// Re-derive volatile state after a pool is (re)opened. Must be called
    /// before any other operation observes the container from the calling
    /// thread, and is safe to call redundantly.
    fn runtime_initialize(&self, pool: &P) -> Result<()>;
}
