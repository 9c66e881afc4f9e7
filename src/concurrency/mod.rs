pub mod stack;

use std::cell::Cell;

thread_local! {
    /// Count of live hash map accessors ([`crate::hashmap::accessor::ReadAccessor`]/
    /// `WriteAccessor`) on this thread. Incremented on construction, decremented
    /// on drop.
    static ACCESSOR_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Mark one accessor as live on the current thread.
pub(crate) fn accessor_acquired() {
    ACCESSOR_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

/// Mark one accessor as released on the current thread.
pub(crate) fn accessor_released() {
    ACCESSOR_DEPTH.with(|depth| depth.set(depth.get() - 1));
}

/// True if the current thread is holding at least one hash map accessor.
/// Checked by `Pool::run` to catch the "accessor held across a transaction"
/// usage error in debug builds.
pub fn accessor_held_on_this_thread() -> bool {
    ACCESSOR_DEPTH.with(|depth| depth.get() > 0)
}
