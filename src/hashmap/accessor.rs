//! Scoped read/write handles onto a single entry's value.
//!
//! An accessor pins a node's value lock for as long as it is held; holding
//! one across a call into [`crate::pool::Pool::run`] on the same thread is a
//! programmer error. Each accessor bumps a thread-local depth counter on
//! construction and drops it on release, so `MemoryPool::run` can
//! `debug_assert!` that no accessor is outstanding before opening a
//! transaction.

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::concurrency;

pub struct ReadAccessor<'a, K, V> {
    pub(super) key: &'a K,
    pub(super) guard: RwLockReadGuard<'a, V>,
}

impl<'a, K, V> ReadAccessor<'a, K, V> {
    pub(super) fn new(key: &'a K, guard: RwLockReadGuard<'a, V>) -> Self {
        concurrency::accessor_acquired();
        Self { key, guard }
    }

    pub fn key(&self) -> &K {
        self.key
    }

    pub fn value(&self) -> &V {
        &self.guard
    }
}

impl<K, V> Drop for ReadAccessor<'_, K, V> {
    fn drop(&mut self) {
        concurrency::accessor_released();
    }
}

pub struct WriteAccessor<'a, K, V> {
    pub(super) key: &'a K,
    pub(super) guard: RwLockWriteGuard<'a, V>,
}

impl<'a, K, V> WriteAccessor<'a, K, V> {
    pub(super) fn new(key: &'a K, guard: RwLockWriteGuard<'a, V>) -> Self {
        concurrency::accessor_acquired();
        Self { key, guard }
    }

    pub fn key(&self) -> &K {
        self.key
    }

    pub fn value(&self) -> &V {
        &self.guard
    }

    pub fn value_mut(&mut self) -> &mut V {
        &mut self.guard
    }
}

impl<K, V> Drop for WriteAccessor<'_, K, V> {
    fn drop(&mut self) {
        concurrency::accessor_released();
    }
}
