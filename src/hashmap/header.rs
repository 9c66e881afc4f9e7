//! Persistent hash map header.
//!
//! Unlike nodes and segment blocks, the header itself is not allocated out
//! of the pool arena in this implementation: it is the root/anchor object an
//! application would hold a `persistent_ptr` to in the source design, and is
//! kept here as an ordinary heap value owned by [`super::HashMap`]. See
//! `DESIGN.md` for why that simplification does not affect any of the
//! concurrency or recovery guarantees this crate provides.

use std::sync::atomic::{AtomicU64, AtomicUsize};

use parking_lot::Mutex;

use super::bucket::Bucket;
use crate::layout::{LayoutFeatures, CONSISTENT_SIZE};
use crate::segment::{SegmentTable, EMBEDDED_BUCKET_COUNT};
use crate::tls::SizeAccumulator;

pub use crate::layout::HEADER_INCOMPAT;

pub struct HashMapHeader<K, V> {
    pub pool_uuid: u64,
    pub layout_features: LayoutFeatures,
    pub mask: AtomicU64,
    pub value_size: usize,
    pub segment_table: SegmentTable<Bucket<K, V>>,
    pub size: AtomicUsize,
    pub tls: SizeAccumulator,
    pub on_init_size: AtomicUsize,
    pub segment_enable_mutex: Mutex<()>,
    pub embedded_buckets: [Bucket<K, V>; EMBEDDED_BUCKET_COUNT],
}

impl<K, V> HashMapHeader<K, V> {
    pub fn new(pool_uuid: u64) -> Self {
        Self {
            pool_uuid,
            layout_features: LayoutFeatures::new(CONSISTENT_SIZE),
            mask: AtomicU64::new(crate::segment::total_after(0) - 1),
            value_size: std::mem::size_of::<V>(),
            segment_table: SegmentTable::new(),
            size: AtomicUsize::new(0),
            tls: SizeAccumulator::new(),
            on_init_size: AtomicUsize::new(0),
            segment_enable_mutex: Mutex::new(()),
            embedded_buckets: std::array::from_fn(|_| Bucket::new(true)),
        }
    }
}
