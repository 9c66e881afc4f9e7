//! Segment table shared by the concurrent hash map.
//!
//! Bucket index `h` decomposes into a segment number and an in-segment
//! offset: `segment = floor(log2(h | 1))`, `offset = h - segment_base(segment)`.
//! Segment `0` is the embedded segment, fixed at 2 buckets and stored
//! inline in the hash map header rather than behind a table entry. Segment
//! `k >= 1` holds `2^k` buckets. Because `segment_base(k) + segment_size(k)
//! == 2^(k+1)` for every `k`, the running total of enabled buckets is always
//! a power of two, which is exactly invariant I3 (`mask + 1` is a power of
//! two).
//!
//! This implementation does not split a segment's backing store across
//! multiple allocation blocks: the in-process
//! pool stand-in's maximum single allocation is large enough that no segment
//! this crate ever enables would need splitting. See `DESIGN.md` for the
//! rationale.

use std::sync::atomic::Ordering;

use crate::error::Result;
use crate::pool::{Pool, Transaction};
use crate::relptr::{AtomicRelPtr, PoolBase, RelPtr};

pub const MAX_SEGMENTS: usize = 32;
pub const EMBEDDED_BUCKET_COUNT: usize = 2;

#[inline]
pub fn segment_of(h: u64) -> u32 {
    63 - (h | 1).leading_zeros()
}

#[inline]
pub fn segment_base(seg: u32) -> u64 {
    if seg == 0 {
        0
    } else {
        1u64 << seg
    }
}

#[inline]
pub fn segment_size(seg: u32) -> u64 {
    if seg == 0 {
        EMBEDDED_BUCKET_COUNT as u64
    } else {
        1u64 << seg
    }
}

/// Total addressable buckets once segments `0..=seg` are all enabled.
#[inline]
pub fn total_after(seg: u32) -> u64 {
    1u64 << (seg + 1)
}

pub struct SegmentTable<B> {
    blocks: [AtomicRelPtr<B>; MAX_SEGMENTS],
}

impl<B> SegmentTable<B> {
    pub fn new() -> Self {
        Self {
            blocks: std::array::from_fn(|_| AtomicRelPtr::null()),
        }
    }

    pub fn is_valid(&self, seg: u32) -> bool {
        if seg == 0 {
            true
        } else {
            !self.blocks[seg as usize - 1].load(Ordering::Acquire).is_null()
        }
    }

    /// Highest segment number currently enabled (segment 0, the embedded
    /// one, always counts).
    pub fn highest_enabled(&self) -> u32 {
        let mut highest = 0u32;
        for seg in 1..MAX_SEGMENTS as u32 {
            if self.is_valid(seg) {
                highest = seg;
            } else {
                break;
            }
        }
        highest
    }

    /// Recompute the mask by scanning which segments are enabled, for use
    /// by `runtime_initialize`.
    pub fn recompute_mask(&self) -> u64 {
        total_after(self.highest_enabled()) - 1
    }

    pub fn get_bucket<'a, P: Pool>(
        &'a self,
        pool: &'a P,
        embedded: &'a [B; EMBEDDED_BUCKET_COUNT],
        h: u64,
    ) -> &'a B {
        let seg = segment_of(h);
        let offset = (h - segment_base(seg)) as usize;
        if seg == 0 {
            &embedded[offset]
        } else {
            let block = self.blocks[seg as usize - 1].load(Ordering::Acquire);
            debug_assert!(!block.is_null(), "segment {seg} not enabled");
            unsafe {
                let array = pool.base_ptr().add(block.raw_offset() as usize) as *const B;
                &*array.add(offset)
            }
        }
    }

    /// Allocate and initialize segment `seg`'s backing block inside `tx`,
    /// filling every bucket with `init(offset)`. Segment `0` cannot be
    /// enabled through this path (it is always present, embedded in the
    /// header).
    pub fn enable<P: Pool>(
        &self,
        tx: &Transaction<'_, P>,
        seg: u32,
        mut init: impl FnMut(usize) -> B,
    ) -> Result<()> {
        debug_assert!(seg >= 1 && (seg as usize) <= MAX_SEGMENTS);
        if self.is_valid(seg) {
            return Ok(());
        }
        let count = segment_size(seg) as usize;
        let bytes = count * std::mem::size_of::<B>();
        let offset = tx.alloc_bytes(bytes, std::mem::align_of::<B>())?;
        unsafe {
            let array = tx.pool().base_ptr().add(offset as usize) as *mut B;
            for i in 0..count {
                array.add(i).write(init(i));
            }
        }
        self.blocks[seg as usize - 1].store(RelPtr::from_raw_offset(offset), Ordering::Release);
        tx.pool().persist(offset, bytes);
        Ok(())
    }

    /// Deallocate segment `seg`'s backing block, used by `clear`/drop.
    pub fn disable<P: Pool>(&self, tx: &Transaction<'_, P>, seg: u32) -> Result<()> {
        debug_assert!(seg >= 1);
        let block = self.blocks[seg as usize - 1].load(Ordering::Acquire);
        if block.is_null() {
            return Ok(());
        }
        let bytes = segment_size(seg) as usize * std::mem::size_of::<B>();
        tx.free_bytes(block.raw_offset(), bytes)?;
        self.blocks[seg as usize - 1].store(RelPtr::NULL, Ordering::Release);
        Ok(())
    }
}

impl<B> Default for SegmentTable<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_decomposition_matches_power_of_two_growth() {
        assert_eq!(segment_of(0), 0);
        assert_eq!(segment_of(1), 0);
        assert_eq!(segment_of(2), 1);
        assert_eq!(segment_of(3), 1);
        assert_eq!(segment_of(4), 2);
        assert_eq!(segment_of(7), 2);
        assert_eq!(segment_of(8), 3);

        assert_eq!(segment_base(0), 0);
        assert_eq!(segment_base(1), 2);
        assert_eq!(segment_base(2), 4);
        assert_eq!(segment_base(3), 8);

        assert_eq!(total_after(0), 2);
        assert_eq!(total_after(1), 4);
        assert_eq!(total_after(2), 8);
        assert_eq!(total_after(3), 16);
    }
}
