//! Relative (pool-offset) pointers and their tagged variant.
//!
//! A [`RelPtr<T>`] is a 64-bit offset from the owning pool's base address; it
//! survives the pool being remapped to a different address, which is exactly
//! what lets these structures live in a memory-mapped file and be reopened at
//! an arbitrary address on a later run. Dereferencing costs one addition (to
//! the pool's base pointer) plus one load.
//!
//! [`TaggedRelPtr<T>`] steals the low bit of the offset as a discriminant.
//! Callers must guarantee 2-byte alignment of anything pointed to by a
//! tagged pointer; both node kinds in this crate are `#[repr(align(2))]` (in
//! practice far more aligned, since they are cache-line sized) so the low
//! bit of a real offset is always zero.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

/// Anything that can hand out its pool base address for relative-pointer
/// arithmetic. Implemented by [`crate::pool::memory::MemoryPool`].
pub trait PoolBase {
    fn base_ptr(&self) -> *mut u8;
}

const NULL: u64 = 0;

/// A plain (non-atomic) relative pointer. Used for fields that are always
/// mutated while the owning object's lock is held (e.g. `Node::next`,
/// `Bucket::node_list`).
pub struct RelPtr<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RelPtr<T> {
    pub const NULL: Self = Self {
        offset: NULL,
        _marker: PhantomData,
    };

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset == NULL
    }

    #[inline]
    pub fn from_raw_offset(offset: u64) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn raw_offset(&self) -> u64 {
        self.offset
    }

    /// Build a relative pointer from an absolute pointer known to live
    /// inside `pool`.
    pub fn from_ptr(pool: &impl PoolBase, ptr: *const T) -> Self {
        if ptr.is_null() {
            return Self::NULL;
        }
        let offset = ptr as u64 - pool.base_ptr() as u64;
        Self::from_raw_offset(offset)
    }

    /// # Safety
    /// `pool` must be the pool this pointer's offset was computed against,
    /// and the pointed-to object must still be live (not freed/retired).
    #[inline]
    pub unsafe fn get<'a>(&self, pool: &impl PoolBase) -> Option<&'a T> {
        if self.is_null() {
            None
        } else {
            Some(&*pool.base_ptr().add(self.offset as usize).cast::<T>())
        }
    }

    /// # Safety
    /// Same as [`RelPtr::get`], plus: no other live reference (shared or
    /// exclusive) to the pointee may exist.
    #[inline]
    pub unsafe fn get_mut<'a>(&self, pool: &impl PoolBase) -> Option<&'a mut T> {
        if self.is_null() {
            None
        } else {
            Some(&mut *pool.base_ptr().add(self.offset as usize).cast::<T>())
        }
    }
}

impl<T> Clone for RelPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for RelPtr<T> {}

impl<T> PartialEq for RelPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}
impl<T> Eq for RelPtr<T> {}

impl<T> fmt::Debug for RelPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelPtr(0x{:x})", self.offset)
    }
}

impl<T> Default for RelPtr<T> {
    fn default() -> Self {
        Self::NULL
    }
}

/// An atomically-accessed [`RelPtr<T>`].
pub struct AtomicRelPtr<T> {
    offset: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicRelPtr<T> {
    pub fn new(ptr: RelPtr<T>) -> Self {
        Self {
            offset: AtomicU64::new(ptr.raw_offset()),
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(RelPtr::NULL)
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> RelPtr<T> {
        RelPtr::from_raw_offset(self.offset.load(order))
    }

    #[inline]
    pub fn store(&self, ptr: RelPtr<T>, order: Ordering) {
        self.offset.store(ptr.raw_offset(), order);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: RelPtr<T>,
        new: RelPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<RelPtr<T>, RelPtr<T>> {
        self.offset
            .compare_exchange(current.raw_offset(), new.raw_offset(), success, failure)
            .map(RelPtr::from_raw_offset)
            .map_err(RelPtr::from_raw_offset)
    }
}

/// Discriminant carried in the low bit of a [`TaggedRelPtr`]. Named
/// generically; each container gives the two states domain meaning (the
/// radix tree's `ChildRef::{Leaf, Node}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Zero,
    One,
}

impl Tag {
    #[inline]
    fn bit(self) -> u64 {
        match self {
            Tag::Zero => 0,
            Tag::One => 1,
        }
    }

    #[inline]
    fn from_bit(bit: u64) -> Self {
        if bit & 1 == 0 {
            Tag::Zero
        } else {
            Tag::One
        }
    }
}

/// A relative pointer whose low offset bit discriminates between two node
/// kinds. Non-atomic variant, for fields mutated only under an
/// external lock.
pub struct TaggedRelPtr<T> {
    offset: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TaggedRelPtr<T> {
    pub const NULL: Self = Self {
        offset: 0,
        _marker: PhantomData,
    };

    pub fn new(ptr: RelPtr<T>, tag: Tag) -> Self {
        debug_assert_eq!(
            ptr.raw_offset() & 1,
            0,
            "tagged pointer target must be at least 2-byte aligned"
        );
        Self {
            offset: ptr.raw_offset() | tag.bit(),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset & !1 == 0
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        Tag::from_bit(self.offset)
    }

    #[inline]
    pub fn ptr(&self) -> RelPtr<T> {
        RelPtr::from_raw_offset(self.offset & !1)
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            offset: raw,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for TaggedRelPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for TaggedRelPtr<T> {}

impl<T> fmt::Debug for TaggedRelPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaggedRelPtr(0x{:x}, {:?})", self.offset & !1, self.tag())
    }
}

/// Atomic tagged relative pointer — the workhorse of the radix tree
/// (`parent`, `embedded_entry`, `child[16]`, `root`), loaded with acquire
/// and stored with release ordering throughout.
pub struct AtomicTaggedRelPtr<T> {
    offset: AtomicU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicTaggedRelPtr<T> {
    pub fn new(ptr: TaggedRelPtr<T>) -> Self {
        Self {
            offset: AtomicU64::new(ptr.raw()),
            _marker: PhantomData,
        }
    }

    pub fn null() -> Self {
        Self::new(TaggedRelPtr::NULL)
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> TaggedRelPtr<T> {
        TaggedRelPtr::from_raw(self.offset.load(order))
    }

    #[inline]
    pub fn store(&self, ptr: TaggedRelPtr<T>, order: Ordering) {
        self.offset.store(ptr.raw(), order);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: TaggedRelPtr<T>,
        new: TaggedRelPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedRelPtr<T>, TaggedRelPtr<T>> {
        self.offset
            .compare_exchange(current.raw(), new.raw(), success, failure)
            .map(TaggedRelPtr::from_raw)
            .map_err(TaggedRelPtr::from_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(*mut u8);
    impl PoolBase for Dummy {
        fn base_ptr(&self) -> *mut u8 {
            self.0
        }
    }

    #[test]
    fn null_relptr_is_default() {
        let p: RelPtr<u64> = RelPtr::default();
        assert!(p.is_null());
    }

    #[test]
    fn tagged_roundtrip() {
        let raw = RelPtr::<u64>::from_raw_offset(256);
        let tagged = TaggedRelPtr::new(raw, Tag::One);
        assert_eq!(tagged.tag(), Tag::One);
        assert_eq!(tagged.ptr(), raw);
        assert!(!tagged.is_null());
    }

    #[test]
    fn tagged_null_has_either_tag() {
        let t = TaggedRelPtr::<u64>::new(RelPtr::NULL, Tag::Zero);
        assert!(t.is_null());
        let t = TaggedRelPtr::<u64>::new(RelPtr::NULL, Tag::One);
        assert!(t.is_null());
    }
}
