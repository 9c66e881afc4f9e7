//! Skip list node: a fixed-size header, a per-level forward-pointer array
//! sized to the node's own height, then the key's raw bytes — the same
//! header-plus-trailing-bytes layout the radix leaf uses, extended with a
//! variable-length middle section instead of a single trailing run.

use crate::relptr::AtomicRelPtr;

/// Upper bound on a node's height, matching the example library's
/// `NUM_LEVELS` skip list constant.
pub const MAX_LEVEL: usize = 32;

#[repr(C)]
pub struct SkipNode<V> {
    pub height: u8,
    pub key_len: u32,
    pub value: V,
}

impl<V> SkipNode<V> {
    fn forward_offset() -> usize {
        let base = std::mem::size_of::<Self>();
        let align = std::mem::align_of::<AtomicRelPtr<Self>>();
        (base + align - 1) & !(align - 1)
    }

    fn key_offset(height: usize) -> usize {
        Self::forward_offset() + height * std::mem::size_of::<AtomicRelPtr<Self>>()
    }

    pub fn alloc_size(height: usize, key_len: usize) -> usize {
        Self::key_offset(height) + key_len
    }

    pub fn align() -> usize {
        std::mem::align_of::<Self>().max(std::mem::align_of::<AtomicRelPtr<Self>>())
    }

    /// Write a new node (header + forward array + key bytes) into freshly
    /// allocated memory at `ptr`. `ptr` must point to at least
    /// `alloc_size(height, key.len())` bytes, all owned exclusively.
    ///
    /// # Safety
    /// `ptr` must be valid, suitably aligned, and exclusively owned.
    pub unsafe fn init(ptr: *mut Self, height: u8, key: &[u8], value: V) {
        ptr.write(SkipNode {
            height,
            key_len: key.len() as u32,
            value,
        });
        let base = ptr as *mut u8;
        let forward = base.add(Self::forward_offset()) as *mut AtomicRelPtr<Self>;
        for level in 0..height as usize {
            forward.add(level).write(AtomicRelPtr::null());
        }
        let key_dst = base.add(Self::key_offset(height as usize));
        std::ptr::copy_nonoverlapping(key.as_ptr(), key_dst, key.len());
    }

    pub fn height(&self) -> usize {
        self.height as usize
    }

    /// Borrow the forward pointer at `level`. `level` must be `< height()`.
    pub fn forward(&self, level: usize) -> &AtomicRelPtr<Self> {
        debug_assert!(level < self.height as usize, "level out of range for this node's height");
        unsafe {
            let base = self as *const Self as *const u8;
            let forward = base.add(Self::forward_offset()) as *const AtomicRelPtr<Self>;
            &*forward.add(level)
        }
    }

    /// Borrow this node's key bytes. Valid as long as `&self` is.
    pub fn key(&self) -> &[u8] {
        unsafe {
            let base = self as *const Self as *const u8;
            let key_ptr = base.add(Self::key_offset(self.height as usize));
            std::slice::from_raw_parts(key_ptr, self.key_len as usize)
        }
    }
}
