//! Byte regions addressed by offset.
//!
//! Every structure that lives in shared memory is reached through a
//! [`Region`]: a base pointer plus a length. Callers hand around offsets, and
//! only the accessors here turn an offset into a pointer or a typed reference,
//! after checking bounds and alignment.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

/// Alignment of [`HeapRegion`] allocations.
pub const HEAP_REGION_ALIGN: usize = 4096;

/// A view of `len` bytes starting at `base`.
///
/// A `Region` does not own its bytes. Whoever created it (a mapping, a
/// [`HeapRegion`], a caller-provided buffer) must keep them alive while any
/// copy of the view is in use.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// SAFETY: a Region is just an address range; synchronisation of what lives
// inside it is the job of the structures placed there.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap `len` bytes at `base`.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes for as long as
    /// this view (or any copy of it) is used.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Pointer to the byte at `offset`. `offset == len` is allowed (one past
    /// the end).
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(
            offset <= self.len,
            "offset {} out of bounds for region of {} bytes",
            offset,
            self.len
        );
        // SAFETY: offset is within the region (or one past its end).
        unsafe { self.base.add(offset) }
    }

    /// Whether a `T` fits at `offset` with correct alignment.
    pub fn fits<T>(&self, offset: usize) -> bool {
        let Some(end) = offset.checked_add(size_of::<T>()) else {
            return false;
        };
        end <= self.len && (self.base as usize + offset).is_multiple_of(align_of::<T>())
    }

    /// Reference to the `T` stored at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid `T`, and no `&mut` to them may
    /// be live.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        assert!(self.fits::<T>(offset), "misplaced access at offset {}", offset);
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Mutable reference to the `T` stored at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid `T`, and the caller must have
    /// exclusive access to them for the lifetime of the reference.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut<T>(&self, offset: usize) -> &mut T {
        assert!(self.fits::<T>(offset), "misplaced access at offset {}", offset);
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }

    /// The `len` bytes starting at `offset`, as their own region.
    pub fn sub_region(&self, offset: usize, len: usize) -> Option<Region> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Region {
            // SAFETY: offset is in bounds.
            base: unsafe { self.base.add(offset) },
            len,
        })
    }

    /// Offset of `ptr` within this region, if it points inside it.
    pub fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let addr = ptr as usize;
        let base = self.base as usize;
        if addr < base || addr >= base + self.len {
            return None;
        }
        Some(addr - base)
    }

    /// Largest power of two the base address is aligned to.
    pub fn base_alignment(&self) -> usize {
        let addr = self.base as usize;
        if addr == 0 {
            return usize::MAX;
        }
        1 << addr.trailing_zeros()
    }
}

/// Zeroed, page-aligned, process-local memory exposed as a [`Region`].
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Allocate `len` zeroed bytes.
    pub fn new_zeroed(len: usize) -> Self {
        let Ok(layout) = Layout::from_size_align(len.max(1), HEAP_REGION_ALIGN) else {
            panic!("region length {} overflows a Layout", len);
        };
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    /// View of the whole allocation.
    pub fn region(&self) -> Region {
        Region {
            base: self.ptr.as_ptr(),
            len: self.layout.size(),
        }
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
