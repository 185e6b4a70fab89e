//! Pointer-level allocation on top of [`BuddyTree`].
//!
//! [`BuddyHeap`] binds a tree to the bytes of a [`Region`]. The tree itself
//! is ordinary process-local data behind a lock; only the arena bytes are
//! shared, so other processes can read and write blocks handed to them by
//! offset but never allocate from the same heap concurrently.

use std::alloc::Layout;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::buddy::BuddyTree;
use crate::error::{Error, Result};
use crate::region::Region;
use crate::shm::{AccessMode, SharedObject, SharedRegion};

/// A buddy allocator over a fixed arena.
pub struct BuddyHeap {
    region: Region,
    tree: Mutex<BuddyTree>,
    backing: Option<NamedArena>,
}

/// The named object behind a heap created with [`BuddyHeap::create`].
struct NamedArena {
    _mapping: SharedRegion,
    object: SharedObject,
}

impl Drop for NamedArena {
    fn drop(&mut self) {
        if let Err(err) = self.object.unlink() {
            tracing::warn!(%err, "failed to unlink heap arena");
        }
    }
}

impl BuddyHeap {
    /// Manage the bytes of `region`. Only the largest power-of-two prefix
    /// of the region is used.
    ///
    /// # Safety
    ///
    /// The region must stay valid for the lifetime of the heap, and nothing
    /// else may hand out its bytes.
    pub unsafe fn over_region(region: Region) -> Result<Self> {
        let tree = BuddyTree::for_arena(region.len())?;
        Ok(Self {
            region,
            tree: Mutex::new(tree),
            backing: None,
        })
    }

    /// Create (or open) the named object `name`, map `chunk_size` bytes at
    /// `offset` and manage them. The heap owns the object: dropping it
    /// unmaps the arena and unlinks the name.
    pub fn create(name: &str, offset: usize, chunk_size: usize) -> Result<Self> {
        let object = SharedObject::open(name, AccessMode::ReadWrite)?;
        let total = offset
            .checked_add(chunk_size)
            .ok_or_else(|| Error::precondition("arena end overflows"))?;
        object.allocate(total)?;
        let mapping = object.map(offset, chunk_size, AccessMode::ReadWrite)?;
        let region = mapping.region();
        tracing::debug!(name, offset, chunk_size, "created shared heap");

        // SAFETY: the mapping is kept alive in `backing` for as long as the
        // heap exists.
        let mut heap = unsafe { Self::over_region(region)? };
        heap.backing = Some(NamedArena {
            _mapping: mapping,
            object,
        });
        Ok(heap)
    }

    /// The managed bytes.
    pub fn region(&self) -> Region {
        self.region
    }

    /// Bytes actually available for allocation.
    pub fn arena_len(&self) -> usize {
        self.tree.lock().arena_len()
    }

    /// Whether every block has been returned.
    pub fn is_coalesced(&self) -> bool {
        self.tree.lock().is_coalesced()
    }

    /// Allocate a block that fits `layout`. Blocks are powers of two, so
    /// the size is rounded up and alignment comes for free up to the
    /// alignment of the arena base.
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        if layout.align() > self.region.base_alignment() {
            return Err(Error::precondition(format!(
                "alignment {} exceeds the arena base alignment {}",
                layout.align(),
                self.region.base_alignment()
            )));
        }
        let log2_size = block_log2(layout)?;
        let offset = self.tree.lock().allocate(log2_size)?;
        let ptr = self.region.offset(offset);
        // SAFETY: offsets from the tree are inside the region, whose base is
        // non-null.
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Return a block previously handed out by [`allocate`](Self::allocate).
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let offset = self
            .region
            .offset_of(ptr.as_ptr())
            .ok_or(Error::InvalidFree {
                offset: (ptr.as_ptr() as usize).wrapping_sub(self.region.as_ptr() as usize),
            })?;
        self.tree.lock().deallocate(offset)
    }

    /// Offset of an allocated pointer inside the arena, for handing blocks
    /// to other processes.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.region.offset_of(ptr.as_ptr())
    }
}

impl std::fmt::Debug for BuddyHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyHeap")
            .field("region", &self.region)
            .field("named", &self.backing.is_some())
            .finish()
    }
}

/// `ceil(log2(max(size, align, 1)))`
fn block_log2(layout: Layout) -> Result<u32> {
    let want = layout.size().max(layout.align()).max(1);
    let block = want.checked_next_power_of_two().ok_or(Error::OutOfMemory {
        log2_size: usize::BITS,
    })?;
    Ok(block.trailing_zeros())
}

/// Either the system allocator or a [`BuddyHeap`].
#[derive(Debug, Default)]
pub enum Heap {
    #[default]
    Local,
    Shared(BuddyHeap),
}

impl Heap {
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>> {
        match self {
            Self::Local => {
                let layout = non_zero(layout)?;
                // SAFETY: layout has non-zero size.
                let ptr = unsafe { std::alloc::alloc(layout) };
                NonNull::new(ptr).ok_or(Error::OutOfMemory {
                    log2_size: block_log2(layout)?,
                })
            }
            Self::Shared(heap) => heap.allocate(layout),
        }
    }

    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this heap with
    /// the same `layout`, and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) -> Result<()> {
        match self {
            Self::Local => {
                let layout = non_zero(layout)?;
                // SAFETY: guaranteed by the caller.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                Ok(())
            }
            Self::Shared(heap) => heap.deallocate(ptr),
        }
    }

    /// Uninitialised storage for `count` values of `T`.
    pub fn allocate_array<T>(&self, count: usize) -> Result<NonNull<T>> {
        let layout = array_layout::<T>(count)?;
        Ok(self.allocate(layout)?.cast())
    }

    /// # Safety
    ///
    /// `ptr` must come from [`allocate_array`](Self::allocate_array) on
    /// this heap with the same `count`. Elements are not dropped.
    pub unsafe fn deallocate_array<T>(&self, ptr: NonNull<T>, count: usize) -> Result<()> {
        let layout = array_layout::<T>(count)?;
        // SAFETY: guaranteed by the caller.
        unsafe { self.deallocate(ptr.cast(), layout) }
    }
}

fn non_zero(layout: Layout) -> Result<Layout> {
    Layout::from_size_align(layout.size().max(1), layout.align())
        .map_err(|err| Error::precondition(err.to_string()))
}

fn array_layout<T>(count: usize) -> Result<Layout> {
    Layout::array::<T>(count).map_err(|err| Error::precondition(err.to_string()))
}

#[cfg(feature = "allocator")]
unsafe impl allocator_api2::alloc::Allocator for &BuddyHeap {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, allocator_api2::alloc::AllocError> {
        let ptr = BuddyHeap::allocate(self, layout).map_err(|_| allocator_api2::alloc::AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, layout.size()))
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        if let Err(err) = BuddyHeap::deallocate(self, ptr) {
            tracing::warn!(%err, "buddy heap rejected a deallocation");
        }
    }
}
