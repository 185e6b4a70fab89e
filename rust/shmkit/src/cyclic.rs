use core::mem::MaybeUninit;

/// Fixed-capacity ring of `N` slots for one writer and one reader.
///
/// One slot is always left empty so that a full ring (`(write + 1) % N ==
/// read`) can be told apart from an empty one (`write == read`); the ring
/// therefore holds at most `N - 1` elements.
///
/// The indices are plain integers. The buffer is only safe to use from
/// two sides at once when something else orders the accesses, which is
/// what [`SyncSharedQueue`](crate::SyncSharedQueue) does with its mutex.
/// All-zero bytes are an empty buffer.
#[repr(C)]
pub struct CyclicBuffer<T: Copy, const N: usize> {
    read: u32,
    write: u32,
    slots: [MaybeUninit<T>; N],
}

impl<T: Copy, const N: usize> CyclicBuffer<T, N> {
    const SLOTS_OK: () = assert!(N >= 2 && N <= u32::MAX as usize, "need 2..=u32::MAX slots");

    pub fn new() -> Self {
        let () = Self::SLOTS_OK;
        Self {
            read: 0,
            write: 0,
            slots: [MaybeUninit::uninit(); N],
        }
    }

    /// Write an empty buffer at `ptr` without building it on the stack
    /// first (large `N` would not fit).
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `Self` and suitably aligned.
    pub unsafe fn init_in_place(ptr: *mut Self) {
        let () = Self::SLOTS_OK;
        // SAFETY: guaranteed by the caller; slots may stay uninitialised.
        unsafe {
            core::ptr::addr_of_mut!((*ptr).read).write(0);
            core::ptr::addr_of_mut!((*ptr).write).write(0);
        }
    }

    /// Usable capacity, `N - 1`.
    pub const fn capacity() -> usize {
        N - 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        (self.write as usize + 1) % N == self.read as usize
    }

    pub fn len(&self) -> usize {
        (self.write as usize + N - self.read as usize) % N
    }

    /// Append `value`; `false` (and no change) when full.
    pub fn write(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        let index = self.write as usize;
        self.slots[index] = MaybeUninit::new(value);
        self.write = ((index + 1) % N) as u32;
        true
    }

    /// Take the oldest element; `None` when empty.
    pub fn read(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let index = self.read as usize;
        // SAFETY: every slot between read and write was filled by `write`.
        let value = unsafe { self.slots[index].assume_init() };
        self.read = ((index + 1) % N) as u32;
        Some(value)
    }
}

impl<T: Copy, const N: usize> Default for CyclicBuffer<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const N: usize> core::fmt::Debug for CyclicBuffer<T, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CyclicBuffer")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("slots", &N)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holds_one_less_than_its_slot_count() {
        let mut ring = CyclicBuffer::<u32, 8>::new();
        assert!(ring.is_empty());
        for i in 0..7 {
            assert!(ring.write(i), "write {} rejected", i);
        }
        assert!(ring.is_full());
        assert!(!ring.write(99));
        assert_eq!(ring.len(), 7);
        assert_eq!(CyclicBuffer::<u32, 8>::capacity(), 7);
    }

    #[test]
    fn preserves_order_across_the_wrap() {
        let mut ring = CyclicBuffer::<u64, 4>::new();
        let mut next_in = 0u64;
        let mut next_out = 0u64;
        for _ in 0..10 {
            while ring.write(next_in) {
                next_in += 1;
            }
            while let Some(v) = ring.read() {
                assert_eq!(v, next_out);
                next_out += 1;
            }
            assert!(ring.is_empty());
        }
        assert_eq!(next_in, 30);
        assert_eq!(next_out, 30);
    }

    #[test]
    fn empty_only_after_draining() {
        let mut ring = CyclicBuffer::<u8, 3>::new();
        assert!(ring.write(1));
        assert!(!ring.is_empty());
        assert_eq!(ring.read(), Some(1));
        assert!(ring.is_empty());
        assert_eq!(ring.read(), None);
    }

    #[test]
    fn init_in_place_yields_an_empty_ring() {
        let mut slot = MaybeUninit::<CyclicBuffer<u16, 16>>::uninit();
        unsafe {
            CyclicBuffer::init_in_place(slot.as_mut_ptr());
            let ring = slot.assume_init_mut();
            assert!(ring.is_empty());
            assert!(ring.write(7));
            assert_eq!(ring.read(), Some(7));
        }
    }
}
