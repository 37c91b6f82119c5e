use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};

use crate::{
    allocator::{ChunkAllocator, ReleaseError, ResizeError},
    chunk::WORD_SIZE,
    page::PageProvider,
};

/// A [`ChunkAllocator`] behind a spin lock, usable as `#[global_allocator]`.
///
/// Layouts aligned to more than [`WORD_SIZE`] are refused with a null
/// pointer.
///
/// The lock is not reentrant. Anything that allocates while the lock is held,
/// such as a logger that formats into a heap buffer, deadlocks.
pub struct LockedChunkAllocator<P> {
    inner: Mutex<ChunkAllocator<P>>,
}

impl<P> LockedChunkAllocator<P> {
    /// Creates a locked allocator that maps pages from `provider` on demand.
    pub const fn new(provider: P) -> Self {
        Self {
            inner: Mutex::new(ChunkAllocator::new(provider)),
        }
    }

    /// Locks the allocator for direct use.
    pub fn lock(&self) -> MutexGuard<'_, ChunkAllocator<P>> {
        self.inner.lock()
    }
}

impl<P> LockedChunkAllocator<P>
where
    P: PageProvider,
{
    /// Allocates `size` bytes, returning null on failure or if `size` is zero.
    pub(crate) fn allocate_raw(&self, size: usize) -> *mut u8 {
        into_raw(self.lock().allocate(size).ok().flatten())
    }

    /// Releases the block at `ptr`. Null is ignored.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not an allocated block.
    pub(crate) fn release_raw(&self, ptr: *mut u8) {
        let res = self.lock().release(NonNull::new(ptr));
        if let Err(ReleaseError::NotAllocated { addr, .. }) = res {
            panic!("deallocating {addr:#x}, which is not allocated");
        }
    }

    /// Resizes the block at `ptr`, returning null if no memory is left.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is not an allocated block.
    pub(crate) fn resize_raw(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let res = self.lock().resize(NonNull::new(ptr), new_size);
        match res {
            Ok(ptr) => into_raw(ptr),
            Err(ResizeError::NotAllocated { addr, .. }) => {
                panic!("reallocating {addr:#x}, which is not allocated");
            }
            Err(ResizeError::Allocate { .. }) => ptr::null_mut(),
        }
    }
}

fn into_raw(ptr: Option<NonNull<u8>>) -> *mut u8 {
    ptr.map_or(ptr::null_mut(), NonNull::as_ptr)
}

fn fits_word(layout: Layout) -> bool {
    if layout.align() > WORD_SIZE {
        debug!("refusing over-aligned layout {layout:?}");
        return false;
    }
    true
}

unsafe impl<P> GlobalAlloc for LockedChunkAllocator<P>
where
    P: PageProvider + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !fits_word(layout) {
            return ptr::null_mut();
        }
        self.allocate_raw(layout.size())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        // allocate already zeroes the user region
        unsafe { self.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release_raw(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if !fits_word(layout) {
            return ptr::null_mut();
        }
        self.resize_raw(ptr, new_size)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use mman_sys::PAGE_SIZE;

    use super::*;
    use crate::page::RegionPages;

    fn with_test_global<F>(pages: usize, test_fn: F)
    where
        F: FnOnce(&LockedChunkAllocator<RegionPages>),
    {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe {
            let region = std::alloc::alloc(layout);
            let provider = RegionPages::new(NonNull::new(region).unwrap(), pages * PAGE_SIZE);
            let global = LockedChunkAllocator::new(provider);
            test_fn(&global);
            std::alloc::dealloc(region, layout);
        }
    }

    #[test]
    fn test_alloc_dealloc() {
        with_test_global(2, |global| unsafe {
            let layout = Layout::from_size_align(100, 8).unwrap();
            let ptr = global.alloc(layout);
            assert!(!ptr.is_null());
            assert!(ptr.addr().is_multiple_of(WORD_SIZE));
            ptr.write_bytes(0xcd, 100);
            global.dealloc(ptr, layout);
            assert_eq!(global.lock().allocated_chunks().len(), 0);
        });
    }

    #[test]
    fn test_alloc_zeroed_after_reuse() {
        with_test_global(1, |global| unsafe {
            let layout = Layout::from_size_align(256, 8).unwrap();
            let ptr = global.alloc(layout);
            ptr.write_bytes(0xff, 256);
            global.dealloc(ptr, layout);

            let ptr = global.alloc_zeroed(layout);
            let bytes = core::slice::from_raw_parts(ptr, 256);
            assert!(bytes.iter().all(|&b| b == 0));
        });
    }

    #[test]
    fn test_over_aligned_layout_is_refused() {
        with_test_global(1, |global| unsafe {
            let layout = Layout::from_size_align(64, 16).unwrap();
            assert!(global.alloc(layout).is_null());
            assert_eq!(global.lock().provider().mapped_pages(), 0);
        });
    }

    #[test]
    fn test_zero_size_and_exhaustion_return_null() {
        with_test_global(1, |global| unsafe {
            let empty = Layout::from_size_align(0, 1).unwrap();
            assert!(global.alloc(empty).is_null());
            let huge = Layout::from_size_align(2 * PAGE_SIZE, 8).unwrap();
            assert!(global.alloc(huge).is_null());
        });
    }

    #[test]
    fn test_realloc_keeps_contents() {
        with_test_global(2, |global| unsafe {
            let layout = Layout::from_size_align(16, 8).unwrap();
            let ptr = global.alloc(layout);
            ptr.copy_from_nonoverlapping(b"0123456789abcdef".as_ptr(), 16);
            let _blocker = global.alloc(layout);

            let moved = global.realloc(ptr, layout, 1024);
            assert!(!moved.is_null());
            assert_ne!(moved, ptr);
            assert_eq!(core::slice::from_raw_parts(moved, 16), b"0123456789abcdef");
            let tail = core::slice::from_raw_parts(moved.add(16), 1008);
            assert!(tail.iter().all(|&b| b == 0));
        });
    }

    #[test]
    #[should_panic(expected = "which is not allocated")]
    fn test_dealloc_unknown_address_panics() {
        with_test_global(1, |global| unsafe {
            let layout = Layout::from_size_align(8, 8).unwrap();
            let ptr = global.alloc(layout);
            global.dealloc(ptr, layout);
            global.dealloc(ptr, layout);
        });
    }

    #[test]
    #[should_panic(expected = "which is not allocated")]
    fn test_realloc_released_address_panics() {
        with_test_global(1, |global| unsafe {
            let layout = Layout::from_size_align(8, 8).unwrap();
            let ptr = global.alloc(layout);
            global.dealloc(ptr, layout);
            global.realloc(ptr, layout, 64);
        });
    }

    #[test]
    fn test_realloc_exhaustion_keeps_block() {
        with_test_global(1, |global| unsafe {
            let layout = Layout::from_size_align(16, 8).unwrap();
            let ptr = global.alloc(layout);
            ptr.write_bytes(0x5a, 16);

            assert!(global.realloc(ptr, layout, 2 * PAGE_SIZE).is_null());
            assert_eq!(global.lock().allocated_chunks().len(), 1);
            let kept = core::slice::from_raw_parts(ptr, 16);
            assert!(kept.iter().all(|&b| b == 0x5a));
            global.dealloc(ptr, layout);
        });
    }
}
