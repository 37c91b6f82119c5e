//! `malloc`-family entry points backed by a process-wide allocator.
//!
//! Enabled by the `c-abi` feature. The exported symbols replace the C
//! library's, so a program linking this crate must not also use another
//! allocator through them.

use core::{ffi::c_void, ptr};

use crate::{
    global::LockedChunkAllocator,
    page::{PageProvider, SystemPages},
};

static ALLOCATOR: LockedChunkAllocator<SystemPages> = LockedChunkAllocator::new(SystemPages);

fn malloc_in<P>(allocator: &LockedChunkAllocator<P>, size: usize) -> *mut c_void
where
    P: PageProvider,
{
    allocator.allocate_raw(size).cast()
}

fn calloc_in<P>(allocator: &LockedChunkAllocator<P>, count: usize, size: usize) -> *mut c_void
where
    P: PageProvider,
{
    let Some(total) = count.checked_mul(size) else {
        debug!("calloc of {count} x {size} bytes overflows");
        return ptr::null_mut();
    };
    malloc_in(allocator, total)
}

fn realloc_in<P>(allocator: &LockedChunkAllocator<P>, ptr: *mut c_void, size: usize) -> *mut c_void
where
    P: PageProvider,
{
    if ptr.is_null() {
        return malloc_in(allocator, size);
    }
    allocator.resize_raw(ptr.cast(), size).cast()
}

fn free_in<P>(allocator: &LockedChunkAllocator<P>, ptr: *mut c_void)
where
    P: PageProvider,
{
    allocator.release_raw(ptr.cast());
}

/// Allocates `size` zeroed bytes. Returns null on failure or if `size` is
/// zero.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn malloc(size: usize) -> *mut c_void {
    malloc_in(&ALLOCATOR, size)
}

/// Allocates an array of `count` elements of `size` bytes each. Returns null
/// if the total size overflows.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    calloc_in(&ALLOCATOR, count, size)
}

/// Resizes the block at `ptr`. A null `ptr` behaves like [`malloc`].
///
/// Returns null and leaves the block untouched if no memory is left.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this module and not yet freed.
///
/// # Panics
///
/// Panics if `ptr` is not an allocated block.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    realloc_in(&ALLOCATOR, ptr, size)
}

/// Releases the block at `ptr`. A null `ptr` is ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this module and not yet freed.
///
/// # Panics
///
/// Panics if `ptr` is not an allocated block.
#[cfg_attr(not(test), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    free_in(&ALLOCATOR, ptr);
}
