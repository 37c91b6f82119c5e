//! Sources of page-granular memory.
//!
//! The allocator never touches the operating system directly. It asks a
//! [`PageProvider`] for runs of whole pages and carves chunks out of them.
//!
//! - [`SystemPages`] maps anonymous memory with `mmap`.
//! - [`RegionPages`] hands out pages from a fixed region supplied by the
//!   caller, for environments without virtual memory and for tests.

use core::ptr::NonNull;

use mman_sys::{Errno, PAGE_SIZE, Protection};

use crate::chunk::ChunkRef;

/// A source of zero or more contiguous pages.
///
/// # Safety
///
/// Implementors must guarantee that every run returned by
/// [`map_pages`](Self::map_pages) is `count * PAGE_SIZE` bytes long, aligned to
/// [`PAGE_SIZE`], valid for reads and writes, and disjoint from every other
/// run still mapped.
pub unsafe trait PageProvider {
    /// Maps `count` contiguous pages.
    fn map_pages(&mut self, count: usize) -> Result<NonNull<u8>, Errno>;

    /// Returns `count` pages starting at `addr` to the provider.
    ///
    /// # Safety
    ///
    /// `addr` and `count` must describe a run obtained from this provider
    /// that is no longer referenced.
    unsafe fn unmap_pages(&mut self, addr: NonNull<u8>, count: usize) -> Result<(), Errno>;
}

unsafe impl<P> PageProvider for &mut P
where
    P: PageProvider + ?Sized,
{
    fn map_pages(&mut self, count: usize) -> Result<NonNull<u8>, Errno> {
        (**self).map_pages(count)
    }

    unsafe fn unmap_pages(&mut self, addr: NonNull<u8>, count: usize) -> Result<(), Errno> {
        unsafe { (**self).unmap_pages(addr, count) }
    }
}

/// Pages mapped from the operating system with anonymous `mmap`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPages;

unsafe impl PageProvider for SystemPages {
    fn map_pages(&mut self, count: usize) -> Result<NonNull<u8>, Errno> {
        let len = count.checked_mul(PAGE_SIZE).ok_or(Errno::ENOMEM)?;
        mman_sys::map_anonymous(len, Protection::RW)
    }

    unsafe fn unmap_pages(&mut self, addr: NonNull<u8>, count: usize) -> Result<(), Errno> {
        let len = count.checked_mul(PAGE_SIZE).ok_or(Errno::EINVAL)?;
        unsafe { mman_sys::munmap(addr.as_ptr(), len) }
    }
}

/// Pages carved out of a caller-supplied region.
///
/// Pages are handed out front to back. Only the most recently mapped run can
/// be returned; anything else fails with [`Errno::EINVAL`].
#[derive(Debug)]
pub struct RegionPages {
    start: NonNull<u8>,
    pages: usize,
    used: usize,
}

unsafe impl Send for RegionPages {}

impl RegionPages {
    /// Creates a provider over `len` bytes starting at `start`.
    ///
    /// The start is rounded up to a page boundary and any trailing partial
    /// page is ignored.
    ///
    /// # Safety
    ///
    /// `start..start + len` must be valid for reads and writes and must not be
    /// used by anything else while the provider, or any chunk carved from it,
    /// is alive.
    #[must_use]
    pub unsafe fn new(start: NonNull<u8>, len: usize) -> Self {
        let offset = start.align_offset(PAGE_SIZE);
        let pages = len.saturating_sub(offset) / PAGE_SIZE;
        let start = if pages == 0 {
            start
        } else {
            unsafe { start.add(offset) }
        };
        Self {
            start,
            pages,
            used: 0,
        }
    }

    /// Number of pages handed out so far.
    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        self.used
    }

    /// Total number of pages in the region.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pages
    }
}

unsafe impl PageProvider for RegionPages {
    fn map_pages(&mut self, count: usize) -> Result<NonNull<u8>, Errno> {
        if count == 0 {
            return Err(Errno::EINVAL);
        }
        if count > self.pages - self.used {
            return Err(Errno::ENOMEM);
        }
        let addr = unsafe { self.start.add(self.used * PAGE_SIZE) };
        self.used += count;
        Ok(addr)
    }

    unsafe fn unmap_pages(&mut self, addr: NonNull<u8>, count: usize) -> Result<(), Errno> {
        let Some(first) = self.used.checked_sub(count) else {
            return Err(Errno::EINVAL);
        };
        if addr != unsafe { self.start.add(first * PAGE_SIZE) } {
            return Err(Errno::EINVAL);
        }
        self.used = first;
        Ok(())
    }
}

/// Maps `pages` pages from `provider` and turns them into one free chunk.
pub(crate) fn map_chunk<P>(provider: &mut P, pages: usize) -> Result<ChunkRef, Errno>
where
    P: PageProvider + ?Sized,
{
    let len = pages.checked_mul(PAGE_SIZE).ok_or(Errno::ENOMEM)?;
    let addr = provider.map_pages(pages)?;
    trace!("mapped {pages} pages at {addr:p}");
    Ok(unsafe { ChunkRef::init(addr, len) })
}
