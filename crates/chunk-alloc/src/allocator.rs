use core::{error::Error, fmt, mem, ptr::NonNull};

use indexed_heap::Heap;
use mman_sys::{Errno, PAGE_SIZE};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use snafu_utils::{ErrorLocation, Location};

use crate::{
    chunk::{self, ChunkRef, ChunkView, HEADER_SIZE},
    list::{ByAddress, BySize, ChunkList},
    page::{self, PageProvider},
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum AllocError {
    #[snafu(display("request for {size} bytes overflows the address space"))]
    SizeOverflow {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to map {pages} pages"))]
    MapPages {
        pages: usize,
        #[snafu(source)]
        source: Errno,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ErrorLocation for AllocError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::SizeOverflow { location, .. } | Self::MapPages { location, .. } => {
                Some(*location)
            }
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ReleaseError {
    #[snafu(display("address {addr:#x} is not an allocated block"))]
    NotAllocated {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ErrorLocation for ReleaseError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::NotAllocated { location, .. } => Some(*location),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ResizeError {
    #[snafu(display("address {addr:#x} is not an allocated block"))]
    NotAllocated {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate the resized block"))]
    Allocate {
        #[snafu(source)]
        source: AllocError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl ErrorLocation for ResizeError {
    fn location(&self) -> Option<Location> {
        match self {
            Self::NotAllocated { location, .. } | Self::Allocate { location, .. } => {
                Some(*location)
            }
        }
    }
}

/// Locates the allocator's own errors in an error chain, falling back to
/// [`locate_generic`](snafu_utils::locate_generic).
///
/// Pass it to [`Report::with_locator`](snafu_utils::Report::with_locator) so
/// every nested allocator error is reported with its location.
#[must_use]
pub fn locate_error(error: &(dyn Error + 'static)) -> Option<Location> {
    if let Some(e) = error.downcast_ref::<AllocError>() {
        return e.location();
    }
    if let Some(e) = error.downcast_ref::<ReleaseError>() {
        return e.location();
    }
    if let Some(e) = error.downcast_ref::<ResizeError>() {
        return e.location();
    }
    snafu_utils::locate_generic(error)
}

/// Best-fit chunk allocator over pages obtained from a [`PageProvider`].
///
/// Every chunk the allocator knows about is linked into exactly one of two
/// lists, both kept in size order:
///
/// - the free list, whose chunks are coalesced after every release so that no
///   two of them are adjacent in memory
/// - the allocated list, whose chunks are currently handed out
///
/// Together the chunks of both lists cover every page ever mapped, without
/// overlap. Pages are never returned to the provider.
///
/// The allocator is not reentrant and not `Sync`. Wrap it in
/// [`LockedChunkAllocator`](crate::LockedChunkAllocator) to share it.
pub struct ChunkAllocator<P> {
    free: ChunkList<BySize>,
    allocated: ChunkList<BySize>,
    provider: P,
}

// The lists only point into memory owned by the allocator itself.
unsafe impl<P> Send for ChunkAllocator<P> where P: Send {}

impl<P> ChunkAllocator<P> {
    /// Creates an allocator that owns no memory yet.
    pub const fn new(provider: P) -> Self {
        Self {
            free: ChunkList::new(),
            allocated: ChunkList::new(),
            provider,
        }
    }

    /// Returns the page provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Iterates over the free chunks.
    pub fn free_chunks(&self) -> impl ExactSizeIterator<Item = ChunkView<'_>> {
        self.free.iter()
    }

    /// Iterates over the chunks currently handed out.
    pub fn allocated_chunks(&self) -> impl ExactSizeIterator<Item = ChunkView<'_>> {
        self.allocated.iter()
    }
}

impl<P> ChunkAllocator<P>
where
    P: PageProvider,
{
    /// Allocates `size` zeroed bytes aligned to [`WORD_SIZE`](crate::WORD_SIZE).
    ///
    /// Returns `Ok(None)` if `size` is zero. The smallest free chunk that fits
    /// is used; if there is none, fresh pages are mapped.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        let needed = chunk::needed_size(size).context(alloc_error::SizeOverflowSnafu { size })?;
        self.allocate_chunk(size, needed).map(Some)
    }

    /// Returns the block at `ptr` to the allocator.
    ///
    /// `None` is ignored. An address that is not currently allocated is
    /// reported as [`ReleaseError::NotAllocated`] and leaves the allocator
    /// untouched.
    pub fn release(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), ReleaseError> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        let Some(chunk) = self.take_allocated(ptr) else {
            warn!("release of unknown address {ptr:p}");
            return release_error::NotAllocatedSnafu {
                addr: ptr.addr().get(),
            }
            .fail();
        };
        self.free_chunk(chunk);
        Ok(())
    }

    /// Resizes the block at `ptr` to hold at least `new_size` bytes.
    ///
    /// The block is grown in place by absorbing the free chunk that follows
    /// it, if that is enough. Otherwise a new block is allocated, the old
    /// contents are copied over and the old block is released. Bytes beyond
    /// the old size are zero either way.
    ///
    /// Shrinking keeps the block and its address unchanged.
    ///
    /// If no new block can be allocated, the old block is left intact and an
    /// error is returned. `None` is ignored and yields `Ok(None)`.
    pub fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, ResizeError> {
        let Some(ptr) = ptr else {
            return Ok(None);
        };
        let Some(mut chunk) = self.take_allocated(ptr) else {
            warn!("resize of unknown address {ptr:p}");
            return resize_error::NotAllocatedSnafu {
                addr: ptr.addr().get(),
            }
            .fail();
        };

        let needed = match chunk::needed_size(new_size)
            .context(alloc_error::SizeOverflowSnafu { size: new_size })
        {
            Ok(needed) => needed,
            Err(e) => {
                Heap::new(&mut self.allocated).push(chunk);
                return Err(e).context(resize_error::AllocateSnafu);
            }
        };

        if chunk.total_size() >= needed || self.grow_in_place(&mut chunk, needed) {
            Heap::new(&mut self.allocated).push(chunk);
            return Ok(Some(ptr));
        }

        let new_ptr = match self.allocate_chunk(new_size, needed) {
            Ok(new_ptr) => new_ptr,
            Err(e) => {
                Heap::new(&mut self.allocated).push(chunk);
                return Err(e).context(resize_error::AllocateSnafu);
            }
        };
        let len = chunk.user_size().min(needed - HEADER_SIZE);
        debug!(
            "moving {len} bytes from {:p} to {new_ptr:p}",
            chunk.user_ptr()
        );
        unsafe {
            core::ptr::copy_nonoverlapping(chunk.user_ptr().as_ptr(), new_ptr.as_ptr(), len);
        }
        self.free_chunk(chunk);
        Ok(Some(new_ptr))
    }

    fn allocate_chunk(&mut self, size: usize, needed: usize) -> Result<NonNull<u8>, AllocError> {
        let mut chunk = match take_first(&mut self.free, |c| c.total_size() >= needed) {
            Some(chunk) => chunk,
            None => self.map_fresh(size, needed)?,
        };
        if let Some(tail) = chunk.split(needed) {
            trace!("split {chunk:?} leaving {tail:?}");
            Heap::new(&mut self.free).push(tail);
        }
        chunk.zero_user();
        let ptr = chunk.user_ptr();
        Heap::new(&mut self.allocated).push(chunk);
        Ok(ptr)
    }

    fn map_fresh(&mut self, size: usize, needed: usize) -> Result<ChunkRef, AllocError> {
        let pages = needed
            .checked_next_multiple_of(PAGE_SIZE)
            .context(alloc_error::SizeOverflowSnafu { size })?
            / PAGE_SIZE;
        page::map_chunk(&mut self.provider, pages)
            .inspect_err(|e| debug!("mapping {pages} pages failed: {e}"))
            .context(alloc_error::MapPagesSnafu { pages })
    }

    /// Absorbs the free chunks that follow `chunk` until it holds `needed`
    /// bytes.
    ///
    /// On failure every absorbed byte is handed back to the free list and
    /// `chunk` is left as it was.
    fn grow_in_place(&mut self, chunk: &mut ChunkRef, needed: usize) -> bool {
        let old_size = chunk.total_size();
        while chunk.total_size() < needed {
            let end = chunk.end();
            let Some(donor) = take_first(&mut self.free, |c| c.addr() == end) else {
                break;
            };
            chunk.absorb(donor);
        }

        if chunk.total_size() < needed {
            if chunk.total_size() > old_size {
                let donors = chunk.split_off(old_size);
                Heap::new(&mut self.free).push(donors);
            }
            return false;
        }

        trace!("grew {chunk:?} in place from {old_size} bytes");
        if let Some(tail) = chunk.split(needed) {
            Heap::new(&mut self.free).push(tail);
        }
        chunk.zero_from(old_size);
        true
    }

    fn take_allocated(&mut self, ptr: NonNull<u8>) -> Option<ChunkRef> {
        let addr = chunk::chunk_addr_of(ptr);
        take_first(&mut self.allocated, |c| c.addr() == addr)
    }

    fn free_chunk(&mut self, chunk: ChunkRef) {
        Heap::new(&mut self.free).push(chunk);
        self.coalesce();
    }

    /// Merges every run of adjacent free chunks into one chunk.
    fn coalesce(&mut self) {
        let mut by_addr = mem::take(&mut self.free).into_order::<ByAddress>();
        let mut pending = Heap::from_unordered(&mut by_addr);
        let mut free = Heap::new(&mut self.free);

        let mut last: Option<ChunkRef> = None;
        while let Some(chunk) = pending.pop() {
            if let Some(prev) = last.as_mut()
                && prev.is_followed_by(&chunk)
            {
                trace!("merging {chunk:?} into {prev:?}");
                prev.absorb(chunk);
                continue;
            }
            if let Some(prev) = last.replace(chunk) {
                free.push(prev);
            }
        }
        if let Some(prev) = last {
            free.push(prev);
        }
    }
}

impl<P> fmt::Debug for ChunkAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkAllocator")
            .field("free", &DebugChunks(&self.free))
            .field("allocated", &DebugChunks(&self.allocated))
            .finish_non_exhaustive()
    }
}

struct DebugChunks<'a>(&'a ChunkList<BySize>);

impl fmt::Debug for DebugChunks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// Removes the smallest chunk of `list` satisfying `pred`.
///
/// Chunks are popped in size order. Rejected chunks are parked on a
/// temporary list and pushed back once the search ends.
fn take_first<F>(list: &mut ChunkList<BySize>, mut pred: F) -> Option<ChunkRef>
where
    F: FnMut(ChunkView<'_>) -> bool,
{
    let mut rejected = ChunkList::<BySize>::new();
    let mut heap = Heap::new(list);
    let mut found = None;
    while let Some(chunk) = heap.pop() {
        if pred(chunk.view()) {
            found = Some(chunk);
            break;
        }
        rejected.push_back(chunk);
    }
    while let Some(chunk) = rejected.pop_back() {
        heap.push(chunk);
    }
    found
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::alloc::Layout;

    use snafu_utils::Report;

    use super::*;
    use crate::{WORD_SIZE, page::RegionPages};

    fn with_test_allocator<F>(pages: usize, test_fn: F)
    where
        F: FnOnce(&mut ChunkAllocator<RegionPages>),
    {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe {
            let region = std::alloc::alloc(layout);
            // the allocator must not rely on the provider handing out zeroes
            region.write_bytes(0x11, pages * PAGE_SIZE);
            let provider = RegionPages::new(NonNull::new(region).unwrap(), pages * PAGE_SIZE);
            let mut alloc = ChunkAllocator::new(provider);
            test_fn(&mut alloc);
            check_partition(&alloc);
            std::alloc::dealloc(region, layout);
        }
    }

    fn check_partition(alloc: &ChunkAllocator<RegionPages>) {
        let mut ranges = alloc
            .free_chunks()
            .chain(alloc.allocated_chunks())
            .map(|c| c.range())
            .collect::<Vec<_>>();
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start, "overlap: {pair:x?}");
        }
        let total: usize = ranges.iter().map(ExactSizeIterator::len).sum();
        assert_eq!(total, alloc.provider().mapped_pages() * PAGE_SIZE);

        let mut free = alloc.free_chunks().map(|c| c.range()).collect::<Vec<_>>();
        free.sort_by_key(|r| r.start);
        for pair in free.windows(2) {
            assert_ne!(pair[0].end, pair[1].start, "uncoalesced: {pair:x?}");
        }
    }

    fn free_sizes(alloc: &ChunkAllocator<RegionPages>) -> Vec<usize> {
        let mut sizes = alloc
            .free_chunks()
            .map(|c| c.total_size())
            .collect::<Vec<_>>();
        sizes.sort_unstable();
        sizes
    }

    #[test]
    fn test_first_allocation_maps_and_splits() {
        with_test_allocator(2, |alloc| {
            let ptr = alloc.allocate(100).unwrap().unwrap();
            assert!(ptr.addr().get().is_multiple_of(WORD_SIZE));
            assert_eq!(alloc.provider().mapped_pages(), 1);
            assert_eq!(alloc.allocated_chunks().len(), 1);
            assert_eq!(free_sizes(alloc), [PAGE_SIZE - HEADER_SIZE - 104]);
        });
    }

    #[test]
    fn test_free_list_is_reused() {
        with_test_allocator(2, |alloc| {
            let a = alloc.allocate(64).unwrap();
            alloc.release(a).unwrap();
            assert_eq!(alloc.free_chunks().len(), 1);
            let b = alloc.allocate(64).unwrap();
            assert_eq!(a, b);
            assert_eq!(alloc.provider().mapped_pages(), 1);
        });
    }

    #[test]
    fn test_release_coalesces_both_sides() {
        with_test_allocator(1, |alloc| {
            let a = alloc.allocate(32).unwrap();
            let b = alloc.allocate(32).unwrap();
            let c = alloc.allocate(32).unwrap();
            let _guard = alloc.allocate(32).unwrap();
            alloc.release(a).unwrap();
            alloc.release(c).unwrap();
            assert_eq!(alloc.free_chunks().len(), 3);
            alloc.release(b).unwrap();
            assert_eq!(free_sizes(alloc).len(), 2);
            assert!(free_sizes(alloc).contains(&(3 * (HEADER_SIZE + 32))));
        });
    }

    #[test]
    fn test_take_first_keeps_rejects() {
        with_test_allocator(1, |alloc| {
            let blocks = [16, 48, 32, 64].map(|size| alloc.allocate(size).unwrap());
            let _guard = alloc.allocate(8).unwrap();
            for ptr in blocks {
                alloc.release(ptr).unwrap();
            }
            // blocks were adjacent, so they coalesced into one
            assert_eq!(alloc.free_chunks().len(), 2);

            let before = free_sizes(alloc);
            let taken = take_first(&mut alloc.free, |c| c.total_size() > usize::MAX / 2);
            assert!(taken.is_none());
            assert_eq!(free_sizes(alloc), before);
        });
    }

    #[test]
    fn test_grow_in_place_restores_donor_on_failure() {
        with_test_allocator(1, |alloc| {
            let a = alloc.allocate(64).unwrap();
            let b = alloc.allocate(64).unwrap();
            let c = alloc.allocate(64).unwrap();
            alloc.release(b).unwrap();
            let free_before = free_sizes(alloc);

            let mut chunk = alloc.take_allocated(a.unwrap()).unwrap();
            assert!(!alloc.grow_in_place(&mut chunk, 3 * (HEADER_SIZE + 64)));
            assert_eq!(chunk.total_size(), HEADER_SIZE + 64);
            Heap::new(&mut alloc.allocated).push(chunk);

            assert_eq!(free_sizes(alloc), free_before);
            alloc.release(a).unwrap();
            alloc.release(c).unwrap();
            assert_eq!(free_sizes(alloc), [PAGE_SIZE]);
        });
    }

    #[test]
    fn test_resize_splits_surplus_after_growth() {
        with_test_allocator(1, |alloc| {
            let a = alloc.allocate(64).unwrap();
            let b = alloc.allocate(512).unwrap();
            let _guard = alloc.allocate(8).unwrap();
            alloc.release(b).unwrap();

            let grown = alloc.resize(a, 128).unwrap();
            assert_eq!(grown, a);
            let chunk = alloc
                .allocated_chunks()
                .find(|c| Some(c.user_ptr()) == a)
                .unwrap();
            assert_eq!(chunk.total_size(), HEADER_SIZE + 128);
            assert!(free_sizes(alloc).contains(&(HEADER_SIZE + 512 - 64)));
        });
    }

    #[test]
    fn test_report_locates_nested_errors() {
        with_test_allocator(1, |alloc| {
            let a = alloc.allocate(64).unwrap();
            let err = alloc.resize(a, 2 * PAGE_SIZE).unwrap_err();
            let report = Report::with_locator(err, locate_error).to_string();
            let lines = report.lines().collect::<Vec<_>>();
            assert_eq!(lines[0], "error: failed to allocate the resized block");
            assert!(lines[1].starts_with("  at "), "{report}");
            assert_eq!(lines[4], "   0: failed to map 3 pages");
            assert!(lines[5].starts_with("      at "), "{report}");
            assert!(lines[5].contains("allocator.rs"), "{report}");
            assert_eq!(lines[6], "   1: out of memory");
            assert_eq!(lines.len(), 7, "{report}");
            alloc.release(a).unwrap();
        });
    }

    #[test]
    fn test_debug_lists_chunks() {
        with_test_allocator(1, |alloc| {
            let _a = alloc.allocate(8).unwrap();
            let text = format!("{alloc:?}");
            assert!(text.starts_with("ChunkAllocator { free: [Chunk { addr: 0x"));
            assert!(text.contains(&format!("total_size: {}", HEADER_SIZE + 8)));
        });
    }
}
