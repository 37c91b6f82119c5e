//! In-band chunk headers.
//!
//! Every region tracked by the allocator starts with a [`Chunk`] header. The
//! header records the size of the whole region and the links of whichever
//! chunk list currently owns it. The bytes after the header are handed out to
//! callers.
//!
//! ```text
//! Chunk layout:
//! ┌─────────────────────────────────────────────┬──────────────────────┐
//! │ Chunk header (HEADER_SIZE bytes)            │ User region          │
//! │ ┌───────────────────┬───────────┬─────────┐ │                      │
//! │ │ total_size: usize │ next: ptr │ prev:ptr│ │                      │
//! │ └───────────────────┴───────────┴─────────┘ │                      │
//! └─────────────────────────────────────────────┴──────────────────────┘
//! ^ chunk address                               ^ user address
//! <──────────────────────── total_size ─────────────────────────────────>
//! ```
//!
//! Ownership of a chunk is expressed by [`ChunkRef`], a handle that cannot be
//! cloned. A chunk is owned either by exactly one list or by exactly one
//! handle. Read-only inspection goes through [`ChunkView`].

use core::{fmt, marker::PhantomData, ptr::NonNull};

/// Alignment of every chunk and every user address, in bytes.
pub const WORD_SIZE: usize = 8;

/// Size of the chunk header, rounded up to [`WORD_SIZE`].
pub const HEADER_SIZE: usize = size_of::<Chunk>().next_multiple_of(WORD_SIZE);

const _: () = assert!(align_of::<Chunk>() <= WORD_SIZE);
const _: () = assert!(HEADER_SIZE.is_multiple_of(WORD_SIZE));

/// Minimum surplus a chunk must exceed before it is split.
///
/// The split-off tail has to hold a header and at least one word.
const SPLIT_THRESHOLD: usize = HEADER_SIZE + WORD_SIZE;

/// Chunk header stored at the beginning of every tracked region.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct Chunk {
    /// Size of the region in bytes, header included.
    total_size: usize,
    /// Next chunk in the owning list, or null.
    pub(crate) next: *mut Self,
    /// Previous chunk in the owning list, or null.
    pub(crate) prev: *mut Self,
}

/// Returns the total chunk size needed to serve `size` user bytes.
///
/// Returns `None` if the computation overflows.
pub(crate) fn needed_size(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(WORD_SIZE)?
        .checked_add(HEADER_SIZE)
}

/// Returns the address of the chunk header that would own `user` address.
///
/// The result is only an address; it is never dereferenced until it has been
/// matched against a chunk the allocator owns.
pub(crate) fn chunk_addr_of(user: NonNull<u8>) -> usize {
    user.addr().get().wrapping_sub(HEADER_SIZE)
}

/// Exclusive handle to a chunk that is not linked into any list.
pub(crate) struct ChunkRef(NonNull<Chunk>);

impl ChunkRef {
    /// Writes a fresh, unlinked chunk header at `addr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `addr..addr + total_size` is valid for reads and writes
    /// - the region is not used by anything else for as long as the returned
    ///   handle, or any list it is moved into, exists
    /// - `addr` is aligned to [`WORD_SIZE`]
    /// - `total_size` is at least [`HEADER_SIZE`] and a multiple of
    ///   [`WORD_SIZE`]
    pub(crate) unsafe fn init(addr: NonNull<u8>, total_size: usize) -> Self {
        let chunk = addr.cast::<Chunk>();
        assert!(chunk.is_aligned(), "chunk address must be word aligned");
        assert!(
            total_size >= HEADER_SIZE,
            "chunk must be large enough to hold its header"
        );
        assert!(
            total_size.is_multiple_of(WORD_SIZE),
            "chunk size must be a multiple of the word size"
        );

        unsafe {
            chunk.write(Chunk {
                total_size,
                next: core::ptr::null_mut(),
                prev: core::ptr::null_mut(),
            });
        }

        Self(chunk)
    }

    /// Takes ownership of a chunk that was just unlinked from a list.
    ///
    /// # Safety
    ///
    /// `chunk` must point to a valid chunk header that no list and no other
    /// handle owns any more.
    pub(crate) unsafe fn from_raw(chunk: NonNull<Chunk>) -> Self {
        Self(chunk)
    }

    /// Gives up the handle, returning the header pointer.
    ///
    /// The caller becomes responsible for the chunk.
    pub(crate) fn into_raw(self) -> NonNull<Chunk> {
        self.0
    }

    pub(crate) fn view(&self) -> ChunkView<'_> {
        unsafe { ChunkView::new(self.0) }
    }

    pub(crate) fn addr(&self) -> usize {
        self.view().addr()
    }

    pub(crate) fn total_size(&self) -> usize {
        self.view().total_size()
    }

    pub(crate) fn end(&self) -> usize {
        self.view().end()
    }

    pub(crate) fn user_size(&self) -> usize {
        self.view().user_size()
    }

    pub(crate) fn user_ptr(&self) -> NonNull<u8> {
        self.view().user_ptr()
    }

    /// Returns `true` if `other` begins exactly where this chunk ends.
    pub(crate) fn is_followed_by(&self, other: &Self) -> bool {
        self.end() == other.addr()
    }

    /// Splits the chunk after its first `needed` bytes if the remainder is
    /// large enough to form a chunk of its own.
    ///
    /// On success this chunk is truncated to `needed` bytes and the remainder
    /// is returned as a new chunk starting right after it.
    pub(crate) fn split(&mut self, needed: usize) -> Option<Self> {
        let surplus = self.total_size().checked_sub(needed)?;
        (surplus > SPLIT_THRESHOLD).then(|| self.split_off(needed))
    }

    /// Splits the chunk at byte offset `at`, returning the tail.
    ///
    /// # Panics
    ///
    /// Panics if either part would be smaller than a header or if `at` is not
    /// word aligned.
    pub(crate) fn split_off(&mut self, at: usize) -> Self {
        let total_size = self.total_size();
        assert!(at >= HEADER_SIZE && at.is_multiple_of(WORD_SIZE));
        assert!(total_size >= at + HEADER_SIZE);

        let tail = unsafe {
            // the tail lies inside the region this handle owns
            let tail_addr = self.0.cast::<u8>().add(at);
            self.set_total_size(at);
            Self::init(tail_addr, total_size - at)
        };
        assert_eq!(self.end(), tail.addr());
        tail
    }

    /// Merges `other`, which must start right where this chunk ends, into
    /// this chunk. The header of `other` becomes part of this chunk's region.
    ///
    /// # Panics
    ///
    /// Panics if the chunks are not contiguous.
    #[expect(
        clippy::needless_pass_by_value,
        reason = "the absorbed chunk stops being a chunk, so its handle is consumed"
    )]
    pub(crate) fn absorb(&mut self, other: Self) {
        assert!(
            self.is_followed_by(&other),
            "absorbed chunk must be contiguous"
        );
        let total_size = self.total_size() + other.total_size();
        unsafe {
            self.set_total_size(total_size);
        }
    }

    /// Zeroes the bytes from offset `from` up to the end of the chunk.
    ///
    /// # Panics
    ///
    /// Panics if `from` would overwrite the header.
    pub(crate) fn zero_from(&mut self, from: usize) {
        let total_size = self.total_size();
        assert!(from >= HEADER_SIZE, "zeroing must not touch the header");
        if from >= total_size {
            return;
        }
        unsafe {
            self.0
                .cast::<u8>()
                .add(from)
                .write_bytes(0, total_size - from);
        }
    }

    /// Zeroes the whole user region.
    pub(crate) fn zero_user(&mut self) {
        self.zero_from(HEADER_SIZE);
    }

    /// # Safety
    ///
    /// The new size must describe memory this handle owns.
    unsafe fn set_total_size(&mut self, total_size: usize) {
        unsafe {
            (*self.0.as_ptr()).total_size = total_size;
        }
    }
}

impl fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.view(), f)
    }
}

/// Read-only view of a chunk owned by an allocator.
///
/// A view borrows the allocator it came from, so the chunk cannot change
/// while the view exists.
#[derive(Clone, Copy)]
pub struct ChunkView<'a> {
    chunk: NonNull<Chunk>,
    _marker: PhantomData<&'a Chunk>,
}

impl ChunkView<'_> {
    /// # Safety
    ///
    /// `chunk` must point to a valid header that stays unchanged for the
    /// lifetime of the view.
    pub(crate) unsafe fn new(chunk: NonNull<Chunk>) -> Self {
        Self {
            chunk,
            _marker: PhantomData,
        }
    }

    /// Address of the chunk header.
    #[must_use]
    pub fn addr(&self) -> usize {
        self.chunk.addr().get()
    }

    /// Size of the chunk in bytes, header included.
    #[must_use]
    pub fn total_size(&self) -> usize {
        unsafe { (*self.chunk.as_ptr()).total_size }
    }

    /// Address one past the last byte of the chunk.
    #[must_use]
    pub fn end(&self) -> usize {
        self.addr() + self.total_size()
    }

    /// Address handed out to callers.
    #[must_use]
    pub fn user_ptr(&self) -> NonNull<u8> {
        unsafe { self.chunk.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Number of bytes available to callers.
    #[must_use]
    pub fn user_size(&self) -> usize {
        self.total_size() - HEADER_SIZE
    }

    /// Byte range covered by the chunk, header included.
    #[must_use]
    pub fn range(&self) -> core::ops::Range<usize> {
        self.addr()..self.end()
    }
}

impl fmt::Debug for ChunkView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("total_size", &self.total_size())
            .finish()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::alloc::Layout;

    use super::*;

    fn with_test_chunk<F>(size: usize, test_fn: F)
    where
        F: FnOnce(ChunkRef),
    {
        let layout = Layout::from_size_align(size, WORD_SIZE).unwrap();
        unsafe {
            let region = std::alloc::alloc(layout);
            region.write_bytes(0x11, size);
            let chunk = ChunkRef::init(NonNull::new(region).unwrap(), size);
            test_fn(chunk);
            std::alloc::dealloc(region, layout);
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(HEADER_SIZE, 3 * size_of::<usize>());
        assert!(HEADER_SIZE.is_multiple_of(WORD_SIZE));
    }

    #[test]
    fn test_needed_size() {
        assert_eq!(needed_size(0), Some(HEADER_SIZE));
        assert_eq!(needed_size(1), Some(HEADER_SIZE + 8));
        assert_eq!(needed_size(8), Some(HEADER_SIZE + 8));
        assert_eq!(needed_size(9), Some(HEADER_SIZE + 16));
        assert_eq!(needed_size(50), Some(HEADER_SIZE + 56));
        assert_eq!(needed_size(usize::MAX), None);
        assert_eq!(needed_size(usize::MAX - 7 - HEADER_SIZE + 1), None);
    }

    #[test]
    fn test_user_address_round_trip() {
        with_test_chunk(256, |chunk| {
            let user = chunk.user_ptr();
            assert_eq!(user.addr().get(), chunk.addr() + HEADER_SIZE);
            assert_eq!(chunk_addr_of(user), chunk.addr());
            assert_eq!(chunk.user_size(), 256 - HEADER_SIZE);
            assert_eq!(chunk.view().range(), chunk.addr()..chunk.addr() + 256);
        });
    }

    #[test]
    fn test_split_leaves_contiguous_tail() {
        with_test_chunk(256, |mut chunk| {
            let tail = chunk.split(64).unwrap();
            assert_eq!(chunk.total_size(), 64);
            assert_eq!(tail.total_size(), 192);
            assert!(chunk.is_followed_by(&tail));
        });
    }

    #[test]
    fn test_split_requires_surplus_above_threshold() {
        with_test_chunk(256, |mut chunk| {
            // surplus equal to header + word is kept
            assert!(chunk.split(256 - SPLIT_THRESHOLD).is_none());
            assert_eq!(chunk.total_size(), 256);
            // one more word is enough
            let tail = chunk.split(256 - SPLIT_THRESHOLD - WORD_SIZE).unwrap();
            assert_eq!(tail.total_size(), SPLIT_THRESHOLD + WORD_SIZE);
            // requests larger than the chunk never split
            assert!(chunk.split(1024).is_none());
        });
    }

    #[test]
    fn test_absorb_merges_sizes() {
        with_test_chunk(256, |mut chunk| {
            let tail = chunk.split_off(96);
            let addr = chunk.addr();
            chunk.absorb(tail);
            assert_eq!(chunk.addr(), addr);
            assert_eq!(chunk.total_size(), 256);
        });
    }

    #[test]
    #[should_panic(expected = "absorbed chunk must be contiguous")]
    fn test_absorb_rejects_gap() {
        with_test_chunk(256, |mut chunk| {
            let mut middle = chunk.split_off(64);
            let tail = middle.split_off(64);
            chunk.absorb(tail);
        });
    }

    #[test]
    fn test_zero_from_keeps_prefix() {
        with_test_chunk(128, |mut chunk| {
            chunk.zero_from(64);
            let bytes = unsafe {
                core::slice::from_raw_parts(chunk.user_ptr().as_ptr(), chunk.user_size())
            };
            let split = 64 - HEADER_SIZE;
            assert!(bytes[..split].iter().all(|&b| b == 0x11));
            assert!(bytes[split..].iter().all(|&b| b == 0));

            chunk.zero_user();
            let bytes = unsafe {
                core::slice::from_raw_parts(chunk.user_ptr().as_ptr(), chunk.user_size())
            };
            assert!(bytes.iter().all(|&b| b == 0));
        });
    }
}
