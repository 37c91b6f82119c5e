//! A freestanding best-fit chunk allocator.
//!
//! This crate hands out word-aligned blocks of memory carved from whole pages
//! it obtains from a [`PageProvider`]. It needs neither the standard library
//! nor an existing heap, so it can serve as the heap of a program that has
//! none.
//!
//! # Design
//!
//! Every block is preceded by an in-band chunk header recording the size of
//! the chunk. The allocator keeps two intrusive lists of chunks, one free and
//! one allocated, and drives them as binary min-heaps through the
//! [`indexed_heap`] crate:
//!
//! - **Allocation** pops free chunks in size order until one fits (best fit),
//!   splitting off any large surplus. When nothing fits, fresh pages are
//!   mapped.
//! - **Release** moves the chunk to the free list and then coalesces the free
//!   list in address order, so adjacent free chunks are always merged.
//! - **Resize** first absorbs the free chunk that directly follows the block,
//!   and falls back to allocate, copy and release.
//!
//! Every allocated block is zeroed. Pages are never returned to the provider.
//!
//! # Usage
//!
//! ```rust
//! use core::ptr::NonNull;
//!
//! use chunk_alloc::{ChunkAllocator, PAGE_SIZE, RegionPages};
//!
//! // In a freestanding program this would be a static memory region
//! let mut region = vec![0_u8; 4 * PAGE_SIZE];
//! let provider =
//!     unsafe { RegionPages::new(NonNull::new(region.as_mut_ptr()).unwrap(), region.len()) };
//! let mut alloc = ChunkAllocator::new(provider);
//!
//! let ptr = alloc.allocate(100).unwrap().unwrap();
//! let ptr = alloc.resize(Some(ptr), 200).unwrap();
//! alloc.release(ptr).unwrap();
//! assert_eq!(alloc.allocated_chunks().len(), 0);
//! ```
//!
//! [`LockedChunkAllocator`] wraps an allocator in a spin lock and implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc):
//!
//! ```rust,no_run
//! use chunk_alloc::{LockedChunkAllocator, SystemPages};
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedChunkAllocator<SystemPages> = LockedChunkAllocator::new(SystemPages);
//! # fn main() {}
//! ```
//!
//! # Features
//!
//! - `log` (default): emits diagnostics through the `log` facade.
//! - `c-abi`: exports `malloc`, `calloc`, `realloc` and `free` backed by a
//!   process-wide allocator over [`SystemPages`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[macro_use]
mod log;

mod allocator;
#[cfg(any(feature = "c-abi", test))]
pub mod c_abi;
mod chunk;
mod global;
mod list;
mod page;

pub use mman_sys::{Errno, PAGE_SIZE};

pub use self::{
    allocator::{AllocError, ChunkAllocator, ReleaseError, ResizeError, locate_error},
    chunk::{ChunkView, HEADER_SIZE, WORD_SIZE},
    global::LockedChunkAllocator,
    page::{PageProvider, RegionPages, SystemPages},
};
