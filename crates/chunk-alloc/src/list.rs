//! Doubly-linked chunk lists addressed by index.
//!
//! A [`ChunkList`] threads chunks together through the `next`/`prev` fields of
//! their headers, so it never needs memory of its own. The list implements the
//! [`Sortable`] and [`Heapable`] traits of the heap engine, with the ordering
//! chosen by a marker type:
//!
//! - [`BySize`]: ascending total size, used for best-fit searches
//! - [`ByAddress`]: ascending header address, used to find contiguous chunks
//!
//! Index `i` is resolved by walking `i` links from the head, so every heap
//! operation on a list costs O(n) rather than O(log n). Swapping two indices
//! relinks the nodes instead of moving their contents.

use core::{marker::PhantomData, ptr::NonNull};

use indexed_heap::{Heapable, Sortable};

use crate::chunk::{Chunk, ChunkRef, ChunkView};

/// Ordering used when a [`ChunkList`] is driven as a heap.
pub(crate) trait ChunkOrder {
    /// Returns `true` if `a` orders before `b`.
    fn less(a: ChunkView<'_>, b: ChunkView<'_>) -> bool;
}

/// Orders chunks by ascending total size.
#[derive(Debug)]
pub(crate) enum BySize {}

impl ChunkOrder for BySize {
    fn less(a: ChunkView<'_>, b: ChunkView<'_>) -> bool {
        a.total_size() < b.total_size()
    }
}

/// Orders chunks by ascending address.
#[derive(Debug)]
pub(crate) enum ByAddress {}

impl ChunkOrder for ByAddress {
    fn less(a: ChunkView<'_>, b: ChunkView<'_>) -> bool {
        a.addr() < b.addr()
    }
}

/// Intrusive doubly-linked list of chunks.
///
/// The list owns every chunk linked into it. Chunks enter through
/// [`push_back`](Self::push_back) and leave through
/// [`pop_back`](Self::pop_back), both of which move a [`ChunkRef`].
pub(crate) struct ChunkList<O> {
    head: *mut Chunk,
    tail: *mut Chunk,
    len: usize,
    _order: PhantomData<O>,
}

impl<O> Default for ChunkList<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O> ChunkList<O> {
    pub(crate) const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
            len: 0,
            _order: PhantomData,
        }
    }

    /// Reinterprets the list under another ordering.
    ///
    /// No node is touched; the caller has to re-establish heap order for the
    /// new ordering.
    pub(crate) fn into_order<P>(self) -> ChunkList<P> {
        ChunkList {
            head: self.head,
            tail: self.tail,
            len: self.len,
            _order: PhantomData,
        }
    }

    /// Links `chunk` at the tail of the list.
    pub(crate) fn push_back(&mut self, chunk: ChunkRef) {
        let node = chunk.into_raw().as_ptr();
        unsafe {
            (*node).prev = self.tail;
            (*node).next = core::ptr::null_mut();
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
        }
        self.tail = node;
        self.len += 1;
    }

    /// Unlinks the tail of the list.
    pub(crate) fn pop_back(&mut self) -> Option<ChunkRef> {
        let node = NonNull::new(self.tail)?;
        unsafe {
            let prev = (*node.as_ptr()).prev;
            if prev.is_null() {
                self.head = core::ptr::null_mut();
            } else {
                (*prev).next = core::ptr::null_mut();
            }
            self.tail = prev;
            (*node.as_ptr()).prev = core::ptr::null_mut();
            self.len -= 1;
            Some(ChunkRef::from_raw(node))
        }
    }

    /// Returns the node `index` links away from the head.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    fn node_at(&self, index: usize) -> NonNull<Chunk> {
        assert!(index < self.len, "chunk index {index} out of bounds");
        let mut node = self.head;
        for _ in 0..index {
            node = unsafe { (*node).next };
        }
        NonNull::new(node).unwrap_or_else(|| unreachable!("list shorter than its length"))
    }

    /// Iterates over the chunks from head to tail.
    pub(crate) fn iter(&self) -> Iter<'_> {
        Iter {
            node: self.head,
            remaining: self.len,
            _marker: PhantomData,
        }
    }

    /// Exchanges the list positions of two nodes.
    fn swap_nodes(&mut self, a: NonNull<Chunk>, b: NonNull<Chunk>) {
        if a == b {
            return;
        }
        let (a, b) = (a.as_ptr(), b.as_ptr());
        unsafe {
            if (*a).next == b {
                self.swap_adjacent(a, b);
            } else if (*b).next == a {
                self.swap_adjacent(b, a);
            } else {
                let (a_prev, a_next) = ((*a).prev, (*a).next);
                let (b_prev, b_next) = ((*b).prev, (*b).next);
                (*a).prev = b_prev;
                (*a).next = b_next;
                (*b).prev = a_prev;
                (*b).next = a_next;
                self.relink(a);
                self.relink(b);
            }
        }
    }

    /// Swaps `first` and the node right after it.
    ///
    /// # Safety
    ///
    /// Both nodes must belong to this list and `first.next` must be `second`.
    unsafe fn swap_adjacent(&mut self, first: *mut Chunk, second: *mut Chunk) {
        unsafe {
            let prev = (*first).prev;
            let next = (*second).next;
            (*second).prev = prev;
            (*second).next = first;
            (*first).prev = second;
            (*first).next = next;
            self.relink(second);
            self.relink(first);
        }
    }

    /// Points the neighbours of `node`, or the list ends, back at `node`.
    ///
    /// # Safety
    ///
    /// `node` must belong to this list and its own links must already be
    /// correct.
    unsafe fn relink(&mut self, node: *mut Chunk) {
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                self.head = node;
            } else {
                (*prev).next = node;
            }
            if next.is_null() {
                self.tail = node;
            } else {
                (*next).prev = node;
            }
        }
    }
}

impl<O> Sortable for ChunkList<O>
where
    O: ChunkOrder,
{
    fn len(&self) -> usize {
        self.len
    }

    fn less(&self, i: usize, j: usize) -> bool {
        let (a, b) = (self.node_at(i), self.node_at(j));
        unsafe { O::less(ChunkView::new(a), ChunkView::new(b)) }
    }

    fn swap(&mut self, i: usize, j: usize) {
        let (a, b) = (self.node_at(i), self.node_at(j));
        self.swap_nodes(a, b);
    }
}

impl<O> Heapable for ChunkList<O>
where
    O: ChunkOrder,
{
    type Item = ChunkRef;

    fn push(&mut self, item: ChunkRef) {
        self.push_back(item);
    }

    fn pop(&mut self) -> Option<ChunkRef> {
        self.pop_back()
    }
}

/// Iterator over the chunks of a [`ChunkList`].
pub(crate) struct Iter<'a> {
    node: *mut Chunk,
    remaining: usize,
    _marker: PhantomData<&'a Chunk>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = ChunkView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = NonNull::new(self.node)?;
        unsafe {
            self.node = (*node.as_ptr()).next;
            self.remaining -= 1;
            Some(ChunkView::new(node))
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}
