//! A container-agnostic binary min-heap.
//!
//! The heap owns no storage of its own. It drives any container that can
//! report its length, compare and swap two positions, append an element and
//! remove the last one. Those capabilities are described by the [`Sortable`]
//! and [`Heapable`] traits; [`Heap`] borrows such a container for as long as
//! heap operations are needed and is dropped afterwards.
//!
//! Because the engine only ever talks to the container through indices, the
//! container is free to be something other than an array. An intrusive linked
//! list works too, at the price of O(i) index lookups.
//!
//! # Examples
//!
//! ```
//! use indexed_heap::{Heap, Heapable, Sortable};
//!
//! struct Numbers(Vec<u32>);
//!
//! impl Sortable for Numbers {
//!     fn len(&self) -> usize {
//!         self.0.len()
//!     }
//!
//!     fn less(&self, i: usize, j: usize) -> bool {
//!         self.0[i] < self.0[j]
//!     }
//!
//!     fn swap(&mut self, i: usize, j: usize) {
//!         self.0.swap(i, j);
//!     }
//! }
//!
//! impl Heapable for Numbers {
//!     type Item = u32;
//!
//!     fn push(&mut self, item: u32) {
//!         self.0.push(item);
//!     }
//!
//!     fn pop(&mut self) -> Option<u32> {
//!         self.0.pop()
//!     }
//! }
//!
//! let mut numbers = Numbers(vec![5, 3, 8, 1]);
//! let mut heap = Heap::from_unordered(&mut numbers);
//! heap.push(4);
//!
//! let mut sorted = Vec::new();
//! while let Some(n) = heap.pop() {
//!     sorted.push(n);
//! }
//! assert_eq!(sorted, [1, 3, 4, 5, 8]);
//! ```
//!
//! # Complexity
//!
//! Every operation performs O(log n) calls to [`Sortable::less`] and
//! [`Sortable::swap`], except [`Heap::heapify`] which performs O(n). The real
//! cost therefore depends on how expensive indexing is in the container.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

/// A container whose elements can be compared and swapped by index.
pub trait Sortable {
    /// Returns the number of elements in the container.
    fn len(&self) -> usize;

    /// Returns `true` if the container holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the element at `i` must be ordered before the element
    /// at `j`.
    fn less(&self, i: usize, j: usize) -> bool;

    /// Swaps the elements at `i` and `j`.
    fn swap(&mut self, i: usize, j: usize);
}

/// A [`Sortable`] container that can also grow and shrink at its end.
pub trait Heapable: Sortable {
    /// Element type moved in and out of the container.
    type Item;

    /// Appends `item` as the last element.
    fn push(&mut self, item: Self::Item);

    /// Removes and returns the last element, or `None` if the container is
    /// empty.
    fn pop(&mut self) -> Option<Self::Item>;
}

/// Binary min-heap view over a borrowed [`Heapable`] container.
///
/// The view keeps no state besides the borrow. Heap order is a property of
/// the container contents: creating a new `Heap` over a container that was
/// previously ordered by the same comparator keeps that order, while a
/// container that was filled by other means needs [`heapify`](Self::heapify)
/// first.
pub struct Heap<'a, H>
where
    H: ?Sized,
{
    container: &'a mut H,
}

impl<'a, H> Heap<'a, H>
where
    H: Heapable + ?Sized,
{
    /// Wraps a container that is already in heap order (or empty).
    pub fn new(container: &'a mut H) -> Self {
        Self { container }
    }

    /// Wraps an arbitrary container and establishes heap order over it.
    pub fn from_unordered(container: &'a mut H) -> Self {
        let mut heap = Self::new(container);
        heap.heapify();
        heap
    }

    /// Returns a shared reference to the underlying container.
    #[must_use]
    pub fn container(&self) -> &H {
        self.container
    }

    /// Returns the number of elements in the heap.
    #[must_use]
    pub fn len(&self) -> usize {
        self.container.len()
    }

    /// Returns `true` if the heap is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    /// Establishes heap order over all elements in O(n).
    pub fn heapify(&mut self) {
        let n = self.container.len();
        for i in (0..n / 2).rev() {
            self.down(i, n);
        }
    }

    /// Pushes `item` onto the heap.
    pub fn push(&mut self, item: H::Item) {
        self.container.push(item);
        let last = self.container.len() - 1;
        self.up(last);
    }

    /// Removes and returns the minimum element, or `None` if the heap is
    /// empty.
    pub fn pop(&mut self) -> Option<H::Item> {
        let n = self.container.len().checked_sub(1)?;
        self.container.swap(0, n);
        self.down(0, n);
        self.container.pop()
    }

    /// Removes and returns the element at index `i`, or `None` if `i` is out
    /// of bounds.
    pub fn remove(&mut self, i: usize) -> Option<H::Item> {
        let n = self.container.len().checked_sub(1)?;
        if i > n {
            return None;
        }
        if i != n {
            self.container.swap(i, n);
            if !self.down(i, n) {
                self.up(i);
            }
        }
        self.container.pop()
    }

    /// Re-establishes heap order after the element at index `i` has changed
    /// its ordering key.
    pub fn fix(&mut self, i: usize) {
        let n = self.container.len();
        if i >= n {
            return;
        }
        if !self.down(i, n) {
            self.up(i);
        }
    }

    fn up(&mut self, mut child: usize) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if !self.container.less(child, parent) {
                break;
            }
            self.container.swap(parent, child);
            child = parent;
        }
    }

    /// Sifts the element at `start` down within the first `n` elements.
    ///
    /// Returns `true` if the element moved.
    fn down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        while let Some(left) = i.checked_mul(2).and_then(|l| l.checked_add(1)) {
            if left >= n {
                break;
            }
            // ties stay on the left
            let mut j = left;
            let right = left + 1;
            if right < n && self.container.less(right, left) {
                j = right;
            }
            if !self.container.less(j, i) {
                break;
            }
            self.container.swap(i, j);
            i = j;
        }
        i > start
    }
}
