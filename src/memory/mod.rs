//! Page-granular managed heap.
//!
//! Memory is a reserved range of 8 KiB pages, committed lazily in 1 MiB
//! chunks. Spans are runs of pages described by records in a fixed-size
//! arena and found through the page table. Small objects are carved out of
//! spans of their size class; large objects get a span of their own.

pub mod arena;
pub mod cache;
pub mod central;
pub mod fixalloc;
pub mod heap;
pub mod malloc;
pub mod pagemap;
pub mod size_class;
pub mod span;
pub mod stack;
pub mod stats;
pub mod sweep;

use std::fmt;

pub use arena::Arena;
pub use fixalloc::FixAlloc;
pub use heap::Heap;
pub use span::{ObjectState, Span, SpanId, SpanState, WordKind};
pub use stats::MemStats;

pub const WORD_SIZE: usize = std::mem::size_of::<usize>();
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Largest size served from size classes.
pub const MAX_SMALL_SIZE: usize = 32 << 10;
/// Free spans shorter than this many pages sit in per-length lists.
pub const MAX_HEAP_LIST: usize = 1 << (20 - PAGE_SHIFT);
/// Heap growth granularity.
pub const HEAP_ALLOC_CHUNK: usize = 1 << 20;
/// Minimum unit the heap grows by.
pub const HEAP_GROW_UNIT: usize = 64 << 10;
/// Chunk size of the fixed-size allocator.
pub const FIX_ALLOC_CHUNK: usize = 16 << 10;

/// An address in the managed heap. Zero is nil.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    #[inline(always)]
    pub const fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    #[inline(always)]
    pub const fn to_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    #[inline(always)]
    pub const fn add_words(self, words: usize) -> Self {
        Self(self.0 + words * WORD_SIZE)
    }

    #[inline(always)]
    pub const fn page(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    #[inline(always)]
    pub const fn from_page(page: usize) -> Self {
        Self(page << PAGE_SHIFT)
    }

    #[inline(always)]
    pub const fn diff(self, base: Address) -> usize {
        self.0 - base.0
    }

    #[inline(always)]
    pub const fn is_word_aligned(self) -> bool {
        self.0 % WORD_SIZE == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Shape of an object: its size and which words hold pointers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeLayout {
    size: usize,
    pointers: Box<[usize]>,
}

impl TypeLayout {
    /// An object of `size` bytes without pointers.
    pub fn noscan(size: usize) -> Self {
        Self {
            size,
            pointers: Box::new([]),
        }
    }

    /// An object of `size` bytes whose words at `pointer_words` hold pointers.
    pub fn new(size: usize, pointer_words: &[usize]) -> Self {
        let nwords = (size + WORD_SIZE - 1) / WORD_SIZE;
        let mut pointers: Vec<usize> = pointer_words
            .iter()
            .copied()
            .filter(|&w| w < nwords)
            .collect();
        pointers.sort_unstable();
        pointers.dedup();
        Self {
            size,
            pointers: pointers.into_boxed_slice(),
        }
    }

    /// An object made of `slots` pointer words.
    pub fn pointers(slots: usize) -> Self {
        let words: Vec<usize> = (0..slots).collect();
        Self::new(slots * WORD_SIZE, &words)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn pointer_words(&self) -> &[usize] {
        &self.pointers
    }

    pub fn has_pointers(&self) -> bool {
        !self.pointers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_pages() {
        let a = Address::from_page(3).offset(24);
        assert_eq!(a.page(), 3);
        assert!(a.is_word_aligned());
        assert_eq!(a.diff(Address::from_page(3)), 24);
        assert!(Address::NULL.is_null());
    }

    #[test]
    fn layouts() {
        let l = TypeLayout::new(24, &[2, 0, 7, 0]);
        assert_eq!(l.pointer_words(), &[0, 2]);
        assert!(l.has_pointers());
        assert!(!TypeLayout::noscan(64).has_pointers());
        assert_eq!(TypeLayout::pointers(3).size(), 3 * WORD_SIZE);
    }
}
