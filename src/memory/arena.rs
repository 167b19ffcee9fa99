use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

use super::{Address, PAGE_SHIFT, PAGE_SIZE, WORD_SIZE};
use crate::error::throw;

pub const ARENA_CHUNK_SHIFT: usize = 20;
pub const ARENA_CHUNK_SIZE: usize = 1 << ARENA_CHUNK_SHIFT;
const WORDS_PER_CHUNK: usize = ARENA_CHUNK_SIZE / WORD_SIZE;
const PAGES_PER_CHUNK: usize = ARENA_CHUNK_SIZE / PAGE_SIZE;

/// The reserved address range of the heap.
///
/// Page 0 is never handed out so that address 0 and everything in the first
/// page fault like a nil dereference. Chunks are committed the first time a
/// page inside them is allocated and stay committed; released pages are
/// zeroed instead of unmapped.
pub struct Arena {
    chunks: Box<[OnceCell<Box<[AtomicUsize]>>]>,
    max_pages: usize,
    used_pages: AtomicUsize,
    committed: AtomicUsize,
}

impl Arena {
    pub fn new(max_bytes: usize) -> Self {
        let nchunks = ((max_bytes + ARENA_CHUNK_SIZE - 1) / ARENA_CHUNK_SIZE).max(1);
        Self {
            chunks: (0..nchunks).map(|_| OnceCell::new()).collect(),
            max_pages: nchunks * PAGES_PER_CHUNK,
            used_pages: AtomicUsize::new(1),
            committed: AtomicUsize::new(0),
        }
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// One past the last page handed out so far.
    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Acquire)
    }

    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    /// Takes `npages` fresh pages from the reservation. Must be called with
    /// the heap lock held. Returns `None` when the reservation is exhausted.
    pub fn sys_alloc(&self, npages: usize) -> Option<usize> {
        let first = self.used_pages.load(Ordering::Relaxed);
        if npages == 0 || first + npages > self.max_pages {
            return None;
        }

        let first_chunk = (first * PAGE_SIZE) >> ARENA_CHUNK_SHIFT;
        let last_chunk = ((first + npages) * PAGE_SIZE - 1) >> ARENA_CHUNK_SHIFT;
        for chunk in first_chunk..=last_chunk {
            self.chunks[chunk].get_or_init(|| {
                self.committed.fetch_add(ARENA_CHUNK_SIZE, Ordering::Relaxed);
                (0..WORDS_PER_CHUNK).map(|_| AtomicUsize::new(0)).collect()
            });
        }

        self.used_pages.store(first + npages, Ordering::Release);
        log::trace!(target: "heap", "sys_alloc pages {}..{}", first, first + npages);
        Some(first)
    }

    /// Whether `addr` lies in a page that was handed out.
    pub fn contains(&self, addr: Address) -> bool {
        let page = addr.page();
        page >= 1 && page < self.used_pages()
    }

    #[inline]
    pub fn word(&self, addr: Address) -> Option<&AtomicUsize> {
        if !addr.is_word_aligned() || !self.contains(addr) {
            return None;
        }
        let raw = addr.to_usize();
        let chunk = self.chunks.get(raw >> ARENA_CHUNK_SHIFT)?.get()?;
        chunk.get((raw & (ARENA_CHUNK_SIZE - 1)) / WORD_SIZE)
    }

    #[inline]
    fn word_or_throw(&self, addr: Address) -> &AtomicUsize {
        match self.word(addr) {
            Some(word) => word,
            None => throw(&format!("arena: access to unmapped address {}", addr)),
        }
    }

    #[inline]
    pub fn load(&self, addr: Address) -> usize {
        self.word_or_throw(addr).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, addr: Address, value: usize) {
        self.word_or_throw(addr).store(value, Ordering::Relaxed)
    }

    pub fn clear(&self, start: Address, bytes: usize) {
        let mut addr = start;
        let end = start.offset(bytes);
        while addr < end {
            self.store(addr, 0);
            addr = addr.offset(WORD_SIZE);
        }
    }

    pub fn copy_words(&self, dst: Address, src: Address, words: usize) {
        for i in 0..words {
            let v = self.load(src.add_words(i));
            self.store(dst.add_words(i), v);
        }
    }

    pub fn page_base(page: usize) -> Address {
        Address::from_usize(page << PAGE_SHIFT)
    }
}
