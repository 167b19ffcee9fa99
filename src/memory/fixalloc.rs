use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::FIX_ALLOC_CHUNK;
use crate::error::throw;

/// Allocator for fixed-size runtime records (spans, caches, tasks, work
/// buffers).
///
/// Records are addressed by a 32-bit id; id 0 is never handed out. Chunks of
/// records are committed on demand and never returned. Freed ids are
/// recycled as they are: the record keeps whatever its previous user left in
/// it and the new owner must reinitialise it.
pub struct FixAlloc<T> {
    chunks: Box<[OnceCell<Box<[T]>>]>,
    per_chunk: usize,
    state: Mutex<FixState>,
    inuse: AtomicUsize,
    sys: AtomicUsize,
}

struct FixState {
    next: u32,
    free: Vec<u32>,
}

impl<T: Default> FixAlloc<T> {
    /// `capacity` is the largest number of live records.
    pub fn new(capacity: usize) -> Self {
        let per_chunk = (FIX_ALLOC_CHUNK / std::mem::size_of::<T>().max(1)).max(1);
        let nchunks = (capacity + 1 + per_chunk - 1) / per_chunk;
        Self {
            chunks: (0..nchunks).map(|_| OnceCell::new()).collect(),
            per_chunk,
            state: Mutex::new(FixState {
                next: 1,
                free: Vec::new(),
            }),
            inuse: AtomicUsize::new(0),
            sys: AtomicUsize::new(0),
        }
    }

    /// Returns the id of a record nobody else owns, or `None` when the
    /// capacity is exhausted.
    pub fn try_alloc(&self) -> Option<u32> {
        let mut state = self.state.lock();
        let id = match state.free.pop() {
            Some(id) => id,
            None => {
                let id = state.next;
                let chunk = id as usize / self.per_chunk;
                let cell = self.chunks.get(chunk)?;
                cell.get_or_init(|| {
                    self.sys
                        .fetch_add(self.per_chunk * std::mem::size_of::<T>(), Ordering::Relaxed);
                    (0..self.per_chunk).map(|_| T::default()).collect()
                });
                state.next += 1;
                id
            }
        };
        self.inuse.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    pub fn alloc(&self) -> u32 {
        match self.try_alloc() {
            Some(id) => id,
            None => throw("fixalloc: out of record slots"),
        }
    }
}

impl<T> FixAlloc<T> {
    pub fn free(&self, id: u32) {
        debug_assert!(id != 0);
        self.state.lock().free.push(id);
        self.inuse.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn try_get(&self, id: u32) -> Option<&T> {
        if id == 0 {
            return None;
        }
        let chunk = self.chunks.get(id as usize / self.per_chunk)?.get()?;
        chunk.get(id as usize % self.per_chunk)
    }

    #[inline]
    pub fn get(&self, id: u32) -> &T {
        match self.try_get(id) {
            Some(record) => record,
            None => throw(&format!("fixalloc: bad record id {}", id)),
        }
    }

    /// One past the highest id ever handed out.
    pub fn high_water(&self) -> u32 {
        self.state.lock().next
    }

    pub fn inuse(&self) -> usize {
        self.inuse.load(Ordering::Relaxed)
    }

    /// Bytes committed for records.
    pub fn sys(&self) -> usize {
        self.sys.load(Ordering::Relaxed)
    }

    pub fn record_size(&self) -> usize {
        std::mem::size_of::<T>()
    }
}
