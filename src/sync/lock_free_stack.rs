use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Storage that links stack entries by index.
///
/// Index 0 is reserved as the end-of-list marker and must never be pushed.
pub trait IndexLinks {
    fn link(&self, index: u32) -> &AtomicU32;
}

/// Treiber stack over indices of a fixed arena.
///
/// The head packs `(version << 32) | index`; every successful update bumps the
/// version so a head that was popped and pushed again between a load and a
/// compare-exchange is not mistaken for the old one.
pub struct LockFreeStack {
    head: AtomicU64,
}

#[inline(always)]
fn pack(version: u32, index: u32) -> u64 {
    ((version as u64) << 32) | index as u64
}

#[inline(always)]
fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

impl LockFreeStack {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        unpack(self.head.load(Ordering::Acquire)).1 == 0
    }

    pub fn push<L: IndexLinks + ?Sized>(&self, links: &L, index: u32) {
        debug_assert_ne!(index, 0);
        let mut cur = self.head.load(Ordering::Relaxed);
        loop {
            let (version, top) = unpack(cur);
            links.link(index).store(top, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                cur,
                pack(version.wrapping_add(1), index),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn pop<L: IndexLinks + ?Sized>(&self, links: &L) -> Option<u32> {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (version, top) = unpack(cur);
            if top == 0 {
                return None;
            }
            let next = links.link(top).load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                cur,
                pack(version.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(top),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Number of entries; only meaningful while the stack is quiescent.
    pub fn len<L: IndexLinks + ?Sized>(&self, links: &L) -> usize {
        let mut cur = unpack(self.head.load(Ordering::Acquire)).1;
        let mut n = 0;
        while cur != 0 {
            n += 1;
            cur = links.link(cur).load(Ordering::Relaxed);
        }
        n
    }
}

impl Default for LockFreeStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Links(Vec<AtomicU32>);

    impl IndexLinks for Links {
        fn link(&self, index: u32) -> &AtomicU32 {
            &self.0[index as usize]
        }
    }

    #[test]
    fn lifo_order() {
        let links = Links((0..8).map(|_| AtomicU32::new(0)).collect());
        let stack = LockFreeStack::new();
        for i in 1..8 {
            stack.push(&links, i);
        }
        assert_eq!(stack.len(&links), 7);
        for i in (1..8).rev() {
            assert_eq!(stack.pop(&links), Some(i));
        }
        assert!(stack.pop(&links).is_none());
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_push_pop_conserves_entries() {
        const N: u32 = 4096;
        let links = Arc::new(Links((0..=N).map(|_| AtomicU32::new(0)).collect()));
        let stack = Arc::new(LockFreeStack::new());
        for i in 1..=N {
            stack.push(&*links, i);
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let links = links.clone();
                let stack = stack.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..10_000 {
                        if let Some(i) = stack.pop(&*links) {
                            stack.push(&*links, i);
                        }
                    }
                    while let Some(i) = stack.pop(&*links) {
                        seen.push(i);
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=N).collect::<Vec<_>>());
    }
}
