use std::sync::atomic::{AtomicU32, Ordering};

use super::span::{raw_of, SpanId};

/// Page → span table covering the whole reservation.
///
/// Every page of every live span (free, in-use or stack) maps to that span.
pub struct PageMap {
    entries: Box<[AtomicU32]>,
}

impl PageMap {
    pub fn new(max_pages: usize) -> Self {
        Self {
            entries: (0..max_pages).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    #[inline]
    pub fn get(&self, page: usize) -> Option<SpanId> {
        SpanId::from_raw(self.entries.get(page)?.load(Ordering::Acquire))
    }

    pub fn set_range(&self, first: usize, npages: usize, id: Option<SpanId>) {
        let raw = raw_of(id);
        for entry in &self.entries[first..first + npages] {
            entry.store(raw, Ordering::Release);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges() {
        let map = PageMap::new(16);
        let id = SpanId::from_raw(3);
        map.set_range(2, 4, id);
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(2), id);
        assert_eq!(map.get(5), id);
        assert_eq!(map.get(6), None);
        assert_eq!(map.get(100), None);
        map.set_range(2, 4, None);
        assert_eq!(map.get(3), None);
    }
}
