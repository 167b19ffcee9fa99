use std::sync::atomic::Ordering;

use super::cache::Cache;
use super::heap::Heap;
use super::size_class::size_to_class;
use super::span::{ObjectState, SpanId, WordKind};
use super::stats::HeapCounters;
use super::{Address, TypeLayout, MAX_SMALL_SIZE, PAGE_SHIFT, PAGE_SIZE, WORD_SIZE};
use crate::error::throw;
use crate::utils::align_usize;

/// Address returned for zero-sized allocations. It lies in the guard page,
/// is never nil and owns no slots.
pub const ZERO_BASE: Address = Address::from_usize(PAGE_SIZE - WORD_SIZE);

/// A fresh object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub addr: Address,
    pub span: Option<SpanId>,
    /// Bytes actually taken, the size class rounding included.
    pub size: usize,
}

/// Allocates an object shaped by `layout` in the colour `color` (white, or
/// black while the collector is marking).
pub fn malloc(heap: &Heap, cache: &mut Cache, layout: &TypeLayout, color: ObjectState) -> Allocation {
    let size = layout.size();
    if size == 0 {
        return Allocation {
            addr: ZERO_BASE,
            span: None,
            size: 0,
        };
    }

    let (addr, id) = if size <= MAX_SMALL_SIZE {
        cache.next_free(heap, size_to_class(size))
    } else {
        let npages = align_usize(size, PAGE_SIZE) >> PAGE_SHIFT;
        let id = heap.alloc_span(npages, 0);
        let span = heap.span(id);
        span.alloc_count.store(1, Ordering::Relaxed);
        heap.counters.nlarge_alloc.fetch_add(1, Ordering::Relaxed);
        (span.base(), id)
    };

    let span = heap.span(id);
    let elem = span.elem_size();
    let index = match span.object_index(addr) {
        Some(index) => index,
        None => throw(&format!("malloc: {} is outside span {:?}", addr, id)),
    };

    if span.needzero.load(Ordering::Relaxed) {
        heap.arena.clear(addr, elem);
    } else {
        // The free-list link is the only dirty word of a fresh object.
        heap.arena.store(addr, 0);
    }

    let table = span.objects();
    let first_word = addr.diff(span.base()) / WORD_SIZE;
    for w in 0..elem / WORD_SIZE {
        table.set_word_kind(first_word + w, WordKind::Scalar);
    }
    for &w in layout.pointer_words() {
        table.set_word_kind(first_word + w, WordKind::Pointer);
    }
    table.set_scannable(index, layout.has_pointers());
    if table.state(index) != ObjectState::Free {
        throw(&format!("malloc: object {} handed out twice", addr));
    }
    table.set_state(index, color);
    drop(table);

    let counters = &heap.counters;
    HeapCounters::add(&counters.heap_live, elem);
    HeapCounters::add(&counters.heap_objects, 1);
    if layout.has_pointers() {
        HeapCounters::add(&counters.heap_scan, elem);
    }
    counters.nmalloc.fetch_add(1, Ordering::Relaxed);

    Allocation {
        addr,
        span: Some(id),
        size: elem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_is_shared() {
        let heap = Heap::new(8 << 20);
        let mut cache = Cache::new();
        let a = malloc(&heap, &mut cache, &TypeLayout::noscan(0), ObjectState::White);
        let b = malloc(&heap, &mut cache, &TypeLayout::noscan(0), ObjectState::White);
        assert_eq!(a.addr, ZERO_BASE);
        assert_eq!(a, b);
        assert!(heap.lookup_object(a.addr).is_none());
    }

    #[test]
    fn small_objects_carry_layout() {
        let heap = Heap::new(8 << 20);
        let mut cache = Cache::new();
        let layout = TypeLayout::new(40, &[1, 3]);
        let obj = malloc(&heap, &mut cache, &layout, ObjectState::White);
        assert_eq!(obj.size, 48);
        let span = heap.span(obj.span.unwrap());
        let table = span.objects();
        let index = span.object_index(obj.addr).unwrap();
        assert_eq!(table.state(index), ObjectState::White);
        assert!(table.is_scannable(index));
        let w0 = obj.addr.diff(span.base()) / WORD_SIZE;
        assert_eq!(table.word_kind(w0), WordKind::Scalar);
        assert_eq!(table.word_kind(w0 + 1), WordKind::Pointer);
        assert_eq!(table.word_kind(w0 + 3), WordKind::Pointer);
        assert_eq!(HeapCounters::load(&heap.counters.heap_live), 48);
        assert_eq!(HeapCounters::load(&heap.counters.heap_scan), 48);
        assert_eq!(heap.arena.load(obj.addr), 0);
    }

    #[test]
    fn large_objects_get_a_span() {
        let heap = Heap::new(8 << 20);
        let mut cache = Cache::new();
        let obj = malloc(&heap, &mut cache, &TypeLayout::noscan(100 << 10), ObjectState::Black);
        let span = heap.span(obj.span.unwrap());
        assert_eq!(span.base(), obj.addr);
        assert_eq!(span.npages(), 13);
        assert_eq!(span.size_class(), 0);
        assert_eq!(span.objects().state(0), ObjectState::Black);
        assert_eq!(heap.lookup_object(obj.addr.offset(90 << 10)).unwrap().base, obj.addr);
    }

    #[test]
    fn dirty_spans_are_zeroed() {
        let heap = Heap::new(8 << 20);
        let mut cache = Cache::new();
        let first = malloc(&heap, &mut cache, &TypeLayout::noscan(64 << 10), ObjectState::White);
        heap.arena.store(first.addr.offset(64), 7);
        heap.free_span(first.span.unwrap());
        let again = malloc(&heap, &mut cache, &TypeLayout::noscan(64 << 10), ObjectState::White);
        assert_eq!(again.addr, first.addr);
        assert_eq!(heap.arena.load(again.addr.offset(64)), 0);
    }
}
