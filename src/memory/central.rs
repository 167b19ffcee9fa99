use std::sync::atomic::Ordering;

use parking_lot::Mutex;

use super::heap::Heap;
use super::size_class::class_npages;
use super::span::{SpanId, SpanList, SpanLocation, SpanState};
use super::sweep::sweep_span;
use super::Address;
use crate::error::throw;

struct CentralLists {
    /// Spans with at least one free object.
    nonempty: SpanList,
    /// Spans with no free objects, or handed to a cache.
    empty: SpanList,
}

/// Shared free lists of one size class.
pub struct Central {
    class: usize,
    lists: Mutex<CentralLists>,
}

impl Central {
    pub fn new(class: usize) -> Self {
        Self {
            class,
            lists: Mutex::new(CentralLists {
                nonempty: SpanList::new(SpanLocation::CentralNonempty),
                empty: SpanList::new(SpanLocation::CentralEmpty),
            }),
        }
    }

    pub fn class(&self) -> usize {
        self.class
    }

    /// Hands a span with free objects to a cache. Unswept spans are swept on
    /// the way; the heap is asked for a fresh span when nothing is free.
    pub fn cache_span(&self, heap: &Heap) -> SpanId {
        let id = 'found: loop {
            let mut lists = self.lists.lock();
            let sg = heap.sweepgen();

            for id in lists.nonempty.ids(&heap.spans) {
                let span = heap.span(id);
                let gen = span.sweep_gen.load(Ordering::Acquire);
                if gen == sg.wrapping_sub(2)
                    && span
                        .sweep_gen
                        .compare_exchange(gen, sg.wrapping_sub(1), Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                {
                    lists.nonempty.remove(&heap.spans, id);
                    drop(lists);
                    sweep_span(heap, id, true);
                    break 'found id;
                }
                if gen == sg.wrapping_sub(1) {
                    // The background sweeper has it.
                    continue;
                }
                lists.nonempty.remove(&heap.spans, id);
                break 'found id;
            }

            let mut claimed = None;
            for id in lists.empty.ids(&heap.spans) {
                let span = heap.span(id);
                let gen = span.sweep_gen.load(Ordering::Acquire);
                if gen == sg.wrapping_sub(2)
                    && span
                        .sweep_gen
                        .compare_exchange(gen, sg.wrapping_sub(1), Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                {
                    lists.empty.remove(&heap.spans, id);
                    claimed = Some(id);
                    break;
                }
                if gen == sg.wrapping_sub(1) {
                    continue;
                }
                // Swept spans sit behind the unswept ones; nothing more to find.
                break;
            }
            drop(lists);
            if let Some(id) = claimed {
                let span = heap.span(id);
                sweep_span(heap, id, true);
                if span.freelist.load(Ordering::Acquire) != 0 {
                    break 'found id;
                }
                // Still full; park it at the back and look again.
                self.lists.lock().empty.push_back(&heap.spans, id);
                continue;
            }

            break self.grow(heap);
        };

        let span = heap.span(id);
        if span.alloc_count.load(Ordering::Relaxed) >= span.nelems()
            || span.freelist.load(Ordering::Acquire) == 0
        {
            throw(&format!(
                "central {}: span {:?} handed to cache has no free objects",
                self.class, id
            ));
        }
        span.set_location(SpanLocation::Cached);
        id
    }

    /// Takes back a span from a cache.
    pub fn uncache_span(&self, heap: &Heap, id: SpanId) {
        let span = heap.span(id);
        let mut lists = self.lists.lock();
        if span.location() != SpanLocation::Cached {
            throw(&format!(
                "central {}: uncache of span {:?} in {:?}",
                self.class,
                id,
                span.location()
            ));
        }
        span.set_location(SpanLocation::Nowhere);
        if span.alloc_count.load(Ordering::Relaxed) < span.nelems() {
            lists.nonempty.push_front(&heap.spans, id);
        } else {
            lists.empty.push_back(&heap.spans, id);
        }
    }

    /// Records the result of sweeping a span that freed objects. With
    /// `preserve` the span stays where its sweeper put it. Returns whether the
    /// span went back to the heap.
    pub fn free_span(&self, heap: &Heap, id: SpanId, preserve: bool) -> bool {
        let span = heap.span(id);
        if span.location() == SpanLocation::Cached {
            throw(&format!("central {}: sweep freed objects of a cached span", self.class));
        }
        if preserve {
            span.sweep_gen.store(heap.sweepgen(), Ordering::Release);
            return false;
        }

        let mut lists = self.lists.lock();
        if span.location() == SpanLocation::CentralEmpty {
            lists.empty.remove(&heap.spans, id);
            lists.nonempty.push_front(&heap.spans, id);
        }
        // Publish the sweep only after the list move so that cache_span never
        // sees a swept span on the wrong list.
        span.sweep_gen.store(heap.sweepgen(), Ordering::Release);

        if span.alloc_count.load(Ordering::Relaxed) != 0 {
            return false;
        }

        lists.nonempty.remove(&heap.spans, id);
        drop(lists);
        span.freelist.store(0, Ordering::Relaxed);
        heap.free_span(id);
        true
    }

    /// Allocates a fresh span for this class and threads its free list.
    fn grow(&self, heap: &Heap) -> SpanId {
        let id = heap.alloc_span(class_npages(self.class), self.class);
        let span = heap.span(id);
        span.set_location(SpanLocation::Nowhere);
        let (base, elem, n) = (span.base(), span.elem_size(), span.nelems());
        let mut next = Address::NULL;
        for index in (0..n).rev() {
            let obj = base.offset(index * elem);
            heap.arena.store(obj, next.to_usize());
            next = obj;
        }
        span.freelist.store(next.to_usize(), Ordering::Release);
        debug_assert_eq!(span.state(), SpanState::InUse);
        id
    }

    /// Number of spans on the (nonempty, empty) lists.
    pub fn lens(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.nonempty.len(), lists.empty.len())
    }
}
