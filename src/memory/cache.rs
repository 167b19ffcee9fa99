use std::sync::atomic::Ordering;

use super::heap::Heap;
use super::size_class::num_classes;
use super::span::SpanId;
use super::stack::NUM_STACK_ORDERS;
use super::Address;

/// Stack segments of one order cached by a context, linked through their
/// first word.
#[derive(Clone, Copy, Default, Debug)]
pub struct StackFreeList {
    pub list: Address,
    pub size: usize,
}

/// Per-context allocation cache: one span per size class and a small stock
/// of stack segments per order. Only the owning context touches it, except
/// while flushing during a stop-the-world.
pub struct Cache {
    alloc: Vec<Option<SpanId>>,
    pub stacks: [StackFreeList; NUM_STACK_ORDERS],
    /// Bytes handed out since the last flush into the heap counters.
    pub local_alloc: usize,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self {
            alloc: vec![None; num_classes()],
            stacks: [StackFreeList::default(); NUM_STACK_ORDERS],
            local_alloc: 0,
        }
    }

    pub fn span_for(&self, class: usize) -> Option<SpanId> {
        self.alloc[class]
    }

    /// Pops a free object of `class`, refilling from the central list when
    /// the cached span is used up. Returns the object and its span.
    pub fn next_free(&mut self, heap: &Heap, class: usize) -> (Address, SpanId) {
        loop {
            if let Some(id) = self.alloc[class] {
                let span = heap.span(id);
                let head = span.freelist.load(Ordering::Acquire);
                if head != 0 {
                    let obj = Address::from_usize(head);
                    span.freelist.store(heap.arena.load(obj), Ordering::Release);
                    span.alloc_count.fetch_add(1, Ordering::Relaxed);
                    self.local_alloc += span.elem_size();
                    return (obj, id);
                }
            }
            self.refill(heap, class);
        }
    }

    /// Returns the current span of `class` to its central list and takes a
    /// new one with free objects.
    pub fn refill(&mut self, heap: &Heap, class: usize) {
        if let Some(old) = self.alloc[class].take() {
            heap.central(class).uncache_span(heap, old);
        }
        self.alloc[class] = Some(heap.central(class).cache_span(heap));
    }

    /// Gives every cached span back to its central list.
    pub fn release_all(&mut self, heap: &Heap) {
        for class in 1..self.alloc.len() {
            if let Some(id) = self.alloc[class].take() {
                heap.central(class).uncache_span(heap, id);
            }
        }
        self.local_alloc = 0;
    }

    pub fn holds_spans(&self) -> bool {
        self.alloc.iter().any(|s| s.is_some())
    }
}
