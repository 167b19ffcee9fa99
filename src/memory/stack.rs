//! Task stack allocation.
//!
//! Stacks of 2, 4, 8 and 16 KiB ("orders" 0..4) are carved out of 32 KiB
//! stack spans kept in per-order pools; each context caches up to 32 KiB of
//! segments per order. Anything larger gets a dedicated stack span.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::cache::Cache;
use super::heap::Heap;
use super::span::{SpanId, SpanList, SpanLocation, SpanState};
use super::{Address, PAGE_SHIFT, PAGE_SIZE, WORD_SIZE};
use crate::error::throw;
use crate::utils::{align_usize, formatted_size, is_aligned, round_up_pow2};

/// Smallest stack, order 0.
pub const FIXED_STACK: usize = 2048;
pub const NUM_STACK_ORDERS: usize = 4;
/// Per-order cache limit of a context and the size of a pool span.
pub const STACK_CACHE_SIZE: usize = 32 << 10;
/// Stacks never grow past this.
pub const MAX_STACK_SIZE: usize = 1 << 20;

const STACK_SPAN_PAGES: usize = STACK_CACHE_SIZE / PAGE_SIZE;

/// A task stack: `size` bytes starting at `lo`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Stack {
    pub lo: Address,
    pub size: usize,
}

impl Stack {
    pub const EMPTY: Stack = Stack {
        lo: Address::NULL,
        size: 0,
    };

    pub fn hi(&self) -> Address {
        self.lo.offset(self.size)
    }

    /// Number of word slots.
    pub fn slots(&self) -> usize {
        self.size / WORD_SIZE
    }

    pub fn slot(&self, index: usize) -> Address {
        self.lo.add_words(index)
    }
}

fn order_of(size: usize) -> Option<usize> {
    let size = round_up_pow2(size.max(FIXED_STACK));
    let order = (size / FIXED_STACK).trailing_zeros() as usize;
    if order < NUM_STACK_ORDERS && size < STACK_CACHE_SIZE {
        Some(order)
    } else {
        None
    }
}

pub struct StackAllocator {
    pools: Mutex<Vec<SpanList>>,
    /// Dedicated stack spans freed while the collector was running.
    deferred: Mutex<Vec<SpanId>>,
    gc_active: AtomicBool,
}

impl Default for StackAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StackAllocator {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(
                (0..NUM_STACK_ORDERS)
                    .map(|_| SpanList::new(SpanLocation::StackPool))
                    .collect(),
            ),
            deferred: Mutex::new(Vec::new()),
            gc_active: AtomicBool::new(false),
        }
    }

    /// While set, stack spans are not returned to the heap; the collector
    /// may still be scanning them.
    pub fn set_gc_active(&self, active: bool) {
        self.gc_active.store(active, Ordering::Release);
    }

    /// Allocates a stack of at least `size` bytes, a power of two no
    /// smaller than [`FIXED_STACK`].
    pub fn alloc(&self, heap: &Heap, cache: Option<&mut Cache>, size: usize) -> Stack {
        let size = round_up_pow2(size.max(FIXED_STACK));
        if size > MAX_STACK_SIZE {
            throw(&format!(
                "stack overflow: {} exceeds the {} limit",
                formatted_size(size),
                formatted_size(MAX_STACK_SIZE)
            ));
        }

        let lo = match order_of(size) {
            Some(order) => match cache {
                Some(cache) => {
                    if cache.stacks[order].size == 0 {
                        self.refill(heap, cache, order);
                    }
                    let list = &mut cache.stacks[order];
                    let x = list.list;
                    list.list = Address::from_usize(heap.arena.load(x));
                    list.size -= FIXED_STACK << order;
                    x
                }
                None => {
                    let mut pools = self.pools.lock();
                    self.pool_alloc(heap, &mut pools, order)
                }
            },
            None => {
                let npages = align_usize(size, PAGE_SIZE) >> PAGE_SHIFT;
                let id = heap.alloc_stack_span(npages);
                let span = heap.span(id);
                span.set_location(SpanLocation::Busy);
                span.base()
            }
        };
        log::trace!(target: "stack", "stackalloc {} at {}", size, lo);
        Stack { lo, size }
    }

    pub fn free(&self, heap: &Heap, cache: Option<&mut Cache>, stack: Stack) {
        log::trace!(target: "stack", "stackfree {} at {}", stack.size, stack.lo);
        if !is_aligned(stack.lo.to_usize(), FIXED_STACK) || stack.size < FIXED_STACK {
            throw(&format!("stackfree: bad stack {} of {}", stack.lo, stack.size));
        }
        match order_of(stack.size) {
            Some(order) => match cache {
                Some(cache) => {
                    if cache.stacks[order].size >= STACK_CACHE_SIZE {
                        self.release(heap, cache, order);
                    }
                    let list = &mut cache.stacks[order];
                    heap.arena.store(stack.lo, list.list.to_usize());
                    list.list = stack.lo;
                    list.size += stack.size;
                }
                None => {
                    let mut pools = self.pools.lock();
                    self.pool_free(heap, &mut pools, stack.lo, order);
                }
            },
            None => {
                let id = match heap.lookup(stack.lo) {
                    Some(id) => id,
                    None => throw(&format!("stackfree: bad stack address {}", stack.lo)),
                };
                if self.gc_active.load(Ordering::Acquire) {
                    self.deferred.lock().push(id);
                } else {
                    heap.free_stack_span(id);
                }
            }
        }
    }

    /// Doubles `old`, copying its first `used` slots, and frees it.
    pub fn grow(
        &self,
        heap: &Heap,
        mut cache: Option<&mut Cache>,
        old: Stack,
        used: usize,
    ) -> Stack {
        let new = self.alloc(heap, cache.as_deref_mut(), old.size * 2);
        heap.arena.copy_words(new.lo, old.lo, used);
        heap.arena.clear(new.slot(used), new.size - used * WORD_SIZE);
        self.free(heap, cache, old);
        log::debug!(
            target: "stack",
            "stack grew from {} to {}",
            formatted_size(old.size),
            formatted_size(new.size)
        );
        new
    }

    fn pool_alloc(&self, heap: &Heap, pools: &mut [SpanList], order: usize) -> Address {
        let id = match pools[order].first() {
            Some(id) => id,
            None => {
                let id = heap.alloc_stack_span(STACK_SPAN_PAGES);
                let span = heap.span(id);
                let elem = FIXED_STACK << order;
                let mut head = 0;
                for i in (0..STACK_CACHE_SIZE / elem).rev() {
                    let x = span.base().offset(i * elem);
                    heap.arena.store(x, head);
                    head = x.to_usize();
                }
                span.freelist.store(head, Ordering::Relaxed);
                span.alloc_count.store(0, Ordering::Relaxed);
                pools[order].push_front(&heap.spans, id);
                id
            }
        };
        let span = heap.span(id);
        let x = span.freelist.load(Ordering::Relaxed);
        if x == 0 {
            throw(&format!("stack span {:?} in pool has no free segment", id));
        }
        let x = Address::from_usize(x);
        span.freelist.store(heap.arena.load(x), Ordering::Relaxed);
        span.alloc_count.fetch_add(1, Ordering::Relaxed);
        if span.freelist.load(Ordering::Relaxed) == 0 {
            pools[order].remove(&heap.spans, id);
            span.set_location(SpanLocation::Busy);
        }
        x
    }

    fn pool_free(&self, heap: &Heap, pools: &mut [SpanList], x: Address, order: usize) {
        let id = match heap.lookup(x) {
            Some(id) if heap.span(id).state() == SpanState::Stack => id,
            _ => throw(&format!("stackfree: {} is not in a stack span", x)),
        };
        let span = heap.span(id);
        if span.freelist.load(Ordering::Relaxed) == 0 {
            span.set_location(SpanLocation::Nowhere);
            pools[order].push_front(&heap.spans, id);
        }
        heap.arena.store(x, span.freelist.load(Ordering::Relaxed));
        span.freelist.store(x.to_usize(), Ordering::Relaxed);
        let left = span.alloc_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if left == 0 && !self.gc_active.load(Ordering::Acquire) {
            pools[order].remove(&heap.spans, id);
            span.freelist.store(0, Ordering::Relaxed);
            heap.free_stack_span(id);
        }
    }

    /// Moves segments from the pool into `cache` until it holds half its limit.
    fn refill(&self, heap: &Heap, cache: &mut Cache, order: usize) {
        let mut pools = self.pools.lock();
        let list = &mut cache.stacks[order];
        while list.size < STACK_CACHE_SIZE / 2 {
            let x = self.pool_alloc(heap, &mut pools, order);
            heap.arena.store(x, list.list.to_usize());
            list.list = x;
            list.size += FIXED_STACK << order;
        }
    }

    /// Returns segments from `cache` to the pool until it holds half its limit.
    fn release(&self, heap: &Heap, cache: &mut Cache, order: usize) {
        let mut pools = self.pools.lock();
        let list = &mut cache.stacks[order];
        while list.size > STACK_CACHE_SIZE / 2 {
            let x = list.list;
            list.list = Address::from_usize(heap.arena.load(x));
            list.size -= FIXED_STACK << order;
            self.pool_free(heap, &mut pools, x, order);
        }
    }

    /// Empties the stack cache of `cache`.
    pub fn clear_cache(&self, heap: &Heap, cache: &mut Cache) {
        let mut pools = self.pools.lock();
        for order in 0..NUM_STACK_ORDERS {
            let list = &mut cache.stacks[order];
            while !list.list.is_null() {
                let x = list.list;
                list.list = Address::from_usize(heap.arena.load(x));
                self.pool_free(heap, &mut pools, x, order);
            }
            list.size = 0;
        }
    }

    /// Frees the stack spans that became unused while the collector was
    /// running. Called with the world stopped at the end of marking.
    pub fn free_deferred(&self, heap: &Heap) -> usize {
        let mut freed = 0;
        let mut pools = self.pools.lock();
        for list in pools.iter_mut() {
            for id in list.ids(&heap.spans) {
                let span = heap.span(id);
                if span.alloc_count.load(Ordering::Relaxed) == 0 {
                    list.remove(&heap.spans, id);
                    span.freelist.store(0, Ordering::Relaxed);
                    heap.free_stack_span(id);
                    freed += 1;
                }
            }
        }
        drop(pools);
        for id in std::mem::take(&mut *self.deferred.lock()) {
            heap.free_stack_span(id);
            freed += 1;
        }
        if freed > 0 {
            log::debug!(target: "stack", "freed {} deferred stack spans", freed);
        }
        freed
    }

    pub fn pool_spans(&self, order: usize) -> usize {
        self.pools.lock()[order].len()
    }
}
