use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use super::arena::Arena;
use super::central::Central;
use super::fixalloc::FixAlloc;
use super::pagemap::PageMap;
use super::size_class::{class_size, num_classes};
use super::span::{Span, SpanId, SpanList, SpanLocation, SpanState};
use super::stats::HeapCounters;
use super::sweep::SweepState;
use super::{Address, MemStats, HEAP_ALLOC_CHUNK, HEAP_GROW_UNIT, MAX_HEAP_LIST, PAGE_SIZE};
use crate::error::throw;
use crate::utils::{align_usize, formatted_size, nanotime};

/// Reference to an allocated object: its span, slot index and base address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub span: SpanId,
    pub index: usize,
    pub base: Address,
}

struct HeapLists {
    /// `free[n]` holds free spans of exactly `n` pages.
    free: Vec<SpanList>,
    /// Free spans of `MAX_HEAP_LIST` pages or more.
    large: SpanList,
}

impl HeapLists {
    fn list_for(&mut self, npages: usize) -> &mut SpanList {
        if npages < MAX_HEAP_LIST {
            &mut self.free[npages]
        } else {
            &mut self.large
        }
    }
}

/// The page heap: every span, the page table, the free lists and one
/// [`Central`] per size class.
pub struct Heap {
    pub arena: Arena,
    pub spans: FixAlloc<Span>,
    pub pagemap: PageMap,
    lists: Mutex<HeapLists>,
    centrals: Box<[Central]>,
    /// Advanced by 2 at the end of each mark phase. A span whose generation
    /// is `sweepgen - 2` needs sweeping, `sweepgen - 1` is being swept and
    /// `sweepgen` is swept.
    pub sweepgen: AtomicU32,
    pub sweep: SweepState,
    pub counters: HeapCounters,
}

impl Heap {
    pub fn new(max_heap: usize) -> Self {
        let arena = Arena::new(max_heap);
        let max_pages = arena.max_pages();
        let centrals = (0..num_classes()).map(Central::new).collect();
        Self {
            spans: FixAlloc::new(max_pages + 1024),
            pagemap: PageMap::new(max_pages),
            lists: Mutex::new(HeapLists {
                free: (0..MAX_HEAP_LIST)
                    .map(|_| SpanList::new(SpanLocation::HeapFree))
                    .collect(),
                large: SpanList::new(SpanLocation::HeapLarge),
            }),
            centrals,
            arena,
            sweepgen: AtomicU32::new(4),
            sweep: SweepState::new(),
            counters: HeapCounters::default(),
        }
    }

    #[inline]
    pub fn span(&self, id: SpanId) -> &Span {
        self.spans.get(id.raw())
    }

    #[inline]
    pub fn central(&self, class: usize) -> &Central {
        &self.centrals[class]
    }

    pub fn sweepgen(&self) -> u32 {
        self.sweepgen.load(Ordering::Acquire)
    }

    /// Allocates an in-use span of `npages` pages for objects of `size_class`
    /// (0 for a single large object).
    pub fn alloc_span(&self, npages: usize, size_class: usize) -> SpanId {
        // Sweep enough to make room before taking fresh pages.
        if !self.sweep.is_done() {
            super::sweep::reclaim(self, npages);
        }

        let mut lists = self.lists.lock();
        let id = match self.alloc_span_locked(&mut lists, npages) {
            Some(id) => id,
            None => {
                drop(lists);
                self.out_of_memory(npages)
            }
        };

        let span = self.span(id);
        let (elem, nelems) = if size_class == 0 {
            (npages * PAGE_SIZE, 1)
        } else {
            let elem = class_size(size_class);
            (elem, npages * PAGE_SIZE / elem)
        };
        span.init_objects(size_class, elem, nelems);
        span.freelist.store(0, Ordering::Relaxed);
        span.alloc_count.store(0, Ordering::Relaxed);
        span.sweep_gen.store(self.sweepgen(), Ordering::Release);
        span.set_state(SpanState::InUse);
        if size_class == 0 {
            span.set_location(SpanLocation::Busy);
        }
        HeapCounters::add(&self.counters.heap_inuse, npages * PAGE_SIZE);
        drop(lists);

        log::trace!(
            target: "heap",
            "alloc span {:?} pages {}+{} class {}",
            id,
            span.start(),
            npages,
            size_class
        );
        id
    }

    /// Allocates a span for task stacks.
    pub fn alloc_stack_span(&self, npages: usize) -> SpanId {
        let mut lists = self.lists.lock();
        let id = match self.alloc_span_locked(&mut lists, npages) {
            Some(id) => id,
            None => {
                drop(lists);
                self.out_of_memory(npages)
            }
        };
        let span = self.span(id);
        span.clear_objects();
        span.freelist.store(0, Ordering::Relaxed);
        span.alloc_count.store(0, Ordering::Relaxed);
        span.set_state(SpanState::Stack);
        HeapCounters::add(&self.counters.stacks_inuse, npages * PAGE_SIZE);
        id
    }

    /// Returns an in-use span to the heap.
    pub fn free_span(&self, id: SpanId) {
        let span = self.span(id);
        let mut lists = self.lists.lock();
        if span.state() != SpanState::InUse {
            throw(&format!(
                "free of span in invalid state: span {:?} at {} is {:?}",
                id,
                span.base(),
                span.state()
            ));
        }
        HeapCounters::sub(&self.counters.heap_inuse, span.bytes());
        span.clear_objects();
        span.needzero.store(true, Ordering::Relaxed);
        self.free_span_locked(&mut lists, id, 0);
    }

    pub fn free_stack_span(&self, id: SpanId) {
        let span = self.span(id);
        let mut lists = self.lists.lock();
        if span.state() != SpanState::Stack {
            throw(&format!(
                "free of span in invalid state: stack span {:?} is {:?}",
                id,
                span.state()
            ));
        }
        HeapCounters::sub(&self.counters.stacks_inuse, span.bytes());
        span.needzero.store(true, Ordering::Relaxed);
        self.free_span_locked(&mut lists, id, 0);
    }

    fn out_of_memory(&self, npages: usize) -> ! {
        log::error!(
            target: "heap",
            "out of memory allocating {} (heap sys {}, in use {})",
            formatted_size(npages * PAGE_SIZE),
            formatted_size(HeapCounters::load(&self.counters.heap_sys)),
            formatted_size(HeapCounters::load(&self.counters.heap_inuse))
        );
        throw("out of memory")
    }

    fn alloc_span_locked(&self, lists: &mut HeapLists, npages: usize) -> Option<SpanId> {
        let id = match self.take_free(lists, npages) {
            Some(id) => id,
            None => {
                if !self.grow(lists, npages) {
                    return None;
                }
                self.take_free(lists, npages)?
            }
        };

        let span = self.span(id);
        if span.state() != SpanState::Free {
            throw(&format!("alloc_span: span {:?} is not free", id));
        }

        let released = span.released_pages.swap(0, Ordering::Relaxed);
        let mut handed_out = released;

        if span.npages() > npages {
            // Trim the tail into a new free span. Released pages are counted,
            // not located, so the tail keeps its share of them.
            let rest = self.new_span_record();
            let tail = self.span(rest);
            let tail_pages = span.npages() - npages;
            let tail_released = released * tail_pages / span.npages();
            tail.init(rest, span.start() + npages, tail_pages);
            tail.released_pages.store(tail_released, Ordering::Relaxed);
            handed_out -= tail_released;
            span.set_npages(npages);
            self.pagemap.set_range(tail.start(), tail.npages(), Some(rest));
            tail.needzero
                .store(span.needzero.load(Ordering::Relaxed), Ordering::Relaxed);
            self.free_span_locked(lists, rest, span.unused_since.load(Ordering::Relaxed));
        }
        if handed_out > 0 {
            HeapCounters::sub(&self.counters.heap_released, handed_out * PAGE_SIZE);
        }

        span.unused_since.store(0, Ordering::Relaxed);
        Some(id)
    }

    fn new_span_record(&self) -> SpanId {
        match SpanId::from_raw(self.spans.alloc()) {
            Some(id) => id,
            None => throw("span record allocator returned nil id"),
        }
    }

    fn take_free(&self, lists: &mut HeapLists, npages: usize) -> Option<SpanId> {
        for n in npages..MAX_HEAP_LIST {
            if let Some(id) = lists.free[n].pop_front(&self.spans) {
                return Some(id);
            }
        }

        // Best fit among the large spans, lowest address on ties.
        let mut best: Option<(SpanId, usize, usize)> = None;
        for id in lists.large.ids(&self.spans) {
            let span = self.span(id);
            let (n, start) = (span.npages(), span.start());
            if n < npages {
                continue;
            }
            match best {
                Some((_, bn, bs)) if n > bn || (n == bn && start > bs) => {}
                _ => best = Some((id, n, start)),
            }
        }
        let (id, _, _) = best?;
        lists.large.remove(&self.spans, id);
        Some(id)
    }

    /// Adds at least `npages` pages to the heap. Growth is in whole 64 KiB
    /// units and at least 1 MiB when the reservation allows it.
    fn grow(&self, lists: &mut HeapLists, npages: usize) -> bool {
        let unit = HEAP_GROW_UNIT / PAGE_SIZE;
        let mut ask = align_usize(npages, unit).max(HEAP_ALLOC_CHUNK / PAGE_SIZE);
        let first = match self.arena.sys_alloc(ask) {
            Some(first) => first,
            None => {
                ask = align_usize(npages, unit);
                match self.arena.sys_alloc(ask) {
                    Some(first) => first,
                    None => {
                        // The reservation might not hold a whole growth unit.
                        ask = npages;
                        match self.arena.sys_alloc(ask) {
                            Some(first) => first,
                            None => return false,
                        }
                    }
                }
            }
        };

        let id = self.new_span_record();
        let span = self.span(id);
        span.init(id, first, ask);
        self.pagemap.set_range(first, ask, Some(id));
        HeapCounters::add(&self.counters.heap_sys, ask * PAGE_SIZE);
        log::debug!(
            target: "heap",
            "grow heap by {} (pages {}..{})",
            formatted_size(ask * PAGE_SIZE),
            first,
            first + ask
        );
        self.free_span_locked(lists, id, 0);
        true
    }

    /// Marks the span free, merges it with free neighbours and files it in
    /// the free lists.
    fn free_span_locked(&self, lists: &mut HeapLists, id: SpanId, unused_since: u64) {
        let span = self.span(id);
        match span.location() {
            SpanLocation::Nowhere | SpanLocation::Busy | SpanLocation::Cached => {
                span.set_location(SpanLocation::Nowhere)
            }
            other => throw(&format!("free_span: span {:?} still linked in {:?}", id, other)),
        }
        span.set_state(SpanState::Free);
        span.freelist.store(0, Ordering::Relaxed);
        span.unused_since.store(
            if unused_since == 0 { nanotime() } else { unused_since },
            Ordering::Relaxed,
        );

        // Coalesce with the left neighbour.
        if span.start() > 1 {
            if let Some(left) = self.pagemap.get(span.start() - 1) {
                let l = self.span(left);
                if left != id
                    && l.state() == SpanState::Free
                    && l.start() + l.npages() == span.start()
                {
                    lists.list_for(l.npages()).remove(&self.spans, left);
                    span.set_start(l.start());
                    span.set_npages(span.npages() + l.npages());
                    self.absorb(span, l);
                    self.pagemap.set_range(l.start(), l.npages(), Some(id));
                    self.retire(left);
                }
            }
        }

        // Coalesce with the right neighbour.
        let end = span.start() + span.npages();
        if let Some(right) = self.pagemap.get(end) {
            let r = self.span(right);
            if right != id && r.state() == SpanState::Free && r.start() == end {
                lists.list_for(r.npages()).remove(&self.spans, right);
                span.set_npages(span.npages() + r.npages());
                self.absorb(span, r);
                self.pagemap.set_range(r.start(), r.npages(), Some(id));
                self.retire(right);
            }
        }

        lists.list_for(span.npages()).push_front(&self.spans, id);
    }

    fn absorb(&self, into: &Span, from: &Span) {
        into.released_pages.fetch_add(
            from.released_pages.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        if from.needzero.load(Ordering::Relaxed) {
            into.needzero.store(true, Ordering::Relaxed);
        }
    }

    fn retire(&self, id: SpanId) {
        let span = self.span(id);
        span.set_state(SpanState::Dead);
        span.set_location(SpanLocation::Nowhere);
        self.spans.free(id.raw());
    }

    /// Span owning `addr`, whatever its state.
    pub fn lookup(&self, addr: Address) -> Option<SpanId> {
        if !self.arena.contains(addr) {
            return None;
        }
        let id = self.pagemap.get(addr.page())?;
        if self.span(id).contains(addr) {
            Some(id)
        } else {
            None
        }
    }

    /// Resolves a possibly interior pointer to the allocated object holding it.
    pub fn lookup_object(&self, addr: Address) -> Option<ObjectRef> {
        let id = self.lookup(addr)?;
        let span = self.span(id);
        if span.state() != SpanState::InUse {
            return None;
        }
        let index = span.object_index(addr)?;
        Some(ObjectRef {
            span: id,
            index,
            base: span.object_base(index),
        })
    }

    /// Releases the pages of spans that have been free for longer than
    /// `limit_ns`. Returns the number of bytes released.
    pub fn scavenge(&self, now: u64, limit_ns: u64) -> usize {
        let lists = self.lists.lock();
        let mut released = 0;
        for list in lists.free.iter().chain(std::iter::once(&lists.large)) {
            for id in list.ids(&self.spans) {
                let span = self.span(id);
                let since = span.unused_since.load(Ordering::Relaxed);
                let already = span.released_pages.load(Ordering::Relaxed);
                if already >= span.npages() || now.saturating_sub(since) <= limit_ns {
                    continue;
                }
                // Released memory reads back as zero.
                self.arena.clear(span.base(), span.bytes());
                span.released_pages.store(span.npages(), Ordering::Relaxed);
                span.needzero.store(false, Ordering::Relaxed);
                released += (span.npages() - already) * PAGE_SIZE;
            }
        }
        if released > 0 {
            HeapCounters::add(&self.counters.heap_released, released);
        }
        drop(lists);

        if released > 0 {
            log::debug!(target: "heap", "scavenger released {}", formatted_size(released));
        }
        released
    }

    /// Releases every free span regardless of age.
    pub fn scavenge_all(&self) -> usize {
        self.scavenge(u64::MAX, 0)
    }

    /// Spans currently holding objects, in record order.
    pub fn in_use_spans(&self) -> Vec<SpanId> {
        (1..self.spans.high_water())
            .filter_map(SpanId::from_raw)
            .filter(|&id| self.span(id).state() == SpanState::InUse)
            .collect()
    }

    /// Total pages sitting in the free lists.
    pub fn free_pages(&self) -> usize {
        let lists = self.lists.lock();
        lists
            .free
            .iter()
            .chain(std::iter::once(&lists.large))
            .flat_map(|list| list.ids(&self.spans))
            .map(|id| self.span(id).npages())
            .sum()
    }

    /// Number of spans in the free lists.
    pub fn free_span_count(&self) -> usize {
        let lists = self.lists.lock();
        lists.free.iter().map(|l| l.len()).sum::<usize>() + lists.large.len()
    }

    /// Checks that every page handed out belongs to exactly one span whose
    /// range contains it, and that spans do not overlap.
    pub fn verify(&self) -> Result<(), String> {
        let lists = self.lists.lock();
        let used = self.arena.used_pages();
        let mut page = 1;
        while page < used {
            let id = self
                .pagemap
                .get(page)
                .ok_or_else(|| format!("page {} has no span", page))?;
            let span = self.span(id);
            if span.state() == SpanState::Dead {
                return Err(format!("page {} maps to dead span {:?}", page, id));
            }
            if span.start() != page {
                return Err(format!(
                    "page {} maps to span {:?} starting at {}",
                    page,
                    id,
                    span.start()
                ));
            }
            for p in page..page + span.npages() {
                if self.pagemap.get(p) != Some(id) {
                    return Err(format!("page {} of span {:?} maps elsewhere", p, id));
                }
            }
            page += span.npages();
        }
        if page != used {
            return Err(format!("last span runs past the arena ({} > {})", page, used));
        }

        let released: usize = lists
            .free
            .iter()
            .chain(std::iter::once(&lists.large))
            .flat_map(|list| list.ids(&self.spans))
            .map(|id| self.span(id).released_pages.load(Ordering::Relaxed))
            .sum();
        let counted = HeapCounters::load(&self.counters.heap_released);
        if released * PAGE_SIZE != counted {
            return Err(format!(
                "free spans hold {} released bytes, counter says {}",
                released * PAGE_SIZE,
                counted
            ));
        }
        Ok(())
    }

    pub fn fill_stats(&self, stats: &mut MemStats) {
        let c = &self.counters;
        stats.heap_sys = HeapCounters::load(&c.heap_sys);
        stats.heap_inuse = HeapCounters::load(&c.heap_inuse);
        stats.stacks_inuse = HeapCounters::load(&c.stacks_inuse);
        stats.heap_released = HeapCounters::load(&c.heap_released);
        stats.heap_idle = stats
            .heap_sys
            .saturating_sub(stats.heap_inuse + stats.stacks_inuse);
        stats.heap_live = HeapCounters::load(&c.heap_live);
        stats.heap_objects = HeapCounters::load(&c.heap_objects);
        stats.nmalloc = c.nmalloc.load(Ordering::Relaxed);
        stats.nfree = c.nfree.load(Ordering::Relaxed);
        stats.span_inuse = self.spans.inuse();
        stats.span_sys = self.spans.sys();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::size_class::size_to_class;

    fn make_heap() -> Heap {
        Heap::new(16 << 20)
    }

    #[test]
    fn alloc_grows_and_trims() {
        let heap = make_heap();
        let a = heap.alloc_span(1, 0);
        let span = heap.span(a);
        assert_eq!(span.npages(), 1);
        assert_eq!(span.state(), SpanState::InUse);
        // The first growth takes a whole chunk and leaves the rest free.
        assert_eq!(heap.free_pages(), HEAP_ALLOC_CHUNK / PAGE_SIZE - 1);
        heap.verify().unwrap();
    }

    #[test]
    fn free_coalesces_neighbours() {
        let heap = make_heap();
        let a = heap.alloc_span(2, 0);
        let b = heap.alloc_span(3, 0);
        let c = heap.alloc_span(4, 0);
        let total = HEAP_ALLOC_CHUNK / PAGE_SIZE;
        assert_eq!(heap.free_pages(), total - 9);

        heap.free_span(a);
        heap.free_span(c);
        // a alone on the left, c merged with the free tail.
        assert_eq!(heap.free_span_count(), 2);
        heap.free_span(b);
        assert_eq!(heap.free_span_count(), 1);
        assert_eq!(heap.free_pages(), total);
        heap.verify().unwrap();
    }

    #[test]
    fn never_coalesces_across_stack_spans() {
        let heap = make_heap();
        let a = heap.alloc_span(2, 0);
        let s = heap.alloc_stack_span(4);
        let b = heap.alloc_span(2, 0);
        heap.free_span(a);
        heap.free_span(b);
        // The stack span keeps the two free runs apart.
        assert_eq!(heap.free_span_count(), 2);
        heap.free_stack_span(s);
        assert_eq!(heap.free_span_count(), 1);
        heap.verify().unwrap();
    }

    #[test]
    fn exact_list_before_best_fit() {
        let heap = make_heap();
        let a = heap.alloc_span(5, 0);
        let _guard = heap.alloc_span(1, 0);
        let base = heap.span(a).start();
        heap.free_span(a);
        let again = heap.alloc_span(5, 0);
        assert_eq!(heap.span(again).start(), base);
    }

    #[test]
    fn large_spans_use_best_fit() {
        let heap = Heap::new(64 << 20);
        let big = heap.alloc_span(300, 0);
        let _g1 = heap.alloc_span(1, 0);
        let bigger = heap.alloc_span(400, 0);
        let _g2 = heap.alloc_span(1, 0);
        let (b300, b400) = (heap.span(big).start(), heap.span(bigger).start());
        heap.free_span(bigger);
        heap.free_span(big);
        let s = heap.alloc_span(200, 0);
        assert_eq!(heap.span(s).start(), b300);
        let t = heap.alloc_span(350, 0);
        assert_eq!(heap.span(t).start(), b400);
        heap.verify().unwrap();
    }

    #[test]
    #[should_panic(expected = "free of span in invalid state")]
    fn double_free_is_fatal() {
        let heap = make_heap();
        let a = heap.alloc_span(1, 0);
        heap.free_span(a);
        heap.free_span(a);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn exhausted_reservation_is_fatal() {
        let heap = Heap::new(2 << 20);
        heap.alloc_span(1024, 0);
    }

    #[test]
    fn small_class_span_layout() {
        let heap = make_heap();
        let class = size_to_class(48);
        let id = heap.alloc_span(1, class);
        let span = heap.span(id);
        assert_eq!(span.elem_size(), 48);
        assert_eq!(span.nelems(), PAGE_SIZE / 48);
        let obj = heap.lookup_object(span.base().offset(50)).unwrap();
        assert_eq!(obj.index, 1);
        assert_eq!(obj.base, span.base().offset(48));
        assert!(heap.lookup_object(Address::from_usize(16)).is_none());
    }

    #[test]
    fn scavenger_releases_idle_spans() {
        let heap = make_heap();
        let a = heap.alloc_span(4, 0);
        let base = heap.span(a).base();
        heap.arena.store(base, 99);
        heap.free_span(a);
        let released = heap.scavenge(nanotime() + 1_000_000_000, 1);
        assert_eq!(released, HEAP_ALLOC_CHUNK);
        assert_eq!(heap.arena.load(base), 0);
        assert_eq!(HeapCounters::load(&heap.counters.heap_released), HEAP_ALLOC_CHUNK);
        // Reusing pages takes only those out of the released count.
        heap.alloc_span(4, 0);
        assert_eq!(
            HeapCounters::load(&heap.counters.heap_released),
            HEAP_ALLOC_CHUNK - 4 * PAGE_SIZE
        );
        assert_eq!(heap.scavenge(nanotime(), u64::MAX), 0);
        heap.verify().unwrap();
    }

    #[test]
    fn trimmed_tail_stays_released() {
        let heap = make_heap();
        let a = heap.alloc_span(8, 0);
        heap.free_span(a);
        assert_eq!(heap.scavenge_all(), HEAP_ALLOC_CHUNK);

        let b = heap.alloc_span(1, 0);
        assert_eq!(heap.span(b).released_pages.load(Ordering::Relaxed), 0);
        assert_eq!(
            HeapCounters::load(&heap.counters.heap_released),
            HEAP_ALLOC_CHUNK - PAGE_SIZE
        );
        // The tail is still released, so there is nothing left to scavenge.
        assert_eq!(heap.scavenge_all(), 0);
        heap.verify().unwrap();

        // Freeing the used page back makes it the only unreleased one.
        heap.free_span(b);
        assert_eq!(heap.scavenge_all(), PAGE_SIZE);
        assert_eq!(HeapCounters::load(&heap.counters.heap_released), HEAP_ALLOC_CHUNK);
        heap.verify().unwrap();
    }
}
