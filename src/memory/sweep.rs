//! Sweeping: reclaiming white objects after marking.
//!
//! A span whose sweep generation is `sg - 2` is unswept; whoever moves it to
//! `sg - 1` with a CAS owns the sweep and publishes `sg` when finished. The
//! background sweeper, allocation-time reclaim and `Central::cache_span`
//! all race through that CAS.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::heap::Heap;
use super::span::{ObjectState, SpanId, SpanLocation, SpanState};
use super::stats::HeapCounters;
use crate::error::throw;

pub struct SweepState {
    spans: Mutex<Vec<SpanId>>,
    next: AtomicUsize,
    done: AtomicBool,
    /// Spans swept by the background sweeper.
    pub nbgsweep: AtomicU64,
    /// Spans swept on the allocation path or at the start of a cycle.
    pub npausesweep: AtomicU64,
}

impl Default for SweepState {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepState {
    pub fn new() -> Self {
        Self {
            spans: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            done: AtomicBool::new(true),
            nbgsweep: AtomicU64::new(0),
            npausesweep: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Installs the set of spans to sweep for the new generation.
    pub fn prepare(&self, spans: Vec<SpanId>) {
        let mut list = self.spans.lock();
        *list = spans;
        self.next.store(0, Ordering::Release);
        self.done.store(list.is_empty(), Ordering::Release);
    }

    fn claim(&self) -> Option<SpanId> {
        let list = self.spans.lock();
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        match list.get(index) {
            Some(&id) => Some(id),
            None => {
                self.done.store(true, Ordering::Release);
                None
            }
        }
    }
}

/// Sweeps one span from the current set. Returns the number of pages
/// examined, `Some(0)` for a span somebody else swept, or `None` once the set
/// is exhausted.
pub fn sweep_one(heap: &Heap) -> Option<usize> {
    loop {
        let id = heap.sweep.claim()?;
        let span = heap.span(id);
        let sg = heap.sweepgen();
        let gen = span.sweep_gen.load(Ordering::Acquire);
        if span.state() != SpanState::InUse || gen != sg.wrapping_sub(2) {
            continue;
        }
        if span
            .sweep_gen
            .compare_exchange(gen, sg.wrapping_sub(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }
        let npages = span.npages();
        sweep_span(heap, id, false);
        return Some(npages);
    }
}

/// Sweeps until at least `npages` pages went back to the heap or nothing is
/// left to sweep.
pub fn reclaim(heap: &Heap, npages: usize) {
    let mut reclaimed = 0;
    while reclaimed < npages {
        let before = HeapCounters::load(&heap.counters.heap_inuse);
        if sweep_one(heap).is_none() {
            break;
        }
        heap.sweep.npausesweep.fetch_add(1, Ordering::Relaxed);
        let after = HeapCounters::load(&heap.counters.heap_inuse);
        reclaimed += before.saturating_sub(after) / super::PAGE_SIZE;
    }
}

/// Sweeps everything left over from the previous cycle.
pub fn finish(heap: &Heap) -> usize {
    let mut n = 0;
    while sweep_one(heap).is_some() {
        n += 1;
    }
    heap.sweep.npausesweep.fetch_add(n as u64, Ordering::Relaxed);
    n
}

/// Sweeps span `id`, which the caller moved to generation `sg - 1`. Returns
/// whether the span went back to the heap.
pub fn sweep_span(heap: &Heap, id: SpanId, preserve: bool) -> bool {
    let span = heap.span(id);
    let sg = heap.sweepgen();
    if span.state() != SpanState::InUse || span.sweep_gen.load(Ordering::Acquire) != sg.wrapping_sub(1) {
        throw(&format!(
            "sweep: span {:?} in state {:?} with generation {} (heap at {})",
            id,
            span.state(),
            span.sweep_gen.load(Ordering::Relaxed),
            sg
        ));
    }

    let class = span.size_class();
    let elem = span.elem_size();
    let table = span.objects();
    let mut head = span.freelist.load(Ordering::Acquire);
    let mut nfreed = 0;
    let mut freed_scan = 0;
    for index in 0..table.len() {
        match table.state(index) {
            ObjectState::White => {
                table.set_state(index, ObjectState::Free);
                if table.is_scannable(index) {
                    table.set_scannable(index, false);
                    freed_scan += elem;
                }
                if class != 0 {
                    let obj = span.object_base(index);
                    heap.arena.store(obj, head);
                    head = obj.to_usize();
                }
                nfreed += 1;
            }
            ObjectState::Black => table.set_state(index, ObjectState::White),
            ObjectState::Grey => throw(&format!(
                "sweep: grey object {} in span {:?} after mark termination",
                span.object_base(index),
                id
            )),
            ObjectState::Free => {}
        }
    }
    drop(table);

    let counters = &heap.counters;
    if nfreed > 0 {
        HeapCounters::sub(&counters.heap_objects, nfreed);
        HeapCounters::sub(&counters.heap_scan, freed_scan);
        counters.nfree.fetch_add(nfreed as u64, Ordering::Relaxed);
    }

    if class == 0 {
        if nfreed > 0 {
            counters.nlarge_free.fetch_add(1, Ordering::Relaxed);
            span.alloc_count.store(0, Ordering::Relaxed);
            span.sweep_gen.store(sg, Ordering::Release);
            if span.location() == SpanLocation::Busy {
                span.set_location(SpanLocation::Nowhere);
            }
            heap.free_span(id);
            return true;
        }
        span.sweep_gen.store(sg, Ordering::Release);
        return false;
    }

    if nfreed > 0 {
        span.freelist.store(head, Ordering::Release);
        span.alloc_count.fetch_sub(nfreed, Ordering::Relaxed);
        span.needzero.store(true, Ordering::Relaxed);
        if heap.central(class).free_span(heap, id, preserve) {
            return true;
        }
    }
    span.sweep_gen.store(sg, Ordering::Release);
    false
}
