//! Shading, object scanning and draining of the grey queue.

use std::sync::atomic::Ordering;

use super::workbuf::{GcWork, WorkQueue};
use crate::memory::heap::ObjectRef;
use crate::memory::{Address, Heap, ObjectState, WordKind, WORD_SIZE};
use crate::runtime::RuntimeState;
use crate::sched::{Context, Task, TaskId};

/// Objects scanned between checks of a drain's stop condition.
const DRAIN_CHECK_EVERY: usize = 16;

/// Greys the object holding `addr`, if `addr` points into one. Interior
/// pointers count.
#[inline]
pub fn shade(heap: &Heap, q: &WorkQueue, gcw: &mut GcWork, addr: Address) {
    if addr.is_null() {
        return;
    }
    if let Some(r) = heap.lookup_object(addr) {
        grey_object(heap, q, gcw, r);
    }
}

/// White objects with pointers turn grey and are queued; pointer-free ones
/// turn black at once. Free, grey and black objects are left alone.
pub fn grey_object(heap: &Heap, q: &WorkQueue, gcw: &mut GcWork, r: ObjectRef) {
    let span = heap.span(r.span);
    let table = span.objects();
    if table.is_scannable(r.index) {
        if table.cas_state(r.index, ObjectState::White, ObjectState::Grey) {
            drop(table);
            gcw.put(q, r.base);
        }
    } else if table.cas_state(r.index, ObjectState::White, ObjectState::Black) {
        gcw.bytes_marked += span.elem_size() as u64;
    }
}

/// Shades every heap pointer held by the grey object at `obj` and blackens
/// it.
pub fn scan_object(heap: &Heap, q: &WorkQueue, gcw: &mut GcWork, obj: Address) {
    let r = match heap.lookup_object(obj) {
        Some(r) => r,
        None => crate::error::throw(&format!("scanobject: {} is not in the heap", obj)),
    };
    let span = heap.span(r.span);
    let elem = span.elem_size();
    let mut found = Vec::new();
    {
        let table = span.objects();
        if table.state(r.index) != ObjectState::Grey {
            crate::error::throw(&format!(
                "scanobject: {} is {:?}, not grey",
                obj,
                table.state(r.index)
            ));
        }
        let first = r.base.diff(span.base()) / WORD_SIZE;
        for w in 0..elem / WORD_SIZE {
            if table.word_kind(first + w) != WordKind::Pointer {
                continue;
            }
            let value = heap.arena.load(r.base.add_words(w));
            if value != 0 {
                found.push(Address::from_usize(value));
            }
        }
    }
    for p in found {
        shade(heap, q, gcw, p);
    }
    if !span
        .objects()
        .cas_state(r.index, ObjectState::Grey, ObjectState::Black)
    {
        crate::error::throw("scanobject: object changed colour while grey");
    }
    gcw.bytes_marked += elem as u64;
    gcw.scan_work += elem as i64;
}

/// Conservatively shades every word of `nwords` words at `lo` that points
/// into an allocated object.
pub fn scan_block(heap: &Heap, q: &WorkQueue, gcw: &mut GcWork, lo: Address, nwords: usize) {
    for w in 0..nwords {
        let value = heap.arena.load(lo.add_words(w));
        if value != 0 {
            shade(heap, q, gcw, Address::from_usize(value));
        }
        gcw.scan_work += WORD_SIZE as i64;
    }
}

/// Scans the used part of a task's stack.
pub fn scan_stack(heap: &Heap, q: &WorkQueue, gcw: &mut GcWork, task: &Task) {
    let ts = task.stack.lock();
    if ts.used != 0 {
        scan_block(heap, q, gcw, ts.stack.lo, ts.used);
    }
}

/// Scans grey objects until `stop` returns true or no work is left.
/// `blocking` waits in the work queue's rendezvous for other workers to
/// produce work; otherwise only immediately available work is taken.
pub fn drain(
    heap: &Heap,
    q: &WorkQueue,
    gcw: &mut GcWork,
    blocking: bool,
    mut stop: impl FnMut() -> bool,
) {
    let mut n = 0usize;
    loop {
        if n % DRAIN_CHECK_EVERY == 0 && stop() {
            return;
        }
        n += 1;
        if !q.has_shared_work() {
            gcw.balance(q);
        }
        let obj = if blocking { gcw.get(q) } else { gcw.try_get(q) };
        match obj {
            Some(obj) => scan_object(heap, q, gcw, obj),
            None => return,
        }
    }
}

/// Scans until at least `scan_work` units of work were done or no work is
/// immediately available. Returns the work done.
pub fn drain_n(heap: &Heap, q: &WorkQueue, gcw: &mut GcWork, scan_work: i64) -> i64 {
    let start = gcw.scan_work;
    while gcw.scan_work - start < scan_work {
        if !q.has_shared_work() {
            gcw.balance(q);
        }
        match gcw.try_get(q) {
            Some(obj) => scan_object(heap, q, gcw, obj),
            None => break,
        }
    }
    gcw.scan_work - start
}

impl RuntimeState {
    /// Scans the stack of the task running on `ctx` on its own thread, when
    /// the collector asked for it.
    pub(crate) fn scan_own_stack(&self, ctx: &Context, id: TaskId) {
        let task = self.sched.task(id);
        if !task.preempt_scan.swap(false, Ordering::AcqRel) {
            return;
        }
        let q = &self.gc.work;
        let mut gcw = ctx.gcw.lock();
        q.start_worker();
        scan_stack(&self.heap, q, &mut gcw, task);
        if self.gc.blacken_promptly() {
            gcw.dispose(q);
        }
        task.scan_cycle.store(self.gc.cycle(), Ordering::Release);
        if q.finish_worker() {
            self.gc.mark_done.wakeup();
        }
    }

    /// Whether a mark worker on `ctx` would find something to do.
    pub(crate) fn mark_work_available(&self, ctx: &Context) -> bool {
        let q = &self.gc.work;
        if q.has_shared_work() {
            return true;
        }
        match ctx.gcw.try_lock() {
            Some(gcw) => !gcw.is_empty(q),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::cache::Cache;
    use crate::memory::malloc::malloc;
    use crate::memory::TypeLayout;
    use crate::{Runtime, RuntimeConfig};

    fn state_of(heap: &Heap, addr: Address) -> ObjectState {
        let r = heap.lookup_object(addr).unwrap();
        let span = heap.span(r.span);
        let s = span.objects().state(r.index);
        s
    }

    #[test]
    fn shading_follows_pointers() {
        let heap = Heap::new(16 << 20);
        let q = WorkQueue::new();
        let mut cache = Cache::new();
        let leaf = malloc(&heap, &mut cache, &TypeLayout::noscan(16), ObjectState::White).addr;
        let node = malloc(&heap, &mut cache, &TypeLayout::new(24, &[0, 2]), ObjectState::White).addr;
        let unreachable = malloc(&heap, &mut cache, &TypeLayout::noscan(16), ObjectState::White).addr;
        heap.arena.store(node, leaf.to_usize());
        // A scalar word that happens to look like a pointer is not followed.
        heap.arena.store(node.add_words(1), unreachable.to_usize());

        let mut gcw = GcWork::new();
        shade(&heap, &q, &mut gcw, node);
        assert_eq!(state_of(&heap, node), ObjectState::Grey);
        drain(&heap, &q, &mut gcw, false, || false);
        assert_eq!(state_of(&heap, node), ObjectState::Black);
        assert_eq!(state_of(&heap, leaf), ObjectState::Black);
        assert_eq!(state_of(&heap, unreachable), ObjectState::White);
        assert_eq!(gcw.bytes_marked, 16 + 32);
        assert_eq!(q.puts.load(Ordering::Relaxed), q.gets.load(Ordering::Relaxed));
    }

    #[test]
    fn black_is_never_greyed_again() {
        let heap = Heap::new(16 << 20);
        let q = WorkQueue::new();
        let mut cache = Cache::new();
        let obj = malloc(&heap, &mut cache, &TypeLayout::pointers(2), ObjectState::Black).addr;
        let mut gcw = GcWork::new();
        shade(&heap, &q, &mut gcw, obj);
        assert_eq!(state_of(&heap, obj), ObjectState::Black);
        assert!(gcw.is_empty(&q));
    }

    #[test]
    fn conservative_block_scan_finds_interior_pointers() {
        let heap = Heap::new(16 << 20);
        let q = WorkQueue::new();
        let mut cache = Cache::new();
        let obj = malloc(&heap, &mut cache, &TypeLayout::noscan(64), ObjectState::White).addr;
        let block = malloc(&heap, &mut cache, &TypeLayout::noscan(32), ObjectState::Black).addr;
        heap.arena.store(block.add_words(2), obj.offset(40).to_usize());
        heap.arena.store(block.add_words(3), 12345);
        let mut gcw = GcWork::new();
        scan_block(&heap, &q, &mut gcw, block, 4);
        assert_eq!(state_of(&heap, obj), ObjectState::Black);
    }

    #[test]
    fn drain_n_stops_after_enough_work() {
        let heap = Heap::new(16 << 20);
        let q = WorkQueue::new();
        let mut cache = Cache::new();
        let mut gcw = GcWork::new();
        for _ in 0..10 {
            let obj = malloc(&heap, &mut cache, &TypeLayout::pointers(8), ObjectState::White).addr;
            shade(&heap, &q, &mut gcw, obj);
        }
        let done = drain_n(&heap, &q, &mut gcw, 100);
        assert!(done >= 100 && done < 10 * 64);
        assert!(!gcw.is_empty(&q));
        drain(&heap, &q, &mut gcw, false, || false);
        assert!(gcw.is_empty(&q));
        assert_eq!(gcw.scan_work, 10 * 64);
    }

    #[test]
    fn held_work_buffers_read_as_busy() {
        let rt = Runtime::new(RuntimeConfig::default().with_max_procs(2).with_gc_percent(None));
        let state = rt.state();
        let q = &state.gc.work;
        let ctx = state.sched.context(0);
        assert!(!state.mark_work_available(ctx));

        ctx.gcw.lock().put(q, Address::from_usize(64));
        assert!(state.mark_work_available(ctx));
        // A looker never waits on the owner of the buffers.
        let held = ctx.gcw.lock();
        let other = std::thread::scope(|s| s.spawn(|| state.mark_work_available(ctx)).join());
        assert!(!other.unwrap());
        drop(held);

        ctx.gcw.lock().dispose(q);
        assert!(state.mark_work_available(ctx));
    }
}
