//! Allocation on behalf of tasks, with mark assists.
//!
//! While the collector is marking, every allocation incurs assist debt in
//! units of scan work (`size * assist_ratio`). The debt is paid first from
//! the credit background workers accumulated, then by scanning on the
//! allocating task. This keeps allocation from outrunning marking.

use std::sync::atomic::Ordering;

use super::mark::drain_n;
use super::GcPhase;
use crate::memory::malloc::malloc;
use crate::memory::stats::HeapCounters;
use crate::memory::{Address, ObjectState, TypeLayout};
use crate::runtime::RuntimeState;
use crate::sched::{Context, Task};
use crate::utils::nanotime;

impl RuntimeState {
    /// Allocates an object for the task running on `ctx`. Objects allocated
    /// during a cycle are black.
    pub(crate) fn mallocgc(&self, ctx: &Context, task: &Task, layout: &TypeLayout) -> Address {
        let gc = &self.gc;
        if gc.blacken_enabled() && layout.size() != 0 {
            self.assist_alloc(ctx, task, layout.size());
        }

        let marking = gc.phase() != GcPhase::Off;
        let color = if marking {
            ObjectState::Black
        } else {
            ObjectState::White
        };
        let a = {
            let mut cache = ctx.cache.lock();
            malloc(&self.heap, &mut cache, layout, color)
        };
        if marking && a.size != 0 {
            gc.work.bytes_marked.fetch_add(a.size as u64, Ordering::Relaxed);
        }

        if self.config.gc_enabled()
            && !marking
            && HeapCounters::load(&self.heap.counters.heap_live) >= gc.pacer.next_gc()
        {
            gc.request_cycle();
        }
        a.addr
    }

    fn assist_alloc(&self, ctx: &Context, task: &Task, size: usize) {
        let pacer = &self.gc.pacer;
        let cost = (size as f64 * pacer.assist_ratio()) as i64;
        let mut debt = task.assist_debt.fetch_add(cost, Ordering::AcqRel) + cost;
        if debt <= 0 {
            return;
        }

        let credit = pacer.bg_scan_credit.load(Ordering::Acquire);
        if credit > 0 {
            let stolen = credit.min(debt);
            pacer.bg_scan_credit.fetch_sub(stolen, Ordering::AcqRel);
            debt -= stolen;
            if debt <= 0 {
                task.assist_debt.store(debt, Ordering::Release);
                return;
            }
        }

        let start = nanotime();
        let q = &self.gc.work;
        let done = {
            let mut gcw = ctx.gcw.lock();
            q.start_worker();
            debt -= drain_n(&self.heap, q, &mut gcw, debt);
            if self.gc.blacken_promptly() {
                gcw.dispose(q);
            }
            q.finish_worker()
        };
        if done {
            self.gc.mark_done.wakeup();
        }
        // Whatever could not be paid because no work was left is forgiven.
        task.assist_debt.store(debt.min(0), Ordering::Release);
        pacer
            .assist_time
            .fetch_add((nanotime() - start) as i64, Ordering::Relaxed);
    }
}
