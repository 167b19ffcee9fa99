//! Background mark workers.
//!
//! Every context owns one worker task. It sleeps as a waiting system task
//! and is made runnable by the scheduler when the pacer hands the context a
//! worker token (dedicated or fractional) or when the context has nothing
//! else to run (idle).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::mark::drain;
use super::pacer::{MarkWorkerMode, FORCE_PREEMPT_NS};
use crate::runtime::RuntimeState;
use crate::sched::{Context, Step, TaskCtx, TaskId, TaskStatus, WaitReason};
use crate::trace::TraceEvent;
use crate::utils::nanotime;

impl RuntimeState {
    /// Creates the worker task of every context that has none yet.
    pub(crate) fn ensure_mark_workers(self: &Arc<Self>) {
        for ctx in &self.sched.contexts {
            if ctx.mark_worker().is_some() {
                continue;
            }
            let id = self.newproc(None, Box::new(mark_worker_step), true);
            self.sched.task(id).set_wait_reason(WaitReason::MarkWorkerIdle);
            ctx.mark_worker.store(id.raw(), Ordering::Release);
            log::trace!(target: "gc", "mark worker {:?} created for context {}", id, ctx.id);
        }
    }

    /// The worker `ctx` should run now, if the pacer wants one.
    pub(crate) fn find_runnable_gc_worker(&self, ctx: &Context) -> Option<TaskId> {
        if !self.gc.blacken_enabled() {
            return None;
        }
        let id = ctx.mark_worker()?;
        if self.sched.task(id).status() != TaskStatus::Waiting || !self.mark_work_available(ctx) {
            return None;
        }
        let mode = self.gc.pacer.find_runnable_gc_worker(nanotime());
        if mode == MarkWorkerMode::None {
            return None;
        }
        self.resume_worker(ctx, id, mode)
    }

    /// Runs the worker of `ctx` in idle mode when there is marking to do.
    pub(crate) fn idle_gc_worker(&self, ctx: &Context) -> Option<TaskId> {
        if !self.gc.blacken_enabled() {
            return None;
        }
        let id = ctx.mark_worker()?;
        if self.sched.task(id).status() != TaskStatus::Waiting || !self.mark_work_available(ctx) {
            return None;
        }
        self.resume_worker(ctx, id, MarkWorkerMode::Idle)
    }

    fn resume_worker(&self, ctx: &Context, id: TaskId, mode: MarkWorkerMode) -> Option<TaskId> {
        ctx.set_mark_mode(mode);
        if !self.sched.task(id).try_resume() {
            ctx.set_mark_mode(MarkWorkerMode::None);
            self.gc.pacer.worker_done(mode, 0);
            return None;
        }
        self.trace(TraceEvent::TaskUnblock { task: id });
        Some(id)
    }
}

/// Body of a mark worker: one drain per activation, then park.
fn mark_worker_step(tctx: &mut TaskCtx) -> Step {
    let rt = tctx.runtime().clone();
    let me = tctx.id();
    let ctx = tctx.context();
    let mode = ctx.mark_mode();
    ctx.set_mark_mode(MarkWorkerMode::None);
    if mode == MarkWorkerMode::None {
        return Step::Park;
    }
    if !rt.gc.blacken_enabled() {
        rt.gc.pacer.worker_done(mode, 0);
        return Step::Park;
    }

    let start = nanotime();
    ctx.mark_start.store(start, Ordering::Relaxed);
    let sched = &rt.sched;
    let task = sched.task(me);
    let q = &rt.gc.work;
    let stop_world = || {
        sched.gcwaiting.load(Ordering::Acquire) || ctx.run_safe_point_fn.load(Ordering::Acquire)
    };

    let (done, credit) = {
        let mut gcw = ctx.gcw.lock();
        let before = gcw.scan_work;
        q.start_worker();
        match mode {
            MarkWorkerMode::Dedicated => drain(&rt.heap, q, &mut gcw, false, &stop_world),
            MarkWorkerMode::Fractional => drain(&rt.heap, q, &mut gcw, false, || {
                stop_world()
                    || task.preempt.load(Ordering::Acquire)
                    || (nanotime() - start) as i64 >= FORCE_PREEMPT_NS
            }),
            MarkWorkerMode::Idle => drain(&rt.heap, q, &mut gcw, false, || {
                stop_world()
                    || task.preempt.load(Ordering::Acquire)
                    || !ctx.runq_is_empty()
                    || !sched.poller.is_empty()
                    || sched.lock.try_lock().map_or(false, |inner| !inner.runq.is_empty())
            }),
            MarkWorkerMode::None => {}
        }
        let credit = gcw.scan_work - before;
        if rt.gc.blacken_promptly() {
            gcw.dispose(q);
        }
        (q.finish_worker(), credit)
    };

    rt.gc.pacer.bg_scan_credit.fetch_add(credit, Ordering::AcqRel);
    let elapsed = (nanotime() - start) as i64;
    rt.gc.pacer.worker_done(mode, elapsed);
    log::trace!(
        target: "gc",
        "{:?} mark worker on context {} ran {}us, scan work {}",
        mode,
        ctx.id,
        elapsed / 1000,
        credit
    );
    if done {
        rt.gc.mark_done.wakeup();
    }
    Step::Park
}
