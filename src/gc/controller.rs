//! The collector's control thread.
//!
//! The controller owns the cycle: it waits for a request or for the heap to
//! reach its trigger, drives the phases, and in between cycles does the
//! periodic housekeeping of the runtime (background sweeping, scavenging,
//! retaking contexts, polling, deadlock checks and profiling).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot_core::SpinWait;
use scoped_thread_pool::Pool;

use super::mark::{drain, scan_stack, shade};
use super::pacer::CycleInput;
use super::workbuf::GcWork;
use super::GcPhase;
use crate::config::MAX_GC_PROCS;
use crate::error::throw;
use crate::memory::stats::HeapCounters;
use crate::memory::sweep;
use crate::parfor::ParFor;
use crate::runtime::RuntimeState;
use crate::sched::{TaskId, TaskStatus};
use crate::trace::TraceEvent;
use crate::utils::{formatted_size, nanotime, usleep};

const TICK: Duration = Duration::from_millis(10);
/// Time the controller spends sweeping per tick when idle.
const BG_SWEEP_BUDGET: Duration = Duration::from_millis(1);
/// Time the controller spends draining per round while waiting for marking
/// to finish.
const HELP_BUDGET_NS: u64 = 1_000_000;
const SCHED_TRACE_PERIOD: Duration = Duration::from_secs(1);

struct ControlState {
    /// Helpers for mark termination.
    pool: Pool,
    last_scavenge: Instant,
    last_profile: Instant,
    last_sched_trace: Instant,
}

enum CycleEnd {
    Done,
    Aborted,
}

impl RuntimeState {
    /// Spawns the control thread.
    pub(crate) fn start_controller(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let rt = self.clone();
        let spawned = std::thread::Builder::new()
            .name("rtcore-gc".to_string())
            .spawn(move || crate::error::run_guarded("rtcore-gc", || rt.control_loop()));
        match spawned {
            Ok(handle) => handle,
            Err(err) => throw(&format!("failed to start the collector thread: {}", err)),
        }
    }

    fn control_loop(self: &Arc<Self>) {
        let helpers = self.config.procs().min(MAX_GC_PROCS).max(1);
        let now = Instant::now();
        let mut state = ControlState {
            pool: Pool::new(helpers),
            last_scavenge: now,
            last_profile: now,
            last_sched_trace: now,
        };
        let tick = match self.profile_period() {
            Some(period) => period.min(TICK),
            None => TICK,
        };
        log::debug!(target: "gc", "controller started with {} mark helpers", helpers);

        loop {
            let (requested, shutdown) = self.gc.wait_request(tick);
            if shutdown || self.sched.is_exiting() {
                break;
            }
            self.housekeeping(&mut state);

            if self.should_collect(requested) {
                if let CycleEnd::Aborted = self.gc_cycle(&state.pool) {
                    break;
                }
                continue;
            }
            self.background_sweep();
        }

        state.pool.shutdown();
        log::debug!(target: "gc", "controller stopped after {} cycles", self.gc.num_gc());
    }

    fn should_collect(&self, requested: bool) -> bool {
        if !self.config.gc_enabled() {
            return false;
        }
        requested
            || self.gc.has_waiters()
            || HeapCounters::load(&self.heap.counters.heap_live) >= self.gc.pacer.next_gc()
    }

    fn profile_period(&self) -> Option<Duration> {
        if self.config.profile_hz == 0 || !self.profile.is_enabled() {
            return None;
        }
        Some(Duration::from_secs(1) / self.config.profile_hz)
    }

    /// Work done on every tick, also while waiting for marking to end.
    fn poll_and_retake(self: &Arc<Self>) {
        if let Some(first) = self.netpoll() {
            self.inject_list(vec![first]);
        }
        self.retake(nanotime());
    }

    fn housekeeping(self: &Arc<Self>, state: &mut ControlState) {
        self.poll_and_retake();
        self.sched.check_dead_now();

        // Waiters may be left over from a cycle that completed while the
        // last one was registering.
        for id in self.gc.take_waiters() {
            self.ready(None, id);
        }

        if let Some(period) = self.profile_period() {
            if state.last_profile.elapsed() >= period {
                state.last_profile = Instant::now();
                self.profile_tick();
            }
        }

        if state.last_scavenge.elapsed() >= self.config.scavenge_period {
            state.last_scavenge = Instant::now();
            let limit = self.config.scavenge_limit.as_nanos() as u64;
            let released = self.heap.scavenge(nanotime(), limit);
            if released != 0 {
                log::debug!(target: "heap", "scavenger released {}", formatted_size(released));
            }
        }

        if self.config.sched_trace && state.last_sched_trace.elapsed() >= SCHED_TRACE_PERIOD {
            state.last_sched_trace = Instant::now();
            self.log_sched_state();
        }
    }

    fn log_sched_state(&self) {
        let sched = &self.sched;
        let (runq, idle_threads, threads) = {
            let inner = sched.lock.lock();
            (inner.runq.len(), inner.midle.len(), inner.mcount)
        };
        let local: Vec<usize> = sched.contexts.iter().map(|c| c.runq_len()).collect();
        log::info!(
            target: "sched",
            "SCHED procs={} idleprocs={} threads={} idlethreads={} spinning={} runqueue={} tasks={} local={:?}",
            sched.procs(),
            sched.npidle.load(Ordering::Relaxed),
            threads,
            idle_threads,
            sched.nmspinning.load(Ordering::Relaxed),
            runq,
            sched.user_task_count(),
            local
        );
    }

    fn background_sweep(&self) {
        if self.heap.sweep.is_done() {
            return;
        }
        let start = Instant::now();
        let mut pages = 0;
        while start.elapsed() < BG_SWEEP_BUDGET {
            match sweep::sweep_one(&self.heap) {
                Some(n) => {
                    pages += n;
                    self.heap.sweep.nbgsweep.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        if pages != 0 {
            log::trace!(target: "gc", "background sweep freed {} pages", pages);
        }
    }

    /// Runs one full collection. Returns `Aborted` if the runtime started
    /// exiting in the middle of it.
    fn gc_cycle(self: &Arc<Self>, pool: &Pool) -> CycleEnd {
        let sched = &self.sched;
        let gc = &self.gc;
        let heap = &self.heap;
        let q = &gc.work;
        let wall = Instant::now();

        sched.gc_busy.store(true, Ordering::Release);
        let swept = sweep::finish(heap);
        if swept != 0 {
            log::trace!(target: "gc", "finished {} spans left from the previous cycle", swept);
        }

        // Start: with the world stopped, set up the cycle and turn the
        // barrier on.
        if !self.stop_the_world("gc start") {
            return self.abort_cycle();
        }
        let pause_start = Instant::now();
        sweep::finish(heap);
        let cycle = gc.begin_cycle();
        self.trace(TraceEvent::GcStart { cycle });
        for id in sched.task_ids() {
            sched.task(id).assist_debt.store(0, Ordering::Relaxed);
        }
        self.stacks.set_gc_active(true);
        q.reset();
        let heap_live_start = HeapCounters::load(&heap.counters.heap_live);
        gc.pacer.start_cycle(CycleInput {
            heap_live: heap_live_start,
            heap_scan: HeapCounters::load(&heap.counters.heap_scan),
        });
        self.ensure_mark_workers();
        gc.set_phase(GcPhase::ScanRoots);
        gc.set_barrier(true);
        let mut pause = pause_start.elapsed();
        self.start_the_world();

        // Concurrent root scan.
        if !self.scan_roots(cycle) {
            return self.abort_cycle();
        }

        // Mark. Every context acknowledges the phase change at a scheduling
        // point and publishes what its own stack scan cached.
        gc.set_phase(GcPhase::Mark);
        let rt = self.clone();
        if !self.for_each_context(Arc::new(move |ctx| ctx.gcw.lock().dispose(&rt.gc.work))) {
            return self.abort_cycle();
        }
        gc.set_blacken(true);
        self.wakep();

        if !self.wait_mark_done(false) {
            return self.abort_cycle();
        }
        // Second half: nothing may be cached on a context from now on.
        gc.set_blacken_promptly(true);
        let rt = self.clone();
        if !self.for_each_context(Arc::new(move |ctx| ctx.gcw.lock().dispose(&rt.gc.work))) {
            return self.abort_cycle();
        }
        if !self.wait_mark_done(true) {
            return self.abort_cycle();
        }

        // Mark termination.
        if !self.stop_the_world("gc mark termination") {
            return self.abort_cycle();
        }
        let pause_start = Instant::now();
        gc.set_blacken(false);
        gc.set_blacken_promptly(false);
        gc.pacer.stop_workers();
        gc.set_phase(GcPhase::MarkTermination);
        for ctx in &sched.contexts {
            ctx.gcw.lock().dispose(q);
        }
        gc.pacer.end_cycle(HeapCounters::load(&heap.counters.heap_live), nanotime());
        self.mark_termination(pool);

        if q.has_shared_work() {
            throw("work.full != 0");
        }
        if sched.contexts.iter().any(|ctx| ctx.gcw.lock().holds_buffers()) {
            throw("context has cached GC work at end of mark termination");
        }

        // Stacks freed during the cycle can go now; caches go back to the
        // central lists so that sweeping sees every span.
        self.stacks.free_deferred(heap);
        self.stacks.set_gc_active(false);
        for ctx in &sched.contexts {
            let mut cache = ctx.cache.lock();
            self.stacks.clear_cache(heap, &mut cache);
            cache.release_all(heap);
        }

        let bytes_marked = q.bytes_marked.load(Ordering::Acquire) as usize;
        let scan_work = q.scan_work.load(Ordering::Acquire).max(0) as usize;
        let heap_live = HeapCounters::load(&heap.counters.heap_live);
        let next_gc = gc.pacer.finish_mark(bytes_marked, heap_live);
        heap.counters.heap_live.store(bytes_marked, Ordering::Release);
        heap.counters.heap_scan.store(scan_work, Ordering::Release);

        // Sweep setup: every in-use span becomes unswept.
        heap.sweepgen.fetch_add(2, Ordering::AcqRel);
        heap.sweep.prepare(heap.in_use_spans());

        gc.set_phase(GcPhase::Off);
        gc.set_barrier(false);
        pause += pause_start.elapsed();
        let num_gc = gc.complete_cycle(pause);
        self.trace(TraceEvent::GcDone { cycle });
        self.trace(TraceEvent::HeapAlloc { bytes: bytes_marked });
        self.trace(TraceEvent::NextGc { bytes: next_gc });
        self.start_the_world();

        for id in gc.take_waiters() {
            self.ready(None, id);
        }
        sched.gc_busy.store(false, Ordering::Release);

        if self.config.gc_trace {
            log::info!(
                target: "gc",
                "GC({}) {} -> {} (goal {}), pause {:.3}ms, {:.3}ms total",
                num_gc,
                formatted_size(heap_live_start),
                formatted_size(bytes_marked),
                formatted_size(next_gc),
                pause.as_micros() as f64 / 1000.0,
                wall.elapsed().as_micros() as f64 / 1000.0
            );
        } else {
            log::debug!(
                target: "gc",
                "GC({}) {} -> {}, pause {:.3}ms",
                num_gc,
                formatted_size(heap_live_start),
                formatted_size(bytes_marked),
                pause.as_micros() as f64 / 1000.0
            );
        }

        #[cfg(feature = "debug-checks")]
        if let Err(msg) = heap.verify() {
            throw(&format!("heap verification failed after GC({}): {}", num_gc, msg));
        }

        CycleEnd::Done
    }

    fn abort_cycle(&self) -> CycleEnd {
        let gc = &self.gc;
        gc.set_blacken(false);
        gc.set_blacken_promptly(false);
        gc.set_barrier(false);
        gc.set_phase(GcPhase::Off);
        self.sched.gc_busy.store(false, Ordering::Release);
        log::debug!(target: "gc", "cycle {} abandoned, runtime is exiting", gc.cycle());
        CycleEnd::Aborted
    }

    /// Shades globals and scans every task stack while tasks keep running.
    /// A running task cannot be scanned from outside: it is asked to scan
    /// itself at its next preemption check.
    fn scan_roots(&self, cycle: u64) -> bool {
        let heap = &self.heap;
        let q = &self.gc.work;
        let mut gcw = GcWork::new();
        q.start_worker();

        for block in 0..self.globals.nblocks() {
            self.globals.for_each_in_block(block, |v| shade(heap, q, &mut gcw, v));
        }

        let mut pending = self.sched.task_ids();
        let mut backoff = SpinWait::new();
        while !pending.is_empty() {
            if self.sched.is_exiting() {
                break;
            }
            pending.retain(|&id| !self.try_scan_task(id, cycle, &mut gcw));
            if pending.is_empty() {
                break;
            }
            // Keep the published work flowing while waiting for tasks.
            gcw.dispose(q);
            if !backoff.spin() {
                usleep(100);
            }
        }

        gcw.dispose(q);
        if q.finish_worker() {
            self.gc.mark_done.wakeup();
        }
        !self.sched.is_exiting()
    }

    /// Scans the stack of `id` for `cycle` if it is not running. Returns true
    /// once the task needs nothing more.
    fn try_scan_task(&self, id: TaskId, cycle: u64, gcw: &mut GcWork) -> bool {
        let task = self.sched.task(id);
        if task.scan_cycle.load(Ordering::Acquire) >= cycle {
            return true;
        }
        let status = task.status();
        match status {
            TaskStatus::Idle | TaskStatus::Dead => true,
            TaskStatus::Runnable | TaskStatus::Waiting | TaskStatus::Syscall => {
                if !task.try_begin_scan(status) {
                    return false;
                }
                scan_stack(&self.heap, &self.gc.work, gcw, task);
                task.scan_cycle.store(cycle, Ordering::Release);
                task.end_scan();
                true
            }
            TaskStatus::Running => {
                task.preempt_scan.store(true, Ordering::Release);
                task.preempt.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Waits for the current half of the mark phase to run out of work,
    /// helping along the way. In the second half every context cache must be
    /// empty as well.
    fn wait_mark_done(self: &Arc<Self>, second_half: bool) -> bool {
        let gc = &self.gc;
        let q = &gc.work;
        loop {
            if self.sched.is_exiting() {
                return false;
            }
            gc.mark_done.sleep_timeout(TICK);
            gc.mark_done.clear();

            gc.pacer.revise(HeapCounters::load(&self.heap.counters.heap_scan));
            self.help_mark();

            if q.is_exhausted() && (!second_half || self.contexts_hold_no_work()) {
                return true;
            }
            if q.has_shared_work() && self.sched.npidle.load(Ordering::Acquire) > 0 {
                self.wakep();
            }
            self.poll_and_retake();
        }
    }

    fn contexts_hold_no_work(&self) -> bool {
        let q = &self.gc.work;
        self.sched.contexts.iter().all(|ctx| match ctx.gcw.try_lock() {
            Some(gcw) => gcw.is_empty(q),
            None => false,
        })
    }

    /// Drains shared work on the controller thread for a bounded time.
    fn help_mark(&self) {
        let q = &self.gc.work;
        if !q.has_shared_work() {
            return;
        }
        let start = nanotime();
        let mut gcw = GcWork::new();
        q.start_worker();
        drain(&self.heap, q, &mut gcw, false, || nanotime() - start >= HELP_BUDGET_NS);
        gcw.dispose(q);
        if q.finish_worker() {
            self.gc.mark_done.wakeup();
        }
    }

    /// With the world stopped: rescans every root and drains the queue on
    /// the helper pool. Root blocks and task stacks are spread over the
    /// helpers with a parallel for.
    fn mark_termination(&self, pool: &Pool) {
        let q = &self.gc.work;
        let nblocks = self.globals.nblocks();
        let tasks = self.sched.task_ids();
        let nthr = pool.workers().clamp(1, MAX_GC_PROCS);
        let desc = ParFor::new(nthr, nblocks + tasks.len(), false);
        q.begin_round(nthr as u32);

        pool.scoped(|scope| {
            for _ in 0..nthr {
                let desc = &desc;
                let tasks = &tasks;
                scope.execute(move || self.mark_helper(desc, nblocks, tasks));
            }
        });

        let stats = desc.stats();
        log::trace!(
            target: "gc",
            "mark termination: {} roots on {} helpers, {} steals",
            desc.len(),
            nthr,
            stats.nsteal
        );
    }

    fn mark_helper(&self, desc: &ParFor, nblocks: usize, tasks: &[TaskId]) {
        let heap = &self.heap;
        let q = &self.gc.work;
        let mut gcw = GcWork::new();
        q.start_worker();
        desc.run(|i| {
            if i < nblocks {
                self.globals.for_each_in_block(i, |v| shade(heap, q, &mut gcw, v));
            } else {
                let task = self.sched.task(tasks[i - nblocks]);
                match task.status() {
                    TaskStatus::Idle | TaskStatus::Dead => {}
                    _ => scan_stack(heap, q, &mut gcw, task),
                }
            }
        });
        // Blocking drain: returns once every helper is out of work.
        drain(heap, q, &mut gcw, true, || false);
        gcw.dispose(q);
    }
}
