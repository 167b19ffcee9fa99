//! Stopping the world, safe-point rounds and preemption.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::context::{Context, ContextStatus};
use super::SafePointFn;
use crate::error::throw;
use crate::gc::pacer::FORCE_PREEMPT_NS;
use crate::runtime::RuntimeState;
use crate::trace::TraceEvent;
use crate::utils::nanotime;

/// A context blocked in a system call is retaken after this long even when
/// it has no queued work.
const SYSCALL_RETAKE_NS: u64 = 10_000_000;

impl RuntimeState {
    /// Asks the task running on `ctx` to yield at its next check.
    pub(crate) fn preempt_one(&self, ctx: &Context) -> bool {
        let m = match ctx.thread() {
            Some(m) => m,
            None => return false,
        };
        let task = match self.sched.threads.read().get(m).and_then(|m| m.cur_task()) {
            Some(t) => t,
            None => return false,
        };
        self.sched.task(task).preempt.store(true, Ordering::Release);
        true
    }

    pub(crate) fn preempt_all(&self) -> bool {
        let mut res = false;
        for ctx in &self.sched.contexts {
            if ctx.status() == ContextStatus::Running && self.preempt_one(ctx) {
                res = true;
            }
        }
        res
    }

    /// Stops every context. Must be called from a thread that is not
    /// running a task. Returns false if the runtime started exiting while
    /// waiting; the world is then left as it is.
    pub fn stop_the_world(&self, reason: &str) -> bool {
        let sched = &self.sched;
        if sched.current_thread().is_some() {
            throw("stop_the_world called from a task");
        }
        sched.acquire_world();
        let start = nanotime();
        self.trace(TraceEvent::StwStart);

        let wait = {
            let mut inner = sched.lock.lock();
            inner.stopwait = sched.procs() as i32;
            sched.gcwaiting.store(true, Ordering::Release);
            self.preempt_all();
            for ctx in &sched.contexts {
                let s = ctx.status();
                if s == ContextStatus::Syscall && ctx.cas_status(s, ContextStatus::GcStop) {
                    ctx.syscalltick.fetch_add(1, Ordering::Relaxed);
                    inner.stopwait -= 1;
                } else if s == ContextStatus::Dead {
                    inner.stopwait -= 1;
                }
            }
            while let Some(c) = sched.pidleget(&mut inner) {
                sched.context(c).set_status(ContextStatus::GcStop);
                inner.stopwait -= 1;
            }
            inner.stopwait > 0
        };

        if wait {
            loop {
                if sched.stop_note.sleep_timeout(Duration::from_micros(100)) {
                    sched.stop_note.clear();
                    if !sched.is_exiting() {
                        break;
                    }
                }
                if sched.is_exiting() {
                    sched.gcwaiting.store(false, Ordering::Release);
                    sched.release_world();
                    return false;
                }
                self.preempt_all();
            }
        }

        let inner = sched.lock.lock();
        if inner.stopwait != 0 {
            throw(&format!("stop_the_world: not stopped (stopwait={})", inner.stopwait));
        }
        for ctx in &sched.contexts {
            let s = ctx.status();
            if s != ContextStatus::GcStop && s != ContextStatus::Dead {
                throw(&format!(
                    "stop_the_world: not stopped (context {} is {:?})",
                    ctx.id, s
                ));
            }
        }
        drop(inner);
        log::debug!(
            target: "safepoint",
            "world stopped for {} in {}us",
            reason,
            (nanotime() - start) / 1000
        );
        true
    }

    /// Restarts every stopped context and releases the world.
    pub fn start_the_world(self: &Arc<Self>) {
        let sched = &self.sched;
        let mut starts = Vec::new();
        {
            let mut inner = sched.lock.lock();
            for ctx in &sched.contexts {
                if ctx.status() != ContextStatus::GcStop {
                    continue;
                }
                ctx.set_status(ContextStatus::Idle);
                if ctx.runq_is_empty() {
                    sched.pidleput(&mut inner, ctx.id);
                } else if let Some(s) = sched.startm_locked(&mut inner, Some(ctx.id), false) {
                    starts.push(s);
                }
            }
            sched.gcwaiting.store(false, Ordering::Release);
        }
        for s in starts {
            self.launch(s);
        }
        if sched.npidle.load(Ordering::Acquire) != 0 && sched.nmspinning.load(Ordering::Acquire) == 0 {
            self.wakep();
        }
        self.trace(TraceEvent::StwDone);
        sched.release_world();
    }

    /// Runs `f` once for every context at a point where it is not running
    /// task code, and waits until all did. Idle contexts and contexts in
    /// system calls run it on the calling thread.
    pub fn for_each_context(self: &Arc<Self>, f: SafePointFn) -> bool {
        let sched = &self.sched;
        if sched.current_thread().is_some() {
            throw("for_each_context called from a task");
        }
        let wait = {
            let mut inner = sched.lock.lock();
            if inner.safe_point_wait != 0 {
                throw("forEachP: sched.safePointWait != 0");
            }
            inner.safe_point_wait = sched.procs() as i32;
            inner.safe_point_fn = Some(f.clone());
            for ctx in &sched.contexts {
                if ctx.status() == ContextStatus::Dead {
                    inner.safe_point_wait -= 1;
                } else {
                    ctx.run_safe_point_fn.store(true, Ordering::Release);
                }
            }
            self.preempt_all();
            let idle = inner.pidle.clone();
            for c in idle {
                let ctx = sched.context(c);
                if ctx
                    .run_safe_point_fn
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    f(ctx);
                    inner.safe_point_wait -= 1;
                }
            }
            inner.safe_point_wait > 0
        };

        // Contexts blocked in system calls are handed off, which runs the
        // function.
        for ctx in &sched.contexts {
            let s = ctx.status();
            if s == ContextStatus::Syscall
                && ctx.run_safe_point_fn.load(Ordering::Acquire)
                && ctx.cas_status(s, ContextStatus::Idle)
            {
                ctx.syscalltick.fetch_add(1, Ordering::Relaxed);
                self.handoff(ctx.id);
            }
        }

        let mut done = true;
        if wait {
            loop {
                if sched.safe_point_note.sleep_timeout(Duration::from_micros(100)) {
                    sched.safe_point_note.clear();
                    if !sched.is_exiting() {
                        break;
                    }
                }
                if sched.is_exiting() {
                    done = false;
                    break;
                }
                self.preempt_all();
            }
        }

        let mut inner = sched.lock.lock();
        if done {
            if inner.safe_point_wait != 0 {
                throw("forEachP: not done");
            }
            if sched
                .contexts
                .iter()
                .any(|c| c.run_safe_point_fn.load(Ordering::Acquire))
            {
                throw("forEachP: context did not run fn");
            }
        } else {
            inner.safe_point_wait = 0;
        }
        inner.safe_point_fn = None;
        done
    }

    /// Takes contexts back from threads stuck in system calls and preempts
    /// tasks that ran for too long. Called periodically by the controller.
    pub(crate) fn retake(self: &Arc<Self>, now: u64) -> usize {
        let sched = &self.sched;
        let mut n = 0;
        for ctx in &sched.contexts {
            let s = ctx.status();
            let mut pd = ctx.sysmon.lock();
            match s {
                ContextStatus::Syscall => {
                    let t = ctx.syscalltick.load(Ordering::Relaxed);
                    if pd.syscalltick != t {
                        pd.syscalltick = t;
                        pd.syscallwhen = now;
                        continue;
                    }
                    // Leave it alone if there is no other work and somebody
                    // can pick up new work anyway.
                    if ctx.runq_is_empty()
                        && sched.nmspinning.load(Ordering::Acquire) + sched.npidle.load(Ordering::Acquire) > 0
                        && pd.syscallwhen + SYSCALL_RETAKE_NS > now
                    {
                        continue;
                    }
                    drop(pd);
                    if ctx.cas_status(s, ContextStatus::Idle) {
                        log::trace!(target: "sched", "retaking context {} from a system call", ctx.id);
                        ctx.syscalltick.fetch_add(1, Ordering::Relaxed);
                        n += 1;
                        self.handoff(ctx.id);
                    }
                }
                ContextStatus::Running => {
                    let t = ctx.schedtick.load(Ordering::Relaxed);
                    if pd.schedtick != t {
                        pd.schedtick = t;
                        pd.schedwhen = now;
                        continue;
                    }
                    if pd.schedwhen + FORCE_PREEMPT_NS as u64 > now {
                        continue;
                    }
                    drop(pd);
                    self.preempt_one(ctx);
                }
                _ => {}
            }
        }
        n
    }
}
