//! The scheduling loop and the thread/context hand-off protocol.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::context::{Context, ContextStatus};
use super::task::{Step, TaskBody, TaskId, TaskStatus};
use super::task_ctx::TaskCtx;
use super::thread::Thread;
use super::StartM;
use crate::error::{run_guarded, throw};
use crate::runtime::RuntimeState;
use crate::trace::TraceEvent;

impl RuntimeState {
    /// Entry point of a scheduler thread spawned by the runtime.
    pub(crate) fn mstart(self: &Arc<Self>, m: Arc<Thread>) {
        self.sched.set_current_thread(Some(m.id));
        if let Some(ctx) = m.take_next_ctx() {
            self.acquirep(&m, ctx);
        }
        log::trace!(target: "sched", "M{} started", m.id);
        self.schedule(&m);
        self.sched.set_current_thread(None);
        log::trace!(target: "sched", "M{} exited", m.id);
    }

    /// Runs tasks until the runtime exits.
    pub(crate) fn schedule(self: &Arc<Self>, m: &Arc<Thread>) {
        loop {
            if self.sched.is_exiting() {
                self.drop_context(m);
                return;
            }

            if let Some(locked) = m.locked_task() {
                if self.stoplockedm(m) {
                    self.execute(m, locked, false);
                }
                continue;
            }

            let ctx_id = match m.ctx() {
                Some(c) => c,
                None => {
                    self.stopm(m);
                    continue;
                }
            };
            let ctx = self.sched.context(ctx_id);

            if self.sched.gcwaiting.load(Ordering::Acquire) {
                self.gcstopm(m);
                continue;
            }
            self.run_safe_point_fn(ctx);

            let mut found = None;
            if self.gc.blacken_enabled() {
                found = self.find_runnable_gc_worker(ctx).map(|t| (t, false));
            }
            if found.is_none() && ctx.schedtick.load(Ordering::Relaxed) % 61 == 0 {
                // Keep the global queue from starving behind busy locals.
                let mut inner = self.sched.lock.lock();
                if let Some((t, _)) = self.sched.globrunqget(&mut inner, 1) {
                    found = Some((t, false));
                }
            }
            if found.is_none() {
                found = ctx.runq_get();
            }
            if found.is_none() {
                found = self.find_runnable(m);
            }
            let (task, inherit) = match found {
                Some(f) => f,
                None => continue,
            };

            if m.is_spinning() {
                self.resetspinning(m);
            }

            if let Some(owner) = self.sched.task(task).locked_thread() {
                if owner != m.id {
                    self.startlockedm(m, task);
                    continue;
                }
            }

            self.execute(m, task, inherit);
        }
    }

    /// Runs one step of `id` on `m` and applies its outcome.
    fn execute(self: &Arc<Self>, m: &Arc<Thread>, id: TaskId, inherit: bool) {
        let ctx_id = match m.ctx() {
            Some(c) => c,
            None => throw("execute: thread has no context"),
        };
        let ctx = self.sched.context(ctx_id);
        let task = self.sched.task(id);
        task.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        task.clear_permit();
        task.preempt.store(false, Ordering::Release);
        if !inherit {
            ctx.schedtick.fetch_add(1, Ordering::Relaxed);
        }
        m.set_cur_task(Some(id));
        self.trace(TraceEvent::TaskStart { task: id, ctx: ctx_id });

        if task.preempt_scan.load(Ordering::Acquire) {
            self.scan_own_stack(ctx, id);
        }

        let mut body = match task.body.lock().take() {
            Some(body) => body,
            None => throw(&format!("execute: task {} has no body", task.goid())),
        };
        let step = {
            let mut tctx = TaskCtx::new(self.clone(), m.clone(), id);
            body(&mut tctx)
        };
        *task.body.lock() = Some(body);

        if task.preempt_scan.load(Ordering::Acquire) {
            self.scan_own_stack(ctx, id);
        }
        m.set_cur_task(None);

        match step {
            Step::Yield => self.gosched(id),
            Step::Park => self.park(m, ctx, id),
            Step::Syscall(call) => {
                self.entersyscall(m, id);
                call();
                self.exitsyscall(m, id);
            }
            Step::Exit => self.goexit(m, ctx, id),
        }
    }

    /// Looks everywhere for a runnable task. Returns `None` when the thread
    /// should restart its scheduling round, which includes having slept on
    /// the idle list.
    fn find_runnable(self: &Arc<Self>, m: &Arc<Thread>) -> Option<(TaskId, bool)> {
        let sched = &self.sched;
        let ctx_id = m.ctx()?;
        let ctx = sched.context(ctx_id);

        if sched.gcwaiting.load(Ordering::Acquire) {
            self.gcstopm(m);
            return None;
        }
        self.run_safe_point_fn(ctx);

        if let Some(found) = ctx.runq_get() {
            return Some(found);
        }
        if let Some(t) = self.globrunq_take(ctx) {
            return Some((t, false));
        }
        if let Some(t) = self.netpoll() {
            return Some((t, false));
        }

        let procs = sched.procs() as u32;
        let busy = procs - sched.npidle.load(Ordering::Acquire);
        // Limit spinning threads to half the busy contexts.
        if procs > 1 && (m.is_spinning() || 2 * sched.nmspinning.load(Ordering::Acquire) < busy) {
            if !m.is_spinning() {
                m.spinning.store(true, Ordering::Release);
                sched.nmspinning.fetch_add(1, Ordering::AcqRel);
            }
            for i in 0..4 * procs as usize {
                if sched.gcwaiting.load(Ordering::Acquire) {
                    return None;
                }
                let steal_next = i > 2 * procs as usize;
                let victim = sched.context(m.fastrand(procs as usize));
                if victim.id == ctx_id {
                    continue;
                }
                if let Some(t) = ctx.runq_steal(victim, steal_next) {
                    return Some((t, false));
                }
            }
        }

        if let Some(t) = self.idle_gc_worker(ctx) {
            return Some((t, false));
        }

        // Nothing to do: give the context back.
        let mut inner = sched.lock.lock();
        if sched.gcwaiting.load(Ordering::Acquire) || ctx.run_safe_point_fn.load(Ordering::Acquire) {
            return None;
        }
        if let Some((t, rest)) = sched.globrunqget(&mut inner, 0) {
            drop(inner);
            for r in rest {
                ctx.runq_put(sched, r, false);
            }
            return Some((t, false));
        }
        let released = self.releasep(m);
        sched.pidleput(&mut inner, released);
        drop(inner);
        self.trace(TraceEvent::ProcStop { ctx: released });

        let was_spinning = m.is_spinning();
        if was_spinning {
            m.spinning.store(false, Ordering::Release);
            if sched.nmspinning.fetch_sub(1, Ordering::AcqRel) == 0 {
                throw("findrunnable: negative nmspinning");
            }
        }

        // Work may have been submitted between the checks above and the
        // release; look once more before sleeping.
        let pending = sched.contexts.iter().any(|c| !c.runq_is_empty())
            || (self.gc.blacken_enabled() && self.gc.work.has_shared_work())
            || !sched.poller.is_empty();
        if pending {
            let got = {
                let mut inner = sched.lock.lock();
                sched.pidleget(&mut inner)
            };
            if let Some(c) = got {
                self.acquirep(m, c);
                if was_spinning {
                    m.spinning.store(true, Ordering::Release);
                    sched.nmspinning.fetch_add(1, Ordering::AcqRel);
                }
                return None;
            }
        }

        self.stopm(m);
        None
    }

    fn globrunq_take(&self, ctx: &Context) -> Option<TaskId> {
        let (first, rest) = {
            let mut inner = self.sched.lock.lock();
            self.sched.globrunqget(&mut inner, 0)?
        };
        for t in rest {
            ctx.runq_put(&self.sched, t, false);
        }
        Some(first)
    }

    /// Collects tasks whose external events arrived. The first one is
    /// returned, the rest go to the global queue.
    pub(crate) fn netpoll(self: &Arc<Self>) -> Option<TaskId> {
        if self.sched.poller.is_empty() {
            return None;
        }
        let mut woken = self.sched.poller.poll(&self.sched);
        if woken.is_empty() {
            return None;
        }
        let first = woken.remove(0);
        self.inject_list(woken);
        Some(first)
    }

    /// Puts readied tasks on the global queue and starts threads for them.
    pub(crate) fn inject_list(self: &Arc<Self>, tasks: Vec<TaskId>) {
        if tasks.is_empty() {
            return;
        }
        let mut starts = Vec::new();
        {
            let mut inner = self.sched.lock.lock();
            let n = tasks.len();
            for t in tasks {
                self.sched.globrunqput(&mut inner, t);
            }
            for _ in 0..n {
                if self.sched.npidle.load(Ordering::Acquire) == 0 {
                    break;
                }
                match self.sched.startm_locked(&mut inner, None, false) {
                    Some(s) => starts.push(s),
                    None => break,
                }
            }
        }
        for s in starts {
            self.launch(s);
        }
    }

    pub(crate) fn netpoll_ready(self: &Arc<Self>, task: TaskId) {
        let start = {
            let mut inner = self.sched.lock.lock();
            self.sched.poller.push(task);
            if self.sched.npidle.load(Ordering::Acquire) > 0
                && self.sched.nmspinning.load(Ordering::Acquire) == 0
            {
                self.sched.startm_locked(&mut inner, None, false)
            } else {
                None
            }
        };
        if let Some(s) = start {
            self.launch(s);
        }
    }

    fn resetspinning(self: &Arc<Self>, m: &Thread) {
        m.spinning.store(false, Ordering::Release);
        let prev = self.sched.nmspinning.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            throw("findrunnable: negative nmspinning");
        }
        // The last spinning thread found work; make sure someone else keeps
        // looking while contexts are idle.
        if prev == 1 && self.sched.npidle.load(Ordering::Acquire) > 0 {
            self.wakep();
        }
    }

    /// Starts a spinning thread on an idle context, unless one is already
    /// spinning.
    pub(crate) fn wakep(self: &Arc<Self>) {
        if self
            .sched
            .nmspinning
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        self.startm(None, true);
    }

    pub(crate) fn startm(self: &Arc<Self>, ctx: Option<usize>, spinning: bool) {
        let start = {
            let mut inner = self.sched.lock.lock();
            self.sched.startm_locked(&mut inner, ctx, spinning)
        };
        if let Some(s) = start {
            self.launch(s);
        }
    }

    pub(crate) fn launch(self: &Arc<Self>, start: StartM) {
        match start {
            StartM::Wake(m) => m.park.wakeup(),
            StartM::Spawn { ctx, spinning } => self.newm(ctx, spinning),
        }
    }

    fn newm(self: &Arc<Self>, ctx: usize, spinning: bool) {
        let m = self.sched.allocm();
        m.spinning.store(spinning, Ordering::Release);
        m.set_next_ctx(ctx);
        let rt = self.clone();
        let name = format!("rtcore-m{}", m.id);
        log::debug!(target: "sched", "spawning {} for context {}", name, ctx);
        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            run_guarded(&name, || rt.mstart(m));
        });
        if let Err(err) = spawned {
            throw(&format!("newm: failed to create thread: {}", err));
        }
    }

    /// Parks `m` on the idle list until it is handed a context. Returns
    /// false when woken because the runtime exits.
    pub(crate) fn stopm(&self, m: &Thread) -> bool {
        if m.ctx().is_some() {
            throw("stopm: holding context");
        }
        if m.is_spinning() {
            throw("stopm: spinning");
        }
        {
            let mut inner = self.sched.lock.lock();
            if self.sched.is_exiting() {
                return false;
            }
            self.sched.mput(&mut inner, m);
        }
        m.park.sleep();
        m.park.clear();
        if self.sched.is_exiting() {
            return false;
        }
        match m.take_next_ctx() {
            Some(c) => {
                self.acquirep(m, c);
                true
            }
            None => throw("stopm: woken without a context"),
        }
    }

    fn gcstopm(&self, m: &Thread) -> bool {
        if !self.sched.gcwaiting.load(Ordering::Acquire) {
            throw("gcstopm: not waiting for gc");
        }
        if m.is_spinning() {
            m.spinning.store(false, Ordering::Release);
            self.sched.nmspinning.fetch_sub(1, Ordering::AcqRel);
        }
        let c = self.releasep(m);
        {
            let mut inner = self.sched.lock.lock();
            self.sched.context(c).set_status(ContextStatus::GcStop);
            inner.stopwait -= 1;
            if inner.stopwait == 0 {
                self.sched.stop_note.wakeup();
            }
        }
        self.stopm(m)
    }

    /// Hands a context whose thread blocked or went away to a thread that
    /// can use it, or puts it on the idle list.
    pub(crate) fn handoff(self: &Arc<Self>, c: usize) {
        let sched = &self.sched;
        let ctx = sched.context(c);
        if !ctx.runq_is_empty()
            || !sched.lock.lock().runq.is_empty()
            || (self.gc.blacken_enabled() && self.mark_work_available(ctx))
        {
            self.startm(Some(c), false);
            return;
        }
        if sched.nmspinning.load(Ordering::Acquire) + sched.npidle.load(Ordering::Acquire) == 0
            && sched
                .nmspinning
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.startm(Some(c), true);
            return;
        }

        let mut inner = sched.lock.lock();
        if sched.gcwaiting.load(Ordering::Acquire) {
            ctx.set_status(ContextStatus::GcStop);
            inner.stopwait -= 1;
            if inner.stopwait == 0 {
                sched.stop_note.wakeup();
            }
            return;
        }
        if ctx
            .run_safe_point_fn
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            if let Some(f) = inner.safe_point_fn.clone() {
                f(ctx);
            }
            inner.safe_point_wait -= 1;
            if inner.safe_point_wait == 0 {
                sched.safe_point_note.wakeup();
            }
        }
        if !inner.runq.is_empty() || !sched.poller.is_empty() {
            let start = sched.startm_locked(&mut inner, Some(c), false);
            drop(inner);
            if let Some(s) = start {
                self.launch(s);
            }
            return;
        }
        sched.pidleput(&mut inner, c);
    }

    pub(crate) fn acquirep(&self, m: &Thread, c: usize) {
        let ctx = self.sched.context(c);
        if m.ctx().is_some() || ctx.thread().is_some() || ctx.status() != ContextStatus::Idle {
            throw(&format!(
                "acquirep: invalid context state (M{} ctx {:?}, context {} {:?} owned by {:?})",
                m.id,
                m.ctx(),
                c,
                ctx.status(),
                ctx.thread()
            ));
        }
        ctx.set_thread(Some(m.id));
        ctx.set_status(ContextStatus::Running);
        m.set_ctx(Some(c));
        self.trace(TraceEvent::ProcStart { ctx: c, thread: m.id });
    }

    pub(crate) fn releasep(&self, m: &Thread) -> usize {
        let c = match m.ctx() {
            Some(c) => c,
            None => throw("releasep: thread has no context"),
        };
        let ctx = self.sched.context(c);
        if ctx.thread() != Some(m.id) || ctx.status() != ContextStatus::Running {
            throw(&format!(
                "releasep: invalid context state (context {} {:?} owned by {:?})",
                c,
                ctx.status(),
                ctx.thread()
            ));
        }
        ctx.set_thread(None);
        ctx.set_status(ContextStatus::Idle);
        m.set_ctx(None);
        c
    }

    fn drop_context(&self, m: &Thread) {
        if let Some(c) = m.ctx() {
            let ctx = self.sched.context(c);
            ctx.set_thread(None);
            ctx.set_status(ContextStatus::Dead);
            m.set_ctx(None);
        }
        if m.is_spinning() {
            m.spinning.store(false, Ordering::Release);
            self.sched.nmspinning.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn run_safe_point_fn(&self, ctx: &Context) {
        if ctx
            .run_safe_point_fn
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let f = self.sched.lock.lock().safe_point_fn.clone();
        if let Some(f) = f {
            f(ctx);
        }
        let mut inner = self.sched.lock.lock();
        inner.safe_point_wait -= 1;
        if inner.safe_point_wait == 0 {
            self.sched.safe_point_note.wakeup();
        }
    }

    // Task state transitions.

    /// Creates a task. From a scheduler thread the task goes to the run-next
    /// slot of the current context; from anywhere else it is injected into
    /// the global queue. System tasks start out waiting and are never
    /// queued.
    pub(crate) fn newproc(self: &Arc<Self>, m: Option<&Thread>, body: TaskBody, system: bool) -> TaskId {
        let sched = &self.sched;
        let id = match TaskId::from_raw(sched.tasks.alloc()) {
            Some(id) => id,
            None => throw("newproc: task table returned the nil id"),
        };
        let ctx = m.and_then(|m| m.ctx()).map(|c| sched.context(c));
        let stack = match ctx {
            Some(ctx) => {
                let mut cache = ctx.cache.lock();
                self.stacks.alloc(&self.heap, Some(&mut cache), self.config.initial_stack)
            }
            None => self.stacks.alloc(&self.heap, None, self.config.initial_stack),
        };
        let task = sched.task(id);
        task.reset(sched.next_goid(), system, stack, body);
        sched.all_tasks.lock().push(id);
        self.trace(TraceEvent::TaskCreate {
            task: id,
            parent: m.and_then(|m| m.cur_task()),
        });

        if system {
            task.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
            task.cas_status(TaskStatus::Runnable, TaskStatus::Running);
            task.cas_status(TaskStatus::Running, TaskStatus::Waiting);
            return id;
        }

        task.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        match ctx {
            Some(ctx) => {
                ctx.runq_put(sched, id, true);
                if sched.npidle.load(Ordering::Acquire) != 0
                    && sched.nmspinning.load(Ordering::Acquire) == 0
                    && sched.main_started()
                {
                    self.wakep();
                }
            }
            None => self.inject_list(vec![id]),
        }
        id
    }

    /// Makes a waiting task runnable. A wake-up that arrives before the task
    /// parked is kept as a permit and consumed by the park.
    pub(crate) fn ready(self: &Arc<Self>, m: Option<&Thread>, id: TaskId) {
        let sched = &self.sched;
        let task = sched.task(id);
        match m.and_then(|m| m.ctx()) {
            Some(c) => {
                if task.try_wake() {
                    self.trace(TraceEvent::TaskUnblock { task: id });
                    sched.context(c).runq_put(sched, id, true);
                    if sched.npidle.load(Ordering::Acquire) != 0
                        && sched.nmspinning.load(Ordering::Acquire) == 0
                    {
                        self.wakep();
                    }
                }
            }
            None => {
                // Waking and queueing under the scheduler lock keeps the
                // deadlock check from seeing a half-done wake-up.
                let start = {
                    let mut inner = sched.lock.lock();
                    if !task.try_wake() {
                        return;
                    }
                    sched.globrunqput(&mut inner, id);
                    if sched.npidle.load(Ordering::Acquire) > 0 {
                        sched.startm_locked(&mut inner, None, false)
                    } else {
                        None
                    }
                };
                self.trace(TraceEvent::TaskUnblock { task: id });
                if let Some(s) = start {
                    self.launch(s);
                }
            }
        }
    }

    fn gosched(&self, id: TaskId) {
        self.sched.task(id).cas_status(TaskStatus::Running, TaskStatus::Runnable);
        let mut inner = self.sched.lock.lock();
        self.sched.globrunqput(&mut inner, id);
    }

    fn park(self: &Arc<Self>, m: &Thread, ctx: &Context, id: TaskId) {
        let task = self.sched.task(id);
        task.cas_status(TaskStatus::Running, TaskStatus::Waiting);
        self.trace(TraceEvent::TaskBlock {
            task: id,
            reason: task.wait_reason(),
        });
        let unlock = m.wait_unlock.lock().take();
        if let Some(unlock) = unlock {
            if !unlock() {
                if task.try_resume() {
                    ctx.runq_put(&self.sched, id, true);
                }
                return;
            }
        }
        if task.consume_permit() {
            ctx.runq_put(&self.sched, id, false);
        }
    }

    fn goexit(self: &Arc<Self>, m: &Thread, ctx: &Context, id: TaskId) {
        let sched = &self.sched;
        let task = sched.task(id);
        task.cas_status(TaskStatus::Running, TaskStatus::Dead);
        self.trace(TraceEvent::TaskEnd { task: id });

        if m.locked_task() == Some(id) {
            m.set_locked_task(None);
            m.lock_count.store(0, Ordering::Release);
        }
        task.set_locked_thread(None);

        let stack = std::mem::take(&mut *task.stack.lock());
        if stack.stack.size != 0 {
            let mut cache = ctx.cache.lock();
            self.stacks.free(&self.heap, Some(&mut cache), stack.stack);
        }
        let body = task.body.lock().take();
        drop(body);
        {
            let mut all = sched.all_tasks.lock();
            if let Some(pos) = all.iter().position(|&t| t == id) {
                all.swap_remove(pos);
            }
        }
        let is_main = sched.main_task() == Some(id);
        sched.tasks.free(id.raw());

        if is_main {
            log::debug!(target: "sched", "main task exited");
            let _inner = sched.lock.lock();
            sched.begin_exit();
        }
    }

    fn entersyscall(self: &Arc<Self>, m: &Thread, id: TaskId) {
        let sched = &self.sched;
        let task = sched.task(id);
        let c = match m.ctx() {
            Some(c) => c,
            None => throw("entersyscall: thread has no context"),
        };
        let ctx = sched.context(c);
        self.run_safe_point_fn(ctx);
        task.cas_status(TaskStatus::Running, TaskStatus::Syscall);
        self.trace(TraceEvent::TaskSyscall { task: id });

        m.set_old_ctx(Some(c));
        m.set_ctx(None);
        ctx.set_thread(None);
        ctx.set_status(ContextStatus::Syscall);

        if sched.gcwaiting.load(Ordering::Acquire) {
            let mut inner = sched.lock.lock();
            if inner.stopwait > 0 && ctx.cas_status(ContextStatus::Syscall, ContextStatus::GcStop) {
                ctx.syscalltick.fetch_add(1, Ordering::Relaxed);
                inner.stopwait -= 1;
                if inner.stopwait == 0 {
                    sched.stop_note.wakeup();
                }
            }
            return;
        }

        // Queued work should not wait for the controller to retake the
        // context.
        let work = !ctx.runq_is_empty() || !sched.lock.lock().runq.is_empty();
        if work && ctx.cas_status(ContextStatus::Syscall, ContextStatus::Idle) {
            ctx.syscalltick.fetch_add(1, Ordering::Relaxed);
            self.handoff(c);
        }
    }

    fn exitsyscall(self: &Arc<Self>, m: &Thread, id: TaskId) {
        let sched = &self.sched;
        let task = sched.task(id);
        let old = m.old_ctx();
        m.set_old_ctx(None);

        // Fast path: the context is still waiting for us.
        if let Some(c) = old {
            let ctx = sched.context(c);
            if ctx.cas_status(ContextStatus::Syscall, ContextStatus::Running) {
                ctx.set_thread(Some(m.id));
                m.set_ctx(Some(c));
                ctx.syscalltick.fetch_add(1, Ordering::Relaxed);
                task.cas_status(TaskStatus::Syscall, TaskStatus::Runnable);
                self.trace(TraceEvent::TaskSysExit { task: id });
                ctx.runq_put(sched, id, true);
                return;
            }
        }

        let got = {
            let mut inner = sched.lock.lock();
            task.cas_status(TaskStatus::Syscall, TaskStatus::Runnable);
            let c = if sched.gcwaiting.load(Ordering::Acquire) {
                None
            } else {
                sched.pidleget(&mut inner)
            };
            if c.is_none() {
                sched.globrunqput(&mut inner, id);
            }
            c
        };
        self.trace(TraceEvent::TaskSysExit { task: id });
        if let Some(c) = got {
            self.acquirep(m, c);
            sched.context(c).runq_put(sched, id, true);
            return;
        }
        // A locked task is picked up by whoever finds it in the global
        // queue and handed back to this thread.
        if m.locked_task() != Some(id) {
            self.stopm(m);
        }
    }

    // Locked tasks.

    /// Gives away the context and waits until the locked task is runnable
    /// again. Returns false when the runtime exits meanwhile.
    fn stoplockedm(self: &Arc<Self>, m: &Thread) -> bool {
        if m.ctx().is_some() {
            let c = self.releasep(m);
            self.handoff(c);
        }
        {
            let mut inner = self.sched.lock.lock();
            if self.sched.is_exiting() {
                return false;
            }
            inner.nmidlelocked += 1;
            self.sched.check_dead(&mut inner);
        }
        m.park.sleep();
        m.park.clear();
        if self.sched.is_exiting() {
            return false;
        }
        if let Some(t) = m.locked_task() {
            let status = self.sched.task(t).status();
            if status != TaskStatus::Runnable {
                throw(&format!("stoplockedm: not runnable ({:?})", status));
            }
        }
        match m.take_next_ctx() {
            Some(c) => {
                self.acquirep(m, c);
                true
            }
            None => throw("stoplockedm: woken without a context"),
        }
    }

    /// Hands the current context to the thread `task` is locked to and
    /// parks this thread.
    fn startlockedm(self: &Arc<Self>, m: &Thread, task: TaskId) {
        let owner = match self.sched.task(task).locked_thread() {
            Some(owner) => owner,
            None => throw("startlockedm: task is not locked"),
        };
        if owner == m.id {
            throw("startlockedm: locked to me");
        }
        let target = self.sched.thread(owner);
        self.sched.incidlelocked(-1);
        let c = self.releasep(m);
        target.set_next_ctx(c);
        target.park.wakeup();
        self.stopm(m);
    }

    pub(crate) fn lock_thread(&self, m: &Thread, id: TaskId) {
        m.set_locked_task(Some(id));
        self.sched.task(id).set_locked_thread(Some(m.id));
        m.lock_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unlock_thread(&self, m: &Thread, id: TaskId) {
        let count = m.lock_count.load(Ordering::Acquire);
        if count == 0 {
            return;
        }
        m.lock_count.store(count - 1, Ordering::Release);
        if count == 1 {
            m.set_locked_task(None);
            self.sched.task(id).set_locked_thread(None);
        }
    }
}
