//! M:N task scheduler.
//!
//! Tasks run on OS threads ("M"s) that must own a [`Context`] to execute
//! task code. Each context has a local run queue; a global queue takes the
//! overflow and tasks readied from outside the runtime. Idle threads steal
//! from random victims, bounded by the number of spinning threads.
//!
//! Lock order: `Scheduler::lock`, then `all_tasks`, then `threads`. The
//! scheduler lock is never taken while holding either of the others.

pub mod context;
pub mod deadlock;
pub mod netpoll;
pub mod schedule;
pub mod sema;
pub mod stw;
pub mod task;
pub mod task_ctx;
pub mod thread;

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thread_local::ThreadLocal;

pub use context::{Context, ContextStatus};
pub use netpoll::{IoToken, Poller};
pub use sema::Semaphore;
pub use task::{Step, Task, TaskBody, TaskId, TaskStatus, WaitReason};
pub use task_ctx::TaskCtx;
pub use thread::Thread;

use crate::memory::FixAlloc;
use crate::sync::{Monitor, Note};

/// Function every context runs at its next scheduling point.
pub type SafePointFn = Arc<dyn Fn(&Context) + Send + Sync>;

/// Scheduler state guarded by the scheduler lock.
pub struct SchedInner {
    /// Global run queue.
    pub runq: VecDeque<TaskId>,
    /// Idle threads.
    pub midle: Vec<usize>,
    /// Threads blocked waiting for their locked task.
    pub nmidlelocked: i32,
    /// Threads created, counting the one that called `run`.
    pub mcount: i32,
    /// Idle contexts.
    pub pidle: Vec<usize>,
    /// Contexts still to stop for the pending stop-the-world.
    pub stopwait: i32,
    /// Contexts still to run the pending safe-point function.
    pub safe_point_wait: i32,
    pub safe_point_fn: Option<SafePointFn>,
    /// First fatal condition detected by a scheduler thread.
    pub fatal: Option<String>,
}

/// Result of picking a thread for a context under the scheduler lock.
pub enum StartM {
    /// An idle thread got the context; wake it after unlocking.
    Wake(Arc<Thread>),
    /// No idle thread; spawn a new one for the context.
    Spawn { ctx: usize, spinning: bool },
}

pub struct Scheduler {
    pub lock: Mutex<SchedInner>,
    pub contexts: Vec<Context>,
    pub threads: RwLock<Vec<Arc<Thread>>>,
    pub tasks: FixAlloc<Task>,
    pub all_tasks: Mutex<Vec<TaskId>>,
    pub npidle: AtomicU32,
    pub nmspinning: AtomicU32,
    /// A stop-the-world is pending.
    pub gcwaiting: AtomicBool,
    pub stop_note: Note,
    pub safe_point_note: Note,
    pub exiting: AtomicBool,
    /// Set by the collector for the duration of a cycle.
    pub gc_busy: AtomicBool,
    goidgen: AtomicU64,
    main_task: AtomicU32,
    main_started: AtomicBool,
    current: ThreadLocal<Cell<usize>>,
    pub poller: Poller,
    world_sema: Monitor<bool>,
}

impl Scheduler {
    pub fn new(procs: usize, max_tasks: usize) -> Self {
        let contexts: Vec<Context> = (0..procs).map(Context::new).collect();
        Self {
            lock: Mutex::new(SchedInner {
                runq: VecDeque::new(),
                midle: Vec::new(),
                nmidlelocked: 0,
                mcount: 0,
                // Popped from the back: context 0 is handed out first.
                pidle: (0..procs).rev().collect(),
                stopwait: 0,
                safe_point_wait: 0,
                safe_point_fn: None,
                fatal: None,
            }),
            contexts,
            threads: RwLock::new(Vec::new()),
            tasks: FixAlloc::new(max_tasks),
            all_tasks: Mutex::new(Vec::new()),
            npidle: AtomicU32::new(procs as u32),
            nmspinning: AtomicU32::new(0),
            gcwaiting: AtomicBool::new(false),
            stop_note: Note::new(),
            safe_point_note: Note::new(),
            exiting: AtomicBool::new(false),
            gc_busy: AtomicBool::new(false),
            goidgen: AtomicU64::new(0),
            main_task: AtomicU32::new(0),
            main_started: AtomicBool::new(false),
            current: ThreadLocal::new(),
            poller: Poller::new(),
            world_sema: Monitor::new(false),
        }
    }

    #[inline]
    pub fn procs(&self) -> usize {
        self.contexts.len()
    }

    #[inline]
    pub fn task(&self, id: TaskId) -> &Task {
        self.tasks.get(id.raw())
    }

    #[inline]
    pub fn context(&self, id: usize) -> &Context {
        &self.contexts[id]
    }

    pub fn thread(&self, id: usize) -> Arc<Thread> {
        self.threads.read()[id].clone()
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn next_goid(&self) -> u64 {
        self.goidgen.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn main_task(&self) -> Option<TaskId> {
        TaskId::from_raw(self.main_task.load(Ordering::Acquire))
    }

    pub(crate) fn set_main_task(&self, id: TaskId) {
        self.main_task.store(id.raw(), Ordering::Release);
        self.main_started.store(true, Ordering::Release);
    }

    pub fn main_started(&self) -> bool {
        self.main_started.load(Ordering::Acquire)
    }

    /// Thread the calling OS thread is carrying, if it is one of ours.
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        let id = self.current.get()?.get().checked_sub(1)?;
        self.threads.read().get(id).cloned()
    }

    pub(crate) fn set_current_thread(&self, id: Option<usize>) {
        self.current
            .get_or(|| Cell::new(0))
            .set(id.map_or(0, |id| id + 1));
    }

    /// Registers a new thread record.
    pub(crate) fn allocm(&self) -> Arc<Thread> {
        let mut threads = self.threads.write();
        let id = threads.len();
        let seed = rand::random::<usize>() | 1;
        let m = Arc::new(Thread::new(id, seed));
        threads.push(m.clone());
        m
    }

    pub(crate) fn globrunqput(&self, inner: &mut SchedInner, task: TaskId) {
        inner.runq.push_back(task);
    }

    pub(crate) fn globrunqput_head(&self, inner: &mut SchedInner, task: TaskId) {
        inner.runq.push_front(task);
    }

    /// Takes a fair share of the global queue for `ctx`: the first task to
    /// run plus a batch the caller puts on the local queue once the lock is
    /// released.
    pub(crate) fn globrunqget(
        &self,
        inner: &mut SchedInner,
        max: usize,
    ) -> Option<(TaskId, Vec<TaskId>)> {
        let size = inner.runq.len();
        if size == 0 {
            return None;
        }
        let mut n = size / self.procs() + 1;
        n = n.min(size);
        if max > 0 {
            n = n.min(max);
        }
        n = n.min(context::RUNQ_SIZE / 2);
        let first = inner.runq.pop_front()?;
        let rest = inner.runq.drain(..n - 1).collect();
        Some((first, rest))
    }

    pub(crate) fn pidleput(&self, inner: &mut SchedInner, ctx: usize) {
        let c = self.context(ctx);
        if !c.runq_is_empty() {
            crate::error::throw("pidleput: context has non-empty run queue");
        }
        c.set_status(ContextStatus::Idle);
        c.set_thread(None);
        inner.pidle.push(ctx);
        self.npidle.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn pidleget(&self, inner: &mut SchedInner) -> Option<usize> {
        let ctx = inner.pidle.pop()?;
        self.npidle.fetch_sub(1, Ordering::AcqRel);
        Some(ctx)
    }

    /// Parks thread `m` on the idle list and checks for deadlock.
    pub(crate) fn mput(&self, inner: &mut SchedInner, m: &Thread) {
        inner.midle.push(m.id);
        self.check_dead(inner);
    }

    pub(crate) fn mget(&self, inner: &mut SchedInner) -> Option<Arc<Thread>> {
        let id = inner.midle.pop()?;
        Some(self.thread(id))
    }

    /// Finds a thread for `ctx`, or for an idle context when `ctx` is
    /// `None`. A `spinning` request was already counted in `nmspinning` by
    /// the caller; it is given back when no context is available.
    pub(crate) fn startm_locked(
        &self,
        inner: &mut SchedInner,
        ctx: Option<usize>,
        spinning: bool,
    ) -> Option<StartM> {
        let ctx = match ctx.or_else(|| self.pidleget(inner)) {
            Some(ctx) => ctx,
            None => {
                if spinning {
                    self.nmspinning.fetch_sub(1, Ordering::AcqRel);
                }
                return None;
            }
        };
        match self.mget(inner) {
            Some(m) => {
                if m.is_spinning() {
                    crate::error::throw("startm: thread is spinning");
                }
                m.spinning.store(spinning, Ordering::Release);
                m.set_next_ctx(ctx);
                Some(StartM::Wake(m))
            }
            None => {
                inner.mcount += 1;
                Some(StartM::Spawn { ctx, spinning })
            }
        }
    }

    pub(crate) fn incidlelocked(&self, delta: i32) {
        let mut inner = self.lock.lock();
        inner.nmidlelocked += delta;
        if delta > 0 {
            self.check_dead(&mut inner);
        }
    }

    /// Marks the runtime as exiting and wakes every thread so it can leave
    /// its scheduling loop.
    pub(crate) fn begin_exit(&self) {
        self.exiting.store(true, Ordering::Release);
        for m in self.threads.read().iter() {
            m.park.wakeup();
        }
        self.stop_note.wakeup();
        self.safe_point_note.wakeup();
    }

    pub(crate) fn acquire_world(&self) {
        let mut held = self.world_sema.lock();
        held.wait_while(|held| *held);
        *held = true;
    }

    pub(crate) fn release_world(&self) {
        let mut held = self.world_sema.lock();
        *held = false;
        held.notify_all();
    }

    /// Snapshot of the live task ids.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.all_tasks.lock().clone()
    }

    /// Number of live tasks that are not runtime-internal.
    pub fn user_task_count(&self) -> usize {
        self.all_tasks
            .lock()
            .iter()
            .filter(|&&id| !self.task(id).is_system())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_queue_fair_share() {
        let sched = Scheduler::new(4, 64);
        let mut inner = sched.lock.lock();
        for n in 1..=9 {
            sched.globrunqput(&mut inner, TaskId::from_raw(n).unwrap());
        }
        // 9 / 4 + 1 = 3 tasks: one to run, two for the local queue.
        let (first, rest) = sched.globrunqget(&mut inner, 0).unwrap();
        assert_eq!(first.raw(), 1);
        assert_eq!(rest.iter().map(|t| t.raw()).collect::<Vec<_>>(), vec![2, 3]);
        let (first, rest) = sched.globrunqget(&mut inner, 1).unwrap();
        assert_eq!(first.raw(), 4);
        assert!(rest.is_empty());
        assert_eq!(inner.runq.len(), 5);
    }

    #[test]
    fn idle_contexts_are_counted() {
        let sched = Scheduler::new(3, 8);
        let mut inner = sched.lock.lock();
        assert_eq!(sched.pidleget(&mut inner), Some(0));
        assert_eq!(sched.npidle.load(Ordering::Relaxed), 2);
        sched.pidleput(&mut inner, 0);
        assert_eq!(sched.npidle.load(Ordering::Relaxed), 3);
        assert_eq!(sched.context(0).status(), ContextStatus::Idle);
    }

    #[test]
    fn spinning_request_without_context_is_returned() {
        let sched = Scheduler::new(1, 8);
        let mut inner = sched.lock.lock();
        sched.pidleget(&mut inner);
        sched.nmspinning.store(1, Ordering::Relaxed);
        assert!(sched.startm_locked(&mut inner, None, true).is_none());
        assert_eq!(sched.nmspinning.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn startm_prefers_idle_threads() {
        let sched = Scheduler::new(2, 8);
        let m = sched.allocm();
        let mut inner = sched.lock.lock();
        inner.mcount = 2;
        inner.midle.push(m.id);
        match sched.startm_locked(&mut inner, None, false) {
            Some(StartM::Wake(t)) => {
                assert_eq!(t.id, m.id);
                assert_eq!(t.take_next_ctx(), Some(0));
            }
            _ => panic!("expected an idle thread"),
        }
        match sched.startm_locked(&mut inner, None, true) {
            Some(StartM::Spawn { ctx, spinning }) => {
                assert_eq!(ctx, 1);
                assert!(spinning);
            }
            _ => panic!("expected a new thread"),
        }
        assert_eq!(inner.mcount, 3);
    }
}
