//! Execution contexts and their local run queues.
//!
//! A context is the right to run tasks. A thread must own one to execute
//! task code; the context carries the allocation cache, the GC work cache
//! and a ring of runnable tasks that only the owner appends to, while any
//! thread may steal from its head.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::task::TaskId;
use super::Scheduler;
use crate::error::throw;
use crate::gc::pacer::MarkWorkerMode;
use crate::gc::workbuf::GcWork;
use crate::memory::cache::Cache;
use crate::utils::usleep;

pub const RUNQ_SIZE: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ContextStatus {
    Idle = 0,
    Running = 1,
    /// Its thread is in a blocking call; the context may be retaken.
    Syscall = 2,
    /// Stopped for a stop-the-world.
    GcStop = 3,
    /// No longer used.
    Dead = 4,
}

impl ContextStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Syscall,
            3 => Self::GcStop,
            4 => Self::Dead,
            _ => Self::Idle,
        }
    }
}

/// What the controller saw of a context at its last look.
#[derive(Default, Clone, Copy)]
pub struct SysmonTick {
    pub schedtick: u32,
    pub schedwhen: u64,
    pub syscalltick: u32,
    pub syscallwhen: u64,
}

pub struct Context {
    pub id: usize,
    status: AtomicU8,
    runq_head: AtomicU32,
    runq_tail: AtomicU32,
    runq: Box<[AtomicU32]>,
    runnext: AtomicU32,
    /// Incremented on every scheduling round.
    pub schedtick: AtomicU32,
    /// Incremented on every system call return and retake.
    pub syscalltick: AtomicU32,
    /// Allocation cache. Only the owning thread allocates from it; the
    /// collector flushes it from its own thread while the world is stopped.
    /// The lock is uncontended outside of that.
    pub cache: Mutex<Cache>,
    /// Mark work buffers. Other threads peek at them with `try_lock` and
    /// dispose of them during mark termination.
    pub gcw: Mutex<GcWork>,
    /// Background mark worker task bound to this context.
    pub mark_worker: AtomicU32,
    mark_mode: AtomicU8,
    /// Nanotime at which the current mark worker started.
    pub mark_start: AtomicU64,
    /// A safe-point function is pending for this context.
    pub run_safe_point_fn: AtomicBool,
    thread: AtomicUsize,
    pub(crate) sysmon: Mutex<SysmonTick>,
}

impl Context {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            status: AtomicU8::new(ContextStatus::Idle as u8),
            runq_head: AtomicU32::new(0),
            runq_tail: AtomicU32::new(0),
            runq: (0..RUNQ_SIZE).map(|_| AtomicU32::new(0)).collect(),
            runnext: AtomicU32::new(0),
            schedtick: AtomicU32::new(0),
            syscalltick: AtomicU32::new(0),
            cache: Mutex::new(Cache::new()),
            gcw: Mutex::new(GcWork::new()),
            mark_worker: AtomicU32::new(0),
            mark_mode: AtomicU8::new(MarkWorkerMode::None as u8),
            mark_start: AtomicU64::new(0),
            run_safe_point_fn: AtomicBool::new(false),
            thread: AtomicUsize::new(0),
            sysmon: Mutex::new(SysmonTick::default()),
        }
    }

    #[inline]
    pub fn status(&self) -> ContextStatus {
        ContextStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn set_status(&self, status: ContextStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn cas_status(&self, old: ContextStatus, new: ContextStatus) -> bool {
        self.status
            .compare_exchange(old as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Thread owning the context, if any.
    pub fn thread(&self) -> Option<usize> {
        match self.thread.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub(crate) fn set_thread(&self, thread: Option<usize>) {
        self.thread.store(thread.map_or(0, |t| t + 1), Ordering::Release);
    }

    pub fn mark_mode(&self) -> MarkWorkerMode {
        MarkWorkerMode::from_u8(self.mark_mode.load(Ordering::Acquire))
    }

    pub fn set_mark_mode(&self, mode: MarkWorkerMode) {
        self.mark_mode.store(mode as u8, Ordering::Release);
    }

    pub fn mark_worker(&self) -> Option<TaskId> {
        TaskId::from_raw(self.mark_worker.load(Ordering::Acquire))
    }

    /// Puts `task` on the local queue. With `next` it goes to the run-next
    /// slot and the previous occupant is kicked to the tail of the ring.
    /// A full ring spills half of its contents to the global queue.
    pub fn runq_put(&self, sched: &Scheduler, task: TaskId, next: bool) {
        let mut task = task;
        if next {
            let old = self.runnext.swap(task.raw(), Ordering::AcqRel);
            match TaskId::from_raw(old) {
                Some(old) => task = old,
                None => return,
            }
        }
        loop {
            let h = self.runq_head.load(Ordering::Acquire);
            let t = self.runq_tail.load(Ordering::Relaxed);
            if t.wrapping_sub(h) < RUNQ_SIZE as u32 {
                self.runq[t as usize % RUNQ_SIZE].store(task.raw(), Ordering::Relaxed);
                self.runq_tail.store(t.wrapping_add(1), Ordering::Release);
                return;
            }
            if self.runq_put_slow(sched, task, h, t) {
                return;
            }
        }
    }

    fn runq_put_slow(&self, sched: &Scheduler, task: TaskId, h: u32, t: u32) -> bool {
        let n = t.wrapping_sub(h) / 2;
        if n != (RUNQ_SIZE / 2) as u32 {
            throw("runqputslow: queue is not full");
        }
        let mut batch = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            let raw = self.runq[h.wrapping_add(i) as usize % RUNQ_SIZE].load(Ordering::Relaxed);
            batch.push(raw);
        }
        if self
            .runq_head
            .compare_exchange(h, h.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let mut inner = sched.lock.lock();
        for raw in batch {
            if let Some(id) = TaskId::from_raw(raw) {
                inner.runq.push_back(id);
            }
        }
        inner.runq.push_back(task);
        true
    }

    /// Takes a task from the local queue. The flag tells whether it came
    /// from the run-next slot and inherits the current time slice.
    pub fn runq_get(&self) -> Option<(TaskId, bool)> {
        loop {
            let next = self.runnext.load(Ordering::Acquire);
            if next == 0 {
                break;
            }
            if self
                .runnext
                .compare_exchange(next, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return TaskId::from_raw(next).map(|t| (t, true));
            }
        }
        loop {
            let h = self.runq_head.load(Ordering::Acquire);
            let t = self.runq_tail.load(Ordering::Acquire);
            if t == h {
                return None;
            }
            let raw = self.runq[h as usize % RUNQ_SIZE].load(Ordering::Relaxed);
            if self
                .runq_head
                .compare_exchange(h, h.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return TaskId::from_raw(raw).map(|t| (t, false));
            }
        }
    }

    /// Copies half of this context's queue into `into`'s ring starting at
    /// `into_head`. Returns the number of tasks taken.
    fn runq_grab(&self, into: &Context, into_head: u32, steal_next: bool) -> u32 {
        loop {
            let h = self.runq_head.load(Ordering::Acquire);
            let t = self.runq_tail.load(Ordering::Acquire);
            let mut n = t.wrapping_sub(h);
            n -= n / 2;
            if n == 0 {
                if steal_next {
                    let next = self.runnext.load(Ordering::Acquire);
                    if next != 0 {
                        // The owner is likely about to schedule it; give it
                        // a moment before stealing.
                        usleep(3);
                        if self
                            .runnext
                            .compare_exchange(next, 0, Ordering::AcqRel, Ordering::Relaxed)
                            .is_err()
                        {
                            continue;
                        }
                        into.runq[into_head as usize % RUNQ_SIZE].store(next, Ordering::Relaxed);
                        return 1;
                    }
                }
                return 0;
            }
            if n > (RUNQ_SIZE / 2) as u32 {
                // Inconsistent read of head and tail.
                continue;
            }
            for i in 0..n {
                let raw = self.runq[h.wrapping_add(i) as usize % RUNQ_SIZE].load(Ordering::Relaxed);
                into.runq[into_head.wrapping_add(i) as usize % RUNQ_SIZE].store(raw, Ordering::Relaxed);
            }
            if self
                .runq_head
                .compare_exchange(h, h.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return n;
            }
        }
    }

    /// Steals half of `victim`'s tasks into this context's queue and
    /// returns one of them.
    pub fn runq_steal(&self, victim: &Context, steal_next: bool) -> Option<TaskId> {
        let t = self.runq_tail.load(Ordering::Relaxed);
        let mut n = victim.runq_grab(self, t, steal_next);
        if n == 0 {
            return None;
        }
        n -= 1;
        let raw = self.runq[t.wrapping_add(n) as usize % RUNQ_SIZE].load(Ordering::Relaxed);
        if n == 0 {
            return TaskId::from_raw(raw);
        }
        let h = self.runq_head.load(Ordering::Acquire);
        if t.wrapping_sub(h).wrapping_add(n) >= RUNQ_SIZE as u32 {
            throw("runqsteal: runq overflow");
        }
        self.runq_tail.store(t.wrapping_add(n), Ordering::Release);
        TaskId::from_raw(raw)
    }

    /// Whether the local queue has no tasks. Ignores transient states of
    /// concurrent puts and gets.
    pub fn runq_is_empty(&self) -> bool {
        loop {
            let head = self.runq_head.load(Ordering::Acquire);
            let tail = self.runq_tail.load(Ordering::Acquire);
            let next = self.runnext.load(Ordering::Acquire);
            if tail == self.runq_tail.load(Ordering::Acquire) {
                return head == tail && next == 0;
            }
        }
    }

    pub fn runq_len(&self) -> usize {
        let head = self.runq_head.load(Ordering::Acquire);
        let tail = self.runq_tail.load(Ordering::Acquire);
        let next = (self.runnext.load(Ordering::Acquire) != 0) as usize;
        tail.wrapping_sub(head) as usize + next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> TaskId {
        TaskId::from_raw(n).unwrap()
    }

    #[test]
    fn runnext_is_lifo_ring_is_fifo() {
        let sched = Scheduler::new(1, 16);
        let ctx = &sched.contexts[0];
        ctx.runq_put(&sched, id(1), false);
        ctx.runq_put(&sched, id(2), false);
        ctx.runq_put(&sched, id(3), true);
        // Replacing run-next kicks the old one to the tail.
        ctx.runq_put(&sched, id(4), true);
        assert_eq!(ctx.runq_len(), 4);
        assert_eq!(ctx.runq_get(), Some((id(4), true)));
        assert_eq!(ctx.runq_get(), Some((id(1), false)));
        assert_eq!(ctx.runq_get(), Some((id(2), false)));
        assert_eq!(ctx.runq_get(), Some((id(3), false)));
        assert_eq!(ctx.runq_get(), None);
        assert!(ctx.runq_is_empty());
    }

    #[test]
    fn overflow_spills_half_to_global() {
        let sched = Scheduler::new(1, 512);
        let ctx = &sched.contexts[0];
        for n in 1..=RUNQ_SIZE as u32 {
            ctx.runq_put(&sched, id(n), false);
        }
        assert_eq!(ctx.runq_len(), RUNQ_SIZE);
        ctx.runq_put(&sched, id(1000), false);
        assert_eq!(ctx.runq_len(), RUNQ_SIZE / 2);
        let global: Vec<u32> = sched.lock.lock().runq.iter().map(|t| t.raw()).collect();
        assert_eq!(global.len(), RUNQ_SIZE / 2 + 1);
        assert_eq!(global[0], 1);
        assert_eq!(*global.last().unwrap(), 1000);
    }

    #[test]
    fn steal_takes_half() {
        let sched = Scheduler::new(2, 64);
        let (a, b) = (&sched.contexts[0], &sched.contexts[1]);
        for n in 1..=10 {
            a.runq_put(&sched, id(n), false);
        }
        let got = b.runq_steal(a, false).unwrap();
        assert_eq!(got, id(5));
        assert_eq!(b.runq_len(), 4);
        assert_eq!(a.runq_len(), 5);
        assert_eq!(a.runq_get(), Some((id(6), false)));
    }

    #[test]
    fn steal_runnext_only_when_asked() {
        let sched = Scheduler::new(2, 64);
        let (a, b) = (&sched.contexts[0], &sched.contexts[1]);
        a.runq_put(&sched, id(7), true);
        assert_eq!(b.runq_steal(a, false), None);
        assert_eq!(b.runq_steal(a, true), Some(id(7)));
        assert!(a.runq_is_empty());
    }

    #[test]
    fn concurrent_steals_lose_nothing() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let sched = Arc::new(Scheduler::new(4, 64));
        let owner = &sched.contexts[0];
        for n in 1..=200 {
            owner.runq_put(&sched, id(n), false);
        }
        let handles: Vec<_> = (1..4)
            .map(|thief| {
                let sched = sched.clone();
                std::thread::spawn(move || {
                    let me = &sched.contexts[thief];
                    let mut got = Vec::new();
                    while let Some(t) = me.runq_steal(&sched.contexts[0], false) {
                        got.push(t.raw());
                        while let Some((t, _)) = me.runq_get() {
                            got.push(t.raw());
                        }
                    }
                    got
                })
            })
            .collect();
        let mut seen: HashSet<u32> = HashSet::new();
        while let Some((t, _)) = owner.runq_get() {
            assert!(seen.insert(t.raw()));
        }
        for h in handles {
            for t in h.join().unwrap() {
                assert!(seen.insert(t));
            }
        }
        for t in sched.lock.lock().runq.iter() {
            assert!(seen.insert(t.raw()));
        }
        assert_eq!(seen.len(), 200);
    }
}
