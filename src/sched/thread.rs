use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::task::TaskId;
use crate::sync::Note;
use crate::weak_random::WeakRandom;

/// Callback run after a task switched to waiting. Returning false resumes the
/// task immediately.
pub type UnlockFn = Box<dyn FnOnce() -> bool + Send>;

/// An OS thread carrying tasks.
pub struct Thread {
    pub id: usize,
    ctx: AtomicUsize,
    /// Context handed over by whoever woke this thread.
    next_ctx: AtomicUsize,
    /// Context released when entering a system call.
    old_ctx: AtomicUsize,
    pub spinning: AtomicBool,
    pub park: Note,
    locked_task: AtomicU32,
    pub lock_count: AtomicU32,
    cur_task: AtomicU32,
    pub rng: Mutex<WeakRandom>,
    pub(crate) wait_unlock: Mutex<Option<UnlockFn>>,
}

fn decode(v: usize) -> Option<usize> {
    v.checked_sub(1)
}

fn encode(v: Option<usize>) -> usize {
    v.map_or(0, |v| v + 1)
}

impl Thread {
    pub fn new(id: usize, seed: usize) -> Self {
        Self {
            id,
            ctx: AtomicUsize::new(0),
            next_ctx: AtomicUsize::new(0),
            old_ctx: AtomicUsize::new(0),
            spinning: AtomicBool::new(false),
            park: Note::new(),
            locked_task: AtomicU32::new(0),
            lock_count: AtomicU32::new(0),
            cur_task: AtomicU32::new(0),
            rng: Mutex::new(WeakRandom::new(Some(seed))),
            wait_unlock: Mutex::new(None),
        }
    }

    #[inline]
    pub fn ctx(&self) -> Option<usize> {
        decode(self.ctx.load(Ordering::Acquire))
    }

    pub(crate) fn set_ctx(&self, ctx: Option<usize>) {
        self.ctx.store(encode(ctx), Ordering::Release);
    }

    pub(crate) fn take_next_ctx(&self) -> Option<usize> {
        decode(self.next_ctx.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn set_next_ctx(&self, ctx: usize) {
        if self.next_ctx.swap(ctx + 1, Ordering::AcqRel) != 0 {
            crate::error::throw("startm: thread already has a context to run");
        }
    }

    pub(crate) fn old_ctx(&self) -> Option<usize> {
        decode(self.old_ctx.load(Ordering::Acquire))
    }

    pub(crate) fn set_old_ctx(&self, ctx: Option<usize>) {
        self.old_ctx.store(encode(ctx), Ordering::Release);
    }

    pub fn cur_task(&self) -> Option<TaskId> {
        TaskId::from_raw(self.cur_task.load(Ordering::Acquire))
    }

    pub(crate) fn set_cur_task(&self, task: Option<TaskId>) {
        self.cur_task
            .store(task.map_or(0, |t| t.raw()), Ordering::Release);
    }

    pub fn locked_task(&self) -> Option<TaskId> {
        TaskId::from_raw(self.locked_task.load(Ordering::Acquire))
    }

    pub(crate) fn set_locked_task(&self, task: Option<TaskId>) {
        self.locked_task
            .store(task.map_or(0, |t| t.raw()), Ordering::Release);
    }

    pub fn is_spinning(&self) -> bool {
        self.spinning.load(Ordering::Acquire)
    }

    /// Random victim index below `n`.
    pub fn fastrand(&self, n: usize) -> usize {
        self.rng.lock().below(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "already has a context")]
    fn double_handoff_is_fatal() {
        let t = Thread::new(0, 1);
        t.set_next_ctx(0);
        t.set_next_ctx(1);
    }

    #[test]
    fn slots_encode_none() {
        let t = Thread::new(3, 1);
        assert_eq!(t.ctx(), None);
        t.set_ctx(Some(0));
        assert_eq!(t.ctx(), Some(0));
        t.set_next_ctx(2);
        assert_eq!(t.take_next_ctx(), Some(2));
        assert_eq!(t.take_next_ctx(), None);
    }
}
