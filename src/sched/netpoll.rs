//! Readiness notifications from outside the runtime.
//!
//! A task that waits for an external event takes an [`IoToken`], hands it
//! to whatever produces the event and parks. Posting the token queues the
//! task; scheduler threads collect the queue in `find_runnable` without
//! blocking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Weak;

use crossbeam_queue::SegQueue;

use super::task::TaskId;
use super::Scheduler;
use crate::runtime::RuntimeState;

pub struct Poller {
    ready: SegQueue<TaskId>,
    /// Tokens handed out and not yet posted.
    pending: AtomicUsize,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Self {
        Self {
            ready: SegQueue::new(),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn push(&self, task: TaskId) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.ready.push(task);
    }

    /// Tasks whose event arrived and that are now runnable. A task posted
    /// before it parked keeps its wake permit instead and requeues itself.
    pub fn poll(&self, sched: &Scheduler) -> Vec<TaskId> {
        let mut woken = Vec::new();
        while let Some(id) = self.ready.pop() {
            if sched.task(id).try_wake() {
                woken.push(id);
            }
        }
        woken
    }
}

/// Wakes one task waiting for an external event.
pub struct IoToken {
    pub(crate) task: TaskId,
    pub(crate) rt: Weak<RuntimeState>,
}

impl IoToken {
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Signals the event. Safe to call from any thread, before or after the
    /// task parked.
    pub fn post(self) {
        if let Some(rt) = self.rt.upgrade() {
            rt.netpoll_ready(self.task);
        }
    }
}
