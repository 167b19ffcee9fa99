//! Sampling profiler buffer.
//!
//! Samples go into a fixed-capacity lock-free ring so that taking one never
//! allocates and never blocks; when the ring is full the sample is dropped
//! and counted.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::runtime::RuntimeState;
use crate::sched::{TaskId, TaskStatus, Thread};
use crate::utils::nanotime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub time: u64,
    pub thread: usize,
    pub ctx: Option<usize>,
    pub task: Option<TaskId>,
    pub status: Option<TaskStatus>,
}

pub struct Profiler {
    ring: Option<ArrayQueue<Sample>>,
    taken: AtomicU64,
    dropped: AtomicU64,
}

impl Profiler {
    /// A profiler keeping up to `capacity` samples; zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: if capacity == 0 {
                None
            } else {
                Some(ArrayQueue::new(capacity))
            },
            taken: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ring.is_some()
    }

    pub fn push(&self, sample: Sample) -> bool {
        let ring = match &self.ring {
            Some(ring) => ring,
            None => return false,
        };
        if ring.push(sample).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.taken.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Removes and returns every buffered sample.
    pub fn drain(&self) -> Vec<Sample> {
        let mut out = Vec::new();
        if let Some(ring) = &self.ring {
            while let Some(s) = ring.pop() {
                out.push(s);
            }
        }
        out
    }

    pub fn taken(&self) -> u64 {
        self.taken.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RuntimeState {
    /// Records what `thread` is doing right now.
    pub fn profile_sample(&self, thread: &Thread) -> bool {
        let task = thread.cur_task();
        self.profile.push(Sample {
            time: nanotime(),
            thread: thread.id,
            ctx: thread.ctx(),
            task,
            status: task.map(|t| self.sched.task(t).status()),
        })
    }

    /// Samples every thread that currently holds a context.
    pub(crate) fn profile_tick(&self) {
        let threads = self.sched.threads.read().clone();
        for m in threads.iter().filter(|m| m.ctx().is_some()) {
            self.profile_sample(m);
        }
    }
}
