//! Concurrent tri-color mark and sweep collector.
//!
//! A cycle goes `Off -> ScanRoots -> Mark -> MarkTermination -> Off`. Roots
//! are scanned and objects blackened while tasks keep running; the write
//! barrier shades every pointer stored into the heap while it is enabled.
//! Mark termination re-scans all roots with the world stopped and drains
//! what is left, after which spans are swept lazily.

pub mod assist;
pub mod barrier;
pub mod controller;
pub mod mark;
pub mod pacer;
pub mod roots;
pub mod workbuf;
pub mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::RuntimeConfig;
use crate::sched::{Scheduler, TaskId};
use crate::sync::{Monitor, Note, SharedEnum, SharedEnumFlag, SharedFlag};
use pacer::Pacer;
use workbuf::WorkQueue;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum GcPhase {
    Off = 0,
    ScanRoots = 1,
    Mark = 2,
    MarkTermination = 3,
}

impl SharedEnum for GcPhase {
    fn to_raw(self) -> u8 {
        self as u8
    }

    fn from_raw(v: u8) -> Self {
        match v {
            1 => Self::ScanRoots,
            2 => Self::Mark,
            3 => Self::MarkTermination,
            _ => Self::Off,
        }
    }
}

#[derive(Default)]
struct Request {
    requested: bool,
    shutdown: bool,
}

/// Pause accounting.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcStats {
    pub pause_total: Duration,
    pub last_pause: Duration,
}

pub struct Collector {
    phase: SharedEnumFlag<GcPhase>,
    barrier: SharedFlag,
    blacken: SharedFlag,
    /// Workers and mutators publish grey objects right away instead of
    /// caching them. Set for the second half of the mark phase.
    blacken_promptly: SharedFlag,
    pub work: WorkQueue,
    pub pacer: Pacer,
    /// Cycles started.
    cycle: AtomicU64,
    /// Cycles completed.
    num_gc: AtomicU64,
    request: Monitor<Request>,
    /// Set by the worker that found the mark phase out of work.
    pub(crate) mark_done: Note,
    /// Tasks parked until a given cycle completes.
    waiters: Mutex<Vec<(u64, TaskId)>>,
    /// Completed cycles, for callers outside the scheduler.
    completed: Monitor<u64>,
    stats: Mutex<GcStats>,
}

impl Collector {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            phase: SharedEnumFlag::new(GcPhase::Off),
            barrier: SharedFlag::new(),
            blacken: SharedFlag::new(),
            blacken_promptly: SharedFlag::new(),
            work: WorkQueue::new(),
            pacer: Pacer::new(config.pacer, config.gc_percent_value(), config.procs()),
            cycle: AtomicU64::new(0),
            num_gc: AtomicU64::new(0),
            request: Monitor::new(Request::default()),
            mark_done: Note::new(),
            waiters: Mutex::new(Vec::new()),
            completed: Monitor::new(0),
            stats: Mutex::new(GcStats::default()),
        }
    }

    #[inline]
    pub fn phase(&self) -> GcPhase {
        self.phase.get()
    }

    pub(crate) fn set_phase(&self, phase: GcPhase) {
        let old = self.phase.replace(phase);
        log::trace!(target: "gc", "phase {:?} -> {:?}", old, phase);
    }

    #[inline]
    pub fn barrier_enabled(&self) -> bool {
        self.barrier.is_set()
    }

    #[inline]
    pub fn blacken_enabled(&self) -> bool {
        self.blacken.is_set()
    }

    #[inline]
    pub fn blacken_promptly(&self) -> bool {
        self.blacken_promptly.is_set()
    }

    /// Number of the cycle in progress or last started.
    pub fn cycle(&self) -> u64 {
        self.cycle.load(Ordering::Acquire)
    }

    pub fn num_gc(&self) -> u64 {
        self.num_gc.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> GcStats {
        *self.stats.lock()
    }

    /// Wakes the controller to start a cycle.
    pub fn request_cycle(&self) {
        let mut req = self.request.lock();
        if !req.requested {
            req.requested = true;
            req.notify_all();
        }
    }

    pub(crate) fn request_shutdown(&self) {
        let mut req = self.request.lock();
        req.shutdown = true;
        req.notify_all();
        drop(req);
        let mut done = self.completed.lock();
        *done = u64::MAX;
        done.notify_all();
    }

    /// Waits up to `timeout` for a request. Returns (requested, shutdown)
    /// and clears the request.
    pub(crate) fn wait_request(&self, timeout: Duration) -> (bool, bool) {
        let mut req = self.request.lock();
        req.wait_while_for(timeout, |r| !r.requested && !r.shutdown);
        let r = (req.requested, req.shutdown);
        req.requested = false;
        r
    }

    /// The first cycle number whose completion satisfies a request made
    /// now: a cycle already under way may have missed the caller's garbage.
    fn target_cycle(&self, sched: &Scheduler) -> u64 {
        let done = self.num_gc();
        if sched.gc_busy.load(Ordering::Acquire) {
            done + 2
        } else {
            done + 1
        }
    }

    /// Registers `task` to be readied after the next full cycle and requests
    /// one.
    pub(crate) fn add_waiter(&self, sched: &Scheduler, task: TaskId) {
        let target = self.target_cycle(sched);
        self.waiters.lock().push((target, task));
        self.request_cycle();
    }

    /// Tasks whose awaited cycle has completed.
    pub(crate) fn take_waiters(&self) -> Vec<TaskId> {
        let done = self.num_gc();
        let mut waiters = self.waiters.lock();
        let mut ready = Vec::new();
        waiters.retain(|&(target, task)| {
            if target <= done {
                ready.push(task);
                false
            } else {
                true
            }
        });
        ready
    }

    pub(crate) fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }

    /// Blocks the calling OS thread until a full cycle that started after
    /// this call has completed.
    pub(crate) fn wait_full_cycle(&self, sched: &Scheduler) {
        let target = self.target_cycle(sched);
        self.request_cycle();
        let mut done = self.completed.lock();
        while *done < target {
            done.wait_timeout(Duration::from_millis(10));
            if *done < target {
                drop(done);
                self.request_cycle();
                done = self.completed.lock();
            }
        }
    }

    pub(crate) fn begin_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_barrier(&self, on: bool) {
        self.barrier.set_cond(on);
    }

    pub(crate) fn set_blacken(&self, on: bool) {
        self.blacken.set_cond(on);
    }

    pub(crate) fn set_blacken_promptly(&self, on: bool) {
        self.blacken_promptly.set_cond(on);
    }

    /// Records a finished cycle and its pause.
    pub(crate) fn complete_cycle(&self, pause: Duration) -> u64 {
        {
            let mut stats = self.stats.lock();
            stats.pause_total += pause;
            stats.last_pause = pause;
        }
        let n = self.num_gc.fetch_add(1, Ordering::AcqRel) + 1;
        let mut done = self.completed.lock();
        if *done != u64::MAX {
            *done = n;
        }
        done.notify_all();
        n
    }
}
