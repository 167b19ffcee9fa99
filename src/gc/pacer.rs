//! Collection pacing.
//!
//! The pacer decides when a cycle starts (the trigger ratio over the
//! reachable heap), how much background marking runs (a share of the
//! contexts, split into dedicated workers and one fractional worker), and how
//! much marking an allocating task must do per allocated byte (the assist
//! ratio). After every cycle the trigger is corrected by a proportional
//! controller that compares the heap growth it observed with the growth the
//! configured percentage asks for.

use std::sync::atomic::{AtomicI64, AtomicUsize};

use atomic::{Atomic, Ordering};

use crate::env::read_float_from_env;
use crate::utils::{formatted_size, nanotime};

/// Tunables of the controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PacerConfig {
    /// Proportional gain of the trigger controller, in `[0, 1]`.
    pub trigger_gain: f64,
    /// Share of the contexts given to background marking.
    pub goal_utilization: f64,
    /// Heap size below which no cycle starts, at 100 percent growth.
    pub heap_minimum: usize,
    /// Floor of the heap distance used for the assist ratio.
    pub min_heap_distance: usize,
    /// Trigger ratio of the first cycle.
    pub initial_trigger_ratio: f64,
    /// Slack in front of the next trigger that lets background sweeping
    /// finish, at 100 percent growth.
    pub sweep_min_heap_distance: usize,
}

impl PacerConfig {
    pub const TRIGGER_GAIN: f64 = 0.5;
    pub const GOAL_UTILIZATION: f64 = 0.25;
    pub const HEAP_MINIMUM: usize = 4 << 20;
    pub const MIN_HEAP_DISTANCE: usize = 1 << 20;
    pub const INITIAL_TRIGGER_RATIO: f64 = 7.0 / 8.0;
    pub const SWEEP_MIN_HEAP_DISTANCE: usize = 1 << 20;

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(gain) = read_float_from_env("RTCORE_PACER_GAIN") {
            config.trigger_gain = gain.clamp(0.0, 1.0);
        }
        if let Some(util) = read_float_from_env("RTCORE_PACER_UTILIZATION") {
            config.goal_utilization = util.clamp(0.01, 1.0);
        }
        if let Some(min) = read_float_from_env("RTCORE_HEAP_MINIMUM") {
            config.heap_minimum = min as usize;
        }
        config
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            trigger_gain: Self::TRIGGER_GAIN,
            goal_utilization: Self::GOAL_UTILIZATION,
            heap_minimum: Self::HEAP_MINIMUM,
            min_heap_distance: Self::MIN_HEAP_DISTANCE,
            initial_trigger_ratio: Self::INITIAL_TRIGGER_RATIO,
            sweep_min_heap_distance: Self::SWEEP_MIN_HEAP_DISTANCE,
        }
    }
}

/// Kind of background mark worker a context runs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum MarkWorkerMode {
    None = 0,
    /// Marks until the round is exhausted; owns its context for the cycle.
    Dedicated = 1,
    /// Marks until preempted while fractional time is under its goal.
    Fractional = 2,
    /// Marks while the context has nothing else to run.
    Idle = 3,
}

impl MarkWorkerMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Dedicated,
            2 => Self::Fractional,
            3 => Self::Idle,
            _ => Self::None,
        }
    }
}

/// Fractional workers are preempted after this long.
pub const FORCE_PREEMPT_NS: i64 = 10_000_000;

/// Heap sizes observed at the start of a cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct CycleInput {
    pub heap_live: usize,
    pub heap_scan: usize,
}

pub struct Pacer {
    pub config: PacerConfig,
    gc_percent: u32,
    procs: usize,
    pub trigger_ratio: Atomic<f64>,
    pub assist_ratio: Atomic<f64>,
    pub next_gc: AtomicUsize,
    pub heap_goal: AtomicUsize,
    pub heap_marked: AtomicUsize,
    pub heap_reachable: AtomicUsize,
    pub initial_heap_live: AtomicUsize,
    pub dedicated_workers_needed: AtomicI64,
    pub fractional_workers_needed: AtomicI64,
    pub fractional_utilization_goal: Atomic<f64>,
    /// Background scan work that assists may steal instead of scanning.
    pub bg_scan_credit: AtomicI64,
    pub assist_time: AtomicI64,
    pub dedicated_mark_time: AtomicI64,
    pub fractional_mark_time: AtomicI64,
    pub idle_mark_time: AtomicI64,
    pub mark_start_time: AtomicI64,
}

impl Pacer {
    pub fn new(config: PacerConfig, gc_percent: u32, procs: usize) -> Self {
        let pacer = Self {
            config,
            gc_percent,
            procs: procs.max(1),
            trigger_ratio: Atomic::new(config.initial_trigger_ratio),
            assist_ratio: Atomic::new(0.0),
            next_gc: AtomicUsize::new(0),
            heap_goal: AtomicUsize::new(0),
            heap_marked: AtomicUsize::new(0),
            heap_reachable: AtomicUsize::new(0),
            initial_heap_live: AtomicUsize::new(0),
            dedicated_workers_needed: AtomicI64::new(0),
            fractional_workers_needed: AtomicI64::new(0),
            fractional_utilization_goal: Atomic::new(0.0),
            bg_scan_credit: AtomicI64::new(0),
            assist_time: AtomicI64::new(0),
            dedicated_mark_time: AtomicI64::new(0),
            fractional_mark_time: AtomicI64::new(0),
            idle_mark_time: AtomicI64::new(0),
            mark_start_time: AtomicI64::new(0),
        };
        pacer.next_gc.store(pacer.heap_minimum(), Ordering::Relaxed);
        pacer
    }

    /// Smallest trigger: the configured minimum scaled by the growth percentage.
    pub fn heap_minimum(&self) -> usize {
        (self.config.heap_minimum as u64 * self.gc_percent as u64 / 100) as usize
    }

    pub fn gc_percent(&self) -> u32 {
        self.gc_percent
    }

    pub fn procs(&self) -> usize {
        self.procs
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc.load(Ordering::Relaxed)
    }

    pub fn trigger_ratio(&self) -> f64 {
        self.trigger_ratio.load(Ordering::Relaxed)
    }

    pub fn assist_ratio(&self) -> f64 {
        self.assist_ratio.load(Ordering::Relaxed)
    }

    /// Resets the per-cycle state and computes the goal and worker split.
    pub fn start_cycle(&self, input: CycleInput) {
        self.bg_scan_credit.store(0, Ordering::Relaxed);
        self.assist_time.store(0, Ordering::Relaxed);
        self.dedicated_mark_time.store(0, Ordering::Relaxed);
        self.fractional_mark_time.store(0, Ordering::Relaxed);
        self.idle_mark_time.store(0, Ordering::Relaxed);
        self.initial_heap_live.store(input.heap_live, Ordering::Relaxed);

        let trigger = self.trigger_ratio();
        let next_gc = self.next_gc();
        if next_gc <= self.heap_minimum() {
            // First cycle or a tiny heap: pretend the last cycle marked
            // what would have produced this trigger.
            let marked = (next_gc as f64 / (1.0 + trigger)) as usize;
            self.heap_marked.store(marked, Ordering::Relaxed);
            self.heap_reachable.store(marked, Ordering::Relaxed);
        }

        let reachable = self.heap_reachable.load(Ordering::Relaxed);
        let goal = reachable + (reachable as u64 * self.gc_percent as u64 / 100) as usize;
        self.heap_goal.store(goal, Ordering::Relaxed);

        let total = self.procs as f64 * self.config.goal_utilization;
        let dedicated = total as i64;
        let fractional = total - dedicated as f64;
        self.dedicated_workers_needed.store(dedicated, Ordering::Relaxed);
        self.fractional_utilization_goal.store(fractional, Ordering::Relaxed);
        self.fractional_workers_needed
            .store(if fractional > 0.0 { 1 } else { 0 }, Ordering::Relaxed);

        self.revise(input.heap_scan);
        self.mark_start_time.store(nanotime() as i64, Ordering::Relaxed);

        log::debug!(
            target: "gc-pacer",
            "start cycle: goal {} trigger {:.3} dedicated {} fractional {:.3} assist ratio {:.4}",
            formatted_size(goal),
            trigger,
            dedicated,
            fractional,
            self.assist_ratio()
        );
    }

    /// Recomputes the assist ratio from the current scannable heap.
    pub fn revise(&self, heap_scan: usize) {
        let goal = self.heap_goal.load(Ordering::Relaxed) as i64;
        let initial = self.initial_heap_live.load(Ordering::Relaxed) as i64;
        let distance = (goal - initial).max(self.config.min_heap_distance as i64);
        self.assist_ratio
            .store(heap_scan as f64 / distance as f64, Ordering::Relaxed);
    }

    /// Corrects the trigger ratio from what this cycle observed and returns it.
    pub fn end_cycle(&self, heap_live: usize, now: u64) -> f64 {
        let goal_growth = self.gc_percent as f64 / 100.0;
        let marked = self.heap_marked.load(Ordering::Relaxed).max(1);
        let actual_growth = heap_live as f64 / marked as f64 - 1.0;
        let duration = now as i64 - self.mark_start_time.load(Ordering::Relaxed);

        let goal_util = self.config.goal_utilization;
        let mut utilization = goal_util;
        if duration > 0 {
            utilization += self.assist_time.load(Ordering::Relaxed) as f64
                / (duration as f64 * self.procs as f64);
        }

        let trigger = self.trigger_ratio();
        let error = goal_growth - trigger - utilization / goal_util * (actual_growth - trigger);
        let mut next = trigger + self.config.trigger_gain * error;
        if next < 0.0 {
            next = 0.0;
        } else if next > goal_growth * 0.95 {
            next = goal_growth * 0.95;
        }
        self.trigger_ratio.store(next, Ordering::Relaxed);

        log::debug!(
            target: "gc-pacer",
            "end cycle: H_m_prev={} h_t={:.3} H_a={} h_a={:.3} u_a={:.3} -> h_t={:.3}",
            marked,
            trigger,
            heap_live,
            actual_growth,
            utilization,
            next
        );
        next
    }

    /// Publishes the marked heap and picks the next trigger point.
    pub fn finish_mark(&self, bytes_marked: usize, heap_live: usize) -> usize {
        let initial = self.initial_heap_live.load(Ordering::Relaxed);
        let allocated = heap_live.saturating_sub(initial);
        let reachable = bytes_marked.saturating_sub(allocated);
        self.heap_reachable.store(reachable, Ordering::Relaxed);
        self.heap_marked.store(bytes_marked, Ordering::Relaxed);

        let mut next = (reachable as f64 * (1.0 + self.trigger_ratio())) as usize;
        next = next.max(self.heap_minimum());
        let min_next =
            bytes_marked + (self.config.sweep_min_heap_distance as u64 * self.gc_percent as u64 / 100) as usize;
        next = next.max(min_next);
        self.next_gc.store(next, Ordering::Relaxed);
        next
    }

    /// Chooses the mark worker for a context at a scheduling point, if any.
    pub fn find_runnable_gc_worker(&self, now: u64) -> MarkWorkerMode {
        if dec_if_positive(&self.dedicated_workers_needed) {
            return MarkWorkerMode::Dedicated;
        }
        if !dec_if_positive(&self.fractional_workers_needed) {
            return MarkWorkerMode::None;
        }
        let since = now as i64 - self.mark_start_time.load(Ordering::Relaxed);
        let used = self.fractional_mark_time.load(Ordering::Relaxed) + FORCE_PREEMPT_NS;
        if since > 0
            && used as f64 / since as f64 > self.fractional_utilization_goal.load(Ordering::Relaxed)
        {
            // Over budget; give the token back.
            self.fractional_workers_needed.fetch_add(1, Ordering::Relaxed);
            return MarkWorkerMode::None;
        }
        MarkWorkerMode::Fractional
    }

    /// Returns the worker token and accounts the worker's time.
    pub fn worker_done(&self, mode: MarkWorkerMode, duration_ns: i64) {
        match mode {
            MarkWorkerMode::Dedicated => {
                self.dedicated_mark_time.fetch_add(duration_ns, Ordering::Relaxed);
                self.dedicated_workers_needed.fetch_add(1, Ordering::Relaxed);
            }
            MarkWorkerMode::Fractional => {
                self.fractional_mark_time.fetch_add(duration_ns, Ordering::Relaxed);
                self.fractional_workers_needed.fetch_add(1, Ordering::Relaxed);
            }
            MarkWorkerMode::Idle => {
                self.idle_mark_time.fetch_add(duration_ns, Ordering::Relaxed);
            }
            MarkWorkerMode::None => {}
        }
    }

    /// Stops handing out worker tokens for the rest of the cycle.
    pub fn stop_workers(&self) {
        self.dedicated_workers_needed.store(0, Ordering::Relaxed);
        self.fractional_workers_needed.store(0, Ordering::Relaxed);
    }
}

fn dec_if_positive(v: &AtomicI64) -> bool {
    let mut cur = v.load(Ordering::Relaxed);
    loop {
        if cur <= 0 {
            return false;
        }
        match v.compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(actual) => cur = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1 << 20;

    #[test]
    fn worker_split() {
        let pacer = Pacer::new(PacerConfig::default(), 100, 6);
        pacer.start_cycle(CycleInput::default());
        // 6 * 0.25 = 1.5: one dedicated worker and one fractional at 0.5.
        assert_eq!(pacer.dedicated_workers_needed.load(Ordering::Relaxed), 1);
        assert_eq!(pacer.fractional_workers_needed.load(Ordering::Relaxed), 1);
        assert!((pacer.fractional_utilization_goal.load(Ordering::Relaxed) - 0.5).abs() < 1e-9);

        let start = pacer.mark_start_time.load(Ordering::Relaxed) as u64;
        assert_eq!(pacer.find_runnable_gc_worker(start + 1_000_000_000), MarkWorkerMode::Dedicated);
        assert_eq!(pacer.find_runnable_gc_worker(start + 1_000_000_000), MarkWorkerMode::Fractional);
        assert_eq!(pacer.find_runnable_gc_worker(start + 1_000_000_000), MarkWorkerMode::None);
        pacer.worker_done(MarkWorkerMode::Fractional, 900_000_000);
        // 0.91s of fractional time in 1s is over the 0.5 goal.
        assert_eq!(pacer.find_runnable_gc_worker(start + 1_000_000_000), MarkWorkerMode::None);
        assert_eq!(pacer.fractional_workers_needed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn first_cycle_fakes_marked_heap() {
        let pacer = Pacer::new(PacerConfig::default(), 100, 4);
        assert_eq!(pacer.next_gc(), 4 * MB);
        pacer.start_cycle(CycleInput {
            heap_live: 4 * MB,
            heap_scan: 2 * MB,
        });
        let marked = pacer.heap_marked.load(Ordering::Relaxed);
        assert_eq!(marked, (4.0 * MB as f64 / (1.0 + 7.0 / 8.0)) as usize);
        assert_eq!(pacer.heap_goal.load(Ordering::Relaxed), 2 * marked);
    }

    #[test]
    fn assist_ratio_uses_min_distance() {
        let pacer = Pacer::new(PacerConfig::default(), 100, 4);
        pacer.heap_goal.store(10 * MB, Ordering::Relaxed);
        pacer.initial_heap_live.store(10 * MB, Ordering::Relaxed);
        pacer.revise(3 * MB);
        assert!((pacer.assist_ratio() - 3.0).abs() < 1e-9);
        pacer.initial_heap_live.store(6 * MB, Ordering::Relaxed);
        pacer.revise(2 * MB);
        assert!((pacer.assist_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn trigger_is_clamped() {
        let pacer = Pacer::new(PacerConfig::default(), 100, 4);
        pacer.heap_marked.store(10 * MB, Ordering::Relaxed);
        let start = pacer.mark_start_time.load(Ordering::Relaxed) as u64;
        // A heap that barely grew pushes the trigger up to its ceiling.
        let mut t = 0.0;
        for _ in 0..20 {
            t = pacer.end_cycle(10 * MB, start + 1_000_000);
        }
        assert!((t - 0.95).abs() < 1e-9);
        // A heap that doubled many times over drives it to zero.
        for _ in 0..20 {
            t = pacer.end_cycle(100 * MB, start + 1_000_000);
        }
        assert_eq!(t, 0.0);
    }

    /// Steady state: the mutator allocates until the trigger, marking finds
    /// the same live heap each cycle and assists stay at the goal, so the
    /// trigger settles where the heap reaches its goal at the end of marking.
    #[test]
    fn trigger_converges() {
        let pacer = Pacer::new(PacerConfig::default(), 100, 4);
        let live = 64 * MB;
        // Heap growth during marking as a share of the reachable heap.
        let growth_during_mark = 0.3;
        let mut last = pacer.trigger_ratio();
        let mut deltas = Vec::new();
        for _ in 0..40 {
            pacer.heap_marked.store(live, Ordering::Relaxed);
            let start = pacer.mark_start_time.load(Ordering::Relaxed) as u64;
            let heap_at_end = (live as f64 * (1.0 + last + growth_during_mark)) as usize;
            let next = pacer.end_cycle(heap_at_end, start + 10_000_000);
            deltas.push((next - last).abs());
            last = next;
        }
        assert!(deltas[39] < 1e-6, "trigger still moving: {:?}", &deltas[35..]);
        assert!((last - (1.0 - growth_during_mark)).abs() < 1e-3, "trigger {}", last);
    }

    #[test]
    fn next_gc_is_floored() {
        let pacer = Pacer::new(PacerConfig::default(), 100, 4);
        let next = pacer.finish_mark(MB, MB);
        assert_eq!(next, 4 * MB);
        pacer.initial_heap_live.store(100 * MB, Ordering::Relaxed);
        let next = pacer.finish_mark(80 * MB, 110 * MB);
        // reachable = 80 - 10 = 70 MiB, trigger 7/8.
        assert_eq!(pacer.heap_reachable.load(Ordering::Relaxed), 70 * MB);
        assert_eq!(next, (70.0 * MB as f64 * (1.0 + 7.0 / 8.0)) as usize);
    }
}
