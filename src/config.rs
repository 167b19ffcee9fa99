//! Process-wide runtime configuration, read once at start-up.

use std::time::Duration;

use crate::env::{read_bool_from_env, read_float_from_env, read_string_from_env, read_uint_from_env};
use crate::gc::pacer::PacerConfig;

/// Upper bound on contexts; also bounds the parallel-for helpers.
pub const MAX_PROCS: usize = 256;
/// Upper bound on helper threads used during mark termination.
pub const MAX_GC_PROCS: usize = 32;

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Heap growth target in percent; `None` turns collection off.
    pub gc_percent: Option<u32>,
    /// Number of contexts. Zero runs a single context with collection disabled.
    pub max_procs: usize,
    /// Size of the reserved address range backing the heap.
    pub max_heap: usize,
    /// Number of global root slots.
    pub global_slots: usize,
    /// Largest number of live tasks.
    pub max_tasks: usize,
    /// Stack segment size given to new tasks.
    pub initial_stack: usize,
    /// Free spans unused for this long are released by the scavenger.
    pub scavenge_limit: Duration,
    /// How often the scavenger looks at free spans.
    pub scavenge_period: Duration,
    /// Capacity of the profiling sample ring; zero disables profiling.
    pub profile_buffer: usize,
    /// Sampling frequency of the built-in profiler thread; zero means samples
    /// are only taken when the embedder calls the sample entry point.
    pub profile_hz: u32,
    /// Logs one line per collection, like `GODEBUG=gctrace=1`.
    pub gc_trace: bool,
    /// Logs scheduler state periodically.
    pub sched_trace: bool,
    pub pacer: PacerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_percent: Some(100),
            max_procs: num_cpus::get().clamp(1, MAX_PROCS),
            max_heap: 1024 * 1024 * 1024,
            global_slots: 1024,
            max_tasks: 1 << 20,
            initial_stack: crate::memory::stack::FIXED_STACK,
            scavenge_limit: Duration::from_secs(5 * 60),
            scavenge_period: Duration::from_secs(60),
            profile_buffer: 4096,
            profile_hz: 0,
            gc_trace: false,
            sched_trace: false,
            pacer: PacerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(percent) = read_string_from_env("RTCORE_GC_PERCENT") {
            if percent.trim().eq_ignore_ascii_case("off") {
                config.gc_percent = None;
            } else if let Some(value) = read_float_from_env("RTCORE_GC_PERCENT") {
                config.gc_percent = if value < 0.0 { None } else { Some(value as u32) };
            }
        }

        if let Some(procs) = read_uint_from_env("RTCORE_MAX_PROCS") {
            config.max_procs = procs.min(MAX_PROCS);
        }

        if let Some(size) = read_uint_from_env("RTCORE_MAX_HEAP") {
            config.max_heap = size;
        }

        if let Some(slots) = read_uint_from_env("RTCORE_GLOBAL_SLOTS") {
            config.global_slots = slots;
        }

        if let Some(n) = read_uint_from_env("RTCORE_MAX_TASKS") {
            config.max_tasks = n.max(1);
        }

        if let Some(size) = read_uint_from_env("RTCORE_STACK_SIZE") {
            config.initial_stack = size;
        }

        if let Some(secs) = read_float_from_env("RTCORE_SCAVENGE_LIMIT") {
            config.scavenge_limit = Duration::from_secs_f64(secs.max(0.0));
        }

        if let Some(hz) = read_uint_from_env("RTCORE_PROFILE_HZ") {
            config.profile_hz = hz as u32;
        }

        if let Some(trace) = read_bool_from_env("RTCORE_GC_TRACE") {
            config.gc_trace = trace;
        }

        if let Some(trace) = read_bool_from_env("RTCORE_SCHED_TRACE") {
            config.sched_trace = trace;
        }

        config.pacer = PacerConfig::from_env();
        config
    }

    pub fn with_gc_percent(mut self, percent: Option<u32>) -> Self {
        self.gc_percent = percent;
        self
    }

    pub fn with_max_procs(mut self, procs: usize) -> Self {
        self.max_procs = procs.min(MAX_PROCS);
        self
    }

    pub fn with_max_heap(mut self, size: usize) -> Self {
        self.max_heap = size;
        self
    }

    pub fn with_global_slots(mut self, slots: usize) -> Self {
        self.global_slots = slots;
        self
    }

    pub fn with_max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n.max(1);
        self
    }

    pub fn with_initial_stack(mut self, size: usize) -> Self {
        self.initial_stack = size;
        self
    }

    pub fn with_scavenge_limit(mut self, limit: Duration) -> Self {
        self.scavenge_limit = limit;
        self
    }

    pub fn with_scavenge_period(mut self, period: Duration) -> Self {
        self.scavenge_period = period;
        self
    }

    pub fn with_profile_buffer(mut self, capacity: usize) -> Self {
        self.profile_buffer = capacity;
        self
    }

    pub fn with_profile_hz(mut self, hz: u32) -> Self {
        self.profile_hz = hz;
        self
    }

    pub fn with_gc_trace(mut self, trace: bool) -> Self {
        self.gc_trace = trace;
        self
    }

    pub fn with_sched_trace(mut self, trace: bool) -> Self {
        self.sched_trace = trace;
        self
    }

    pub fn with_pacer(mut self, pacer: PacerConfig) -> Self {
        self.pacer = pacer;
        self
    }

    /// Number of contexts actually created.
    pub fn procs(&self) -> usize {
        self.max_procs.max(1)
    }

    /// Whether the collector runs at all.
    pub fn gc_enabled(&self) -> bool {
        self.max_procs != 0 && self.gc_percent.is_some()
    }

    pub fn gc_percent_value(&self) -> u32 {
        self.gc_percent.unwrap_or(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_procs_disables_collection() {
        let config = RuntimeConfig::default().with_max_procs(0);
        assert_eq!(config.procs(), 1);
        assert!(!config.gc_enabled());
    }

    #[test]
    fn gc_percent_off() {
        let config = RuntimeConfig::default().with_gc_percent(None);
        assert!(!config.gc_enabled());
        assert_eq!(config.gc_percent_value(), 100);
    }

    #[test]
    fn builder() {
        let config = RuntimeConfig::default()
            .with_max_procs(3)
            .with_max_heap(64 << 20)
            .with_gc_percent(Some(50));
        assert_eq!(config.procs(), 3);
        assert_eq!(config.max_heap, 64 << 20);
        assert!(config.gc_enabled());
    }
}
