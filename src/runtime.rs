//! The runtime instance: heap, collector and scheduler tied together.
//!
//! ```ignore
//! let rt = Runtime::new(RuntimeConfig::default().with_max_procs(4));
//! rt.run(|t: &mut TaskCtx| {
//!     let node = t.alloc(&TypeLayout::pointers(2));
//!     t.set_global(0, node).unwrap();
//!     Step::Exit
//! });
//! println!("{}", rt.stats());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::config::RuntimeConfig;
use crate::error::throw;
use crate::gc::roots::Globals;
use crate::gc::Collector;
use crate::memory::stack::StackAllocator;
use crate::memory::{Heap, MemStats};
use crate::profile::Profiler;
use crate::sched::{Scheduler, Step, TaskCtx, TaskId};
use crate::trace::TraceSink;
use crate::utils::formatted_size;

/// State shared by every thread of one runtime.
pub struct RuntimeState {
    pub config: RuntimeConfig,
    pub heap: Heap,
    pub stacks: StackAllocator,
    pub globals: Globals,
    pub sched: Scheduler,
    pub gc: Collector,
    pub profile: Profiler,
    pub(crate) tracing: AtomicBool,
    pub(crate) trace_sink: RwLock<Option<Arc<dyn TraceSink>>>,
    started: AtomicBool,
}

impl RuntimeState {
    fn new(config: RuntimeConfig) -> Self {
        Self {
            heap: Heap::new(config.max_heap),
            stacks: StackAllocator::new(),
            globals: Globals::new(config.global_slots),
            sched: Scheduler::new(config.procs(), config.max_tasks),
            gc: Collector::new(&config),
            profile: Profiler::new(config.profile_buffer),
            tracing: AtomicBool::new(false),
            trace_sink: RwLock::new(None),
            started: AtomicBool::new(false),
            config,
        }
    }

    /// Makes every scheduler thread leave its loop and stops the controller.
    fn shutdown(&self) {
        {
            let _inner = self.sched.lock.lock();
            self.sched.begin_exit();
        }
        self.gc.request_shutdown();
    }
}

/// Owner of a runtime. Dropping it stops all runtime threads.
pub struct Runtime {
    state: Arc<RuntimeState>,
    controller: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        log::debug!(
            target: "runtime",
            "starting runtime: {} contexts, heap limit {}, gc {}",
            config.procs(),
            formatted_size(config.max_heap),
            match config.gc_percent {
                Some(p) if config.gc_enabled() => format!("{}%", p),
                _ => "off".to_string(),
            }
        );
        let state = Arc::new(RuntimeState::new(config));
        let controller = state.start_controller();
        Self {
            state,
            controller: Mutex::new(Some(controller)),
        }
    }

    /// A runtime configured from `RTCORE_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(RuntimeConfig::from_env())
    }

    pub fn state(&self) -> &Arc<RuntimeState> {
        &self.state
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.state.config
    }

    /// Runs `main` as the main task, using the calling thread as the first
    /// scheduler thread, and returns once the main task has exited. Other
    /// tasks still alive at that point are abandoned.
    ///
    /// A detected deadlock is fatal and reported on the calling thread.
    pub fn run<F>(&self, main: F)
    where
        F: FnMut(&mut TaskCtx) -> Step + Send + 'static,
    {
        let rt = &self.state;
        if rt.started.swap(true, Ordering::AcqRel) {
            throw("Runtime::run called twice");
        }
        if rt.sched.current_thread().is_some() {
            throw("Runtime::run called from a runtime thread");
        }

        let m0 = rt.sched.allocm();
        rt.sched.set_current_thread(Some(m0.id));
        let ctx = {
            let mut inner = rt.sched.lock.lock();
            inner.mcount += 1;
            rt.sched.pidleget(&mut inner)
        };
        match ctx {
            Some(c) => rt.acquirep(&m0, c),
            None => throw("Runtime::run: no idle context for the main thread"),
        }
        let main = rt.newproc(Some(&m0), Box::new(main), false);
        rt.sched.set_main_task(main);
        log::debug!(target: "runtime", "main task {:?} started on M{}", main, m0.id);

        rt.schedule(&m0);
        rt.sched.set_current_thread(None);
        self.stop();

        let fatal = rt.sched.lock.lock().fatal.take();
        if let Some(msg) = fatal {
            throw(&msg);
        }
    }

    /// Starts a task from outside the runtime.
    pub fn spawn<F>(&self, body: F) -> TaskId
    where
        F: FnMut(&mut TaskCtx) -> Step + Send + 'static,
    {
        self.state.newproc(None, Box::new(body), false)
    }

    /// Readies a task parked with `WaitReason::External`. Safe from any
    /// thread.
    pub fn ready(&self, task: TaskId) {
        self.state.ready(None, task);
    }

    /// Blocks the calling thread until a full collection cycle has run.
    /// Returns false if collection is disabled.
    pub fn collect(&self) -> bool {
        let rt = &self.state;
        if !rt.config.gc_enabled() {
            return false;
        }
        if rt.sched.current_thread().is_some() {
            throw("Runtime::collect called from a task");
        }
        if rt.sched.is_exiting() {
            return false;
        }
        rt.gc.wait_full_cycle(&rt.sched);
        true
    }

    /// Runs a full cycle, finishes sweeping and hands every free page back.
    /// Returns the number of bytes released.
    pub fn free_os_memory(&self) -> usize {
        let rt = &self.state;
        if self.collect() {
            crate::memory::sweep::finish(&rt.heap);
        }
        let released = rt.heap.scavenge_all();
        log::debug!(target: "heap", "released {} to the system", formatted_size(released));
        released
    }

    pub fn num_gc(&self) -> u64 {
        self.state.gc.num_gc()
    }

    pub fn stats(&self) -> MemStats {
        let rt = &self.state;
        let mut stats = MemStats::default();
        rt.heap.fill_stats(&mut stats);
        let pacer = &rt.gc.pacer;
        stats.heap_marked = pacer.heap_marked.load(Ordering::Acquire);
        stats.next_gc = pacer.next_gc();
        stats.trigger_ratio = pacer.trigger_ratio();
        stats.num_gc = rt.gc.num_gc() as usize;
        let gc = rt.gc.stats();
        stats.pause_total = gc.pause_total;
        stats.last_pause = gc.last_pause;
        stats
    }

    pub fn set_trace_sink(&self, sink: Option<Arc<dyn TraceSink>>) {
        self.state.set_trace_sink(sink);
    }

    fn stop(&self) {
        self.state.shutdown();
        if let Some(handle) = self.controller.lock().take() {
            if handle.join().is_err() {
                log::error!(target: "runtime", "collector thread panicked");
            }
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
