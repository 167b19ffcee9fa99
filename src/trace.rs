//! Execution trace hooks.
//!
//! The runtime reports scheduler and collector events to an installed
//! [`TraceSink`]. Encoding and storage are up to the sink.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::runtime::RuntimeState;
use crate::sched::{TaskId, WaitReason};
use crate::utils::nanotime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    ProcStart { ctx: usize, thread: usize },
    ProcStop { ctx: usize },
    TaskCreate { task: TaskId, parent: Option<TaskId> },
    TaskStart { task: TaskId, ctx: usize },
    TaskEnd { task: TaskId },
    TaskBlock { task: TaskId, reason: WaitReason },
    TaskUnblock { task: TaskId },
    TaskSyscall { task: TaskId },
    TaskSysExit { task: TaskId },
    StwStart,
    StwDone,
    GcStart { cycle: u64 },
    GcDone { cycle: u64 },
    /// Live heap after a change worth reporting.
    HeapAlloc { bytes: usize },
    NextGc { bytes: usize },
}

/// Receives trace events. Called on runtime threads, often with scheduler
/// state half updated: implementations must not call back into the runtime.
pub trait TraceSink: Send + Sync {
    fn emit(&self, ts: u64, event: &TraceEvent);
}

/// Sink keeping every event in memory.
#[derive(Default)]
pub struct TraceBuffer {
    events: Mutex<Vec<(u64, TraceEvent)>>,
}

impl TraceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(u64, TraceEvent)> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl TraceSink for TraceBuffer {
    fn emit(&self, ts: u64, event: &TraceEvent) {
        self.events.lock().push((ts, *event));
    }
}

impl RuntimeState {
    #[inline]
    pub(crate) fn trace(&self, event: TraceEvent) {
        if !self.tracing.load(Ordering::Acquire) {
            return;
        }
        if let Some(sink) = self.trace_sink.read().as_ref() {
            sink.emit(nanotime(), &event);
        }
    }

    /// Installs `sink`, or stops tracing with `None`.
    pub fn set_trace_sink(&self, sink: Option<Arc<dyn TraceSink>>) {
        let mut slot = self.trace_sink.write();
        self.tracing.store(sink.is_some(), Ordering::Release);
        *slot = sink;
    }
}
