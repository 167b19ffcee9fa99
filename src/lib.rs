//! Runtime core for a garbage-collected language with lightweight tasks.
//!
//! The crate provides a page-granular heap with size-classed spans and
//! per-context allocation caches, a concurrent tri-color mark and sweep
//! collector paced against heap growth, and an M:N scheduler running tasks
//! on a bounded set of contexts.
//!
//! Tasks are resumable step functions: a body runs until it returns a
//! [`Step`] telling the scheduler what to do with it next. Pointers held by a
//! task live in its stack frames ([`TaskCtx::enter_frame`]), which the
//! collector scans precisely.

pub mod config;
pub mod env;
pub mod error;
pub mod fault;
pub mod gc;
pub mod memory;
pub mod parfor;
pub mod profile;
pub mod runtime;
pub mod sched;
pub mod sync;
pub mod trace;
pub mod utils;
pub mod weak_random;

pub use config::RuntimeConfig;
pub use error::{throw, RuntimeError, RuntimeResult};
pub use gc::GcPhase;
pub use memory::{Address, MemStats, TypeLayout};
pub use runtime::{Runtime, RuntimeState};
pub use sched::{IoToken, Semaphore, Step, TaskCtx, TaskId, TaskStatus, WaitReason};
pub use trace::{TraceBuffer, TraceEvent, TraceSink};
pub use utils::formatted_size;
