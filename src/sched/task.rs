//! Task records.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use parking_lot::Mutex;

use super::task_ctx::TaskCtx;
use crate::error::throw;
use crate::memory::stack::Stack;

/// Index of a task record. Zero never names a task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

impl TaskId {
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Set while somebody scans the task's stack. Status transitions wait for it
/// to clear.
pub const SCAN_BIT: u8 = 0x80;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TaskStatus {
    /// Allocated but not started, or recycled.
    Idle = 0,
    Runnable = 1,
    Running = 2,
    /// Blocked in a system call, off any context.
    Syscall = 3,
    Waiting = 4,
    Dead = 5,
}

impl TaskStatus {
    pub fn from_u8(v: u8) -> Self {
        match v & !SCAN_BIT {
            1 => Self::Runnable,
            2 => Self::Running,
            3 => Self::Syscall,
            4 => Self::Waiting,
            5 => Self::Dead,
            _ => Self::Idle,
        }
    }
}

/// Why a task is waiting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum WaitReason {
    None = 0,
    /// Plain park, woken by `ready`.
    Park,
    Semaphore,
    /// Waiting for a readiness event from the poller.
    IoWait,
    /// Waiting for a wake-up from a thread outside the runtime.
    External,
    /// Waiting for a collection to finish.
    GcCompletion,
    /// Background mark worker with nothing to do.
    MarkWorkerIdle,
}

impl WaitReason {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Park,
            2 => Self::Semaphore,
            3 => Self::IoWait,
            4 => Self::External,
            5 => Self::GcCompletion,
            6 => Self::MarkWorkerIdle,
            _ => Self::None,
        }
    }

    /// Waits that something other than a task can end.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::IoWait | Self::External | Self::GcCompletion)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Park => "park",
            Self::Semaphore => "semacquire",
            Self::IoWait => "IO wait",
            Self::External => "external wait",
            Self::GcCompletion => "garbage collection",
            Self::MarkWorkerIdle => "mark worker (idle)",
        }
    }
}

/// Outcome of running a task body once.
pub enum Step {
    /// Give up the context; the task goes to the global queue.
    Yield,
    /// Block until `ready` is called for the task.
    Park,
    /// Run a blocking call off the context, then continue.
    Syscall(Box<dyn FnOnce() + Send>),
    Exit,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Yield => f.write_str("Yield"),
            Step::Park => f.write_str("Park"),
            Step::Syscall(_) => f.write_str("Syscall"),
            Step::Exit => f.write_str("Exit"),
        }
    }
}

/// A resumable task body. Each call runs the task up to its next suspension
/// point.
pub type TaskBody = Box<dyn FnMut(&mut TaskCtx) -> Step + Send>;

/// Stack segment of a task plus the bookkeeping of its frames.
pub struct TaskStack {
    pub stack: Stack,
    /// Slots in use, counted from `stack.lo`.
    pub used: usize,
    /// Start slot of every open frame.
    pub frames: Vec<usize>,
}

impl Default for TaskStack {
    fn default() -> Self {
        Self {
            stack: Stack::EMPTY,
            used: 0,
            frames: Vec::new(),
        }
    }
}

impl TaskStack {
    /// Slot range of the innermost frame.
    pub fn frame(&self) -> (usize, usize) {
        let start = self.frames.last().copied().unwrap_or(0);
        (start, self.used)
    }
}

#[derive(Default)]
pub struct Task {
    status: AtomicU8,
    /// Asks the task to yield at its next check.
    pub preempt: AtomicBool,
    /// Asks the task to scan its own stack at its next check.
    pub preempt_scan: AtomicBool,
    wake_permit: AtomicBool,
    wait_reason: AtomicU8,
    /// Collection cycle in which the stack was last scanned.
    pub scan_cycle: AtomicU64,
    pub stack: Mutex<TaskStack>,
    pub(crate) body: Mutex<Option<TaskBody>>,
    /// Thread id plus one of the thread this task is locked to.
    locked_thread: AtomicU32,
    system: AtomicBool,
    /// Allocation not yet paid for by marking, in bytes of scan work.
    pub assist_debt: AtomicI64,
    goid: AtomicU64,
}

impl Task {
    /// Prepares a recycled record for a new task.
    pub(crate) fn reset(&self, goid: u64, system: bool, stack: Stack, body: TaskBody) {
        self.status.store(TaskStatus::Idle as u8, Ordering::SeqCst);
        self.preempt.store(false, Ordering::Relaxed);
        self.preempt_scan.store(false, Ordering::Relaxed);
        self.wake_permit.store(false, Ordering::SeqCst);
        self.wait_reason.store(WaitReason::None as u8, Ordering::Relaxed);
        self.scan_cycle.store(0, Ordering::Relaxed);
        *self.stack.lock() = TaskStack {
            stack,
            used: 0,
            frames: Vec::new(),
        };
        *self.body.lock() = Some(body);
        self.locked_thread.store(0, Ordering::Relaxed);
        self.system.store(system, Ordering::Relaxed);
        self.assist_debt.store(0, Ordering::Relaxed);
        self.goid.store(goid, Ordering::Relaxed);
    }

    #[inline]
    pub fn load_status(&self) -> u8 {
        self.status.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.load_status())
    }

    pub fn is_being_scanned(&self) -> bool {
        self.load_status() & SCAN_BIT != 0
    }

    /// Moves the task from `old` to `new`, waiting while a stack scan holds
    /// the scan bit. Any other status is an invariant violation.
    pub fn cas_status(&self, old: TaskStatus, new: TaskStatus) {
        let mut spins = 0u32;
        loop {
            match self.status.compare_exchange(
                old as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(cur) if cur == old as u8 | SCAN_BIT => {
                    spins += 1;
                    if spins < 64 {
                        std::hint::spin_loop();
                    } else {
                        std::thread::yield_now();
                    }
                }
                Err(cur) => throw(&format!(
                    "casgstatus: bad status {:?}{} -> {:?} (expected {:?}) for task {}",
                    TaskStatus::from_u8(cur),
                    if cur & SCAN_BIT != 0 { "+scan" } else { "" },
                    new,
                    old,
                    self.goid()
                )),
            }
        }
    }

    /// Sets the scan bit if the task is in `status`.
    pub fn try_begin_scan(&self, status: TaskStatus) -> bool {
        self.status
            .compare_exchange(
                status as u8,
                status as u8 | SCAN_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn end_scan(&self) {
        let cur = self.load_status();
        if cur & SCAN_BIT == 0 {
            throw("end_scan: task is not being scanned");
        }
        self.status.store(cur & !SCAN_BIT, Ordering::SeqCst);
    }

    /// Waiting to runnable unless somebody else already did it. Waits while
    /// a stack scan holds the scan bit.
    pub fn try_resume(&self) -> bool {
        let waiting = TaskStatus::Waiting as u8;
        loop {
            match self.status.compare_exchange(
                waiting,
                TaskStatus::Runnable as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(cur) if cur == waiting | SCAN_BIT => std::thread::yield_now(),
                Err(_) => return false,
            }
        }
    }

    /// Ready half of the wake-permit protocol: leaves a permit and, when the
    /// task is already waiting, takes it back and makes the task runnable.
    /// Returns whether this call made the task runnable.
    ///
    /// The permit only survives for a running task, whose current step may
    /// still end in a park. A queued or finished task has nothing to wake.
    pub fn try_wake(&self) -> bool {
        self.wake_permit.store(true, Ordering::SeqCst);
        match self.status() {
            TaskStatus::Waiting => {
                self.wake_permit.swap(false, Ordering::SeqCst) && self.try_resume()
            }
            TaskStatus::Running => false,
            _ => {
                self.wake_permit.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Drops a permit left by an earlier step. Called once the task is
    /// running and before its body does.
    pub fn clear_permit(&self) {
        self.wake_permit.store(false, Ordering::SeqCst);
    }

    /// Park half of the protocol, called after the task became waiting.
    /// Returns true when a wake-up arrived meanwhile and the task is
    /// runnable again.
    pub fn consume_permit(&self) -> bool {
        self.wake_permit.swap(false, Ordering::SeqCst) && self.try_resume()
    }

    pub fn wait_reason(&self) -> WaitReason {
        WaitReason::from_u8(self.wait_reason.load(Ordering::Relaxed))
    }

    pub fn set_wait_reason(&self, reason: WaitReason) {
        self.wait_reason.store(reason as u8, Ordering::Relaxed);
    }

    pub fn is_system(&self) -> bool {
        self.system.load(Ordering::Relaxed)
    }

    pub fn goid(&self) -> u64 {
        self.goid.load(Ordering::Relaxed)
    }

    pub fn locked_thread(&self) -> Option<usize> {
        match self.locked_thread.load(Ordering::Acquire) {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    pub(crate) fn set_locked_thread(&self, thread: Option<usize>) {
        self.locked_thread
            .store(thread.map_or(0, |t| t as u32 + 1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task() -> Task {
        let t = Task::default();
        t.reset(1, false, Stack::EMPTY, Box::new(|_| Step::Exit));
        t
    }

    #[test]
    fn scan_bit_is_not_a_status() {
        let t = task();
        t.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        assert!(t.try_begin_scan(TaskStatus::Runnable));
        assert_eq!(t.status(), TaskStatus::Runnable);
        assert!(t.is_being_scanned());
        assert!(!t.try_begin_scan(TaskStatus::Runnable));
        t.end_scan();
        assert!(!t.is_being_scanned());
    }

    #[test]
    #[should_panic(expected = "casgstatus: bad status")]
    fn wrong_status_is_fatal() {
        let t = task();
        t.cas_status(TaskStatus::Running, TaskStatus::Waiting);
    }

    #[test]
    fn transition_waits_for_scan() {
        let t = Arc::new(task());
        t.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        assert!(t.try_begin_scan(TaskStatus::Runnable));
        let t2 = t.clone();
        let h = std::thread::spawn(move || t2.cas_status(TaskStatus::Runnable, TaskStatus::Running));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(t.status(), TaskStatus::Runnable);
        t.end_scan();
        h.join().unwrap();
        assert_eq!(t.status(), TaskStatus::Running);
    }

    #[test]
    fn permit_before_park_is_kept() {
        let t = task();
        t.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        t.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        // Woken while still running: the permit waits for the park.
        assert!(!t.try_wake());
        t.cas_status(TaskStatus::Running, TaskStatus::Waiting);
        assert!(t.consume_permit());
        assert_eq!(t.status(), TaskStatus::Runnable);
    }

    #[test]
    fn wake_after_park() {
        let t = task();
        t.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        t.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        t.cas_status(TaskStatus::Running, TaskStatus::Waiting);
        assert!(!t.consume_permit());
        assert!(t.try_wake());
        assert_eq!(t.status(), TaskStatus::Runnable);
        // A second wake finds it queued and leaves nothing behind.
        assert!(!t.try_wake());
        t.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        t.cas_status(TaskStatus::Running, TaskStatus::Waiting);
        assert!(!t.consume_permit());
    }

    #[test]
    fn wake_of_queued_task_leaves_no_permit() {
        let t = task();
        t.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        assert!(!t.try_wake());
        t.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        t.cas_status(TaskStatus::Running, TaskStatus::Waiting);
        assert!(!t.consume_permit());
        assert_eq!(t.status(), TaskStatus::Waiting);
    }

    #[test]
    fn permit_ends_with_the_step() {
        let t = task();
        t.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        t.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        // Woken during a step that then yields instead of parking.
        assert!(!t.try_wake());
        t.cas_status(TaskStatus::Running, TaskStatus::Runnable);
        t.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        t.clear_permit();
        t.cas_status(TaskStatus::Running, TaskStatus::Waiting);
        assert!(!t.consume_permit());
        assert_eq!(t.status(), TaskStatus::Waiting);
    }

    #[test]
    fn recoverable_waits() {
        assert!(WaitReason::IoWait.is_recoverable());
        assert!(WaitReason::GcCompletion.is_recoverable());
        assert!(!WaitReason::Semaphore.is_recoverable());
        assert!(!WaitReason::Park.is_recoverable());
    }
}
