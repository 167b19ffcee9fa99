//! Detection of programs that can no longer make progress.

use std::sync::atomic::Ordering;

use super::task::TaskStatus;
use super::{SchedInner, Scheduler};
use crate::error::throw;

impl Scheduler {
    /// Called with the scheduler lock held whenever a thread goes idle. When
    /// no thread is left running and no task can be woken from outside, the
    /// program is deadlocked: the condition is recorded and the runtime
    /// starts exiting so `Runtime::run` can report it.
    pub(crate) fn check_dead(&self, inner: &mut SchedInner) {
        if self.is_exiting()
            || inner.fatal.is_some()
            || self.gcwaiting.load(Ordering::Acquire)
            || self.gc_busy.load(Ordering::Acquire)
            || !self.main_started()
        {
            return;
        }

        let run = inner.mcount - inner.midle.len() as i32 - inner.nmidlelocked;
        if run > 0 {
            return;
        }
        if run < 0 {
            throw(&format!(
                "checkdead: inconsistent counts run={} nmidle={} nmidlelocked={} mcount={}",
                run,
                inner.midle.len(),
                inner.nmidlelocked,
                inner.mcount
            ));
        }

        let mut waiting = 0;
        let mut recoverable = 0;
        for &id in self.all_tasks.lock().iter() {
            let task = self.task(id);
            if task.is_system() {
                continue;
            }
            match task.status() {
                TaskStatus::Waiting => {
                    waiting += 1;
                    if task.wait_reason().is_recoverable() {
                        recoverable += 1;
                    }
                }
                TaskStatus::Runnable | TaskStatus::Running | TaskStatus::Syscall => throw(&format!(
                    "checkdead: runnable task {} ({:?})",
                    task.goid(),
                    task.status()
                )),
                TaskStatus::Idle | TaskStatus::Dead => {}
            }
        }
        if recoverable > 0 || !self.poller.is_empty() {
            return;
        }

        let msg = if waiting == 0 {
            "no tasks (main called exit?) - deadlock!"
        } else {
            "all tasks are asleep - deadlock!"
        };
        log::error!(target: "sched", "fatal error: {}", msg);
        inner.fatal = Some(msg.to_string());
        self.begin_exit();
    }

    /// Deadlock check for callers not holding the scheduler lock.
    pub fn check_dead_now(&self) {
        let mut inner = self.lock.lock();
        self.check_dead(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::super::task::{Step, TaskId, WaitReason};
    use super::*;
    use crate::memory::stack::Stack;

    fn sched_with_task(reason: WaitReason) -> (Scheduler, TaskId) {
        let sched = Scheduler::new(1, 8);
        let id = TaskId::from_raw(sched.tasks.alloc()).unwrap();
        let task = sched.task(id);
        task.reset(1, false, Stack::EMPTY, Box::new(|_| Step::Exit));
        task.cas_status(TaskStatus::Idle, TaskStatus::Runnable);
        task.cas_status(TaskStatus::Runnable, TaskStatus::Running);
        task.cas_status(TaskStatus::Running, TaskStatus::Waiting);
        task.set_wait_reason(reason);
        sched.all_tasks.lock().push(id);
        sched.set_main_task(id);
        (sched, id)
    }

    #[test]
    fn all_asleep_is_recorded() {
        let (sched, _) = sched_with_task(WaitReason::Semaphore);
        let m = sched.allocm();
        let mut inner = sched.lock.lock();
        inner.mcount = 1;
        sched.mput(&mut inner, &m);
        assert_eq!(inner.fatal.as_deref(), Some("all tasks are asleep - deadlock!"));
        assert!(sched.is_exiting());
    }

    #[test]
    fn io_wait_is_not_a_deadlock() {
        let (sched, _) = sched_with_task(WaitReason::IoWait);
        let m = sched.allocm();
        let mut inner = sched.lock.lock();
        inner.mcount = 1;
        sched.mput(&mut inner, &m);
        assert!(inner.fatal.is_none());
    }

    #[test]
    fn running_thread_defers_the_check() {
        let (sched, _) = sched_with_task(WaitReason::Park);
        let m = sched.allocm();
        let mut inner = sched.lock.lock();
        inner.mcount = 2;
        sched.mput(&mut inner, &m);
        assert!(inner.fatal.is_none());
    }

    #[test]
    #[should_panic(expected = "inconsistent counts")]
    fn negative_run_count_is_fatal() {
        let (sched, _) = sched_with_task(WaitReason::Park);
        let m = sched.allocm();
        let mut inner = sched.lock.lock();
        inner.mcount = 0;
        sched.mput(&mut inner, &m);
    }
}
