use std::collections::VecDeque;

use parking_lot::Mutex;

use super::task::{TaskId, WaitReason};
use super::task_ctx::TaskCtx;

struct SemaState {
    count: u32,
    waiters: VecDeque<TaskId>,
}

/// Counting semaphore for tasks.
///
/// ```ignore
/// if !sema.acquire(ctx) {
///     return Step::Park; // called again once released
/// }
/// ```
pub struct Semaphore {
    state: Mutex<SemaState>,
}

impl Semaphore {
    pub fn new(count: u32) -> Self {
        Self {
            state: Mutex::new(SemaState {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Takes a unit if one is available. Otherwise queues the task, sets its
    /// wait reason and returns false; the body must then return
    /// `Step::Park` and retry when it runs again.
    pub fn acquire(&self, ctx: &mut TaskCtx) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            return true;
        }
        let me = ctx.id();
        if !state.waiters.contains(&me) {
            state.waiters.push_back(me);
        }
        ctx.set_wait_reason(WaitReason::Semaphore);
        false
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Returns a unit and readies the oldest waiter.
    pub fn release(&self, ctx: &mut TaskCtx) {
        let waiter = {
            let mut state = self.state.lock();
            state.count += 1;
            state.waiters.pop_front()
        };
        if let Some(t) = waiter {
            ctx.ready(t);
        }
    }

    pub fn count(&self) -> u32 {
        self.state.lock().count
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
