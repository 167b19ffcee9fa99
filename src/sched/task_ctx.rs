//! The mutator interface handed to task bodies.
//!
//! Heap addresses a body holds in Rust locals are only guaranteed to stay
//! valid until the body returns: the collector does not see them. Anything
//! that must survive a `Step` has to live in a stack slot (`set_local`), a
//! global slot or a heap object reachable from one of those.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::context::Context;
use super::netpoll::IoToken;
use super::task::{Step, Task, TaskId, WaitReason};
use super::thread::Thread;
use crate::error::{throw, RuntimeError, RuntimeResult};
use crate::gc::barrier;
use crate::memory::malloc::ZERO_BASE;
use crate::memory::stack::FIXED_STACK;
use crate::memory::{Address, ObjectState, TypeLayout, WordKind, WORD_SIZE};
use crate::runtime::RuntimeState;

pub struct TaskCtx {
    rt: Arc<RuntimeState>,
    thread: Arc<Thread>,
    task: TaskId,
}

/// A validated slot of a heap object.
struct Slot {
    addr: Address,
    kind: WordKind,
}

impl TaskCtx {
    pub(crate) fn new(rt: Arc<RuntimeState>, thread: Arc<Thread>, task: TaskId) -> Self {
        Self { rt, thread, task }
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.task
    }

    pub fn goid(&self) -> u64 {
        self.task().goid()
    }

    pub fn runtime(&self) -> &Arc<RuntimeState> {
        &self.rt
    }

    /// Id of the OS thread carrying the task for this step.
    pub fn thread_id(&self) -> usize {
        self.thread.id
    }

    /// The context the task runs on.
    pub fn context(&self) -> &Context {
        match self.thread.ctx() {
            Some(c) => self.rt.sched.context(c),
            None => throw("task running without a context"),
        }
    }

    fn task(&self) -> &Task {
        self.rt.sched.task(self.task)
    }

    // Heap.

    /// Allocates a zeroed object shaped by `layout`. May run a mark assist
    /// first and may start a collection cycle.
    pub fn alloc(&mut self, layout: &TypeLayout) -> Address {
        self.rt.mallocgc(self.context(), self.task(), layout)
    }

    fn slot(&self, obj: Address, slot: usize) -> RuntimeResult<Slot> {
        if obj.is_null() {
            return Err(RuntimeError::NilDereference);
        }
        if obj == ZERO_BASE {
            return Err(RuntimeError::OutOfBounds { slot, len: 0 });
        }
        let heap = &self.rt.heap;
        let r = match heap.lookup_object(obj) {
            Some(r) if r.base == obj => r,
            _ => return Err(RuntimeError::InvalidAddress(obj.to_usize())),
        };
        let span = heap.span(r.span);
        let table = span.objects();
        if !table.state(r.index).is_allocated() {
            return Err(RuntimeError::InvalidAddress(obj.to_usize()));
        }
        let len = span.elem_size() / WORD_SIZE;
        if slot >= len {
            return Err(RuntimeError::OutOfBounds { slot, len });
        }
        let word = obj.diff(span.base()) / WORD_SIZE + slot;
        Ok(Slot {
            addr: obj.add_words(slot),
            kind: table.word_kind(word),
        })
    }

    fn check_pointer(&self, value: Address) -> RuntimeResult<()> {
        if value.is_null() || value == ZERO_BASE {
            return Ok(());
        }
        match self.rt.heap.lookup_object(value) {
            Some(r) if r.base == value => {
                let span = self.rt.heap.span(r.span);
                if span.objects().state(r.index) == ObjectState::Free {
                    Err(RuntimeError::InvalidAddress(value.to_usize()))
                } else {
                    Ok(())
                }
            }
            _ => Err(RuntimeError::InvalidAddress(value.to_usize())),
        }
    }

    pub fn read_pointer(&self, obj: Address, slot: usize) -> RuntimeResult<Address> {
        let s = self.slot(obj, slot)?;
        if s.kind != WordKind::Pointer {
            return Err(RuntimeError::NotPointer(slot));
        }
        Ok(Address::from_usize(self.rt.heap.arena.load(s.addr)))
    }

    /// Stores `value` into pointer slot `slot` of `obj` through the write
    /// barrier.
    pub fn write_pointer(&mut self, obj: Address, slot: usize, value: Address) -> RuntimeResult<()> {
        let s = self.slot(obj, slot)?;
        if s.kind != WordKind::Pointer {
            return Err(RuntimeError::NotPointer(slot));
        }
        self.check_pointer(value)?;
        let ctx = self.context();
        let mut gcw = ctx.gcw.lock();
        barrier::write_pointer(&self.rt, &mut gcw, s.addr, value);
        Ok(())
    }

    pub fn read_word(&self, obj: Address, slot: usize) -> RuntimeResult<usize> {
        let s = self.slot(obj, slot)?;
        if s.kind != WordKind::Scalar {
            return Err(RuntimeError::PointerSlot(slot));
        }
        Ok(self.rt.heap.arena.load(s.addr))
    }

    pub fn write_word(&mut self, obj: Address, slot: usize, value: usize) -> RuntimeResult<()> {
        let s = self.slot(obj, slot)?;
        if s.kind != WordKind::Scalar {
            return Err(RuntimeError::PointerSlot(slot));
        }
        self.rt.heap.arena.store(s.addr, value);
        Ok(())
    }

    // Stack frames.

    /// Opens a frame of `slots` zeroed local slots, growing the stack when
    /// it does not fit. Returns true when the task should yield.
    pub fn enter_frame(&mut self, slots: usize) -> bool {
        {
            let rt = &self.rt;
            let mut ts = self.task().stack.lock();
            let need = ts.used + slots;
            while need > ts.stack.slots() {
                let ctx = self.context();
                let mut cache = ctx.cache.lock();
                ts.stack = if ts.stack.size == 0 {
                    rt.stacks.alloc(&rt.heap, Some(&mut cache), FIXED_STACK)
                } else {
                    rt.stacks.grow(&rt.heap, Some(&mut cache), ts.stack, ts.used)
                };
            }
            let start = ts.used;
            rt.heap.arena.clear(ts.stack.slot(start), slots * WORD_SIZE);
            ts.frames.push(start);
            ts.used = need;
        }
        self.check_preempt()
    }

    /// Closes the innermost frame.
    pub fn leave_frame(&mut self) {
        let mut ts = self.task().stack.lock();
        match ts.frames.pop() {
            Some(start) => ts.used = start,
            None => throw("leave_frame: no open frame"),
        }
    }

    /// Local slot `i` of the innermost frame.
    pub fn local(&self, i: usize) -> RuntimeResult<Address> {
        let ts = self.task().stack.lock();
        let (start, end) = ts.frame();
        if start + i >= end {
            return Err(RuntimeError::OutOfBounds { slot: i, len: end - start });
        }
        Ok(Address::from_usize(self.rt.heap.arena.load(ts.stack.slot(start + i))))
    }

    pub fn set_local(&mut self, i: usize, value: Address) -> RuntimeResult<()> {
        self.check_pointer(value)?;
        let ts = self.task().stack.lock();
        let (start, end) = ts.frame();
        if start + i >= end {
            return Err(RuntimeError::OutOfBounds { slot: i, len: end - start });
        }
        self.rt.heap.arena.store(ts.stack.slot(start + i), value.to_usize());
        Ok(())
    }

    /// Yield point. Scans the task's own stack when the collector asked for
    /// it and returns true when the task should return `Step::Yield`.
    pub fn check_preempt(&mut self) -> bool {
        let task = self.task();
        if task.preempt_scan.load(Ordering::Acquire) {
            self.rt.scan_own_stack(self.context(), self.task);
        }
        task.preempt.load(Ordering::Acquire)
    }

    // Globals.

    pub fn global(&self, slot: usize) -> RuntimeResult<Address> {
        self.rt.globals.get(slot)
    }

    pub fn set_global(&mut self, slot: usize, value: Address) -> RuntimeResult<()> {
        self.check_pointer(value)?;
        self.rt.globals.set(slot, value)
    }

    // Scheduling.

    /// Starts a new task. It runs next on this context.
    pub fn spawn<F>(&mut self, body: F) -> TaskId
    where
        F: FnMut(&mut TaskCtx) -> Step + Send + 'static,
    {
        self.rt.newproc(Some(&self.thread), Box::new(body), false)
    }

    /// Makes a parked task runnable.
    pub fn ready(&mut self, task: TaskId) {
        self.rt.ready(Some(&self.thread), task);
    }

    /// Records why the task is about to return `Step::Park`.
    pub fn set_wait_reason(&mut self, reason: WaitReason) {
        self.task().set_wait_reason(reason);
    }

    /// Runs `unlock` once the task is parked. If it returns false the park
    /// is cancelled and the task runs again right away.
    pub fn park_unlock<F>(&mut self, reason: WaitReason, unlock: F) -> Step
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        self.set_wait_reason(reason);
        *self.thread.wait_unlock.lock() = Some(Box::new(unlock));
        Step::Park
    }

    /// Wires the task to the current OS thread until the matching
    /// `unlock_thread`.
    pub fn lock_thread(&mut self) {
        self.rt.lock_thread(&self.thread, self.task);
    }

    pub fn unlock_thread(&mut self) {
        self.rt.unlock_thread(&self.thread, self.task);
    }

    /// Asks for a full collection cycle. Returns true when the task must
    /// return `Step::Park`; it is readied once a cycle that started after
    /// this call has completed. With collection disabled nothing happens.
    pub fn request_gc(&mut self) -> bool {
        if !self.rt.config.gc_enabled() {
            return false;
        }
        self.set_wait_reason(WaitReason::GcCompletion);
        self.rt.gc.add_waiter(&self.rt.sched, self.task);
        true
    }

    /// Hands out a token that readies this task when posted. The body
    /// returns `Step::Park` after passing the token on.
    pub fn wait_io(&mut self) -> IoToken {
        self.rt.sched.poller.register();
        self.set_wait_reason(WaitReason::IoWait);
        IoToken {
            task: self.task,
            rt: Arc::downgrade(&self.rt),
        }
    }
}
