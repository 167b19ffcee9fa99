//! Grey-object work queue.
//!
//! Grey objects travel in fixed-size buffers. Buffers move as a whole between
//! three global lock-free stacks (full, partial and empty); a [`GcWork`]
//! caches at most two of them for its owner so most puts and gets touch no
//! shared state.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::error::throw;
use crate::memory::{Address, FixAlloc};
use crate::sync::{IndexLinks, LockFreeStack};
use crate::utils::{osyield, procyield, usleep};

pub const WORKBUF_SIZE: usize = 256;
/// Object slots per buffer: the buffer size minus the header words.
pub const WORKBUF_CAPACITY: usize = (WORKBUF_SIZE - 3 * 8) / 8;

/// Most buffers that may exist at once.
const MAX_WORKBUFS: usize = 1 << 18;

pub struct Workbuf {
    next: AtomicU32,
    nobj: AtomicUsize,
    obj: [AtomicUsize; WORKBUF_CAPACITY],
}

impl Default for Workbuf {
    fn default() -> Self {
        Self {
            next: AtomicU32::new(0),
            nobj: AtomicUsize::new(0),
            obj: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }
}

impl Workbuf {
    #[inline]
    pub fn nobj(&self) -> usize {
        self.nobj.load(Ordering::Relaxed)
    }

    fn is_full(&self) -> bool {
        self.nobj() == WORKBUF_CAPACITY
    }

    fn push(&self, obj: Address) {
        let n = self.nobj();
        self.obj[n].store(obj.to_usize(), Ordering::Relaxed);
        self.nobj.store(n + 1, Ordering::Relaxed);
    }

    fn pop(&self) -> Address {
        let n = self.nobj() - 1;
        self.nobj.store(n, Ordering::Relaxed);
        Address::from_usize(self.obj[n].load(Ordering::Relaxed))
    }
}

impl IndexLinks for FixAlloc<Workbuf> {
    fn link(&self, index: u32) -> &AtomicU32 {
        &self.get(index).next
    }
}

/// Shared state of the mark phase: buffer lists, worker rendezvous and the
/// marking counters.
pub struct WorkQueue {
    bufs: FixAlloc<Workbuf>,
    full: LockFreeStack,
    partial: LockFreeStack,
    empty: LockFreeStack,
    /// Number of participants of the current drain round. `u32::MAX` during
    /// concurrent mark, where `nwait` counts down once per active worker.
    pub nproc: AtomicU32,
    pub nwait: AtomicU32,
    pub bytes_marked: AtomicU64,
    pub scan_work: AtomicI64,
    /// Objects pushed and popped, for conservation checks.
    pub puts: AtomicU64,
    pub gets: AtomicU64,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            bufs: FixAlloc::new(MAX_WORKBUFS),
            full: LockFreeStack::new(),
            partial: LockFreeStack::new(),
            empty: LockFreeStack::new(),
            nproc: AtomicU32::new(u32::MAX),
            nwait: AtomicU32::new(u32::MAX),
            bytes_marked: AtomicU64::new(0),
            scan_work: AtomicI64::new(0),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    #[inline]
    fn buf(&self, id: u32) -> &Workbuf {
        self.bufs.get(id)
    }

    /// Prepares a round with `nproc` participants that are all counted as
    /// waiting until they start working.
    pub fn begin_round(&self, nproc: u32) {
        self.nproc.store(nproc, Ordering::Release);
        self.nwait.store(nproc, Ordering::Release);
    }

    /// Resets the counters at the start of a cycle.
    pub fn reset(&self) {
        self.begin_round(u32::MAX);
        self.bytes_marked.store(0, Ordering::Relaxed);
        self.scan_work.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.gets.store(0, Ordering::Relaxed);
    }

    /// Registers an active worker.
    pub fn start_worker(&self) {
        let n = self.nwait.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1);
        if n > self.nproc.load(Ordering::Acquire) {
            throw(&format!("work.nwait {} > work.nproc", n));
        }
    }

    /// Deregisters a worker; returns true when it was the last one and no
    /// work is left.
    pub fn finish_worker(&self) -> bool {
        let n = self.nwait.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let nproc = self.nproc.load(Ordering::Acquire);
        if n > nproc {
            throw(&format!("work.nwait {} > work.nproc {}", n, nproc));
        }
        n == nproc && !self.has_shared_work()
    }

    pub fn has_shared_work(&self) -> bool {
        !self.full.is_empty() || !self.partial.is_empty()
    }

    /// No worker is active and no shared work is left.
    pub fn is_exhausted(&self) -> bool {
        self.nwait.load(Ordering::Acquire) == self.nproc.load(Ordering::Acquire)
            && !self.has_shared_work()
    }

    fn getempty(&self) -> u32 {
        match self.empty.pop(&self.bufs) {
            Some(id) => id,
            None => self.bufs.alloc(),
        }
    }

    fn putempty(&self, id: u32) {
        debug_assert_eq!(self.buf(id).nobj(), 0);
        self.empty.push(&self.bufs, id);
    }

    fn putfull(&self, id: u32) {
        self.full.push(&self.bufs, id);
    }

    fn putpartial(&self, id: u32) {
        let b = self.buf(id);
        if b.nobj() == 0 {
            self.putempty(id);
        } else if b.is_full() {
            self.putfull(id);
        } else {
            self.partial.push(&self.bufs, id);
        }
    }

    fn trygetfull(&self) -> Option<u32> {
        self.full
            .pop(&self.bufs)
            .or_else(|| self.partial.pop(&self.bufs))
    }

    /// Blocks until a buffer with work is available or every participant of
    /// the round is waiting, in which case it returns `None`.
    fn getfull(&self) -> Option<u32> {
        if let Some(id) = self.trygetfull() {
            return Some(id);
        }

        let n = self.nwait.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        let nproc = self.nproc.load(Ordering::Acquire);
        if n > nproc {
            throw(&format!("work.nwait {} > work.nproc {}", n, nproc));
        }
        let mut i = 0usize;
        loop {
            if self.has_shared_work() {
                self.nwait.fetch_sub(1, Ordering::AcqRel);
                if let Some(id) = self.trygetfull() {
                    return Some(id);
                }
                let n = self.nwait.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
                if n > self.nproc.load(Ordering::Acquire) {
                    throw("work.nwait > work.nproc");
                }
            }
            if self.nwait.load(Ordering::Acquire) == self.nproc.load(Ordering::Acquire) {
                return None;
            }
            if i < 10 {
                procyield(20);
            } else if i < 20 {
                osyield();
            } else {
                usleep(100);
            }
            i += 1;
        }
    }

    /// Gives half of the objects of `id` to the full list and keeps the other
    /// half in a fresh buffer.
    fn handoff(&self, id: u32) -> u32 {
        let b = self.buf(id);
        let n = b.nobj() / 2;
        let keep = self.getempty();
        let k = self.buf(keep);
        for _ in 0..n {
            k.push(b.pop());
        }
        self.putfull(id);
        keep
    }

    /// Buffers currently on the shared lists: (full, partial, empty).
    pub fn list_lens(&self) -> (usize, usize, usize) {
        (
            self.full.len(&self.bufs),
            self.partial.len(&self.bufs),
            self.empty.len(&self.bufs),
        )
    }

    /// Objects waiting in shared buffers. Only meaningful while quiescent.
    pub fn shared_objects(&self) -> usize {
        let mut n = 0;
        for stack in [&self.full, &self.partial] {
            let mut cur = self.pop_all(stack);
            for &id in &cur {
                n += self.buf(id).nobj();
            }
            for id in cur.drain(..) {
                stack.push(&self.bufs, id);
            }
        }
        n
    }

    fn pop_all(&self, stack: &LockFreeStack) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(id) = stack.pop(&self.bufs) {
            out.push(id);
        }
        out
    }
}

/// A producer/consumer's private view of the work queue.
#[derive(Default)]
pub struct GcWork {
    wbuf1: u32,
    wbuf2: u32,
    /// Bytes marked and scan work done since the last dispose.
    pub bytes_marked: u64,
    pub scan_work: i64,
}

impl GcWork {
    pub fn new() -> Self {
        Self::default()
    }

    fn init(&mut self, q: &WorkQueue) {
        if self.wbuf1 == 0 {
            self.wbuf1 = q.getempty();
            self.wbuf2 = q.getempty();
        }
    }

    pub fn put(&mut self, q: &WorkQueue, obj: Address) {
        self.init(q);
        if q.buf(self.wbuf1).is_full() {
            std::mem::swap(&mut self.wbuf1, &mut self.wbuf2);
            if q.buf(self.wbuf1).is_full() {
                q.putfull(self.wbuf1);
                self.wbuf1 = q.getempty();
            }
        }
        q.buf(self.wbuf1).push(obj);
        q.puts.fetch_add(1, Ordering::Relaxed);
    }

    /// Pops an object without waiting for other workers.
    pub fn try_get(&mut self, q: &WorkQueue) -> Option<Address> {
        self.init(q);
        if q.buf(self.wbuf1).nobj() == 0 {
            std::mem::swap(&mut self.wbuf1, &mut self.wbuf2);
            if q.buf(self.wbuf1).nobj() == 0 {
                let owbuf = self.wbuf1;
                self.wbuf1 = q.trygetfull()?;
                q.putempty(owbuf);
            }
        }
        q.gets.fetch_add(1, Ordering::Relaxed);
        Some(q.buf(self.wbuf1).pop())
    }

    /// Pops an object, waiting in the round's rendezvous when out of work.
    pub fn get(&mut self, q: &WorkQueue) -> Option<Address> {
        self.init(q);
        if q.buf(self.wbuf1).nobj() == 0 {
            std::mem::swap(&mut self.wbuf1, &mut self.wbuf2);
            if q.buf(self.wbuf1).nobj() == 0 {
                let owbuf = self.wbuf1;
                self.wbuf1 = q.getfull()?;
                q.putempty(owbuf);
            }
        }
        q.gets.fetch_add(1, Ordering::Relaxed);
        Some(q.buf(self.wbuf1).pop())
    }

    /// Publishes cached work when other workers have none.
    pub fn balance(&mut self, q: &WorkQueue) {
        if self.wbuf1 == 0 {
            return;
        }
        if q.buf(self.wbuf2).nobj() != 0 {
            q.putfull(self.wbuf2);
            self.wbuf2 = q.getempty();
        } else if q.buf(self.wbuf1).nobj() > 4 {
            self.wbuf1 = q.handoff(self.wbuf1);
        }
    }

    /// Returns cached buffers to the shared lists and flushes the counters.
    pub fn dispose(&mut self, q: &WorkQueue) {
        for id in [std::mem::take(&mut self.wbuf1), std::mem::take(&mut self.wbuf2)] {
            if id != 0 {
                q.putpartial(id);
            }
        }
        if self.bytes_marked != 0 {
            q.bytes_marked.fetch_add(self.bytes_marked, Ordering::Relaxed);
            self.bytes_marked = 0;
        }
        if self.scan_work != 0 {
            q.scan_work.fetch_add(self.scan_work, Ordering::Relaxed);
            self.scan_work = 0;
        }
    }

    pub fn is_empty(&self, q: &WorkQueue) -> bool {
        self.wbuf1 == 0 || (q.buf(self.wbuf1).nobj() == 0 && q.buf(self.wbuf2).nobj() == 0)
    }

    /// Whether this view holds buffers.
    pub fn holds_buffers(&self) -> bool {
        self.wbuf1 != 0 || self.wbuf2 != 0
    }
}
