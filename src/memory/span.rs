use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use super::{Address, FixAlloc, PAGE_SHIFT, PAGE_SIZE, WORD_SIZE};
use crate::error::throw;

/// Index of a span record. Zero means "no span".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SpanId(u32);

impl SpanId {
    #[inline(always)]
    pub fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline(always)]
    pub fn raw(self) -> u32 {
        self.0
    }
}

#[inline(always)]
pub fn raw_of(id: Option<SpanId>) -> u32 {
    id.map(|s| s.0).unwrap_or(0)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SpanState {
    /// Record is not describing memory.
    Dead = 0,
    Free = 1,
    InUse = 2,
    Stack = 3,
}

impl SpanState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Free,
            2 => Self::InUse,
            3 => Self::Stack,
            _ => Self::Dead,
        }
    }
}

/// Where a span currently lives. A span is in exactly one of these places.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SpanLocation {
    Nowhere = 0,
    HeapFree = 1,
    HeapLarge = 2,
    CentralNonempty = 3,
    CentralEmpty = 4,
    Cached = 5,
    StackPool = 6,
    /// Handed out: a large object, a dedicated stack or a fully used stack span.
    Busy = 7,
}

impl SpanLocation {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::HeapFree,
            2 => Self::HeapLarge,
            3 => Self::CentralNonempty,
            4 => Self::CentralEmpty,
            5 => Self::Cached,
            6 => Self::StackPool,
            7 => Self::Busy,
            _ => Self::Nowhere,
        }
    }
}

/// Per-object collector state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ObjectState {
    /// Not allocated; its first word links the span's free list.
    Free = 0,
    White = 1,
    Grey = 2,
    Black = 3,
}

impl ObjectState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::White,
            2 => Self::Grey,
            3 => Self::Black,
            _ => Self::Free,
        }
    }

    pub fn is_allocated(self) -> bool {
        self != Self::Free
    }

    pub fn is_marked(self) -> bool {
        matches!(self, Self::Grey | Self::Black)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum WordKind {
    Scalar = 0,
    Pointer = 1,
}

/// Object metadata of an in-use span.
#[derive(Default)]
pub struct ObjectTable {
    states: Box<[AtomicU8]>,
    scannable: Box<[AtomicBool]>,
    words: Box<[AtomicU8]>,
}

impl ObjectTable {
    fn new(nelems: usize, nwords: usize) -> Self {
        Self {
            states: (0..nelems).map(|_| AtomicU8::new(ObjectState::Free as u8)).collect(),
            scannable: (0..nelems).map(|_| AtomicBool::new(false)).collect(),
            words: (0..nwords).map(|_| AtomicU8::new(WordKind::Scalar as u8)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    #[inline]
    pub fn state(&self, index: usize) -> ObjectState {
        ObjectState::from_u8(self.states[index].load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, index: usize, state: ObjectState) {
        self.states[index].store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn cas_state(&self, index: usize, from: ObjectState, to: ObjectState) -> bool {
        self.states[index]
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_scannable(&self, index: usize) -> bool {
        self.scannable[index].load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_scannable(&self, index: usize, scannable: bool) {
        self.scannable[index].store(scannable, Ordering::Release);
    }

    #[inline]
    pub fn word_kind(&self, word: usize) -> WordKind {
        if self.words[word].load(Ordering::Relaxed) == WordKind::Pointer as u8 {
            WordKind::Pointer
        } else {
            WordKind::Scalar
        }
    }

    #[inline]
    pub fn set_word_kind(&self, word: usize, kind: WordKind) {
        self.words[word].store(kind as u8, Ordering::Relaxed);
    }
}

/// A run of pages.
///
/// Fields change under the protocol of whoever owns the span at the moment
/// (heap lock, central lock, owning cache, or the sweeper that won the
/// sweep-generation CAS); they are atomics so that the collector can read
/// them without taking any of those locks.
#[derive(Default)]
pub struct Span {
    id: AtomicU32,
    start: AtomicUsize,
    npages: AtomicUsize,
    state: AtomicU8,
    location: AtomicU8,
    size_class: AtomicUsize,
    elem_size: AtomicUsize,
    nelems: AtomicUsize,
    pub sweep_gen: AtomicU32,
    /// Head of the free-object (or free-stack) list threaded through memory.
    pub freelist: AtomicUsize,
    /// Objects (or stack segments) handed out.
    pub alloc_count: AtomicUsize,
    pub needzero: AtomicBool,
    pub unused_since: AtomicU64,
    pub released_pages: AtomicUsize,
    pub(crate) next: AtomicU32,
    pub(crate) prev: AtomicU32,
    objects: RwLock<ObjectTable>,
}

impl Span {
    /// Describes pages `start..start + npages`; every other field is reset
    /// except the zeroing and scavenging bookkeeping which the caller sets.
    pub fn init(&self, id: SpanId, start: usize, npages: usize) {
        self.id.store(id.0, Ordering::Relaxed);
        self.start.store(start, Ordering::Relaxed);
        self.npages.store(npages, Ordering::Relaxed);
        self.state.store(SpanState::Dead as u8, Ordering::Relaxed);
        self.location.store(SpanLocation::Nowhere as u8, Ordering::Relaxed);
        self.size_class.store(0, Ordering::Relaxed);
        self.elem_size.store(0, Ordering::Relaxed);
        self.nelems.store(0, Ordering::Relaxed);
        self.sweep_gen.store(0, Ordering::Relaxed);
        self.freelist.store(0, Ordering::Relaxed);
        self.alloc_count.store(0, Ordering::Relaxed);
        self.needzero.store(false, Ordering::Relaxed);
        self.unused_since.store(0, Ordering::Relaxed);
        self.released_pages.store(0, Ordering::Relaxed);
        self.next.store(0, Ordering::Relaxed);
        self.prev.store(0, Ordering::Relaxed);
        *self.objects.write() = ObjectTable::default();
    }

    /// Prepares an in-use span for objects of `elem_size` bytes.
    pub fn init_objects(&self, size_class: usize, elem_size: usize, nelems: usize) {
        let nwords = (nelems * elem_size) / WORD_SIZE;
        *self.objects.write() = ObjectTable::new(nelems, nwords);
        self.size_class.store(size_class, Ordering::Relaxed);
        self.elem_size.store(elem_size, Ordering::Relaxed);
        self.nelems.store(nelems, Ordering::Release);
    }

    /// Drops object metadata, used when the span leaves the in-use state.
    pub fn clear_objects(&self) {
        self.nelems.store(0, Ordering::Release);
        self.elem_size.store(0, Ordering::Relaxed);
        self.size_class.store(0, Ordering::Relaxed);
        *self.objects.write() = ObjectTable::default();
    }

    pub fn id(&self) -> SpanId {
        SpanId(self.id.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start.load(Ordering::Acquire)
    }

    pub fn set_start(&self, start: usize) {
        self.start.store(start, Ordering::Release);
    }

    #[inline]
    pub fn npages(&self) -> usize {
        self.npages.load(Ordering::Acquire)
    }

    pub fn set_npages(&self, npages: usize) {
        self.npages.store(npages, Ordering::Release);
    }

    #[inline]
    pub fn base(&self) -> Address {
        Address::from_page(self.start())
    }

    #[inline]
    pub fn limit(&self) -> Address {
        Address::from_page(self.start() + self.npages())
    }

    pub fn bytes(&self) -> usize {
        self.npages() << PAGE_SHIFT
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.base() && addr < self.limit()
    }

    #[inline]
    pub fn state(&self) -> SpanState {
        SpanState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: SpanState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn location(&self) -> SpanLocation {
        SpanLocation::from_u8(self.location.load(Ordering::Acquire))
    }

    pub fn set_location(&self, location: SpanLocation) {
        self.location.store(location as u8, Ordering::Release);
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        self.size_class.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nelems(&self) -> usize {
        self.nelems.load(Ordering::Acquire)
    }

    pub fn objects(&self) -> RwLockReadGuard<'_, ObjectTable> {
        self.objects.read()
    }

    /// Index of the object containing `addr`, if `addr` lies in an object slot.
    #[inline]
    pub fn object_index(&self, addr: Address) -> Option<usize> {
        let elem = self.elem_size();
        if elem == 0 || !self.contains(addr) {
            return None;
        }
        let index = addr.diff(self.base()) / elem;
        if index < self.nelems() {
            Some(index)
        } else {
            None
        }
    }

    #[inline]
    pub fn object_base(&self, index: usize) -> Address {
        self.base().offset(index * self.elem_size())
    }

    pub fn free_bytes_tail(&self) -> usize {
        self.bytes() - self.nelems() * self.elem_size()
    }
}

/// Doubly linked list of spans threaded through the span records.
///
/// The list itself is protected by its owner's lock; the links live in the
/// span records so membership changes need no allocation.
pub struct SpanList {
    first: u32,
    last: u32,
    len: usize,
    location: SpanLocation,
}

impl SpanList {
    pub const fn new(location: SpanLocation) -> Self {
        Self {
            first: 0,
            last: 0,
            len: 0,
            location,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<SpanId> {
        SpanId::from_raw(self.first)
    }

    pub fn location(&self) -> SpanLocation {
        self.location
    }

    fn check_detached(&self, span: &Span, id: SpanId) {
        if span.location() != SpanLocation::Nowhere {
            throw(&format!(
                "span {:?} inserted into {:?} list while in {:?}",
                id,
                self.location,
                span.location()
            ));
        }
    }

    pub fn push_front(&mut self, spans: &FixAlloc<Span>, id: SpanId) {
        let span = spans.get(id.0);
        self.check_detached(span, id);
        span.prev.store(0, Ordering::Relaxed);
        span.next.store(self.first, Ordering::Relaxed);
        if self.first != 0 {
            spans.get(self.first).prev.store(id.0, Ordering::Relaxed);
        } else {
            self.last = id.0;
        }
        self.first = id.0;
        self.len += 1;
        span.set_location(self.location);
    }

    pub fn push_back(&mut self, spans: &FixAlloc<Span>, id: SpanId) {
        let span = spans.get(id.0);
        self.check_detached(span, id);
        span.next.store(0, Ordering::Relaxed);
        span.prev.store(self.last, Ordering::Relaxed);
        if self.last != 0 {
            spans.get(self.last).next.store(id.0, Ordering::Relaxed);
        } else {
            self.first = id.0;
        }
        self.last = id.0;
        self.len += 1;
        span.set_location(self.location);
    }

    pub fn remove(&mut self, spans: &FixAlloc<Span>, id: SpanId) {
        let span = spans.get(id.0);
        if span.location() != self.location {
            throw(&format!(
                "span {:?} removed from {:?} list but lives in {:?}",
                id,
                self.location,
                span.location()
            ));
        }
        let prev = span.prev.load(Ordering::Relaxed);
        let next = span.next.load(Ordering::Relaxed);
        if prev != 0 {
            spans.get(prev).next.store(next, Ordering::Relaxed);
        } else {
            self.first = next;
        }
        if next != 0 {
            spans.get(next).prev.store(prev, Ordering::Relaxed);
        } else {
            self.last = prev;
        }
        span.next.store(0, Ordering::Relaxed);
        span.prev.store(0, Ordering::Relaxed);
        span.set_location(SpanLocation::Nowhere);
        self.len -= 1;
    }

    pub fn pop_front(&mut self, spans: &FixAlloc<Span>) -> Option<SpanId> {
        let id = self.first()?;
        self.remove(spans, id);
        Some(id)
    }

    /// Span following `id` in this list.
    pub fn next_of(&self, spans: &FixAlloc<Span>, id: SpanId) -> Option<SpanId> {
        SpanId::from_raw(spans.get(id.0).next.load(Ordering::Relaxed))
    }

    pub fn ids(&self, spans: &FixAlloc<Span>) -> Vec<SpanId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.first;
        while cur != 0 {
            out.push(SpanId(cur));
            cur = spans.get(cur).next.load(Ordering::Relaxed);
        }
        out
    }
}

pub fn pages_to_bytes(npages: usize) -> usize {
    npages * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans_with(n: usize) -> (FixAlloc<Span>, Vec<SpanId>) {
        let spans: FixAlloc<Span> = FixAlloc::new(64);
        let ids = (0..n)
            .map(|i| {
                let id = SpanId::from_raw(spans.alloc()).unwrap();
                spans.get(id.raw()).init(id, 1 + i * 2, 2);
                id
            })
            .collect();
        (spans, ids)
    }

    #[test]
    fn list_links() {
        let (spans, ids) = spans_with(4);
        let mut list = SpanList::new(SpanLocation::HeapFree);
        for &id in &ids {
            list.push_back(&spans, id);
        }
        assert_eq!(list.len(), 4);
        list.remove(&spans, ids[1]);
        assert_eq!(list.ids(&spans), vec![ids[0], ids[2], ids[3]]);
        assert_eq!(spans.get(ids[1].raw()).location(), SpanLocation::Nowhere);
        list.push_front(&spans, ids[1]);
        assert_eq!(list.pop_front(&spans), Some(ids[1]));
        assert_eq!(list.next_of(&spans, ids[0]), Some(ids[2]));
    }

    #[test]
    #[should_panic(expected = "inserted into")]
    fn double_insert_is_fatal() {
        let (spans, ids) = spans_with(1);
        let mut a = SpanList::new(SpanLocation::HeapFree);
        let mut b = SpanList::new(SpanLocation::CentralEmpty);
        a.push_back(&spans, ids[0]);
        b.push_back(&spans, ids[0]);
    }

    #[test]
    fn object_lookup() {
        let (spans, ids) = spans_with(1);
        let span = spans.get(ids[0].raw());
        span.init_objects(3, 48, (2 * PAGE_SIZE) / 48);
        let base = span.base();
        assert_eq!(span.object_index(base), Some(0));
        assert_eq!(span.object_index(base.offset(47)), Some(0));
        assert_eq!(span.object_index(base.offset(48 * 5 + 8)), Some(5));
        assert_eq!(span.object_index(span.limit()), None);
        assert_eq!(span.object_base(5), base.offset(240));
        let table = span.objects();
        assert_eq!(table.state(5), ObjectState::Free);
        assert!(!table.cas_state(5, ObjectState::White, ObjectState::Grey));
        table.set_state(5, ObjectState::White);
        assert!(table.cas_state(5, ObjectState::White, ObjectState::Grey));
        assert!(table.state(5).is_marked());
    }
}
