use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::utils::formatted_size;

/// Live heap accounting, updated by the allocator, the sweeper and the
/// scavenger.
#[derive(Default)]
pub struct HeapCounters {
    /// Bytes taken from the reservation for the heap.
    pub heap_sys: AtomicUsize,
    /// Bytes in spans holding objects.
    pub heap_inuse: AtomicUsize,
    /// Bytes of free spans whose pages were handed back.
    pub heap_released: AtomicUsize,
    /// Bytes in stack spans.
    pub stacks_inuse: AtomicUsize,
    /// Bytes of allocated objects, dead or alive, not yet swept.
    pub heap_live: AtomicUsize,
    /// Bytes of allocated objects that contain pointers.
    pub heap_scan: AtomicUsize,
    pub heap_objects: AtomicUsize,
    pub nmalloc: AtomicU64,
    pub nfree: AtomicU64,
    pub nlarge_alloc: AtomicU64,
    pub nlarge_free: AtomicU64,
}

impl HeapCounters {
    #[inline]
    pub fn add(counter: &AtomicUsize, bytes: usize) {
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Saturating subtraction; counters are advisory and must never wrap.
    #[inline]
    pub fn sub(counter: &AtomicUsize, bytes: usize) {
        let mut cur = counter.load(Ordering::Relaxed);
        loop {
            let new = cur.saturating_sub(bytes);
            match counter.compare_exchange_weak(cur, new, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn load(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

/// Snapshot of memory and collector statistics.
#[derive(Clone, Debug, Default)]
pub struct MemStats {
    pub heap_sys: usize,
    pub heap_inuse: usize,
    pub heap_idle: usize,
    pub heap_released: usize,
    pub heap_live: usize,
    pub heap_objects: usize,
    pub heap_marked: usize,
    pub stacks_inuse: usize,
    pub span_inuse: usize,
    pub span_sys: usize,
    pub nmalloc: u64,
    pub nfree: u64,
    pub next_gc: usize,
    pub num_gc: usize,
    pub pause_total: Duration,
    pub last_pause: Duration,
    pub trigger_ratio: f64,
}

impl fmt::Display for MemStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "memory statistics:")?;
        writeln!(f, "  heap sys: {}", formatted_size(self.heap_sys))?;
        writeln!(f, "  heap in use: {}", formatted_size(self.heap_inuse))?;
        writeln!(f, "  heap idle: {}", formatted_size(self.heap_idle))?;
        writeln!(f, "  heap released: {}", formatted_size(self.heap_released))?;
        writeln!(f, "  heap live: {}", formatted_size(self.heap_live))?;
        writeln!(f, "  heap marked: {}", formatted_size(self.heap_marked))?;
        writeln!(f, "  heap objects: {}", self.heap_objects)?;
        writeln!(f, "  stacks in use: {}", formatted_size(self.stacks_inuse))?;
        writeln!(
            f,
            "  span records: {} in use, {}",
            self.span_inuse,
            formatted_size(self.span_sys)
        )?;
        writeln!(f, "  mallocs: {}, frees: {}", self.nmalloc, self.nfree)?;
        writeln!(f, "  next gc: {}", formatted_size(self.next_gc))?;
        writeln!(f, "  trigger ratio: {:.3}", self.trigger_ratio)?;
        writeln!(f, "  gc count: {}", self.num_gc)?;
        writeln!(
            f,
            "  pause total: {:.3}ms, last pause: {:.3}ms",
            self.pause_total.as_secs_f64() * 1000.0,
            self.last_pause.as_secs_f64() * 1000.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_sub() {
        let c = AtomicUsize::new(10);
        HeapCounters::sub(&c, 4);
        assert_eq!(HeapCounters::load(&c), 6);
        HeapCounters::sub(&c, 100);
        assert_eq!(HeapCounters::load(&c), 0);
    }

    #[test]
    fn display_mentions_sizes() {
        let stats = MemStats {
            heap_sys: 4 << 20,
            num_gc: 3,
            ..Default::default()
        };
        let text = stats.to_string();
        assert!(text.contains("heap sys: 4.0M"));
        assert!(text.contains("gc count: 3"));
    }
}
