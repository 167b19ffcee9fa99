//! Write barrier.
//!
//! Every pointer store into heap memory goes through [`write_pointer`].
//! While the barrier is enabled the stored value is shaded, whatever the
//! colour of the object written to (insertion barrier, not refined by the
//! slot's colour). Stack and global slots are not covered; mark termination
//! re-scans them.
//!
//! # Usage
//!
//! ```ignore
//! let mut gcw = ctx.gcw.lock();
//! barrier::write_pointer(&rt, &mut gcw, slot, value);
//! ```

use super::workbuf::GcWork;
use super::GcPhase;
use crate::memory::Address;
use crate::runtime::RuntimeState;

/// Stores `value` at `slot` and shades it when the barrier is on. `gcw` is
/// the work cache of the storing context.
#[inline]
pub fn write_pointer(rt: &RuntimeState, gcw: &mut GcWork, slot: Address, value: Address) {
    rt.heap.arena.store(slot, value.to_usize());
    if rt.gc.barrier_enabled() {
        shade_value(rt, gcw, value);
    }
}

#[cold]
fn shade_value(rt: &RuntimeState, gcw: &mut GcWork, value: Address) {
    let q = &rt.gc.work;
    super::mark::shade(&rt.heap, q, gcw, value);
    // Once the mark phase looks finished, cached work would go unnoticed.
    if rt.gc.blacken_promptly() || rt.gc.phase() == GcPhase::MarkTermination {
        gcw.dispose(q);
    }
}
