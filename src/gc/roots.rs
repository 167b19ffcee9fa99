use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{RuntimeError, RuntimeResult};
use crate::memory::Address;

/// Global slots scanned per root job.
pub const ROOT_BLOCK_SLOTS: usize = 256;

/// Global pointer slots of the program (its data and bss).
///
/// Stores need no write barrier: mark termination rescans every slot with
/// the world stopped.
pub struct Globals {
    slots: Box<[AtomicUsize]>,
}

impl Globals {
    pub fn new(nslots: usize) -> Self {
        Self {
            slots: (0..nslots).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, slot: usize) -> RuntimeResult<Address> {
        self.slots
            .get(slot)
            .map(|s| Address::from_usize(s.load(Ordering::Acquire)))
            .ok_or(RuntimeError::OutOfBounds {
                slot,
                len: self.slots.len(),
            })
    }

    pub fn set(&self, slot: usize, value: Address) -> RuntimeResult<()> {
        match self.slots.get(slot) {
            Some(s) => {
                s.store(value.to_usize(), Ordering::Release);
                Ok(())
            }
            None => Err(RuntimeError::OutOfBounds {
                slot,
                len: self.slots.len(),
            }),
        }
    }

    /// Number of root jobs the slots are split into.
    pub fn nblocks(&self) -> usize {
        (self.slots.len() + ROOT_BLOCK_SLOTS - 1) / ROOT_BLOCK_SLOTS
    }

    /// Calls `f` with every non-nil value in block `block`.
    pub fn for_each_in_block(&self, block: usize, mut f: impl FnMut(Address)) {
        let start = block * ROOT_BLOCK_SLOTS;
        let end = (start + ROOT_BLOCK_SLOTS).min(self.slots.len());
        for slot in &self.slots[start.min(end)..end] {
            let value = slot.load(Ordering::Acquire);
            if value != 0 {
                f(Address::from_usize(value));
            }
        }
    }
}
