//! In-memory swap device for software emulation.

use alloc::{boxed::Box, vec::Vec};
use spin::Mutex;

use crate::{PAGE_SIZE, SwapDevice, VmError, VmResult};

/// A swap device whose slots live in host memory.
pub struct RamSwap {
    slots: Mutex<Vec<Box<[u8; PAGE_SIZE]>>>,
}

impl RamSwap {
    /// Creates a device with `slots` page-sized slots.
    pub fn new(slots: usize) -> Self {
        Self {
            slots: Mutex::new((0..slots).map(|_| Box::new([0; PAGE_SIZE])).collect()),
        }
    }
}

impl SwapDevice for RamSwap {
    fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn read_slot(&self, slot: usize, buf: &mut [u8]) -> VmResult<()> {
        let slots = self.slots.lock();
        let data = slots.get(slot).ok_or(VmError::ReadFailed)?;
        buf.copy_from_slice(&data[..]);
        Ok(())
    }

    fn write_slot(&self, slot: usize, buf: &[u8]) -> VmResult<()> {
        let mut slots = self.slots.lock();
        let data = slots.get_mut(slot).ok_or(VmError::SwapExhausted)?;
        data.copy_from_slice(buf);
        Ok(())
    }
}
