//! Swap slots for evicted anonymous pages.
//!
//! The swap device itself is an external block store divided into page-sized slots. This
//! module only decides which slots are in use.

use alloc::{boxed::Box, vec, vec::Vec};
use spin::Mutex;

use crate::{PAGE_SIZE, VmError, VmResult};

/// A block device divided into page-sized slots.
pub trait SwapDevice: Send + Sync {
    /// Returns the number of slots on the device.
    fn slot_count(&self) -> usize;

    /// Reads slot `slot` into `buf`, which is exactly one page long.
    fn read_slot(&self, slot: usize, buf: &mut [u8]) -> VmResult<()>;

    /// Writes `buf`, which is exactly one page long, to slot `slot`.
    fn write_slot(&self, slot: usize, buf: &[u8]) -> VmResult<()>;
}

/// Identifies the swap slot holding an evicted page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    /// Returns the raw slot index.
    pub const fn index(self) -> usize {
        self.0
    }
}

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Tracks slot usage on the swap device.
pub struct SwapTable {
    device: Option<Box<dyn SwapDevice>>,
    /// One bit per slot; set means in use.
    used: Mutex<Vec<u64>>,
    slots: usize,
}

impl SwapTable {
    /// Creates a swap table over `device`. Without a device every swap-out fails.
    pub fn new(device: Option<Box<dyn SwapDevice>>) -> Self {
        let slots = device.as_ref().map_or(0, |d| d.slot_count());
        Self {
            device,
            used: Mutex::new(vec![0; slots.div_ceil(BITS_PER_WORD)]),
            slots,
        }
    }

    /// Returns the total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Returns the number of slots holding a page.
    pub fn used(&self) -> usize {
        self.used
            .lock()
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }

    /// Writes one page to a free slot and returns the slot.
    pub fn swap_out(&self, page: &[u8]) -> VmResult<SwapSlot> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let device = self.device.as_ref().ok_or(VmError::SwapExhausted)?;
        let slot = self.claim_slot().ok_or(VmError::SwapExhausted)?;

        if let Err(err) = device.write_slot(slot.0, page) {
            self.free(slot);
            return Err(err);
        }
        Ok(slot)
    }

    /// Reads a page back from `slot` and releases the slot.
    ///
    /// On failure the slot stays allocated so the contents are not lost.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8]) -> VmResult<()> {
        self.read(slot, page)?;
        self.free(slot);
        Ok(())
    }

    /// Reads a page back from `slot`, leaving the slot allocated.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8]) -> VmResult<()> {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let device = self.device.as_ref().ok_or(VmError::ReadFailed)?;
        device.read_slot(slot.0, page)
    }

    /// Releases `slot` without reading it.
    pub fn free(&self, slot: SwapSlot) {
        let mut used = self.used.lock();
        let (word, bit) = (slot.0 / BITS_PER_WORD, slot.0 % BITS_PER_WORD);
        debug_assert!(used[word] & (1 << bit) != 0, "double free of swap slot {}", slot.0);
        used[word] &= !(1 << bit);
    }

    fn claim_slot(&self) -> Option<SwapSlot> {
        let mut used = self.used.lock();
        for (index, word) in used.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let slot = index * BITS_PER_WORD + bit;
            if slot >= self.slots {
                return None;
            }
            *word |= 1 << bit;
            return Some(SwapSlot(slot));
        }
        None
    }
}
