//! Page table entry for software emulation.

use crate::{PAGE_SIZE, PhysicalAddress};

use super::flags::PageFlags;

/// A single leaf translation entry for software emulation.
///
/// The entry packs the frame address and the flags into one word, like a hardware entry:
/// - Bits 0-11: Flags (see [`PageFlags`])
/// - Bits 12-51: Physical frame address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// Physical address mask (bits 12-51).
    const ADDRESS_MASK: usize = 0x000F_FFFF_FFFF_F000;

    /// Flag bits mask (bits 0-11).
    const FLAGS_MASK: usize = PAGE_SIZE - 1;

    /// Creates a new entry mapping `frame` with `flags`.
    ///
    /// The frame address must be page-aligned.
    pub fn new(frame: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(frame.is_page_aligned(), "frame address must be page-aligned");
        let addr_bits = frame.as_usize() & Self::ADDRESS_MASK;
        let flag_bits = flags.to_raw() & Self::FLAGS_MASK;
        Self(addr_bits | flag_bits)
    }

    /// Returns the frame address stored in this entry, or None if it is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.flags().is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    /// Replaces the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        let addr_bits = self.0 & Self::ADDRESS_MASK;
        self.0 = addr_bits | (flags.to_raw() & Self::FLAGS_MASK);
    }

    /// Applies `f` to the flags of this entry.
    pub fn update_flags(&mut self, f: impl FnOnce(&mut PageFlags)) {
        let mut flags = self.flags();
        f(&mut flags);
        self.set_flags(flags);
    }
}
