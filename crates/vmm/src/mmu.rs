//! Interface to the hardware address translation of one address space.

use crate::{PhysicalAddress, VirtualAddress, VmResult};

/// The state of an installed translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// The frame the page is mapped to.
    pub frame: PhysicalAddress,
    /// Whether user writes are permitted.
    pub writable: bool,
    /// Set by the hardware when the page is read or written.
    pub accessed: bool,
    /// Set by the hardware when the page is written.
    pub dirty: bool,
}

/// Installs, clears and inspects virtual-to-physical translations.
///
/// All addresses passed to these methods are page-aligned user addresses. Implementations
/// synchronize internally, since the fault path and the evictor may act on the same address
/// space from different threads.
pub trait Mmu: Send + Sync {
    /// Maps `page` to `frame`, clearing the accessed and dirty bits.
    fn map(&self, page: VirtualAddress, frame: PhysicalAddress, writable: bool) -> VmResult<()>;

    /// Removes the translation for `page`, if any.
    fn unmap(&self, page: VirtualAddress);

    /// Returns the translation for `page`, if one is installed.
    fn query(&self, page: VirtualAddress) -> Option<Translation>;

    /// Sets or clears the accessed bit of an installed translation.
    fn set_accessed(&self, page: VirtualAddress, accessed: bool);

    /// Sets or clears the dirty bit of an installed translation.
    fn set_dirty(&self, page: VirtualAddress, dirty: bool);

    /// Returns true if `page` is mapped and its accessed bit is set.
    fn is_accessed(&self, page: VirtualAddress) -> bool {
        self.query(page).is_some_and(|t| t.accessed)
    }

    /// Returns true if `page` is mapped and its dirty bit is set.
    fn is_dirty(&self, page: VirtualAddress) -> bool {
        self.query(page).is_some_and(|t| t.dirty)
    }
}
