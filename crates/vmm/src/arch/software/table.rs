//! Translation table for software emulation.

use alloc::collections::BTreeMap;
use spin::Mutex;

use crate::{Mmu, PageNumber, PhysicalAddress, Translation, VirtualAddress, VmResult};

use super::{entry::PageEntry, flags::PageFlags};

/// An emulated translation table for one address space.
///
/// Only leaf entries are modelled: the table maps virtual page numbers straight to packed
/// entries. Nothing sets the accessed and dirty bits on its own; whoever emulates the CPU
/// (the user-access helpers or a test) sets them through [`Mmu::set_accessed`] and
/// [`Mmu::set_dirty`].
#[derive(Default)]
pub struct SoftwareMmu {
    entries: Mutex<BTreeMap<PageNumber, PageEntry>>,
}

impl SoftwareMmu {
    /// Creates an empty translation table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of installed translations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no translation is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, page: VirtualAddress, f: impl FnOnce(&mut PageFlags)) {
        if let Some(entry) = self.entries.lock().get_mut(&page.page_number()) {
            entry.update_flags(f);
        }
    }
}

impl Mmu for SoftwareMmu {
    fn map(&self, page: VirtualAddress, frame: PhysicalAddress, writable: bool) -> VmResult<()> {
        debug_assert!(page.is_page_aligned(), "virtual address must be page-aligned");
        let entry = PageEntry::new(frame, PageFlags::user_page(writable));
        self.entries.lock().insert(page.page_number(), entry);
        Ok(())
    }

    fn unmap(&self, page: VirtualAddress) {
        self.entries.lock().remove(&page.page_number());
    }

    fn query(&self, page: VirtualAddress) -> Option<Translation> {
        let entry = *self.entries.lock().get(&page.page_number())?;
        let flags = entry.flags();
        Some(Translation {
            frame: entry.address()?,
            writable: flags.is_writable(),
            accessed: flags.is_accessed(),
            dirty: flags.is_dirty(),
        })
    }

    fn set_accessed(&self, page: VirtualAddress, accessed: bool) {
        self.update(page, |flags| flags.set_accessed(accessed));
    }

    fn set_dirty(&self, page: VirtualAddress, dirty: bool) {
        self.update(page, |flags| flags.set_dirty(dirty));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_query_unmap() {
        let mmu = SoftwareMmu::new();
        let page = VirtualAddress::new(0x40_0000);
        let frame = PhysicalAddress::new(0x10_0000);

        mmu.map(page, frame, false).unwrap();
        let translation = mmu.query(page).unwrap();
        assert_eq!(translation.frame, frame);
        assert!(!translation.writable);
        assert!(!translation.accessed);
        assert!(!translation.dirty);

        mmu.unmap(page);
        assert_eq!(mmu.query(page), None);
        assert!(mmu.is_empty());
    }

    #[test]
    fn tracks_accessed_and_dirty() {
        let mmu = SoftwareMmu::new();
        let page = VirtualAddress::new(0x40_0000);
        mmu.map(page, PhysicalAddress::new(0x10_0000), true).unwrap();

        mmu.set_accessed(page, true);
        mmu.set_dirty(page, true);
        assert!(mmu.is_accessed(page));
        assert!(mmu.is_dirty(page));

        mmu.set_accessed(page, false);
        assert!(!mmu.is_accessed(page));
        assert!(mmu.is_dirty(page));
    }

    #[test]
    fn remap_clears_bits() {
        let mmu = SoftwareMmu::new();
        let page = VirtualAddress::new(0x40_0000);
        mmu.map(page, PhysicalAddress::new(0x10_0000), true).unwrap();
        mmu.set_dirty(page, true);

        mmu.map(page, PhysicalAddress::new(0x11_0000), true).unwrap();
        assert!(!mmu.is_dirty(page));
    }

    #[test]
    fn bits_on_unmapped_page_are_ignored() {
        let mmu = SoftwareMmu::new();
        let page = VirtualAddress::new(0x40_0000);
        mmu.set_dirty(page, true);
        assert!(!mmu.is_dirty(page));
        assert!(mmu.is_empty());
    }
}
