//! x86_64 hardware translation backend.
//!
//! Wraps the `x86_64` crate's [`OffsetPageTable`] so that user page tables can be driven
//! through the architecture-independent [`Mmu`] trait. Intermediate tables are taken from
//! the same frame allocator that backs user pages.

use alloc::sync::Arc;
use spin::Mutex;
use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{
        FrameAllocator as TableFrameAllocator, Mapper, OffsetPageTable, Page, PageTable,
        PageTableFlags, PhysFrame, Size4KiB, Translate, mapper::TranslateResult,
    },
};

use crate::{FrameAllocator, Mmu, PhysicalAddress, Translation, VirtualAddress, VmError, VmResult};

/// Adapts a [`FrameAllocator`] to the allocator trait the page table mapper expects.
struct TableFrames<'a>(&'a dyn FrameAllocator);

// SAFETY: frames returned by the allocator are unused and exclusively owned by the caller.
unsafe impl TableFrameAllocator<Size4KiB> for TableFrames<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        let frame = self.0.allocate().ok()?;
        Some(PhysFrame::containing_address(PhysAddr::new(
            frame.as_usize() as u64,
        )))
    }
}

/// A user address space's page table on x86_64.
pub struct HardwareMmu {
    table: Mutex<OffsetPageTable<'static>>,
    allocator: Arc<dyn FrameAllocator>,
}

impl HardwareMmu {
    /// Creates an MMU over an existing level 4 table.
    ///
    /// # Safety
    ///
    /// `root` must be a valid level 4 page table that is not referenced elsewhere, and all of
    /// physical memory must be mapped at `physical_offset`.
    pub unsafe fn new(
        root: &'static mut PageTable,
        physical_offset: VirtualAddress,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Self {
        // SAFETY: upheld by the caller.
        let table = unsafe {
            OffsetPageTable::new(root, VirtAddr::new(physical_offset.as_usize() as u64))
        };
        Self {
            table: Mutex::new(table),
            allocator,
        }
    }

    fn page(page: VirtualAddress) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(page.as_usize() as u64))
    }

    fn update(&self, page: VirtualAddress, f: impl FnOnce(&mut PageTableFlags)) {
        let mut table = self.table.lock();
        let TranslateResult::Mapped { mut flags, .. } =
            table.translate(VirtAddr::new(page.as_usize() as u64))
        else {
            return;
        };
        f(&mut flags);
        // SAFETY: only the accessed/dirty bits change; the mapped frame stays the same.
        if let Ok(flush) = unsafe { table.update_flags(Self::page(page), flags) } {
            flush.flush();
        }
    }
}

impl Mmu for HardwareMmu {
    fn map(&self, page: VirtualAddress, frame: PhysicalAddress, writable: bool) -> VmResult<()> {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(frame.as_usize() as u64));

        let mut table = self.table.lock();
        let mut frames = TableFrames(&*self.allocator);
        // SAFETY: the frame was handed to this page by the frame table and is not mapped
        // anywhere else in this address space.
        let flush = unsafe { table.map_to(Self::page(page), frame, flags, &mut frames) }
            .map_err(|err| {
                log::error!("failed to map {page}: {err:?}");
                VmError::OutOfMemory
            })?;
        flush.flush();
        Ok(())
    }

    fn unmap(&self, page: VirtualAddress) {
        let mut table = self.table.lock();
        if let Ok((_, flush)) = table.unmap(Self::page(page)) {
            flush.flush();
        }
    }

    fn query(&self, page: VirtualAddress) -> Option<Translation> {
        let table = self.table.lock();
        match table.translate(VirtAddr::new(page.as_usize() as u64)) {
            TranslateResult::Mapped { frame, flags, .. } => Some(Translation {
                frame: PhysicalAddress::new(frame.start_address().as_u64() as usize),
                writable: flags.contains(PageTableFlags::WRITABLE),
                accessed: flags.contains(PageTableFlags::ACCESSED),
                dirty: flags.contains(PageTableFlags::DIRTY),
            }),
            _ => None,
        }
    }

    fn set_accessed(&self, page: VirtualAddress, accessed: bool) {
        self.update(page, |flags| flags.set(PageTableFlags::ACCESSED, accessed));
    }

    fn set_dirty(&self, page: VirtualAddress, dirty: bool) {
        self.update(page, |flags| flags.set(PageTableFlags::DIRTY, dirty));
    }
}
