//! User address spaces.
//!
//! An [`AddressSpace`] owns one process's supplemental page table, its translation table
//! and its memory mappings, and borrows the process-wide [`Vm`] for frames and swap. Page
//! allocation, claiming, removal, duplication and teardown live here; the fault handler,
//! memory-mapped files, segment loading and user copies extend it in their own modules.

use alloc::{collections::BTreeMap, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::frame::frame_bytes;
use crate::mmap::Mapping;
use crate::page::{PageState, Preserved};
use crate::{
    ErrorClass, File, FrameId, LazyLoad, MappingId, Mmu, PAGE_SIZE, Page, PageRef, PageTarget,
    SupplementalPageTable, TeardownError, VirtualAddress, Vm, VmConfig, VmError, VmResult,
    VmType,
};

/// One process's view of memory.
pub struct AddressSpace {
    vm: Arc<Vm>,
    mmu: Arc<dyn Mmu>,
    spt: SupplementalPageTable,
    pub(crate) mappings: Mutex<BTreeMap<VirtualAddress, Mapping>>,
    pub(crate) next_mapping: AtomicUsize,
    /// User stack pointer saved on entry to the kernel; zero if unknown.
    pub(crate) user_sp: AtomicUsize,
}

impl AddressSpace {
    /// Creates an empty address space translating through `mmu`.
    pub fn new(vm: Arc<Vm>, mmu: Arc<dyn Mmu>) -> Self {
        Self {
            vm,
            mmu,
            spt: SupplementalPageTable::new(),
            mappings: Mutex::new(BTreeMap::new()),
            next_mapping: AtomicUsize::new(0),
            user_sp: AtomicUsize::new(0),
        }
    }

    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn mmu(&self) -> &Arc<dyn Mmu> {
        &self.mmu
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn config(&self) -> &VmConfig {
        &self.vm.config
    }

    /// Registers an uninitialized page at `va` that becomes `target` on first access.
    ///
    /// `init`, if given, runs once after the type initializer, with the page's frame. Fails
    /// with [`VmError::AlreadyMapped`] if `va` is taken, leaving the table unchanged.
    pub fn alloc_page_with_initializer(
        &self,
        target: PageTarget,
        va: VirtualAddress,
        writable: bool,
        init: Option<Arc<dyn LazyLoad>>,
    ) -> VmResult<PageRef> {
        if !va.is_page_aligned() || !self.config().is_user_range(va, PAGE_SIZE) {
            return Err(VmError::InvalidArgument);
        }
        let page = self.spt.insert(Page::new(va, writable, target, init))?;
        log::trace!("registered page {va} (writable: {writable})");
        Ok(page)
    }

    /// Registers an uninitialized page with no deferred initializer.
    pub fn alloc_page(
        &self,
        target: PageTarget,
        va: VirtualAddress,
        writable: bool,
    ) -> VmResult<PageRef> {
        self.alloc_page_with_initializer(target, va, writable, None)
    }

    /// Makes the page containing `va` resident now.
    pub fn claim_page(&self, va: VirtualAddress) -> VmResult<()> {
        let page_ref = self.spt.find(va).ok_or(VmError::InvalidAccess)?;
        let mut page = page_ref.lock();
        self.claim_locked(&page_ref, &mut page).map(|_| ())
    }

    /// Makes `page` resident. The caller holds the page's lock.
    ///
    /// The frame is filled before the translation is installed, so user code can never see
    /// a frame whose contents are still being produced. On failure the frame is released
    /// and no translation or frame link is left behind. A page that fails to initialize is
    /// removed from the table before its lock is released, so no later claim can revive it.
    pub(crate) fn claim_locked(&self, page_ref: &PageRef, page: &mut Page) -> VmResult<FrameId> {
        if let Some(id) = page.frame() {
            // Another thread finished the claim while this one waited for the lock.
            return Ok(id);
        }
        if !self.spt.holds(page.va(), page_ref) {
            // Discarded while this thread waited for the lock.
            return Err(VmError::InvalidAccess);
        }
        let vm = &*self.vm;
        let id = vm.frames.get_frame(&vm.swap, &vm.stats)?;
        let kva = vm.frames.kernel_address(id);
        let was_uninit = page.is_uninit();

        // SAFETY: the frame is pinned to this claim and not yet mapped anywhere.
        let bytes = unsafe { frame_bytes(kva) };
        if let Err(err) = page.swap_in(bytes, &vm.swap) {
            log::debug!("failed to populate {}: {err}", page.va());
            vm.frames.release(id);
            if err.class() == ErrorClass::InitializationFailure {
                self.discard_locked(page_ref, page);
            }
            return Err(err);
        }
        let paddr = vm.frames.physical_address(id);
        if let Err(err) = self.mmu.map(page.va(), paddr, page.writable()) {
            vm.frames.release(id);
            return Err(err);
        }
        page.frame = Some(id);
        page.finish_swap_in(&vm.swap);
        vm.frames.attach(id, page_ref, &self.mmu);

        vm.stats.record_claim();
        match page.vm_type() {
            VmType::File => vm.stats.record_file_read(),
            VmType::Anon if !was_uninit => vm.stats.record_swap_in(),
            _ => {}
        }
        log::trace!("claimed {} in frame {}", page.va(), id.index());
        Ok(id)
    }

    /// Drops a page that can never be made usable. The caller holds the page's lock.
    fn discard_locked(&self, page_ref: &PageRef, page: &mut Page) {
        if !self.spt.remove_entry(page.va(), page_ref) {
            return;
        }
        if let Err(err) = self.dealloc(page) {
            log::warn!("failed to discard {}: {err}", page.va());
        }
    }

    /// Removes `page` from the table and releases its frame, swap slot or file handle.
    ///
    /// A dirty file-backed page is written back first; a failed write-back is returned but
    /// the page is released regardless.
    pub fn remove_page(&self, page_ref: &PageRef) -> VmResult<()> {
        let mut page = page_ref.lock();
        if !self.spt.remove_entry(page.va(), page_ref) {
            return Err(VmError::NotMapped);
        }
        self.dealloc(&mut page)
    }

    fn dealloc(&self, page: &mut Page) -> VmResult<()> {
        let vm = &*self.vm;
        let va = page.va();
        let frame = page.frame.take();
        let (bytes, dirty) = match frame {
            Some(id) => {
                let dirty = self.mmu.is_dirty(va);
                self.mmu.unmap(va);
                // SAFETY: the page lock is held and the translation is gone.
                (Some(&*unsafe { frame_bytes(vm.frames.kernel_address(id)) }), dirty)
            }
            None => (None, false),
        };

        let result = page.destroy(bytes, dirty, &vm.swap);
        if let Some(id) = frame {
            vm.frames.release(id);
        }
        match result {
            Ok(Preserved::WrittenBack) => {
                vm.stats.record_write_back();
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => {
                log::warn!("failed to write back {va}: {err}");
                Err(err)
            }
        }
    }

    /// Releases every page and mapping.
    ///
    /// Every page is released even if some fail; the failures are reported together.
    /// Calling this again on an emptied space does nothing.
    pub fn destroy(&self) -> Result<(), TeardownError> {
        self.mappings.lock().clear();

        let mut failed = 0;
        let mut first = None;
        for page_ref in self.spt.take_all() {
            let mut page = page_ref.lock();
            if let Err(err) = self.dealloc(&mut page) {
                failed += 1;
                first.get_or_insert(err);
            }
        }
        match first {
            None => Ok(()),
            Some(first) => Err(TeardownError { failed, first }),
        }
    }

    /// Creates a copy of this address space translating through `mmu`.
    pub fn fork(&self, mmu: Arc<dyn Mmu>) -> VmResult<AddressSpace> {
        let child = AddressSpace::new(self.vm.clone(), mmu);
        child.copy_from(self)?;
        let sp = self.user_sp.load(Ordering::Acquire);
        child.set_user_stack_pointer(VirtualAddress::new(sp));
        Ok(child)
    }

    /// Duplicates every page and mapping of `src` into this address space.
    ///
    /// Untouched pages stay untouched in the copy. Every other page gets its own frame
    /// holding a snapshot of the source page's contents at the time of the copy.
    pub fn copy_from(&self, src: &AddressSpace) -> VmResult<()> {
        let mut files: BTreeMap<MappingId, Arc<dyn File>> = BTreeMap::new();
        let mut mappings = BTreeMap::new();
        for (base, mapping) in src.mappings.lock().iter() {
            let file = mapping.file.reopen()?;
            files.insert(mapping.id, file.clone());
            mappings.insert(*base, Mapping { file, ..*mapping });
        }

        for src_ref in src.spt.snapshot() {
            let mut src_page = src_ref.lock();
            let va = src_page.va();
            let writable = src_page.writable();
            let mapping = src_page.mapping();
            let with_file = |target: &PageTarget| match (target, mapping) {
                (PageTarget::File(span), Some(id)) => {
                    let mut span = span.clone();
                    if let Some(file) = files.get(&id) {
                        span.file = file.clone();
                    }
                    PageTarget::File(span)
                }
                (target, _) => target.clone(),
            };

            if let PageState::Uninit(uninit) = &src_page.state {
                let target = with_file(&uninit.target);
                let mut page = Page::new(va, writable, target, uninit.init.clone());
                page.mapping = mapping;
                self.spt.insert(page)?;
                continue;
            }

            let frame = src.claim_locked(&src_ref, &mut src_page)?;
            let dirty = src.mmu.is_dirty(va);
            // SAFETY: the source page is locked and resident.
            let bytes = unsafe { frame_bytes(self.vm.frames.kernel_address(frame)) };
            let snapshot: Arc<[u8]> = Arc::from(&bytes[..]);
            let target = match &src_page.state {
                PageState::File(file) => with_file(&PageTarget::File(file.span.clone())),
                _ => PageTarget::Anon,
            };
            drop(src_page);

            let init: Arc<dyn LazyLoad> =
                Arc::new(move |_: &mut Page, kva: &mut [u8]| -> VmResult<()> {
                    kva.copy_from_slice(&snapshot);
                    Ok(())
                });
            let mut page = Page::new(va, writable, target, Some(init));
            page.mapping = mapping;
            self.spt.insert(page)?;
            self.claim_page(va)?;
            if dirty {
                self.mmu.set_dirty(va, true);
            }
        }

        self.next_mapping.store(
            src.next_mapping.load(Ordering::Acquire),
            Ordering::Release,
        );
        self.mappings.lock().extend(mappings);
        log::debug!("copied {} pages into new address space", self.spt.len());
        Ok(())
    }

    /// Allocates and claims the first stack page, just below the stack top.
    pub fn setup_stack(&self) -> VmResult<VirtualAddress> {
        let top = VirtualAddress::new(self.config().stack_top);
        let va = top - PAGE_SIZE;
        self.alloc_page(PageTarget::Anon, va, true)?;
        self.claim_page(va)?;
        self.set_user_stack_pointer(top);
        Ok(top)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::warn!("address space teardown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::testing::{Fixture, FlakyMmu, mem_file};
    use crate::{FileSpan, FrameAllocator, SoftwareMmu};

    #[test]
    fn alloc_rejects_duplicates_and_bad_addresses() {
        let fixture = Fixture::new(4, 4);
        let space = &fixture.space;
        let va = fixture.user_page(0);

        space.alloc_page(PageTarget::Anon, va, true).unwrap();
        assert_eq!(
            space.alloc_page(PageTarget::Anon, va, false).unwrap_err(),
            VmError::AlreadyMapped
        );
        assert!(space.spt().find(va).unwrap().lock().writable());
        assert_eq!(
            space
                .alloc_page(PageTarget::Anon, va + 1, true)
                .unwrap_err(),
            VmError::InvalidArgument
        );
        assert_eq!(space.spt().len(), 1);
    }

    #[test]
    fn claim_links_frame_and_page_both_ways() {
        let fixture = Fixture::new(4, 4);
        let space = &fixture.space;
        let frames = fixture.vm.frames();
        let va = fixture.user_page(0);

        let page = space.alloc_page(PageTarget::Anon, va, true).unwrap();
        space.claim_page(va).unwrap();

        let id = page.lock().frame().unwrap();
        assert!(Arc::ptr_eq(&frames.owner(id).unwrap(), &page));
        let translation = space.mmu().query(va).unwrap();
        assert_eq!(translation.frame, frames.physical_address(id));
        assert!(translation.writable);

        // Claiming a resident page again is a no-op.
        space.claim_page(va).unwrap();
        assert_eq!(page.lock().frame(), Some(id));
        assert_eq!(fixture.vm.stats().snapshot().claims, 1);
    }

    #[test]
    fn failed_initializer_leaves_no_frame_behind() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let va = fixture.user_page(0);
        let init: Arc<dyn LazyLoad> = Arc::new(|_: &mut Page, _: &mut [u8]| -> VmResult<()> {
            Err(VmError::ReadFailed)
        });

        let page = space
            .alloc_page_with_initializer(PageTarget::Anon, va, true, Some(init))
            .unwrap();
        assert_eq!(space.claim_page(va), Err(VmError::InitializationFailed));
        assert!(!page.lock().is_resident());
        assert!(fixture.vm.frames().is_empty());
        assert_eq!(space.mmu().query(va), None);

        // The page is gone for good: claiming it again cannot hand out a zeroed frame.
        assert!(space.spt().is_empty());
        assert_eq!(space.claim_page(va), Err(VmError::InvalidAccess));
        assert_eq!(space.read_user(va, &mut [0u8; 4]), Err(VmError::InvalidAccess));
    }

    #[test]
    fn failed_remap_keeps_swapped_contents() {
        let fixture = Fixture::new(1, 4);
        let mmu = Arc::new(FlakyMmu::default());
        let space = AddressSpace::new(fixture.vm.clone(), mmu.clone());
        let (a, b) = (fixture.user_page(0), fixture.user_page(1));
        space.alloc_page(PageTarget::Anon, a, true).unwrap();
        space.alloc_page(PageTarget::Anon, b, true).unwrap();

        space.write_user(a, b"swapped").unwrap();
        mmu.set_accessed(a, false);
        space.write_user(b, &[1]).unwrap();
        mmu.set_accessed(b, false);
        assert!(!space.spt().find(a).unwrap().lock().is_resident());

        mmu.fail_maps(true);
        assert_eq!(space.claim_page(a), Err(VmError::OutOfMemory));
        assert!(!space.spt().find(a).unwrap().lock().is_resident());
        // Both pages are now in swap; the first one's slot survived the failed claim.
        assert_eq!(fixture.vm.swap().used(), 2);

        mmu.fail_maps(false);
        let mut buf = [0u8; 7];
        space.read_user(a, &mut buf).unwrap();
        assert_eq!(&buf, b"swapped");
        assert_eq!(fixture.vm.swap().used(), 1);
    }

    #[test]
    fn remove_writes_back_dirty_file_page() {
        let fixture = Fixture::new(4, 0);
        let space = &fixture.space;
        let (file, handle) = mem_file(PAGE_SIZE);
        let va = fixture.user_page(0);

        let init: Arc<dyn LazyLoad> = Arc::new(crate::page::lazy_load);
        let target = PageTarget::File(FileSpan::new(handle, 0, PAGE_SIZE).unwrap());
        let page = space
            .alloc_page_with_initializer(target, va, true, Some(init))
            .unwrap();
        space.write_user(va + 10, b"xyz").unwrap();

        space.remove_page(&page).unwrap();
        assert!(space.spt().is_empty());
        assert!(fixture.vm.frames().is_empty());
        assert_eq!(&file.contents()[10..13], b"xyz");
        assert_eq!(file.write_count(), 1);
    }

    #[test]
    fn teardown_continues_past_failures_and_is_idempotent() {
        let fixture = Fixture::new(4, 0);
        let space = &fixture.space;
        let (file, handle) = mem_file(2 * PAGE_SIZE);

        let base = space
            .mmap(fixture.user_page(0), 2 * PAGE_SIZE, true, &handle, 0)
            .unwrap();
        space.write_user(base, b"a").unwrap();
        space.write_user(base + PAGE_SIZE, b"b").unwrap();
        space.alloc_page(PageTarget::Anon, fixture.user_page(4), true).unwrap();
        file.fail_writes(true);

        let err = space.destroy().unwrap_err();
        assert_eq!(err.failed, 2);
        assert_eq!(err.first, VmError::WriteBack);
        assert!(space.spt().is_empty());
        assert!(fixture.vm.frames().is_empty());
        assert_eq!(fixture.allocator.free_frames(), 4);

        assert_eq!(space.destroy(), Ok(()));
    }

    #[test]
    fn fork_copies_contents_eagerly_and_independently() {
        let fixture = Fixture::new(8, 4);
        let parent = &fixture.space;
        let touched = fixture.user_page(0);
        let untouched = fixture.user_page(1);

        parent.alloc_page(PageTarget::Anon, touched, true).unwrap();
        parent.alloc_page(PageTarget::Anon, untouched, true).unwrap();
        parent.write_user(touched, b"parent").unwrap();

        let child = parent.fork(Arc::new(SoftwareMmu::new())).unwrap();
        assert_eq!(child.spt().len(), 2);
        assert!(child.spt().find(untouched).unwrap().lock().is_uninit());

        let parent_frame = parent.spt().find(touched).unwrap().lock().frame().unwrap();
        let child_frame = child.spt().find(touched).unwrap().lock().frame().unwrap();
        assert_ne!(parent_frame, child_frame);

        child.write_user(touched, b"child!").unwrap();
        let mut buf = [0u8; 6];
        parent.read_user(touched, &mut buf).unwrap();
        assert_eq!(&buf, b"parent");
        child.read_user(touched, &mut buf).unwrap();
        assert_eq!(&buf, b"child!");
    }

    #[test]
    fn fork_restores_evicted_pages_before_copying() {
        let fixture = Fixture::new(2, 8);
        let parent = &fixture.space;
        let va = fixture.user_page(0);

        parent.alloc_page(PageTarget::Anon, va, true).unwrap();
        parent.write_user(va, &[9; 16]).unwrap();
        for index in 1..3 {
            let other = fixture.user_page(index);
            parent.alloc_page(PageTarget::Anon, other, true).unwrap();
            parent.write_user(other, &[1]).unwrap();
            parent.mmu().set_accessed(va, false);
        }
        assert!(!parent.spt().find(va).unwrap().lock().is_resident());

        let child = parent.fork(Arc::new(SoftwareMmu::new())).unwrap();
        let mut buf = vec![0u8; 16];
        child.read_user(va, &mut buf).unwrap();
        assert_eq!(buf, [9; 16]);
    }

    #[test]
    fn stack_setup_claims_top_page() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;

        let top = space.setup_stack().unwrap();
        let page = space.spt().find(top - 1).unwrap();
        assert!(page.lock().is_resident());
        assert_eq!(space.saved_stack_pointer(), Some(top));
    }
}
