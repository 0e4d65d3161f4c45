//! Fixtures shared by the unit tests.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    AddressSpace, EmulatedFrameAllocator, File, MemFile, Mmu, PAGE_SIZE, PhysicalAddress,
    RamSwap, SoftwareMmu, SwapDevice, Translation, VirtualAddress, Vm, VmConfig, VmError,
    VmResult,
};

/// First user page handed out by [`Fixture::user_page`].
const USER_BASE: usize = 0x40_0000;

/// A virtual memory service with a handful of frames and one address space.
pub(crate) struct Fixture {
    pub space: AddressSpace,
    pub vm: Arc<Vm>,
    pub allocator: Arc<EmulatedFrameAllocator>,
}

impl Fixture {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        Self::with_config(VmConfig::new(), frames, swap_slots)
    }

    pub fn with_config(config: VmConfig, frames: usize, swap_slots: usize) -> Self {
        let allocator = Arc::new(EmulatedFrameAllocator::new(frames));
        let swap = (swap_slots > 0)
            .then(|| Box::new(RamSwap::new(swap_slots)) as Box<dyn SwapDevice>);
        let vm = Vm::new(config, allocator.clone(), swap);
        Self {
            space: AddressSpace::new(vm.clone(), Arc::new(SoftwareMmu::new())),
            vm,
            allocator,
        }
    }

    /// Creates another address space sharing this fixture's frames and swap.
    pub fn new_space(&self) -> AddressSpace {
        AddressSpace::new(self.vm.clone(), Arc::new(SoftwareMmu::new()))
    }

    pub fn user_page(&self, index: usize) -> VirtualAddress {
        VirtualAddress::new(USER_BASE + index * PAGE_SIZE)
    }
}

/// The byte stored at `offset` in files made by [`mem_file`]. Never zero.
pub(crate) fn pattern(offset: usize) -> u8 {
    (offset % 251) as u8 + 1
}

/// Creates an in-memory file of `len` patterned bytes, returning it and a handle to it.
pub(crate) fn mem_file(len: usize) -> (MemFile, Arc<dyn File>) {
    let file = MemFile::new((0..len).map(pattern).collect::<Vec<_>>());
    let handle: Arc<dyn File> = Arc::new(file.clone());
    (file, handle)
}

/// A software translation table whose `map` can be made to fail, as a hardware table does
/// when it cannot allocate an intermediate level.
#[derive(Default)]
pub(crate) struct FlakyMmu {
    inner: SoftwareMmu,
    fail_maps: AtomicBool,
}

impl FlakyMmu {
    pub fn fail_maps(&self, fail: bool) {
        self.fail_maps.store(fail, Ordering::SeqCst);
    }
}

impl Mmu for FlakyMmu {
    fn map(&self, page: VirtualAddress, frame: PhysicalAddress, writable: bool) -> VmResult<()> {
        if self.fail_maps.load(Ordering::SeqCst) {
            return Err(VmError::OutOfMemory);
        }
        self.inner.map(page, frame, writable)
    }

    fn unmap(&self, page: VirtualAddress) {
        self.inner.unmap(page)
    }

    fn query(&self, page: VirtualAddress) -> Option<Translation> {
        self.inner.query(page)
    }

    fn set_accessed(&self, page: VirtualAddress, accessed: bool) {
        self.inner.set_accessed(page, accessed)
    }

    fn set_dirty(&self, page: VirtualAddress, dirty: bool) {
        self.inner.set_dirty(page, dirty)
    }
}
