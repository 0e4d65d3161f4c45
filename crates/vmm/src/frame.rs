//! The frame table.
//!
//! Tracks every physical frame the VMM has taken from the frame allocator and which page,
//! if any, is resident in it. When the allocator runs dry the table evicts a resident page
//! using the clock (second-chance) algorithm and hands its frame to the new request.
//!
//! # Locking
//!
//! Claimers lock a page first and the frame table second. The evictor runs with the frame
//! table locked and therefore only ever *tries* to lock a candidate page; a page whose lock
//! is held is being claimed, copied or destroyed and is skipped.

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, slice};
use spin::Mutex;

use crate::page::Preserved;
use crate::{
    AllocError, FrameAllocator, Mmu, PAGE_SIZE, PageRef, PhysicalAddress, SwapTable,
    VirtualAddress, VmError, VmResult, VmStats,
};

/// Index of a frame in the frame table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    /// Returns the raw table index.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

/// The page resident in a frame and the address space it is mapped in.
struct FrameOwner {
    page: PageRef,
    mmu: Arc<dyn Mmu>,
}

struct FrameSlot {
    paddr: PhysicalAddress,
    kva: VirtualAddress,
    owner: Option<FrameOwner>,
    /// Set while the frame is handed out but not yet attached to a page.
    pinned: bool,
}

struct Inner {
    slots: Vec<Option<FrameSlot>>,
    free_ids: Vec<usize>,
    hand: usize,
}

impl Inner {
    fn insert(&mut self, slot: FrameSlot) -> usize {
        match self.free_ids.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn slot(&self, id: FrameId) -> &FrameSlot {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("{id:?} is not in the frame table"))
    }

    fn slot_mut(&mut self, id: FrameId) -> &mut FrameSlot {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("{id:?} is not in the frame table"))
    }
}

/// Process-wide table of frames owned by the VMM.
pub struct FrameTable {
    allocator: Arc<dyn FrameAllocator>,
    inner: Mutex<Inner>,
}

impl FrameTable {
    /// Creates an empty table drawing frames from `allocator`.
    pub fn new(allocator: Arc<dyn FrameAllocator>) -> Self {
        Self {
            allocator,
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free_ids: Vec::new(),
                hand: 0,
            }),
        }
    }

    /// Returns the frame allocator backing this table.
    pub fn allocator(&self) -> &Arc<dyn FrameAllocator> {
        &self.allocator
    }

    /// Obtains a frame for a page that is about to become resident.
    ///
    /// The frame comes from the allocator if it has one, otherwise from evicting a resident
    /// page. It is pinned until [`FrameTable::attach`] so the evictor cannot pick it.
    pub(crate) fn get_frame(&self, swap: &SwapTable, stats: &VmStats) -> VmResult<FrameId> {
        let mut inner = self.inner.lock();
        let index = match self.allocator.allocate() {
            Ok(paddr) => inner.insert(FrameSlot {
                paddr,
                kva: self.allocator.kernel_address(paddr),
                owner: None,
                pinned: true,
            }),
            Err(AllocError::OutOfMemory) => {
                let index = Self::evict(&mut inner, swap, stats)?;
                stats.record_eviction();
                index
            }
        };
        log::trace!("handing out frame {index}");
        Ok(FrameId(index))
    }

    /// Runs the clock over the table, evicts one page and returns its now-free slot.
    ///
    /// The first sweep clears accessed bits; the second is guaranteed to find any unpinned
    /// page that is not locked.
    fn evict(inner: &mut Inner, swap: &SwapTable, stats: &VmStats) -> VmResult<usize> {
        let tracked = inner.slots.len();
        if tracked == 0 {
            return Err(VmError::OutOfMemory);
        }

        for _ in 0..tracked * 2 {
            let index = inner.hand;
            inner.hand = (inner.hand + 1) % tracked;

            let Some(slot) = inner.slots[index].as_ref() else {
                continue;
            };
            if slot.pinned {
                continue;
            }
            let Some(owner) = slot.owner.as_ref() else {
                continue;
            };
            let (page_ref, mmu, paddr, kva) =
                (owner.page.clone(), owner.mmu.clone(), slot.paddr, slot.kva);

            let Some(mut page) = page_ref.try_lock() else {
                continue;
            };
            let va = page.va();
            if mmu.is_accessed(va) {
                mmu.set_accessed(va, false);
                continue;
            }

            let dirty = mmu.is_dirty(va);
            mmu.unmap(va);
            // SAFETY: the translation is gone and the page lock is held, so nothing else
            // reads or writes the frame.
            let bytes = unsafe { frame_bytes(kva) };
            match page.swap_out(bytes, dirty, swap) {
                Ok(preserved) => {
                    match preserved {
                        Preserved::Swapped => stats.record_swap_out(),
                        Preserved::WrittenBack => stats.record_write_back(),
                        Preserved::Discarded => {}
                    }
                    log::debug!("evicted {va} from frame {index} ({preserved:?})");
                }
                Err(err) => {
                    log::error!("failed to evict {va}: {err}");
                    // Leave the victim exactly as it was.
                    mmu.map(va, paddr, page.writable())?;
                    if dirty {
                        mmu.set_dirty(va, true);
                    }
                    return Err(err);
                }
            }
            page.frame = None;
            drop(page);

            if let Some(slot) = inner.slots[index].as_mut() {
                slot.owner = None;
                slot.pinned = true;
            }
            return Ok(index);
        }

        log::error!("no frame can be evicted: all {tracked} are pinned or busy");
        Err(VmError::OutOfMemory)
    }

    /// Records `page` as resident in `id`, mapped through `mmu`, and unpins the frame.
    pub(crate) fn attach(&self, id: FrameId, page: &PageRef, mmu: &Arc<dyn Mmu>) {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(id);
        debug_assert!(slot.owner.is_none(), "{id:?} already has a resident page");
        slot.owner = Some(FrameOwner {
            page: page.clone(),
            mmu: mmu.clone(),
        });
        slot.pinned = false;
    }

    /// Returns `id` to the frame allocator.
    pub(crate) fn release(&self, id: FrameId) {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.get_mut(id.0).and_then(Option::take) else {
            log::warn!("release of untracked {id:?}");
            return;
        };
        inner.free_ids.push(id.0);
        self.allocator.deallocate(slot.paddr);
    }

    /// Returns the kernel address at which frame `id` can be accessed.
    pub fn kernel_address(&self, id: FrameId) -> VirtualAddress {
        self.inner.lock().slot(id).kva
    }

    /// Returns the physical address of frame `id`.
    pub fn physical_address(&self, id: FrameId) -> PhysicalAddress {
        self.inner.lock().slot(id).paddr
    }

    /// Returns the page resident in frame `id`, if any.
    pub fn owner(&self, id: FrameId) -> Option<PageRef> {
        let inner = self.inner.lock();
        inner.slot(id).owner.as_ref().map(|owner| owner.page.clone())
    }

    /// Returns the number of frames the table currently holds.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free_ids.len()
    }

    /// Returns true if the table holds no frames.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of frames with a resident page.
    pub fn resident(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .flatten()
            .filter(|slot| slot.owner.is_some())
            .count()
    }
}

/// Views the page-sized frame at kernel address `kva` as bytes.
///
/// # Safety
///
/// `kva` must be the kernel address of a frame held by the frame table, and the caller must
/// have exclusive access to the frame's contents for `'a` (normally by holding the lock of
/// the page resident in it, or because the frame is pinned to the caller).
pub(crate) unsafe fn frame_bytes<'a>(kva: VirtualAddress) -> &'a mut [u8] {
    // SAFETY: upheld by the caller.
    unsafe { slice::from_raw_parts_mut(kva.as_mut_ptr::<u8>(), PAGE_SIZE) }
}
