//! Page objects and their lifecycle.
//!
//! Every virtual page tracked by a supplemental page table is a [`Page`]. A page is born
//! uninitialized, carrying the type it will become and an optional deferred initializer.
//! The first claim runs the type initializer and then the deferred one, after which the
//! page is anonymous or file-backed for the rest of its life. Its identity (the
//! [`PageRef`] handed out by the table) never changes.
//!
//! Each page sits behind its own lock. Holding that lock is what "claiming" a page means:
//! only the lock holder may transmute it, attach a frame to it, or evict it.

mod anon;
mod file;
mod uninit;

use alloc::sync::Arc;
use core::fmt;
use spin::Mutex;

use crate::{FrameId, MappingId, PAGE_SIZE, SwapTable, VirtualAddress, VmError, VmResult};

pub(crate) use anon::AnonPage;
pub(crate) use file::{FilePage, lazy_load};
pub(crate) use uninit::UninitPage;

/// Shared handle to a page. The mutex doubles as the page's claim lock.
pub type PageRef = Arc<Mutex<Page>>;

/// The type of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    /// Not yet touched; will become one of the other types.
    Uninit,
    /// Zero-filled on first use; preserved in swap when evicted.
    Anon,
    /// Backed by a region of a file; written back when dirty.
    File,
}

/// A page-sized window onto a file.
///
/// The first `read_bytes` come from the file at `offset`; the following `zero_bytes` are
/// zero. Together they always cover exactly one page.
#[derive(Clone)]
pub struct FileSpan {
    pub(crate) file: Arc<dyn crate::File>,
    pub(crate) offset: usize,
    pub(crate) read_bytes: usize,
    pub(crate) zero_bytes: usize,
}

impl FileSpan {
    /// Creates a span reading `read_bytes` from `file` at `offset` and zeroing the rest of
    /// the page. Fails with [`VmError::InvalidArgument`] if `read_bytes` exceeds a page.
    pub fn new(file: Arc<dyn crate::File>, offset: usize, read_bytes: usize) -> VmResult<Self> {
        if read_bytes > PAGE_SIZE {
            return Err(VmError::InvalidArgument);
        }
        Ok(Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
        })
    }

    pub fn file(&self) -> &Arc<dyn crate::File> {
        &self.file
    }

    /// Returns the file offset of the first byte of the page.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns how many bytes of the page come from the file.
    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    /// Returns how many bytes at the end of the page are zero.
    pub fn zero_bytes(&self) -> usize {
        self.zero_bytes
    }

    /// Fills `kva` from the file, zeroing the tail. Fails with `short` if the file holds
    /// fewer bytes than the span expects.
    pub(crate) fn read_into(&self, kva: &mut [u8], short: VmError) -> VmResult<()> {
        let (head, tail) = kva.split_at_mut(self.read_bytes);
        let read = self.file.read_at(head, self.offset)?;
        if read != self.read_bytes {
            log::warn!(
                "short read at offset {:#x}: {read} of {} bytes",
                self.offset,
                self.read_bytes
            );
            return Err(short);
        }
        tail.fill(0);
        Ok(())
    }

    /// Writes the file-backed part of `kva` back to the file.
    pub(crate) fn write_from(&self, kva: &[u8]) -> VmResult<()> {
        let written = self.file.write_at(&kva[..self.read_bytes], self.offset)?;
        if written != self.read_bytes {
            log::warn!(
                "short write at offset {:#x}: {written} of {} bytes",
                self.offset,
                self.read_bytes
            );
            return Err(VmError::WriteBack);
        }
        Ok(())
    }
}

impl fmt::Debug for FileSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSpan")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

/// What an uninitialized page turns into.
///
/// A page can only become a concrete type, so there is no uninitialized target.
#[derive(Debug, Clone)]
pub enum PageTarget {
    Anon,
    File(FileSpan),
}

impl PageTarget {
    /// Returns the type this target produces.
    pub fn vm_type(&self) -> VmType {
        match self {
            Self::Anon => VmType::Anon,
            Self::File(_) => VmType::File,
        }
    }
}

/// A deferred initializer, run once after the type initializer on first claim.
///
/// `kva` is the page's frame; `page` is the freshly transmuted page. Closures of the
/// matching shape implement this trait.
pub trait LazyLoad: Send + Sync {
    fn load(&self, page: &mut Page, kva: &mut [u8]) -> VmResult<()>;
}

impl<F> LazyLoad for F
where
    F: Fn(&mut Page, &mut [u8]) -> VmResult<()> + Send + Sync,
{
    fn load(&self, page: &mut Page, kva: &mut [u8]) -> VmResult<()> {
        self(page, kva)
    }
}

pub(crate) enum PageState {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

/// How an evicted or destroyed page's contents were preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Preserved {
    /// Written to a swap slot.
    Swapped,
    /// Written back to the backing file.
    WrittenBack,
    /// Nothing needed saving.
    Discarded,
}

/// One virtual page.
pub struct Page {
    va: VirtualAddress,
    writable: bool,
    pub(crate) frame: Option<FrameId>,
    pub(crate) mapping: Option<MappingId>,
    pub(crate) state: PageState,
}

impl Page {
    /// Creates an uninitialized page.
    pub(crate) fn new(
        va: VirtualAddress,
        writable: bool,
        target: PageTarget,
        init: Option<Arc<dyn LazyLoad>>,
    ) -> Self {
        debug_assert!(va.is_page_aligned());
        Self {
            va,
            writable,
            frame: None,
            mapping: None,
            state: PageState::Uninit(UninitPage::new(target, init)),
        }
    }

    /// Returns the page's user virtual address.
    pub fn va(&self) -> VirtualAddress {
        self.va
    }

    /// Returns true if user writes are permitted.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Returns the frame backing the page, if it is resident.
    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Returns the memory mapping this page belongs to, if any.
    pub fn mapping(&self) -> Option<MappingId> {
        self.mapping
    }

    /// Returns the page's type. An uninitialized page reports the type it will become.
    pub fn vm_type(&self) -> VmType {
        match &self.state {
            PageState::Uninit(uninit) => uninit.target.vm_type(),
            PageState::Anon(_) => VmType::Anon,
            PageState::File(_) => VmType::File,
        }
    }

    /// Returns the type of the page's current state.
    pub fn current_type(&self) -> VmType {
        match &self.state {
            PageState::Uninit(_) => VmType::Uninit,
            _ => self.vm_type(),
        }
    }

    /// Returns true while the page has never been claimed.
    pub fn is_uninit(&self) -> bool {
        matches!(self.state, PageState::Uninit(_))
    }

    /// Returns the file region backing a file page, once it has been transmuted.
    pub fn file_span(&self) -> Option<&FileSpan> {
        match &self.state {
            PageState::File(file) => Some(&file.span),
            _ => None,
        }
    }

    /// Fills the freshly attached frame `kva` with the page's contents.
    ///
    /// For an uninitialized page this is the one-time transmutation; for a concrete page it
    /// restores contents saved by an earlier eviction.
    pub(crate) fn swap_in(&mut self, kva: &mut [u8], swap: &SwapTable) -> VmResult<()> {
        if self.is_uninit() {
            return uninit::initialize(self, kva);
        }
        match &mut self.state {
            PageState::Uninit(_) => unreachable!(),
            PageState::Anon(anon) => anon.swap_in(kva, swap),
            PageState::File(file) => file.swap_in(kva),
        }
    }

    /// Drops the copy `swap_in` restored from, once the page is mapped again.
    pub(crate) fn finish_swap_in(&mut self, swap: &SwapTable) {
        if let PageState::Anon(anon) = &mut self.state {
            anon.release_slot(swap);
        }
    }

    /// Preserves the contents of the resident frame `kva` so the frame can be reused.
    pub(crate) fn swap_out(
        &mut self,
        kva: &[u8],
        dirty: bool,
        swap: &SwapTable,
    ) -> VmResult<Preserved> {
        let writable = self.writable;
        match &mut self.state {
            // A resident page has always been transmuted.
            PageState::Uninit(_) => Ok(Preserved::Discarded),
            PageState::Anon(anon) => anon.swap_out(kva, swap),
            PageState::File(file) => file.swap_out(kva, dirty && writable),
        }
    }

    /// Releases the page's backing resources. `kva` is the resident frame, if any.
    ///
    /// Dirty file pages are written back; swap slots are freed. The frame itself belongs to
    /// the frame table and is released by the caller.
    pub(crate) fn destroy(
        &mut self,
        kva: Option<&[u8]>,
        dirty: bool,
        swap: &SwapTable,
    ) -> VmResult<Preserved> {
        let writable = self.writable;
        match &mut self.state {
            PageState::Uninit(_) => Ok(Preserved::Discarded),
            PageState::Anon(anon) => {
                anon.release_slot(swap);
                Ok(Preserved::Discarded)
            }
            PageState::File(file) => file.destroy(kva, dirty && writable),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("va", &self.va)
            .field("writable", &self.writable)
            .field("type", &self.current_type())
            .field("target", &self.vm_type())
            .field("frame", &self.frame)
            .field("mapping", &self.mapping)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::{boxed::Box, vec};
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{MemFile, RamSwap};

    fn page_at(target: PageTarget, init: Option<Arc<dyn LazyLoad>>) -> Page {
        Page::new(VirtualAddress::new(0x40_0000), true, target, init)
    }

    #[test]
    fn uninit_reports_target_type() {
        let page = page_at(PageTarget::Anon, None);
        assert!(page.is_uninit());
        assert_eq!(page.vm_type(), VmType::Anon);
        assert_eq!(page.current_type(), VmType::Uninit);

        let file: Arc<dyn crate::File> = Arc::new(MemFile::new(vec![1u8; 16]));
        let page = page_at(PageTarget::File(FileSpan::new(file, 0, 16).unwrap()), None);
        assert_eq!(page.vm_type(), VmType::File);
        assert!(page.file_span().is_none());
    }

    #[test]
    fn anon_transmutes_to_zero_page() {
        let swap = SwapTable::new(None);
        let mut page = page_at(PageTarget::Anon, None);
        let mut frame = vec![0xffu8; PAGE_SIZE];

        page.swap_in(&mut frame, &swap).unwrap();
        assert!(!page.is_uninit());
        assert_eq!(page.vm_type(), VmType::Anon);
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn deferred_initializer_runs_once_after_type_initializer() {
        let swap = SwapTable::new(Some(Box::new(RamSwap::new(1))));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let init: Arc<dyn LazyLoad> = Arc::new(move |page: &mut Page, kva: &mut [u8]| -> VmResult<()> {
            // The type initializer has already replaced the uninitialized state.
            assert!(!page.is_uninit());
            counter.fetch_add(1, Ordering::SeqCst);
            kva[0] = 0x5a;
            Ok(())
        });
        let mut page = page_at(PageTarget::Anon, Some(init));
        let mut frame = vec![0u8; PAGE_SIZE];

        page.swap_in(&mut frame, &swap).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Evict and restore: the content comes back from swap, the loader is not rerun.
        assert_eq!(page.swap_out(&frame, true, &swap), Ok(Preserved::Swapped));
        let mut restored = vec![0u8; PAGE_SIZE];
        page.swap_in(&mut restored, &swap).unwrap();
        assert_eq!(restored[0], 0x5a);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // The slot is held until the restored page is mapped again.
        assert_eq!(swap.used(), 1);
        page.finish_swap_in(&swap);
        assert_eq!(swap.used(), 0);
    }

    #[test]
    fn oversized_span_is_rejected() {
        let file: Arc<dyn crate::File> = Arc::new(MemFile::new(vec![1u8; 2 * PAGE_SIZE]));
        assert_eq!(
            FileSpan::new(file.clone(), 0, PAGE_SIZE + 1).unwrap_err(),
            VmError::InvalidArgument
        );
        let span = FileSpan::new(file, PAGE_SIZE, 100).unwrap();
        assert_eq!(span.offset(), PAGE_SIZE);
        assert_eq!(span.read_bytes() + span.zero_bytes(), PAGE_SIZE);
    }

    #[test]
    fn deferred_failure_fails_initialization() {
        let swap = SwapTable::new(None);
        let init: Arc<dyn LazyLoad> = Arc::new(|_: &mut Page, _: &mut [u8]| -> VmResult<()> {
            Err(VmError::ReadFailed)
        });
        let mut page = page_at(PageTarget::Anon, Some(init));
        let mut frame = vec![0u8; PAGE_SIZE];

        assert_eq!(
            page.swap_in(&mut frame, &swap),
            Err(VmError::InitializationFailed)
        );
    }

    #[test]
    fn destroying_uninit_page_is_noop() {
        let swap = SwapTable::new(None);
        let mut page = page_at(PageTarget::Anon, None);
        assert_eq!(page.destroy(None, false, &swap), Ok(Preserved::Discarded));
    }
}
