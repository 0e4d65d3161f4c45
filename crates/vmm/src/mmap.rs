//! Memory-mapped files.

use alloc::sync::Arc;
use core::{fmt, sync::atomic::Ordering};

use crate::page::lazy_load;
use crate::{
    AddressSpace, File, FileSpan, LazyLoad, PAGE_SIZE, Page, PageTarget, VirtualAddress, VmError,
    VmResult,
};

/// Identifies one mapping within an address space. Every page of the mapping carries it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MappingId(usize);

impl MappingId {
    pub(crate) const fn new(id: usize) -> Self {
        Self(id)
    }
}

impl fmt::Debug for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappingId({})", self.0)
    }
}

/// A live mapping.
pub(crate) struct Mapping {
    pub(crate) id: MappingId,
    pub(crate) base: VirtualAddress,
    pub(crate) pages: usize,
    /// The mapping's own handle, independent of the caller's.
    pub(crate) file: Arc<dyn File>,
}

impl AddressSpace {
    /// Maps `length` bytes of `file`, starting at `offset`, at `addr`.
    ///
    /// Pages are loaded on first access. The part of the last page beyond the end of the
    /// file reads as zeroes and is never written back. On failure nothing is mapped.
    pub fn mmap(
        &self,
        addr: VirtualAddress,
        length: usize,
        writable: bool,
        file: &Arc<dyn File>,
        offset: usize,
    ) -> VmResult<VirtualAddress> {
        if addr.as_usize() == 0
            || !addr.is_page_aligned()
            || length == 0
            || offset % PAGE_SIZE != 0
        {
            return Err(VmError::InvalidArgument);
        }
        let pages = length.div_ceil(PAGE_SIZE);
        let region = pages
            .checked_mul(PAGE_SIZE)
            .filter(|&region| offset.checked_add(region).is_some())
            .ok_or(VmError::InvalidArgument)?;
        if !self.config().is_user_range(addr, region) {
            return Err(VmError::InvalidArgument);
        }
        let file_len = file.len();
        if file_len == 0 {
            return Err(VmError::InvalidArgument);
        }
        if self.spt().overlaps(addr, region) {
            return Err(VmError::AlreadyMapped);
        }

        let file = file.reopen()?;
        let id = MappingId(self.next_mapping.fetch_add(1, Ordering::AcqRel));
        let loader: Arc<dyn LazyLoad> = Arc::new(lazy_load);
        for index in 0..pages {
            let va = addr + index * PAGE_SIZE;
            let ofs = offset + index * PAGE_SIZE;
            let read_bytes = file_len.saturating_sub(ofs).min(PAGE_SIZE);

            let result = FileSpan::new(file.clone(), ofs, read_bytes).and_then(|span| {
                let mut page = Page::new(va, writable, PageTarget::File(span), Some(loader.clone()));
                page.mapping = Some(id);
                self.spt().insert(page)
            });
            if let Err(err) = result {
                for undo in 0..index {
                    self.spt().remove(addr + undo * PAGE_SIZE);
                }
                return Err(err);
            }
        }

        self.mappings.lock().insert(
            addr,
            Mapping {
                id,
                base: addr,
                pages,
                file,
            },
        );
        log::debug!("mapped {pages} pages of file at {addr} ({id:?}, offset {offset:#x})");
        Ok(addr)
    }

    /// Unmaps the mapping that starts at `addr`, writing dirty pages back to the file.
    ///
    /// Every page is released even if a write-back fails; the first failure is returned.
    pub fn munmap(&self, addr: VirtualAddress) -> VmResult<()> {
        let mapping = self
            .mappings
            .lock()
            .remove(&addr)
            .ok_or(VmError::NotMapped)?;

        let mut first = None;
        for index in 0..mapping.pages {
            let va = mapping.base + index * PAGE_SIZE;
            let Some(page_ref) = self.spt().find(va) else {
                continue;
            };
            let owner = page_ref.lock().mapping();
            if owner != Some(mapping.id) {
                continue;
            }
            if let Err(err) = self.remove_page(&page_ref) {
                first.get_or_insert(err);
            }
        }
        log::debug!("unmapped {:?} at {addr}", mapping.id);
        first.map_or(Ok(()), Err)
    }

    /// Returns the number of live mappings.
    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, mem_file, pattern};
    use crate::VmType;

    fn read_page(fixture: &Fixture, va: VirtualAddress) -> alloc::vec::Vec<u8> {
        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        fixture.space.read_user(va, &mut buf).unwrap();
        buf
    }

    fn check_partial_tail(file_len: usize) {
        let fixture = Fixture::new(8, 0);
        let space = &fixture.space;
        let (file, handle) = mem_file(file_len);
        let base = fixture.user_page(0);

        assert_eq!(space.mmap(base, 3 * PAGE_SIZE, true, &handle, 0), Ok(base));
        assert_eq!(space.spt().len(), 3);
        let before = file.contents();

        let mut contents = alloc::vec::Vec::new();
        for index in 0..3 {
            contents.extend(read_page(&fixture, base + index * PAGE_SIZE));
        }
        assert_eq!(&contents[..file_len], &before[..]);
        assert!(contents[file_len..].iter().all(|&b| b == 0));

        let last = space.spt().find(base + 2 * PAGE_SIZE).unwrap();
        let span = last.lock().file_span().cloned().unwrap();
        assert_eq!(span.read_bytes(), file_len.saturating_sub(2 * PAGE_SIZE));
        assert_eq!(span.read_bytes() + span.zero_bytes(), PAGE_SIZE);
        assert_eq!(last.lock().vm_type(), VmType::File);

        // Only the page that was written goes back to the file.
        space.write_user(base + PAGE_SIZE + 5, b"dirty").unwrap();
        space.munmap(base).unwrap();
        assert_eq!(file.write_count(), 1);
        let updated = file.contents();
        assert_eq!(&updated[PAGE_SIZE + 5..PAGE_SIZE + 10], b"dirty");
        assert_eq!(updated.len(), file_len);
        assert!(space.spt().is_empty());
        assert_eq!(space.mapping_count(), 0);
    }

    #[test]
    fn maps_file_with_partial_last_page() {
        check_partial_tail(2 * PAGE_SIZE + PAGE_SIZE / 2);
    }

    #[test]
    fn maps_file_shorter_than_region() {
        check_partial_tail(PAGE_SIZE + PAGE_SIZE / 2);
    }

    #[test]
    fn rejects_bad_arguments() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let (_, handle) = mem_file(PAGE_SIZE);
        let (_, empty) = mem_file(0);
        let base = fixture.user_page(0);

        let cases = [
            space.mmap(VirtualAddress::new(0), PAGE_SIZE, true, &handle, 0),
            space.mmap(base + 1, PAGE_SIZE, true, &handle, 0),
            space.mmap(base, 0, true, &handle, 0),
            space.mmap(base, PAGE_SIZE, true, &handle, 1),
            space.mmap(base, PAGE_SIZE, true, &empty, 0),
            space.mmap(
                VirtualAddress::new(space.config().user_limit - PAGE_SIZE),
                2 * PAGE_SIZE,
                true,
                &handle,
                0,
            ),
        ];
        for result in cases {
            assert_eq!(result, Err(VmError::InvalidArgument));
        }
        assert!(space.spt().is_empty());
    }

    #[test]
    fn oversized_length_or_offset_is_rejected() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let (_, handle) = mem_file(PAGE_SIZE);
        let base = fixture.user_page(0);

        assert_eq!(
            space.mmap(base, usize::MAX, true, &handle, 0),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.mmap(base, usize::MAX - PAGE_SIZE, true, &handle, 0),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.mmap(base, 2 * PAGE_SIZE, true, &handle, usize::MAX - (PAGE_SIZE - 1)),
            Err(VmError::InvalidArgument)
        );
        assert!(space.spt().is_empty());
        assert_eq!(space.mapping_count(), 0);
    }

    #[test]
    fn overlapping_mapping_leaves_nothing_behind() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let (_, handle) = mem_file(4 * PAGE_SIZE);
        space
            .alloc_page(PageTarget::Anon, fixture.user_page(2), true)
            .unwrap();

        assert_eq!(
            space.mmap(fixture.user_page(0), 4 * PAGE_SIZE, true, &handle, 0),
            Err(VmError::AlreadyMapped)
        );
        assert_eq!(space.spt().len(), 1);
        assert_eq!(space.mapping_count(), 0);
    }

    #[test]
    fn offset_selects_file_region() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let (_, handle) = mem_file(3 * PAGE_SIZE);
        let base = fixture.user_page(0);

        space
            .mmap(base, PAGE_SIZE, false, &handle, 2 * PAGE_SIZE)
            .unwrap();
        let page = read_page(&fixture, base);
        assert_eq!(page[0], pattern(2 * PAGE_SIZE));
        assert_eq!(space.write_user(base, &[0]), Err(VmError::WriteProtected));
    }

    #[test]
    fn mapping_outlives_callers_handle() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let (file, handle) = mem_file(PAGE_SIZE);
        let base = fixture.user_page(0);

        space.mmap(base, PAGE_SIZE, true, &handle, 0).unwrap();
        drop(handle);
        space.write_user(base, b"still here").unwrap();
        space.munmap(base).unwrap();
        assert_eq!(&file.contents()[..10], b"still here");
    }

    #[test]
    fn evicted_dirty_page_is_written_back_before_reuse() {
        let fixture = Fixture::new(1, 0);
        let space = &fixture.space;
        let (file, handle) = mem_file(2 * PAGE_SIZE);
        let base = fixture.user_page(0);
        space.mmap(base, 2 * PAGE_SIZE, true, &handle, 0).unwrap();

        space.write_user(base, b"first").unwrap();
        space.mmu().set_accessed(base, false);
        // The second page needs the only frame, so the first must reach the file before
        // its frame is refilled.
        let mut buf = [0u8; 4];
        space.read_user(base + PAGE_SIZE, &mut buf).unwrap();
        assert_eq!(&file.contents()[..5], b"first");
        assert_eq!(buf[0], pattern(PAGE_SIZE));
        assert_eq!(fixture.vm.stats().snapshot().write_backs, 1);

        // Unmapping the clean, evicted first page writes nothing more.
        space.munmap(base).unwrap();
        assert_eq!(file.write_count(), 1);
    }

    #[test]
    fn unmap_of_unknown_address_fails() {
        let fixture = Fixture::new(1, 0);
        assert_eq!(
            fixture.space.munmap(fixture.user_page(0)),
            Err(VmError::NotMapped)
        );
    }
}
