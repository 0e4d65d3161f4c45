//! Lazy loading of executable segments.

use alloc::sync::Arc;

use crate::{
    AddressSpace, File, FileSpan, LazyLoad, PAGE_SIZE, Page, PageTarget, VirtualAddress, VmError,
    VmResult,
};

impl AddressSpace {
    /// Registers the pages of a program segment without reading anything yet.
    ///
    /// The segment occupies `read_bytes + zero_bytes` bytes at `upage`: the first
    /// `read_bytes` come from `file` at `offset`, the rest are zero. Each page is anonymous
    /// once loaded, so later modifications go to swap and never to the executable.
    pub fn load_segment(
        &self,
        file: &Arc<dyn File>,
        offset: usize,
        upage: VirtualAddress,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> VmResult<()> {
        let total = read_bytes
            .checked_add(zero_bytes)
            .filter(|&total| offset.checked_add(total).is_some())
            .ok_or(VmError::InvalidArgument)?;
        if total % PAGE_SIZE != 0 || !upage.is_page_aligned() || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        if total == 0 {
            return Ok(());
        }
        if !self.config().is_user_range(upage, total) {
            return Err(VmError::InvalidArgument);
        }
        if self.spt().overlaps(upage, total) {
            return Err(VmError::AlreadyMapped);
        }

        let pages = total / PAGE_SIZE;
        for index in 0..pages {
            let va = upage + index * PAGE_SIZE;
            let page_read = read_bytes.saturating_sub(index * PAGE_SIZE).min(PAGE_SIZE);
            let result =
                FileSpan::new(file.clone(), offset + index * PAGE_SIZE, page_read).and_then(|span| {
                    let init: Arc<dyn LazyLoad> =
                        Arc::new(move |_: &mut Page, kva: &mut [u8]| -> VmResult<()> {
                            span.read_into(kva, VmError::ReadFailed)
                        });
                    self.alloc_page_with_initializer(PageTarget::Anon, va, writable, Some(init))
                });
            if let Err(err) = result {
                for undo in 0..index {
                    self.spt().remove(upage + undo * PAGE_SIZE);
                }
                return Err(err);
            }
        }
        log::debug!("segment at {upage}: {pages} pages, {read_bytes:#x} bytes from file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, mem_file, pattern};
    use crate::VmType;

    #[test]
    fn segment_reads_file_then_zeroes() {
        let fixture = Fixture::new(4, 4);
        let space = &fixture.space;
        let (file, handle) = mem_file(2 * PAGE_SIZE);
        let base = fixture.user_page(0);

        let read_bytes = PAGE_SIZE + 100;
        space
            .load_segment(&handle, 0, base, read_bytes, 3 * PAGE_SIZE - read_bytes, true)
            .unwrap();
        assert_eq!(space.spt().len(), 3);
        let page = space.spt().find(base).unwrap();
        assert!(page.lock().is_uninit());
        assert_eq!(page.lock().vm_type(), VmType::Anon);

        let mut buf = alloc::vec![0xffu8; 3 * PAGE_SIZE];
        space.read_user(base, &mut buf).unwrap();
        assert_eq!(&buf[..read_bytes], &file.contents()[..read_bytes]);
        assert!(buf[read_bytes..].iter().all(|&b| b == 0));
        assert_eq!(buf[PAGE_SIZE], pattern(PAGE_SIZE));

        // Writes stay in memory: the executable is never modified.
        space.write_user(base, b"patched").unwrap();
        space.destroy().unwrap();
        assert_eq!(file.write_count(), 0);
    }

    #[test]
    fn segment_over_existing_page_leaves_nothing_behind() {
        let fixture = Fixture::new(4, 0);
        let space = &fixture.space;
        let (_, handle) = mem_file(PAGE_SIZE);
        space
            .alloc_page(PageTarget::Anon, fixture.user_page(1), true)
            .unwrap();

        assert_eq!(
            space.load_segment(&handle, 0, fixture.user_page(0), PAGE_SIZE, PAGE_SIZE, false),
            Err(VmError::AlreadyMapped)
        );
        assert_eq!(space.spt().len(), 1);
    }

    #[test]
    fn truncated_executable_fails_on_first_touch() {
        let fixture = Fixture::new(4, 0);
        let space = &fixture.space;
        let (_, handle) = mem_file(100);
        let base = fixture.user_page(0);

        space
            .load_segment(&handle, 0, base, PAGE_SIZE, 0, false)
            .unwrap();
        let mut byte = [0u8];
        assert_eq!(
            space.read_user(base, &mut byte),
            Err(VmError::InitializationFailed)
        );
        assert!(space.spt().is_empty());
    }

    #[test]
    fn rejects_misaligned_segments() {
        let fixture = Fixture::new(1, 0);
        let (_, handle) = mem_file(PAGE_SIZE);
        let base = fixture.user_page(0);
        let space = &fixture.space;

        assert_eq!(
            space.load_segment(&handle, 0, base, 10, 10, true),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.load_segment(&handle, 0, base + 8, PAGE_SIZE, 0, true),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(space.load_segment(&handle, 0, base, 0, 0, true), Ok(()));
    }

    #[test]
    fn rejects_segments_that_overflow() {
        let fixture = Fixture::new(1, 0);
        let (_, handle) = mem_file(PAGE_SIZE);
        let base = fixture.user_page(0);
        let space = &fixture.space;

        assert_eq!(
            space.load_segment(&handle, 0, base, usize::MAX, PAGE_SIZE, true),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(
            space.load_segment(&handle, usize::MAX - (PAGE_SIZE - 1), base, PAGE_SIZE, PAGE_SIZE, true),
            Err(VmError::InvalidArgument)
        );
        assert!(space.spt().is_empty());
    }
}
