//! Copying to and from user memory on behalf of the kernel.
//!
//! The copies go through the same fault path a user access would take, and set the
//! accessed and dirty bits the way the hardware does for a real access.

use core::sync::atomic::Ordering;

use crate::frame::frame_bytes;
use crate::{AddressSpace, FaultInfo, PAGE_SIZE, VirtualAddress, VmError, VmResult};

impl AddressSpace {
    /// Records the user stack pointer saved on entry to the kernel.
    pub fn set_user_stack_pointer(&self, sp: VirtualAddress) {
        self.user_sp.store(sp.as_usize(), Ordering::Release);
    }

    pub(crate) fn saved_stack_pointer(&self) -> Option<VirtualAddress> {
        match self.user_sp.load(Ordering::Acquire) {
            0 => None,
            sp => Some(VirtualAddress::new(sp)),
        }
    }

    /// Copies `buf.len()` bytes of user memory starting at `va` into `buf`.
    pub fn read_user(&self, va: VirtualAddress, buf: &mut [u8]) -> VmResult<()> {
        self.access_user(va, buf.len(), false, |frame, at| {
            buf[at..at + frame.len()].copy_from_slice(frame);
        })
    }

    /// Copies `bytes` into user memory starting at `va`.
    pub fn write_user(&self, va: VirtualAddress, bytes: &[u8]) -> VmResult<()> {
        self.access_user(va, bytes.len(), true, |frame, at| {
            frame.copy_from_slice(&bytes[at..at + frame.len()]);
        })
    }

    /// Walks `[va, va + len)` page by page, handing `f` each resident piece together with
    /// its offset from `va`.
    fn access_user(
        &self,
        va: VirtualAddress,
        len: usize,
        write: bool,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> VmResult<()> {
        let mut done = 0;
        while done < len {
            let addr = va.checked_add(done).ok_or(VmError::InvalidAccess)?;
            let base = addr.page_base();
            let offset = addr.page_offset();
            let chunk = (PAGE_SIZE - offset).min(len - done);

            let translation = self.mmu().query(base);
            if translation.is_none_or(|t| write && !t.writable) {
                let info = FaultInfo::new(addr, false, write, translation.is_none());
                self.try_handle_fault(&info)?;
                continue;
            }

            let Some(page_ref) = self.spt().find(base) else {
                return Err(VmError::InvalidAccess);
            };
            let page = page_ref.lock();
            // Evicted between the lookup and the lock: fault it back in.
            let Some(frame) = page.frame() else {
                continue;
            };
            let kva = self.vm().frames.kernel_address(frame);
            // SAFETY: the page lock is held, so the frame cannot be evicted or released.
            let bytes = unsafe { frame_bytes(kva) };
            f(&mut bytes[offset..offset + chunk], done);

            self.mmu().set_accessed(base, true);
            if write {
                self.mmu().set_dirty(base, true);
            }
            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageTarget;
    use crate::testing::Fixture;

    #[test]
    fn copies_across_page_boundaries() {
        let fixture = Fixture::new(4, 0);
        let space = &fixture.space;
        for index in 0..2 {
            space
                .alloc_page(PageTarget::Anon, fixture.user_page(index), true)
                .unwrap();
        }

        let start = fixture.user_page(1) - 3;
        space.write_user(start, b"abcdef").unwrap();
        let mut buf = [0u8; 6];
        space.read_user(start, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdef");

        for index in 0..2 {
            let va = fixture.user_page(index);
            assert!(space.mmu().is_accessed(va));
            assert!(space.mmu().is_dirty(va));
        }
    }

    #[test]
    fn reads_leave_pages_clean() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let va = fixture.user_page(0);
        space.alloc_page(PageTarget::Anon, va, false).unwrap();

        let mut buf = [1u8; 4];
        space.read_user(va, &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
        assert!(space.mmu().is_accessed(va));
        assert!(!space.mmu().is_dirty(va));
    }

    #[test]
    fn unmapped_range_fails_partway() {
        let fixture = Fixture::new(2, 0);
        let space = &fixture.space;
        let va = fixture.user_page(0);
        space.alloc_page(PageTarget::Anon, va, true).unwrap();

        let result = space.write_user(va + PAGE_SIZE - 1, &[1, 2]);
        assert_eq!(result, Err(VmError::InvalidAccess));
        let mut byte = [0u8];
        space.read_user(va + PAGE_SIZE - 1, &mut byte).unwrap();
        assert_eq!(byte, [1]);
    }
}
