//! Emulated physical memory and frame allocator.

use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::{
    AllocError, FrameAllocator, FrameNumber, PAGE_SIZE, PhysicalAddress, VirtualAddress,
};

/// Physical address of the first emulated frame.
const BASE: usize = 0x0010_0000;

/// One page-aligned frame of emulated physical memory.
#[repr(C, align(4096))]
struct FrameCell(UnsafeCell<[u8; PAGE_SIZE]>);

/// Node in an intrusive linked list for free frames.
///
/// This structure is written directly into the frames that are free.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
}

/// Lock-free stack of free frames.
struct FreeList {
    head: AtomicPtr<FreeBlock>,
    count: AtomicUsize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            count: AtomicUsize::new(0),
        }
    }

    fn push(&self, block: *mut FreeBlock) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `block` points at a free frame owned by this list from now on.
            unsafe {
                (*block).next = head;
            }
            if self
                .head
                .compare_exchange(head, block, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::Release);
                return;
            }
        }
    }

    fn pop(&self) -> Option<NonNull<FreeBlock>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: every node on the list is a frame inside the emulated pool.
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::Release);
                return NonNull::new(head);
            }
        }
    }

    fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// A fixed pool of emulated frames handed out one at a time.
///
/// Frames live in a host allocation; their "physical" addresses start at 1 MiB and their
/// kernel addresses are the host pointers, which stand in for the kernel's direct map.
pub struct EmulatedFrameAllocator {
    frames: Box<[FrameCell]>,
    free: FreeList,
}

// SAFETY: frame contents are only touched through raw pointers by whoever owns the frame,
// and the free list is lock-free.
unsafe impl Send for EmulatedFrameAllocator {}
unsafe impl Sync for EmulatedFrameAllocator {}

impl EmulatedFrameAllocator {
    /// Creates a pool of `count` frames, all free.
    pub fn new(count: usize) -> Self {
        let frames = (0..count)
            .map(|_| FrameCell(UnsafeCell::new([0; PAGE_SIZE])))
            .collect::<Box<[_]>>();
        let allocator = Self {
            frames,
            free: FreeList::new(),
        };

        // Push in reverse so the lowest frame is handed out first.
        for index in (0..count).rev() {
            allocator.free.push(allocator.frame_ptr(index).cast());
        }
        allocator
    }

    /// Returns the number of frames in the pool.
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    fn frame_ptr(&self, index: usize) -> *mut u8 {
        self.frames[index].0.get().cast()
    }

    fn index_of(&self, frame: PhysicalAddress) -> usize {
        assert!(frame.is_page_aligned(), "frame address must be page-aligned");
        match FrameNumber::from(frame).offset_from(FrameNumber::from(PhysicalAddress::new(BASE))) {
            Some(index) if index < self.frames.len() => index,
            _ => panic!("frame {frame} is outside the emulated pool"),
        }
    }

    fn index_of_ptr(&self, ptr: *const u8) -> usize {
        let base = self.frames.as_ptr() as usize;
        let offset = (ptr as usize)
            .checked_sub(base)
            .expect("pointer not within emulated memory");
        assert!(offset % PAGE_SIZE == 0, "pointer is not a frame start");
        offset / PAGE_SIZE
    }
}

impl FrameAllocator for EmulatedFrameAllocator {
    fn allocate(&self) -> Result<PhysicalAddress, AllocError> {
        let block = self.free.pop().ok_or(AllocError::OutOfMemory)?;
        let index = self.index_of_ptr(block.as_ptr().cast());
        Ok(PhysicalAddress::new(BASE + index * PAGE_SIZE))
    }

    fn deallocate(&self, frame: PhysicalAddress) {
        let index = self.index_of(frame);
        self.free.push(self.frame_ptr(index).cast());
    }

    fn kernel_address(&self, frame: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::from_ptr(self.frame_ptr(self.index_of(frame)))
    }

    fn free_frames(&self) -> usize {
        self.free.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hands_out_lowest_frame_first() {
        let allocator = EmulatedFrameAllocator::new(4);
        assert_eq!(allocator.free_frames(), 4);

        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_eq!(first, PhysicalAddress::new(BASE));
        assert_eq!(second, PhysicalAddress::new(BASE + PAGE_SIZE));
        assert_eq!(allocator.free_frames(), 2);
    }

    #[test]
    fn runs_out_and_recovers() {
        let allocator = EmulatedFrameAllocator::new(1);
        let frame = allocator.allocate().unwrap();
        assert_eq!(allocator.allocate(), Err(AllocError::OutOfMemory));

        allocator.deallocate(frame);
        assert_eq!(allocator.allocate(), Ok(frame));
    }

    #[test]
    fn kernel_addresses_are_distinct_and_aligned() {
        let allocator = EmulatedFrameAllocator::new(2);
        let a = allocator.allocate().unwrap();
        let b = allocator.allocate().unwrap();

        let ka = allocator.kernel_address(a);
        let kb = allocator.kernel_address(b);
        assert!(ka.is_page_aligned());
        assert_eq!(kb - ka, PAGE_SIZE);
    }
}
