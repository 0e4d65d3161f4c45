//! Interface to the physical frame allocator.
//!
//! The allocator hands out single, page-sized frames from the user pool. The VMM never
//! touches the allocator's bookkeeping; it only requests and returns frames and asks where
//! a frame is visible in the kernel's direct map.

use crate::{PhysicalAddress, VirtualAddress};

/// Errors that can occur during physical frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame is available.
    OutOfMemory,
}

/// A source of page-sized physical frames for user pages.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame.
    fn allocate(&self) -> Result<PhysicalAddress, AllocError>;

    /// Returns a frame previously obtained from [`FrameAllocator::allocate`].
    fn deallocate(&self, frame: PhysicalAddress);

    /// Returns the kernel virtual address at which `frame` can be accessed.
    fn kernel_address(&self, frame: PhysicalAddress) -> VirtualAddress;

    /// Returns the number of frames currently free.
    fn free_frames(&self) -> usize;
}
