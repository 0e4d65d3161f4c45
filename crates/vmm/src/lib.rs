#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager (VMM) implements demand paging for user address spaces.
//! It provides:
//!
//! - A per-address-space supplemental page table describing what each virtual page should hold.
//! - Pages that are born uninitialized and become anonymous or file-backed on first access.
//! - A process-wide frame table with clock (second-chance) eviction to swap or backing files.
//! - The page fault handler, including bounded stack growth.
//! - Memory-mapped files with write-back of dirty pages on unmap.
//! - Software emulation of the hardware collaborators for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod config;
mod error;
mod fault;
mod file;
mod frame;
mod frame_allocator;
mod loader;
mod mmap;
mod mmu;
mod numbers;
mod page;
mod spt;
mod stats;
mod swap;
mod uaccess;
mod vm;

#[cfg(test)]
mod testing;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use config::VmConfig;
pub use error::{ErrorClass, TeardownError, VmError, VmResult};
pub use fault::{FaultInfo, FaultOutcome};
pub use file::File;
pub use frame::{FrameId, FrameTable};
pub use frame_allocator::{AllocError, FrameAllocator};
pub use mmap::MappingId;
pub use mmu::{Mmu, Translation};
pub use numbers::{FrameNumber, PageNumber};
pub use page::{FileSpan, LazyLoad, Page, PageRef, PageTarget, VmType};
pub use spt::SupplementalPageTable;
pub use stats::{VmStats, VmStatsSnapshot};
pub use swap::{SwapDevice, SwapSlot, SwapTable};
pub use vm::{Vm, current, install};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::software::{EmulatedFrameAllocator, MemFile, RamSwap, SoftwareMmu};

#[cfg(target_arch = "x86_64")]
pub use arch::x86_64::HardwareMmu;

/// Size of a page (and of a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;
