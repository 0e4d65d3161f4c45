//! Software emulation for testing and development.
//!
//! This module provides software-emulated collaborators that run on any host:
//! - a fixed pool of physical frames with a lock-free free list,
//! - a translation table per address space with hardware-style accessed/dirty bits,
//! - in-memory files and an in-memory swap device.

mod entry;
mod file;
mod flags;
mod memory;
mod swap;
mod table;

pub use file::MemFile;
pub use memory::EmulatedFrameAllocator;
pub use swap::RamSwap;
pub use table::SoftwareMmu;
