//! Architecture-specific implementations of the hardware collaborators.
//!
//! The x86_64 module backs the `Mmu` trait with real page tables. The software module
//! emulates the hardware (frames, translation, files and swap) so the fault pipeline can be
//! exercised on any host.

// NOTE: We DO include the x86_64 module even during tests so that it stays type-checked.
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;
