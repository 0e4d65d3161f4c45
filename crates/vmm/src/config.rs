//! Tunables for the virtual memory manager.

use crate::{PAGE_SIZE, VirtualAddress};

/// Address-space layout and stack growth limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// First address that is not user space.
    pub user_limit: usize,
    /// Top of the user stack; the stack grows down from here.
    pub stack_top: usize,
    /// Maximum size of the user stack in bytes.
    pub stack_limit: usize,
    /// How far below the stack pointer a fault may land and still grow the stack.
    pub stack_window: usize,
}

impl VmConfig {
    /// Creates the default configuration.
    pub const fn new() -> Self {
        Self {
            user_limit: 0x0000_8000_0000_0000,
            stack_top: 0x4748_0000,
            stack_limit: 1024 * 1024,
            stack_window: 16 * PAGE_SIZE,
        }
    }

    pub const fn with_user_limit(mut self, user_limit: usize) -> Self {
        self.user_limit = user_limit;
        self
    }

    pub const fn with_stack_top(mut self, stack_top: usize) -> Self {
        self.stack_top = stack_top;
        self
    }

    pub const fn with_stack_limit(mut self, stack_limit: usize) -> Self {
        self.stack_limit = stack_limit;
        self
    }

    pub const fn with_stack_window(mut self, stack_window: usize) -> Self {
        self.stack_window = stack_window;
        self
    }

    /// Lowest address the stack may grow down to.
    pub const fn stack_floor(&self) -> usize {
        self.stack_top.saturating_sub(self.stack_limit)
    }

    /// Returns true if `addr` lies in user space.
    pub const fn is_user(&self, addr: VirtualAddress) -> bool {
        addr.as_usize() < self.user_limit
    }

    /// Returns true if `[addr, addr + length)` lies entirely in user space.
    pub const fn is_user_range(&self, addr: VirtualAddress, length: usize) -> bool {
        match addr.as_usize().checked_add(length) {
            Some(end) => end <= self.user_limit,
            None => false,
        }
    }

    /// Returns true if `addr` lies in the region the stack may occupy.
    pub const fn is_stack_region(&self, addr: VirtualAddress) -> bool {
        let addr = addr.as_usize();
        addr >= self.stack_floor() && addr < self.stack_top
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
