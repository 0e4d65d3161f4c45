//! The page fault handler.
//!
//! A fault is classified first: kernel addresses and protection violations never reach the
//! supplemental page table. A not-present fault on a known page claims it; a not-present
//! fault on an unknown address just below the stack pointer grows the stack; anything else
//! kills the faulting process. Running out of frames or swap halts the kernel.

use crate::{AddressSpace, PAGE_SIZE, PageTarget, VirtualAddress, VmError, VmResult};

/// Error code bit: the fault was a protection violation on a present page.
const ERROR_PRESENT: u64 = 1 << 0;
/// Error code bit: the access was a write.
const ERROR_WRITE: u64 = 1 << 1;
/// Error code bit: the access came from user mode.
const ERROR_USER: u64 = 1 << 2;

/// Everything the trap path knows about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// The faulting address.
    pub address: VirtualAddress,
    /// True if the access came from user mode.
    pub user: bool,
    /// True if the access was a write.
    pub write: bool,
    /// True if the page was not present, false for a protection violation.
    pub not_present: bool,
    /// The user stack pointer at the time of the fault, if the trap frame has one.
    pub stack_pointer: Option<VirtualAddress>,
}

impl FaultInfo {
    pub const fn new(address: VirtualAddress, user: bool, write: bool, not_present: bool) -> Self {
        Self {
            address,
            user,
            write,
            not_present,
            stack_pointer: None,
        }
    }

    pub const fn with_stack_pointer(mut self, stack_pointer: VirtualAddress) -> Self {
        self.stack_pointer = Some(stack_pointer);
        self
    }

    /// Decodes an x86 page fault error code.
    pub const fn from_error_code(
        address: VirtualAddress,
        code: u64,
        stack_pointer: Option<VirtualAddress>,
    ) -> Self {
        Self {
            address,
            user: code & ERROR_USER != 0,
            write: code & ERROR_WRITE != 0,
            not_present: code & ERROR_PRESENT == 0,
            stack_pointer,
        }
    }
}

/// What the trap path should do after a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is resident; retry the faulting instruction.
    Resolved,
    /// The access was invalid; terminate the faulting process.
    KillProcess(VmError),
}

impl AddressSpace {
    /// Handles a page fault from the trap path.
    ///
    /// # Panics
    ///
    /// Panics if a valid access cannot be resolved for lack of frames or swap slots, which
    /// halts the kernel.
    pub fn fault(&self, info: FaultInfo) -> FaultOutcome {
        match self.try_handle_fault(&info) {
            Ok(()) => FaultOutcome::Resolved,
            Err(err) if err.is_fatal() => {
                log::error!("unrecoverable page fault at {}: {err}", info.address);
                panic!("{err} resolving page fault at {}", info.address);
            }
            Err(err) => {
                log::debug!("killing process after fault at {}: {err}", info.address);
                FaultOutcome::KillProcess(err)
            }
        }
    }

    /// Resolves a page fault, returning the error instead of acting on it.
    pub fn try_handle_fault(&self, info: &FaultInfo) -> VmResult<()> {
        let stats = &self.vm().stats;
        stats.record_fault();
        log::trace!(
            "fault at {} (user: {}, write: {}, not present: {})",
            info.address,
            info.user,
            info.write,
            info.not_present
        );

        let result = self.resolve_fault(info);
        if result.is_err() {
            stats.record_failure();
        }
        result
    }

    fn resolve_fault(&self, info: &FaultInfo) -> VmResult<()> {
        let addr = info.address;
        if !self.config().is_user(addr) {
            return Err(VmError::InvalidAccess);
        }
        if !info.not_present {
            return if info.write {
                self.handle_wp(addr)
            } else {
                Err(VmError::InvalidAccess)
            };
        }

        let Some(page_ref) = self.spt().find(addr) else {
            return if self.is_stack_access(info) {
                self.grow_stack(addr)
            } else {
                Err(VmError::InvalidAccess)
            };
        };

        let mut page = page_ref.lock();
        if info.write && !page.writable() {
            return Err(VmError::WriteProtected);
        }
        self.claim_locked(&page_ref, &mut page).map(|_| ())
    }

    /// Handles a write to a present page that does not permit it.
    ///
    /// Every such write is refused; this is where copy-on-write would resolve it.
    fn handle_wp(&self, addr: VirtualAddress) -> VmResult<()> {
        match self.spt().find(addr) {
            Some(page) if !page.lock().writable() => Err(VmError::WriteProtected),
            _ => Err(VmError::InvalidAccess),
        }
    }

    /// Returns true if a not-present fault with no page should grow the stack.
    fn is_stack_access(&self, info: &FaultInfo) -> bool {
        let config = self.config();
        if !config.is_stack_region(info.address) {
            return false;
        }
        let Some(sp) = info.stack_pointer.or_else(|| self.saved_stack_pointer()) else {
            return false;
        };
        info.address.as_usize() + config.stack_window >= sp.as_usize()
    }

    fn grow_stack(&self, addr: VirtualAddress) -> VmResult<()> {
        let va = addr.page_base();
        match self.alloc_page(PageTarget::Anon, va, true) {
            // A concurrent fault on the same page got there first.
            Ok(_) | Err(VmError::AlreadyMapped) => {}
            Err(err) => return Err(err),
        }
        self.claim_page(va)?;
        self.vm().stats.record_stack_growth();
        log::debug!(
            "stack grown to {va} ({} pages below top)",
            (self.config().stack_top - va.as_usize()) / PAGE_SIZE
        );
        Ok(())
    }
}
