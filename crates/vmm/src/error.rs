//! Error types for the virtual memory manager.

use core::fmt;

/// Errors raised while resolving faults, mapping files, or tearing down address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical frame could be obtained, even after trying to evict one.
    OutOfMemory,
    /// An anonymous page had to be preserved but no swap slot was free.
    SwapExhausted,
    /// The address has no page and does not qualify for stack growth.
    InvalidAccess,
    /// A write was attempted on a page that is not writable.
    WriteProtected,
    /// A page already exists at the requested address.
    AlreadyMapped,
    /// A page's type initializer or deferred initializer failed.
    InitializationFailed,
    /// Restoring a page's contents from swap or its file came up short.
    ReadFailed,
    /// Writing a dirty page back to its file failed.
    WriteBack,
    /// A mapping request had an invalid address, length, offset or file.
    InvalidArgument,
    /// No mapping starts at the given address.
    NotMapped,
}

/// Broad classes of failure, which decide how the kernel reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fatal: the kernel halts.
    ResourceExhaustion,
    /// The faulting process is terminated; the kernel continues.
    InvalidAccess,
    /// Reported to the caller with no state changed.
    DuplicateMapping,
    /// The page is destroyed and the fault is treated as an invalid access.
    InitializationFailure,
    /// Propagated to whoever triggered the write-back.
    WriteBackFailure,
}

impl VmError {
    /// Returns the class of this error.
    pub const fn class(self) -> ErrorClass {
        match self {
            Self::OutOfMemory | Self::SwapExhausted => ErrorClass::ResourceExhaustion,
            Self::InvalidAccess
            | Self::WriteProtected
            | Self::InvalidArgument
            | Self::NotMapped => ErrorClass::InvalidAccess,
            Self::AlreadyMapped => ErrorClass::DuplicateMapping,
            Self::InitializationFailed | Self::ReadFailed => ErrorClass::InitializationFailure,
            Self::WriteBack => ErrorClass::WriteBackFailure,
        }
    }

    /// Returns true if the error cannot be recovered from without halting.
    pub const fn is_fatal(self) -> bool {
        matches!(self.class(), ErrorClass::ResourceExhaustion)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::OutOfMemory => "out of physical frames",
            Self::SwapExhausted => "swap space exhausted",
            Self::InvalidAccess => "invalid memory access",
            Self::WriteProtected => "write to read-only page",
            Self::AlreadyMapped => "address already mapped",
            Self::InitializationFailed => "page initialization failed",
            Self::ReadFailed => "short read while restoring page",
            Self::WriteBack => "write-back to file failed",
            Self::InvalidArgument => "invalid mapping argument",
            Self::NotMapped => "no mapping at address",
        };
        f.write_str(message)
    }
}

impl core::error::Error for VmError {}

/// Result type used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

/// Aggregate failure from tearing down an address space.
///
/// Teardown keeps releasing pages after a failure, so this records how many pages failed
/// and the first error seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownError {
    /// Number of pages whose release reported an error.
    pub failed: usize,
    /// The first error encountered.
    pub first: VmError,
}

impl fmt::Display for TeardownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} page(s) failed to release (first: {})", self.failed, self.first)
    }
}

impl core::error::Error for TeardownError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exhaustion_is_fatal() {
        assert!(VmError::OutOfMemory.is_fatal());
        assert!(VmError::SwapExhausted.is_fatal());
        assert!(!VmError::InvalidAccess.is_fatal());
        assert!(!VmError::WriteBack.is_fatal());
        assert_eq!(VmError::AlreadyMapped.class(), ErrorClass::DuplicateMapping);
        assert_eq!(VmError::ReadFailed.class(), ErrorClass::InitializationFailure);
    }
}
