//! Address types for physical and virtual memory.
//!
//! This module provides architecture-independent wrappers around physical and virtual
//! addresses, with the page arithmetic the fault path relies on.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PAGE_SIZE, PageNumber};

/// Number of implemented physical address bits.
const MAX_PHYSICAL_BITS: usize = 52;

/// Number of implemented virtual address bits (sign-extended above this).
const MAX_VIRTUAL_BITS: usize = 48;

const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

const fn validate_virtual(addr: usize) -> bool {
    let upper = addr >> (MAX_VIRTUAL_BITS - 1);
    upper == 0 || upper == usize::MAX >> (MAX_VIRTUAL_BITS - 1)
}

/// Defines an address newtype with page arithmetic.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns true if the address is on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
            }

            /// Rounds the address down to the start of its page.
            #[inline]
            pub const fn page_base(self) -> Self {
                Self(self.0 & !(PAGE_SIZE - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (PAGE_SIZE - 1)
            }

            /// Adds `rhs` bytes, returning `None` on overflow or if the result is invalid.
            #[inline]
            pub const fn checked_add(self, rhs: usize) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(addr) => Self::try_new(addr),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     This is a newtype wrapper around the raw physical address of a frame or a byte\n\
     within one. Values are limited to the architecture's physical address width."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Creates a new physical address, returning `None` if it exceeds the address width.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if validate_physical(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the frame number containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 / PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     This is a newtype wrapper around a canonical virtual address. User pages, faulting\n\
     addresses and the kernel's direct-mapped frame addresses are all expressed with it."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Creates a new virtual address, returning `None` if it is not canonical.
    #[inline]
    pub const fn try_new(addr: usize) -> Option<Self> {
        if validate_virtual(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Creates an address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self::new(ptr as usize)
    }

    /// Returns the page number containing this address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 / PAGE_SIZE)
    }

    /// Returns the address as a raw mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_base_rounds_down() {
        let addr = VirtualAddress::new(0x1234);
        assert_eq!(addr.page_base(), VirtualAddress::new(0x1000));
        assert_eq!(addr.page_offset(), 0x234);
        assert!(!addr.is_page_aligned());
        assert!(addr.page_base().is_page_aligned());
    }

    #[test]
    fn rejects_non_canonical_virtual() {
        assert!(VirtualAddress::try_new(0x0000_8000_0000_0000).is_none());
        assert!(VirtualAddress::try_new(0xffff_8000_0000_0000).is_some());
        assert!(VirtualAddress::try_new(0x0000_7fff_ffff_f000).is_some());
    }

    #[test]
    fn checked_add_stops_at_canonical_hole() {
        let top = VirtualAddress::new(0x0000_7fff_ffff_f000);
        assert_eq!(top.checked_add(0xfff), Some(VirtualAddress::new(0x0000_7fff_ffff_ffff)));
        assert_eq!(top.checked_add(PAGE_SIZE), None);
    }

    #[test]
    fn page_number_matches_page_base() {
        let addr = VirtualAddress::new(0x4000_0fff);
        assert_eq!(addr.page_number().start(), addr.page_base());
    }

    #[test]
    fn physical_frame_number() {
        let addr = PhysicalAddress::new(0x0010_2345);
        assert_eq!(addr.frame_number(), FrameNumber::new(0x102));
        assert_eq!(addr.frame_number().start(), PhysicalAddress::new(0x0010_2000));
    }
}
