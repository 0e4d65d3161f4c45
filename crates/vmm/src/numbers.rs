//! Page and frame number types.
//!
//! Virtual page numbers key the supplemental page table and the software translation table;
//! frame numbers index the emulated physical memory pool.

use crate::{
    PAGE_SIZE,
    address::{PhysicalAddress, VirtualAddress},
};
use core::{fmt, ops::RangeInclusive};

macro_rules! page_number_type {
    ($name:ident, $addr:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the address of the first byte of this page or frame.
            #[inline]
            pub const fn start(self) -> $addr {
                $addr::new(self.0 * PAGE_SIZE)
            }

            /// Returns how many pages or frames `self` lies above `base`, or `None` if it
            /// lies below.
            #[inline]
            pub const fn offset_from(self, base: Self) -> Option<usize> {
                self.0.checked_sub(base.0)
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
    };
}

page_number_type!(
    FrameNumber,
    PhysicalAddress,
    "A physical frame number: a physical address divided by `PAGE_SIZE`."
);

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

page_number_type!(
    PageNumber,
    VirtualAddress,
    "A virtual page number.\n\n\
     Every address within a page maps to the same page number, which makes it the natural\n\
     key for per-page metadata."
);

impl PageNumber {
    /// Returns the pages touched by the `length` bytes starting at `va`.
    ///
    /// `length` must be non-zero.
    pub fn span(va: VirtualAddress, length: usize) -> RangeInclusive<PageNumber> {
        debug_assert!(length > 0, "empty span");
        let last = (va.as_usize() + (length - 1)) / PAGE_SIZE;
        va.page_number()..=PageNumber(last)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}
