//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// The bit positions follow x86_64 so that the emulated entries read like real ones in a
/// debugger: present, writable and user in bits 0-2, accessed and dirty in bits 5-6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: usize = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: usize = 1 << 2;

    /// Accessed bit (bit 5), set on any access.
    const ACCESSED: usize = 1 << 5;

    /// Dirty bit (bit 6), set on writes.
    const DIRTY: usize = 1 << 6;

    /// Mask of every bit this type understands.
    pub const MASK: usize =
        Self::PRESENT | Self::WRITABLE | Self::USER | Self::ACCESSED | Self::DIRTY;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags for a freshly installed user page.
    pub const fn user_page(writable: bool) -> Self {
        let mut bits = Self::PRESENT | Self::USER;
        if writable {
            bits |= Self::WRITABLE;
        }
        Self(bits)
    }

    /// Creates page flags from a raw value, discarding unknown bits.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    pub fn is_present(self) -> bool {
        self.0 & Self::PRESENT != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    pub fn is_user(self) -> bool {
        self.0 & Self::USER != 0
    }

    pub fn is_accessed(self) -> bool {
        self.0 & Self::ACCESSED != 0
    }

    pub fn is_dirty(self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    /// Sets or clears the accessed bit.
    pub fn set_accessed(&mut self, accessed: bool) {
        self.assign(Self::ACCESSED, accessed);
    }

    /// Sets or clears the dirty bit.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.assign(Self::DIRTY, dirty);
    }

    fn assign(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
