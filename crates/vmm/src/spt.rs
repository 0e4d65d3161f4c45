//! The supplemental page table.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use spin::Mutex;

use crate::{Page, PageNumber, PageRef, VirtualAddress, VmError, VmResult};

/// Per-address-space index from virtual page to [`Page`].
///
/// This is the source of truth for what each user page should contain; the hardware table
/// only ever holds a cache of it. Lookups round down to the containing page.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: Mutex<BTreeMap<PageNumber, PageRef>>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the page containing `va`, if any.
    pub fn find(&self, va: VirtualAddress) -> Option<PageRef> {
        self.pages.lock().get(&va.page_number()).cloned()
    }

    /// Adds `page`, keyed by its address.
    ///
    /// Fails with [`VmError::AlreadyMapped`], leaving the table unchanged, if the address is
    /// taken.
    pub fn insert(&self, page: Page) -> VmResult<PageRef> {
        use alloc::collections::btree_map::Entry;

        match self.pages.lock().entry(page.va().page_number()) {
            Entry::Occupied(_) => Err(VmError::AlreadyMapped),
            Entry::Vacant(entry) => Ok(entry.insert(Arc::new(Mutex::new(page))).clone()),
        }
    }

    /// Removes and returns the page containing `va`.
    ///
    /// Releasing the page's resources is up to the caller; see
    /// [`AddressSpace::remove_page`](crate::AddressSpace::remove_page).
    pub(crate) fn remove(&self, va: VirtualAddress) -> Option<PageRef> {
        self.pages.lock().remove(&va.page_number())
    }

    /// Returns true if the entry for `va` is `page`.
    pub(crate) fn holds(&self, va: VirtualAddress, page: &PageRef) -> bool {
        self.pages
            .lock()
            .get(&va.page_number())
            .is_some_and(|existing| Arc::ptr_eq(existing, page))
    }

    /// Removes the entry for `va` if it is `page`. Returns false if the address holds no
    /// page or a different one.
    pub(crate) fn remove_entry(&self, va: VirtualAddress, page: &PageRef) -> bool {
        let mut pages = self.pages.lock();
        match pages.get(&va.page_number()) {
            Some(existing) if Arc::ptr_eq(existing, page) => {
                pages.remove(&va.page_number());
                true
            }
            _ => false,
        }
    }

    /// Removes every page, in address order.
    pub(crate) fn take_all(&self) -> Vec<PageRef> {
        let pages = core::mem::take(&mut *self.pages.lock());
        pages.into_values().collect()
    }

    /// Returns every page, in address order, without removing them.
    pub(crate) fn snapshot(&self) -> Vec<PageRef> {
        self.pages.lock().values().cloned().collect()
    }

    /// Returns true if any page overlaps `[va, va + length)`.
    pub(crate) fn overlaps(&self, va: VirtualAddress, length: usize) -> bool {
        self.pages
            .lock()
            .range(PageNumber::span(va, length))
            .next()
            .is_some()
    }

    /// Returns the number of pages.
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    /// Returns true if the table holds no pages.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
