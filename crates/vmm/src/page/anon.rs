//! Anonymous pages.

use super::{Page, PageState, PageTarget, Preserved};
use crate::{SwapSlot, SwapTable, VmError, VmResult};

/// State of an anonymous page: the swap slot holding it while evicted.
#[derive(Debug, Default)]
pub(crate) struct AnonPage {
    slot: Option<SwapSlot>,
}

/// Type initializer for anonymous pages: a fresh anonymous page is all zeroes.
pub(super) fn initialize(page: &mut Page, _target: PageTarget, kva: &mut [u8]) -> VmResult<()> {
    kva.fill(0);
    page.state = PageState::Anon(AnonPage::default());
    Ok(())
}

impl AnonPage {
    /// Restores the page into `kva`. The slot is kept until [`AnonPage::release_slot`], so
    /// the contents survive if the page cannot be mapped afterwards.
    pub(super) fn swap_in(&mut self, kva: &mut [u8], swap: &SwapTable) -> VmResult<()> {
        let Some(slot) = self.slot else {
            kva.fill(0);
            return Ok(());
        };
        swap.read(slot, kva).map_err(|err| {
            log::warn!("failed to read swap slot {}: {err}", slot.index());
            VmError::ReadFailed
        })
    }

    pub(super) fn swap_out(&mut self, kva: &[u8], swap: &SwapTable) -> VmResult<Preserved> {
        debug_assert!(self.slot.is_none(), "resident page still holds a swap slot");
        let slot = swap.swap_out(kva)?;
        self.slot = Some(slot);
        Ok(Preserved::Swapped)
    }

    pub(super) fn release_slot(&mut self, swap: &SwapTable) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }
}
