//! File-backed pages.

use super::{FileSpan, Page, PageState, PageTarget, Preserved};
use crate::{VmError, VmResult};

/// State of a file-backed page.
#[derive(Debug, Clone)]
pub(crate) struct FilePage {
    pub(crate) span: FileSpan,
}

/// Type initializer for file-backed pages.
///
/// The frame is cleared here; the contents arrive from the deferred initializer.
pub(super) fn initialize(page: &mut Page, target: PageTarget, kva: &mut [u8]) -> VmResult<()> {
    let PageTarget::File(span) = target else {
        return Err(VmError::InitializationFailed);
    };
    kva.fill(0);
    page.state = PageState::File(FilePage { span });
    Ok(())
}

/// Deferred initializer for memory-mapped pages: reads the page's span from its file.
pub(crate) fn lazy_load(page: &mut Page, kva: &mut [u8]) -> VmResult<()> {
    let span = page.file_span().ok_or(VmError::InitializationFailed)?;
    span.read_into(kva, VmError::InitializationFailed)
}

impl FilePage {
    pub(super) fn swap_in(&mut self, kva: &mut [u8]) -> VmResult<()> {
        self.span.read_into(kva, VmError::ReadFailed)
    }

    pub(super) fn swap_out(&mut self, kva: &[u8], dirty: bool) -> VmResult<Preserved> {
        if !dirty {
            return Ok(Preserved::Discarded);
        }
        self.span.write_from(kva)?;
        Ok(Preserved::WrittenBack)
    }

    pub(super) fn destroy(&mut self, kva: Option<&[u8]>, dirty: bool) -> VmResult<Preserved> {
        match kva {
            Some(kva) => self.swap_out(kva, dirty),
            None => Ok(Preserved::Discarded),
        }
    }
}
