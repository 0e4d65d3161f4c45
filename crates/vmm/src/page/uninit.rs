//! Uninitialized pages and their one-time transmutation.

use alloc::sync::Arc;

use super::{LazyLoad, Page, PageState, PageTarget, anon, file};
use crate::{VmError, VmResult};

/// Installs the type-specific state of a page becoming `target`, given its frame.
pub(crate) type TypeInitializer = fn(&mut Page, PageTarget, &mut [u8]) -> VmResult<()>;

/// State of a page that has not been touched yet.
#[derive(Clone)]
pub(crate) struct UninitPage {
    pub(crate) target: PageTarget,
    pub(crate) init: Option<Arc<dyn LazyLoad>>,
    initializer: TypeInitializer,
}

impl UninitPage {
    pub(crate) fn new(target: PageTarget, init: Option<Arc<dyn LazyLoad>>) -> Self {
        let initializer: TypeInitializer = match target {
            PageTarget::Anon => anon::initialize,
            PageTarget::File(_) => file::initialize,
        };
        Self {
            target,
            init,
            initializer,
        }
    }
}

/// Transmutes `page` into its target type and runs its deferred initializer.
///
/// Either failure leaves the frame attached and the page unusable; the caller destroys it.
pub(super) fn initialize(page: &mut Page, kva: &mut [u8]) -> VmResult<()> {
    let PageState::Uninit(uninit) = &page.state else {
        return Err(VmError::InitializationFailed);
    };
    // The type initializer replaces `page.state`, so everything it holds is taken out first.
    let target = uninit.target.clone();
    let init = uninit.init.clone();
    let initializer = uninit.initializer;

    if let Err(err) = initializer(page, target, kva) {
        log::debug!("type initializer for {} failed: {err}", page.va());
        return Err(VmError::InitializationFailed);
    }
    if let Some(init) = init
        && let Err(err) = init.load(page, kva)
    {
        log::debug!("deferred initializer for {} failed: {err}", page.va());
        return Err(VmError::InitializationFailed);
    }
    Ok(())
}
