//! The process-wide virtual memory service.

use alloc::{boxed::Box, sync::Arc};
use spin::Once;

use crate::{FrameAllocator, FrameTable, SwapDevice, SwapTable, VmConfig, VmStats};

/// State shared by every address space: the frame table, the swap table, the layout
/// configuration and statistics.
pub struct Vm {
    pub(crate) config: VmConfig,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapTable,
    pub(crate) stats: VmStats,
}

impl Vm {
    /// Creates a virtual memory service over the given frame allocator and swap device.
    pub fn new(
        config: VmConfig,
        allocator: Arc<dyn FrameAllocator>,
        swap: Option<Box<dyn SwapDevice>>,
    ) -> Arc<Self> {
        let vm = Self {
            config,
            frames: FrameTable::new(allocator),
            swap: SwapTable::new(swap),
            stats: VmStats::new(),
        };
        log::info!(
            "VMM ready: {} free frames, {} swap slots, stack {:#x}..{:#x}",
            vm.frames.allocator().free_frames(),
            vm.swap.capacity(),
            config.stack_floor(),
            config.stack_top
        );
        Arc::new(vm)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapTable {
        &self.swap
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }
}

static VM: Once<Arc<Vm>> = Once::new();

/// Installs the process-wide instance. Later calls keep the first instance.
pub fn install(vm: Arc<Vm>) -> &'static Arc<Vm> {
    VM.call_once(|| vm)
}

/// Returns the process-wide instance.
///
/// # Panics
///
/// Panics if [`install`] has not been called.
pub fn current() -> &'static Arc<Vm> {
    VM.get().expect("virtual memory is not initialized")
}
