//! Virtual memory statistics.

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters updated along the fault and eviction paths.
///
/// Counters are relaxed; they are for diagnostics and tests, not synchronization.
#[derive(Debug, Default)]
pub struct VmStats {
    faults: AtomicU64,
    stack_growths: AtomicU64,
    claims: AtomicU64,
    evictions: AtomicU64,
    swap_outs: AtomicU64,
    swap_ins: AtomicU64,
    write_backs: AtomicU64,
    file_reads: AtomicU64,
    failures: AtomicU64,
}

/// A point-in-time copy of [`VmStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStatsSnapshot {
    /// Faults delivered to the fault handler.
    pub faults: u64,
    /// Faults resolved by growing the stack.
    pub stack_growths: u64,
    /// Pages that became resident.
    pub claims: u64,
    /// Frames taken from another page.
    pub evictions: u64,
    /// Anonymous pages written to swap.
    pub swap_outs: u64,
    /// Anonymous pages read back from swap.
    pub swap_ins: u64,
    /// Dirty file pages written back to their file.
    pub write_backs: u64,
    /// File-backed page loads (first load or reload after eviction).
    pub file_reads: u64,
    /// Faults that could not be resolved.
    pub failures: u64,
}

macro_rules! counters {
    ($($field:ident => $method:ident),* $(,)?) => {
        impl VmStats {
            $(
                pub(crate) fn $method(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            /// Copies the current counter values.
            pub fn snapshot(&self) -> VmStatsSnapshot {
                VmStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    faults => record_fault,
    stack_growths => record_stack_growth,
    claims => record_claim,
    evictions => record_eviction,
    swap_outs => record_swap_out,
    swap_ins => record_swap_in,
    write_backs => record_write_back,
    file_reads => record_file_read,
    failures => record_failure,
}

impl VmStats {
    /// Creates zeroed counters.
    pub const fn new() -> Self {
        Self {
            faults: AtomicU64::new(0),
            stack_growths: AtomicU64::new(0),
            claims: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            swap_outs: AtomicU64::new(0),
            swap_ins: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
            file_reads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }
}
