//! Interface to the file system for file-backed pages.

use alloc::sync::Arc;

use crate::VmResult;

/// An open file that pages can be read from and written back to.
pub trait File: Send + Sync {
    /// Returns the length of the file in bytes.
    fn len(&self) -> usize;

    /// Returns true if the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads into `buf` starting at `offset`, returning the number of bytes read.
    ///
    /// Reads past the end of the file return fewer bytes than requested.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> VmResult<usize>;

    /// Writes `buf` starting at `offset`, returning the number of bytes written.
    fn write_at(&self, buf: &[u8], offset: usize) -> VmResult<usize>;

    /// Opens an independent handle to the same file.
    fn reopen(&self) -> VmResult<Arc<dyn File>>;
}
