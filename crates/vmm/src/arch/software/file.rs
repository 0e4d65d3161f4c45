//! In-memory files for software emulation.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::{File, VmError, VmResult};

struct Contents {
    data: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

/// A file held entirely in memory.
///
/// Handles created with [`File::reopen`] share the same contents, the way reopened handles
/// of an on-disk file share its inode. Writes never extend the file.
#[derive(Clone)]
pub struct MemFile {
    contents: Arc<Contents>,
}

impl MemFile {
    /// Creates a file holding `data`.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: Arc::new(Contents {
                data: Mutex::new(data.into()),
                writes: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.contents.data.lock().clone()
    }

    /// Returns the number of successful `write_at` calls across all handles.
    pub fn write_count(&self) -> usize {
        self.contents.writes.load(Ordering::Acquire)
    }

    /// Makes every subsequent write fail, emulating an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.contents.fail_writes.store(fail, Ordering::Release);
    }
}

impl File for MemFile {
    fn len(&self) -> usize {
        self.contents.data.lock().len()
    }

    fn read_at(&self, buf: &mut [u8], offset: usize) -> VmResult<usize> {
        let data = self.contents.data.lock();
        let Some(available) = data.get(offset..) else {
            return Ok(0);
        };
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> VmResult<usize> {
        if self.contents.fail_writes.load(Ordering::Acquire) {
            return Err(VmError::WriteBack);
        }
        let mut data = self.contents.data.lock();
        let Some(available) = data.get_mut(offset..) else {
            return Ok(0);
        };
        let count = available.len().min(buf.len());
        available[..count].copy_from_slice(&buf[..count]);
        self.contents.writes.fetch_add(1, Ordering::AcqRel);
        Ok(count)
    }

    fn reopen(&self) -> VmResult<Arc<dyn File>> {
        Ok(Arc::new(self.clone()))
    }
}
