use crate::{check_range, OutSink};
use anyhow::{Context, Result};
use memmap2::MmapMut;
use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::Path;

/// Memory-mapped file sink. The map covers the whole output file and lives
/// for the duration of the build.
pub struct MmapSink {
    map: UnsafeCell<MmapMut>,
    size: u64,
}

// SAFETY: same contract as MemSink. Writers touch pairwise-disjoint byte
// ranges of the mapping, reads of a range happen-after the writes that
// produced it (stage ordering in the builder), and bounds are checked on
// every access.
unsafe impl Send for MmapSink {}
unsafe impl Sync for MmapSink {}

impl MmapSink {
    /// Create (or truncate) `path` with `size` bytes and map it.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("cannot create output file {}", path.display()))?;
        file.set_len(size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map: UnsafeCell::new(map),
            size,
        })
    }
}

impl OutSink for MmapSink {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        unsafe {
            let base = (*self.map.get()).as_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(base, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        unsafe {
            let base = (*self.map.get()).as_mut_ptr().add(offset as usize);
            std::ptr::copy_nonoverlapping(buf.as_ptr(), base, buf.len());
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        unsafe { (*self.map.get()).flush()? };
        Ok(())
    }
}
