use anyhow::{anyhow, Result};

/// Positional output sink abstract interface.
///
/// All access is positional (`pread`/`pwrite` style) through a shared
/// reference, so writers working on disjoint byte ranges may run from
/// multiple threads without any locking. Range disjointness is the
/// caller's contract.
pub trait OutSink: Send + Sync {
    /// Total capacity in bytes
    fn len(&self) -> u64;
    /// Read `buf.len()` bytes starting at `offset`
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    /// Write all of `buf` starting at `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;
    /// Flush any buffered state to the backing store
    fn flush(&self) -> Result<()>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn check_range(len: u64, offset: u64, count: usize) -> Result<()> {
    if offset + count as u64 > len {
        return Err(anyhow!(
            "sink range out of bounds: {:#x}..{:#x} > {:#x}",
            offset,
            offset + count as u64,
            len
        ));
    }
    Ok(())
}

pub mod file;
pub mod memory;
pub mod mmap;

pub use file::FileSink;
pub use memory::MemSink;
pub use mmap::MmapSink;

#[cfg(test)]
pub(crate) fn sink_tester(sink: &dyn OutSink) -> Result<()> {
    let data = [0xA5u8; 16];
    sink.write_at(8, &data)?;
    let mut back = [0u8; 16];
    sink.read_at(8, &mut back)?;
    assert_eq!(data, back);
    // holes read back as zeros
    let mut head = [0xFFu8; 8];
    sink.read_at(0, &mut head)?;
    assert_eq!(head, [0u8; 8]);
    sink.flush()?;
    assert!(sink.read_at(sink.len() - 8, &mut [0u8; 16]).is_err());
    Ok(())
}
