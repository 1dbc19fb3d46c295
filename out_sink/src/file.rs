use crate::{check_range, OutSink};
use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Plain-file sink using positional I/O. Slower than [`crate::MmapSink`]
/// but does not require address space for the whole image.
pub struct FileSink {
    file: File,
    size: u64,
}

impl FileSink {
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("cannot create output file {}", path.display()))?;
        file.set_len(size)?;
        Ok(Self { file, size })
    }
}

impl OutSink for FileSink {
    fn len(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(self.size, offset, buf.len())?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn simple_test() -> Result<()> {
        let path = std::env::temp_dir().join("out_sink_file_test.bin");
        {
            let sink = FileSink::create(&path, 64)?;
            crate::sink_tester(&sink)?;
        }
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
