//! Flat weight blob access. Each weight tensor references a byte range in
//! one binary file; the file is mapped read-only and sliced per location.

use anyhow::{bail, Context, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::Path;

pub struct WeightReader {
    mmap: Mmap,
}

impl WeightReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("open weight file {}", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Bytes at a configured [offset, length] location.
    pub fn slice(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let (start, end) = (offset as usize, (offset + length) as usize);
        if end > self.mmap.len() {
            bail!(
                "weight location [{}, {}] outside blob of {} bytes",
                offset,
                length,
                self.mmap.len()
            );
        }
        Ok(&self.mmap[start..end])
    }
}
