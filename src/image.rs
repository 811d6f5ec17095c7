use std::io::{Error, ErrorKind, Result};
use std::ops::Range;
use std::path::Path;

use anyhow::Context;
use mmap_rs::{MmapFlags, MmapMut, MmapOptions};

use crate::{PAGE_SIZE, PageNo};

/// Page-granular I/O against the backing image. The whole image is
/// mapped read-write for the lifetime of the session; every access is
/// bounds-checked against the mapped length and fails with an I/O error
/// kind when the requested range falls outside the image.
pub struct Image {
    m: MmapMut,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image").field("len", &self.m.len()).finish()
    }
}

impl Image {
    pub fn open(path: &Path) -> anyhow::Result<Image> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open image at {}", path.display()))?;

        let meta = file.metadata().context("get metadata for image file")?;
        let size = meta.len();

        if size == 0 {
            return Err(anyhow::anyhow!("image file is empty"));
        }

        if size % PAGE_SIZE as u64 != 0 {
            return Err(anyhow::anyhow!(
                "image size {size} is not a multiple of page size {PAGE_SIZE}",
            ));
        }

        let mmap = unsafe {
            MmapOptions::new(size as usize)
                .context("mmap option")?
                .with_file(&file, 0u64)
                .with_flags(MmapFlags::SHARED)
                .map_mut()
                .context("mmap image file")?
        };

        Ok(Image { m: mmap })
    }

    /// Number of pages in the image file.
    pub fn pages(&self) -> u64 {
        (self.m.len() / PAGE_SIZE) as u64
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.len() == 0
    }

    fn ensure(&self, pos: usize, len: usize) -> Result<()> {
        match pos.checked_add(len) {
            Some(end) if end <= self.m.len() => Ok(()),
            _ => Err(Error::from(ErrorKind::UnexpectedEof)),
        }
    }

    /// Bytes `off..off + len` of the region starting at `page`. The range
    /// may run past the first page as long as it stays inside the image.
    pub fn range(&self, page: PageNo, off: u64, len: usize) -> Result<&[u8]> {
        let pos = (page as usize)
            .checked_mul(PAGE_SIZE)
            .and_then(|p| p.checked_add(off as usize))
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "page index overflow"))?;
        self.ensure(pos, len)?;

        Ok(&self.m.as_slice()[pos..pos + len])
    }

    pub fn range_mut(&mut self, page: PageNo, off: u64, len: usize) -> Result<&mut [u8]> {
        let pos = (page as usize)
            .checked_mul(PAGE_SIZE)
            .and_then(|p| p.checked_add(off as usize))
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "page index overflow"))?;
        self.ensure(pos, len)?;

        Ok(&mut self.m.as_mut_slice()[pos..pos + len])
    }

    pub fn page(&self, page: PageNo) -> Result<&[u8]> {
        self.range(page, 0, PAGE_SIZE)
    }

    pub fn page_mut(&mut self, page: PageNo) -> Result<&mut [u8]> {
        self.range_mut(page, 0, PAGE_SIZE)
    }

    pub fn flush(&self, range: Range<usize>) -> anyhow::Result<()> {
        self.m.flush(range)?;
        Ok(())
    }

    pub fn flush_all(&self) -> anyhow::Result<()> {
        self.m.flush(0..self.len())?;
        Ok(())
    }
}
