//! Memory-mapped file access for zero-copy sample reads

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};
use tracing::debug;

use crate::error::{Error, Result};

/// Memory-mapped file for zero-copy I/O
pub struct MemoryMappedFile {
    /// The memory map; `None` for empty files, which cannot be mapped
    mmap: Option<Mmap>,

    /// The path to the file
    path: PathBuf,

    /// The size of the file in bytes
    size: usize,
}

impl MemoryMappedFile {
    /// Open a file for memory-mapped reading
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = usize::try_from(file.metadata()?.len()).map_err(|_| {
            Error::InvalidArgument(format!("{} is too large to map", path.display()))
        })?;

        let mmap = if size == 0 {
            None
        } else {
            // Safety: the mapping is read-only; callers must not truncate the
            // file while it is mapped.
            #[allow(unsafe_code)]
            let mmap = unsafe { MmapOptions::new().map(&file)? };
            Some(mmap)
        };
        debug!(path = %path.display(), size, "mapped file");

        Ok(Self { mmap, path, size })
    }

    /// Get a slice of the memory-mapped file
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    /// Get a subslice of the memory-mapped file
    pub fn slice(&self, offset: usize, length: usize) -> Result<&[u8]> {
        let end = offset.saturating_add(length);
        if end > self.size {
            return Err(Error::IndexOutOfBounds {
                index: end,
                len: self.size,
            });
        }
        Ok(&self.as_slice()[offset..end])
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the size of the file
    pub fn size(&self) -> usize {
        self.size
    }
}
