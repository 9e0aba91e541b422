//! Memory backends that hand out buffers for tensors and ring-buffer slots

use std::sync::Mutex;

use crate::buffer::BufferHandle;
use crate::error::{Error, Result};
use crate::tensor::MemorySpace;

/// Interface for memory backend implementations
pub trait MemoryBackend: Send + Sync {
    /// Allocate a zeroed buffer of `size` bytes in the given memory space
    fn allocate(&self, size: usize, space: MemorySpace) -> Result<BufferHandle>;

    /// Return a buffer to the backend
    fn release(&self, buffer: BufferHandle);

    /// Whether this backend can serve the given memory space
    fn supports(&self, space: MemorySpace) -> bool;

    /// Get memory usage statistics for this backend
    fn stats(&self) -> MemoryStats;
}

/// Memory usage statistics for a memory backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total allocated memory in bytes
    pub allocated_bytes: usize,

    /// Total released memory in bytes
    pub released_bytes: usize,

    /// Current outstanding allocations in bytes
    pub current_bytes: usize,

    /// Peak memory usage in bytes
    pub peak_bytes: usize,

    /// Total number of allocations performed
    pub total_allocations: usize,

    /// Total number of releases performed
    pub total_releases: usize,
}

/// Host memory backend using the global allocator.
///
/// Pinned host memory is served from the same allocator; the buffers are
/// tagged so downstream consumers can tell them apart.
pub struct HostMemory {
    /// Stats for this backend
    stats: Mutex<MemoryStats>,
}

impl HostMemory {
    /// Create a new host memory backend
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(MemoryStats::default()),
        }
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend for HostMemory {
    fn allocate(&self, size: usize, space: MemorySpace) -> Result<BufferHandle> {
        if !self.supports(space) {
            return Err(Error::InvalidArgument(format!(
                "host memory backend cannot allocate in {space:?}"
            )));
        }
        let buffer = BufferHandle::new(size, space)?;

        let mut stats = self.stats.lock()?;
        stats.allocated_bytes += size;
        stats.current_bytes += size;
        stats.peak_bytes = stats.peak_bytes.max(stats.current_bytes);
        stats.total_allocations += 1;

        Ok(buffer)
    }

    fn release(&self, buffer: BufferHandle) {
        let size = buffer.len();
        drop(buffer);

        if let Ok(mut stats) = self.stats.lock() {
            stats.released_bytes += size;
            stats.current_bytes = stats.current_bytes.saturating_sub(size);
            stats.total_releases += 1;
        }
    }

    fn supports(&self, space: MemorySpace) -> bool {
        matches!(space, MemorySpace::Host | MemorySpace::PinnedHost)
    }

    fn stats(&self) -> MemoryStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }
}
