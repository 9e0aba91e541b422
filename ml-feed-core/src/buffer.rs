//! Aligned, exchangeable storage behind every tensor
//!
//! A [`BufferHandle`] owns one contiguous, 64-byte aligned allocation. Handles
//! are never cloned implicitly: batches move between the loaders, the
//! transform graph and the ring buffer by swapping handles, so at any instant
//! exactly one holder owns a given allocation.

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::error::{Error, Result};
use crate::tensor::MemorySpace;

/// Alignment for optimal SIMD operations (typically 32 or 64 bytes for AVX/AVX-512)
pub const SIMD_ALIGNMENT: usize = 64;

/// Source of unique buffer identifiers
static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// One aligned storage unit; buffers are built from whole chunks so the
/// first byte of every buffer sits on a [`SIMD_ALIGNMENT`] boundary.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct Chunk([u8; SIMD_ALIGNMENT]);

// Safety: `Chunk` is a plain byte array with no padding (size == align == 64),
// so every bit pattern is valid and the all-zero pattern is a valid value.
#[allow(unsafe_code)]
unsafe impl Zeroable for Chunk {}
#[allow(unsafe_code)]
unsafe impl Pod for Chunk {}

/// Owned, aligned byte storage that can be exchanged without copying
pub struct BufferHandle {
    /// Backing storage, rounded up to whole chunks
    chunks: Vec<Chunk>,

    /// Number of valid bytes
    len: usize,

    /// Memory space the storage lives in
    space: MemorySpace,

    /// Unique identity of the allocation, stable across swaps
    id: u64,
}

impl BufferHandle {
    /// Allocate a zeroed buffer of `len` bytes in the given memory space
    pub fn new(len: usize, space: MemorySpace) -> Result<Self> {
        let chunk_count = len.div_ceil(SIMD_ALIGNMENT);
        let mut chunks = Vec::new();
        chunks
            .try_reserve_exact(chunk_count)
            .map_err(|_| Error::MemoryAllocationFailed(len))?;
        chunks.resize(chunk_count, Chunk::zeroed());

        Ok(Self {
            chunks,
            len,
            space,
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// An empty buffer that owns no storage
    pub fn empty(space: MemorySpace) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            space,
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Allocate a host buffer holding a copy of `data`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buffer = Self::new(data.len(), MemorySpace::Host)?;
        buffer.as_bytes_mut().copy_from_slice(data);
        Ok(buffer)
    }

    /// Number of valid bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated capacity in bytes
    pub fn capacity(&self) -> usize {
        self.chunks.len() * SIMD_ALIGNMENT
    }

    /// Memory space the storage lives in
    pub fn memory_space(&self) -> MemorySpace {
        self.space
    }

    /// Identity of the allocation; follows the storage through swaps
    pub fn id(&self) -> u64 {
        self.id
    }

    /// View the valid bytes
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Chunk, u8>(&self.chunks)[..self.len]
    }

    /// Mutable view of the valid bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut::<Chunk, u8>(&mut self.chunks)[..len]
    }

    /// View the valid bytes as a slice of `T`
    pub fn as_slice<T: Pod>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.as_bytes()).map_err(|e| {
            Error::TypeMismatch(format!(
                "cannot view {} bytes as {}-byte elements: {e}",
                self.len,
                size_of::<T>()
            ))
        })
    }

    /// Mutable view of the valid bytes as a slice of `T`
    pub fn as_slice_mut<T: Pod>(&mut self) -> Result<&mut [T]> {
        let len = self.len;
        bytemuck::try_cast_slice_mut(self.as_bytes_mut()).map_err(|e| {
            Error::TypeMismatch(format!(
                "cannot view {len} bytes as {}-byte elements: {e}",
                size_of::<T>()
            ))
        })
    }

    /// Change the number of valid bytes, growing the storage if required.
    /// Newly exposed bytes are zero.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        let chunk_count = len.div_ceil(SIMD_ALIGNMENT);
        if chunk_count > self.chunks.len() {
            self.chunks
                .try_reserve_exact(chunk_count - self.chunks.len())
                .map_err(|_| Error::MemoryAllocationFailed(len))?;
            self.chunks.resize(chunk_count, Chunk::zeroed());
        }
        if len > self.len {
            let old = self.len;
            self.len = len;
            self.as_bytes_mut()[old..].fill(0);
        } else {
            self.len = len;
        }
        Ok(())
    }

    /// Copy the valid bytes of `other` into this buffer, resizing as needed
    pub fn copy_from(&mut self, other: &BufferHandle) -> Result<()> {
        self.resize(other.len)?;
        self.as_bytes_mut().copy_from_slice(other.as_bytes());
        Ok(())
    }

    /// Exchange storage with another handle. No bytes are copied.
    pub fn swap(&mut self, other: &mut BufferHandle) {
        std::mem::swap(self, other);
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("id", &self.id)
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("space", &self.space)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed_and_aligned() {
        let buffer = BufferHandle::new(100, MemorySpace::Host).unwrap();
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 128);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
        assert_eq!(buffer.as_bytes().as_ptr() as usize % SIMD_ALIGNMENT, 0);
    }

    #[test]
    fn test_typed_views() {
        let mut buffer = BufferHandle::new(16, MemorySpace::Host).unwrap();
        buffer
            .as_slice_mut::<f32>()
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buffer.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0, 4.0]);

        let odd = BufferHandle::new(6, MemorySpace::Host).unwrap();
        assert!(matches!(odd.as_slice::<f32>(), Err(Error::TypeMismatch(_))));
    }

    #[test]
    fn test_swap_moves_storage() {
        let mut a = BufferHandle::from_bytes(&[1, 2, 3]).unwrap();
        let mut b = BufferHandle::from_bytes(&[9]).unwrap();
        let (id_a, id_b) = (a.id(), b.id());
        let ptr_a = a.as_bytes().as_ptr();

        a.swap(&mut b);

        assert_eq!(a.as_bytes(), &[9]);
        assert_eq!(b.as_bytes(), &[1, 2, 3]);
        assert_eq!(a.id(), id_b);
        assert_eq!(b.id(), id_a);
        assert_eq!(b.as_bytes().as_ptr(), ptr_a);
    }

    #[test]
    fn test_resize_zero_fills() {
        let mut buffer = BufferHandle::from_bytes(&[7; 10]).unwrap();
        buffer.resize(4).unwrap();
        buffer.resize(200).unwrap();
        assert_eq!(&buffer.as_bytes()[..4], &[7; 4]);
        assert!(buffer.as_bytes()[4..].iter().all(|&b| b == 0));
    }
}
