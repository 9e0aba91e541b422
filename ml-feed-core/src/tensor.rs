//! Tensors exchanged between the loaders, the transform graph and the consumer

use std::fmt;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

use crate::buffer::BufferHandle;
use crate::error::{Error, Result};
use crate::memory::MemoryBackend;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 8-bit unsigned integer
    UInt8,

    /// 16-bit signed integer
    Int16,

    /// 32-bit signed integer
    Int32,

    /// 16-bit floating point, stored as raw bits
    Float16,

    /// 32-bit floating point
    Float32,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DataType::UInt8 => 1,
            DataType::Int16 | DataType::Float16 => 2,
            DataType::Int32 | DataType::Float32 => 4,
        }
    }
}

/// Memory layout of the non-batch dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Layout {
    /// Batch, height, width, channels
    Nhwc,

    /// Batch, channels, height, width
    Nchw,

    /// Batch followed by an opaque per-sample payload
    Flat,
}

/// Where a buffer physically lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemorySpace {
    /// Pageable host memory
    #[default]
    Host,

    /// Page-locked host memory suitable for asynchronous transfers
    PinnedHost,

    /// Accelerator memory
    Device,
}

/// Per-sample region of interest inside a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    /// Left edge in pixels
    pub x: u32,

    /// Top edge in pixels
    pub y: u32,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,
}

impl Roi {
    /// Region covering a whole `width` x `height` sample
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

/// Identifier of a tensor inside one transform graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor#{}", self.0)
    }
}

/// Who owns a tensor across batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorRole {
    /// Refilled by the loader every batch through a buffer swap
    Loader,

    /// Handed to the consumer through the ring buffer
    Output,

    /// Graph-internal, allocated at build time
    Intermediate,
}

/// Shape, type and placement of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Dimensions, batch first
    pub dims: Vec<usize>,

    /// Element type
    pub data_type: DataType,

    /// Layout of the non-batch dimensions
    pub layout: Layout,

    /// Memory space of the storage
    pub memory_space: MemorySpace,
}

impl TensorInfo {
    /// Create tensor info; `dims` must start with the batch dimension
    pub fn new(dims: Vec<usize>, data_type: DataType, layout: Layout) -> Result<Self> {
        if dims.is_empty() {
            return Err(Error::InvalidArgument(
                "tensor must have at least the batch dimension".into(),
            ));
        }
        Ok(Self {
            dims,
            data_type,
            layout,
            memory_space: MemorySpace::Host,
        })
    }

    /// Set the memory space
    #[must_use]
    pub fn with_memory_space(mut self, memory_space: MemorySpace) -> Self {
        self.memory_space = memory_space;
        self
    }

    /// Leading (batch) dimension
    pub fn batch_size(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }

    /// Number of elements in one sample
    pub fn sample_elements(&self) -> usize {
        self.dims.iter().skip(1).product()
    }

    /// Number of bytes in one sample
    pub fn sample_size(&self) -> usize {
        self.sample_elements() * self.data_type.size()
    }

    /// Number of bytes for the whole batch
    pub fn data_size(&self) -> usize {
        self.batch_size() * self.sample_size()
    }

    /// Row-major strides in elements
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }
}

/// A typed, shaped tensor whose storage is an exchangeable [`BufferHandle`]
pub struct Tensor {
    /// Identity inside the owning graph
    id: TensorId,

    /// Shape and type
    info: TensorInfo,

    /// Ownership role
    role: TensorRole,

    /// Region of interest per sample in the batch
    roi: Vec<Roi>,

    /// Storage; empty until allocated
    buffer: BufferHandle,
}

impl Tensor {
    /// Create an unallocated tensor
    pub fn new(id: TensorId, info: TensorInfo, role: TensorRole) -> Self {
        let space = info.memory_space;
        let roi = vec![Roi::default(); info.batch_size()];
        Self {
            id,
            info,
            role,
            roi,
            buffer: BufferHandle::empty(space),
        }
    }

    /// Identity inside the owning graph
    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Shape and type
    pub fn info(&self) -> &TensorInfo {
        &self.info
    }

    /// Ownership role
    pub fn role(&self) -> TensorRole {
        self.role
    }

    /// Leading (batch) dimension
    pub fn batch_size(&self) -> usize {
        self.info.batch_size()
    }

    /// Number of bytes for the whole batch
    pub fn data_size(&self) -> usize {
        self.info.data_size()
    }

    /// Whether storage of the full batch size is attached
    pub fn is_allocated(&self) -> bool {
        self.buffer.len() == self.info.data_size()
    }

    /// Allocate storage from a memory backend, replacing any existing buffer
    pub fn allocate(&mut self, backend: &dyn MemoryBackend) -> Result<()> {
        let buffer = backend.allocate(self.info.data_size(), self.info.memory_space)?;
        let old = std::mem::replace(&mut self.buffer, buffer);
        if !old.is_empty() {
            backend.release(old);
        }
        Ok(())
    }

    /// Storage of the current batch
    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    /// Mutable storage of the current batch
    pub fn buffer_mut(&mut self) -> &mut BufferHandle {
        &mut self.buffer
    }

    /// Exchange this tensor's storage with `other`. The tensor object
    /// stays in place; only the storage changes hands.
    pub fn swap_buffer(&mut self, other: &mut BufferHandle) {
        self.buffer.swap(other);
    }

    /// Detach the storage, leaving the tensor unallocated
    pub fn take_buffer(&mut self) -> BufferHandle {
        std::mem::replace(&mut self.buffer, BufferHandle::empty(self.info.memory_space))
    }

    /// Per-sample regions of interest
    pub fn roi(&self) -> &[Roi] {
        &self.roi
    }

    /// Mutable per-sample regions of interest
    pub fn roi_mut(&mut self) -> &mut [Roi] {
        &mut self.roi
    }

    /// Replace the region of interest list
    pub fn set_roi(&mut self, roi: &[Roi]) {
        self.roi.clear();
        self.roi.extend_from_slice(roi);
    }

    /// View the storage as elements of `T`
    pub fn as_slice<T: Pod>(&self) -> Result<&[T]> {
        self.check_element::<T>()?;
        self.buffer.as_slice()
    }

    /// Mutable view of the storage as elements of `T`
    pub fn as_slice_mut<T: Pod>(&mut self) -> Result<&mut [T]> {
        self.check_element::<T>()?;
        self.buffer.as_slice_mut()
    }

    /// Bytes of sample `index` within the batch
    pub fn sample_bytes(&self, index: usize) -> Result<&[u8]> {
        let batch = self.batch_size();
        if index >= batch {
            return Err(Error::IndexOutOfBounds { index, len: batch });
        }
        let size = self.info.sample_size();
        self.buffer
            .as_bytes()
            .get(index * size..(index + 1) * size)
            .ok_or(Error::SizeMismatch {
                expected: self.info.data_size(),
                actual: self.buffer.len(),
            })
    }

    /// Copy the batch into caller-provided memory of at least [`Tensor::data_size`] bytes
    pub fn copy_to(&self, dst: &mut [u8]) -> Result<usize> {
        let src = self.buffer.as_bytes();
        if dst.len() < src.len() {
            return Err(Error::SizeMismatch {
                expected: src.len(),
                actual: dst.len(),
            });
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn check_element<T>(&self) -> Result<()> {
        if std::mem::size_of::<T>() != self.info.data_type.size() {
            return Err(Error::TypeMismatch(format!(
                "{} holds {:?} elements, requested a {}-byte type",
                self.id,
                self.info.data_type,
                std::mem::size_of::<T>()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("role", &self.role)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostMemory;
    use proptest::prelude::*;
    use test_case::test_case;

    fn image_info() -> TensorInfo {
        TensorInfo::new(vec![2, 4, 4, 3], DataType::UInt8, Layout::Nhwc).unwrap()
    }

    #[test]
    fn test_info_sizes() {
        let info = TensorInfo::new(vec![8, 3, 2], DataType::Float32, Layout::Nchw).unwrap();
        assert_eq!(info.batch_size(), 8);
        assert_eq!(info.sample_size(), 24);
        assert_eq!(info.data_size(), 192);
        assert_eq!(info.strides(), vec![6, 2, 1]);
        assert!(TensorInfo::new(vec![], DataType::UInt8, Layout::Flat).is_err());
    }

    #[test]
    fn test_allocate_and_sample_access() {
        let memory = HostMemory::new();
        let mut tensor = Tensor::new(TensorId(0), image_info(), TensorRole::Intermediate);
        assert!(!tensor.is_allocated());
        tensor.allocate(&memory).unwrap();
        assert!(tensor.is_allocated());

        tensor.buffer_mut().as_bytes_mut()[48] = 5;
        assert_eq!(tensor.sample_bytes(1).unwrap()[0], 5);
        assert!(matches!(
            tensor.sample_bytes(2),
            Err(Error::IndexOutOfBounds { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_swap_buffer_keeps_tensor() {
        let mut tensor = Tensor::new(TensorId(3), image_info(), TensorRole::Loader);
        let mut incoming = BufferHandle::from_bytes(&[1; 96]).unwrap();
        let incoming_id = incoming.id();
        tensor.swap_buffer(&mut incoming);
        assert_eq!(tensor.id(), TensorId(3));
        assert_eq!(tensor.buffer().id(), incoming_id);
        assert!(incoming.is_empty());
    }

    #[test]
    fn test_typed_view_checks_element_size() {
        let memory = HostMemory::new();
        let info = TensorInfo::new(vec![1, 4], DataType::Float32, Layout::Flat).unwrap();
        let mut tensor = Tensor::new(TensorId(0), info, TensorRole::Output);
        tensor.allocate(&memory).unwrap();
        tensor.as_slice_mut::<f32>().unwrap()[3] = 2.5;
        assert_eq!(tensor.as_slice::<f32>().unwrap()[3], 2.5);
        assert!(tensor.as_slice::<u8>().is_err());

        let mut dst = [0u8; 8];
        assert!(tensor.copy_to(&mut dst).is_err());
    }

    #[test_case(DataType::UInt8, 1)]
    #[test_case(DataType::Int16, 2)]
    #[test_case(DataType::Float16, 2)]
    #[test_case(DataType::Int32, 4)]
    #[test_case(DataType::Float32, 4)]
    fn test_element_size(data_type: DataType, size: usize) {
        assert_eq!(data_type.size(), size);
    }

    proptest! {
        #[test]
        fn prop_outer_stride_spans_one_sample(dims in prop::collection::vec(1usize..6, 2..5)) {
            let info = TensorInfo::new(dims.clone(), DataType::UInt8, Layout::Flat).unwrap();
            let strides = info.strides();
            prop_assert_eq!(strides[0], info.sample_elements());
            prop_assert_eq!(*strides.last().unwrap(), 1);
            prop_assert_eq!(info.data_size(), dims.iter().product::<usize>());
        }
    }
}
