//! Typed tensor view over an arena buffer

use std::fmt;

use crate::error::{ForgeError, ForgeResult};
use crate::memory::{Allocator, AllocatorInfo, BufferRef};
use crate::tensor::dtype::{DataType, TensorElement};
use crate::tensor::shape::TensorShape;

/// A tensor: element type, shape, and a counted reference to its buffer
///
/// An owning tensor's buffer has exactly `dtype.size() * shape.size()` bytes.
/// An aliasing tensor (created for in-place reuse) borrows a donor buffer that
/// is at least that large. Cloning a tensor shares the buffer.
#[derive(Clone)]
pub struct Tensor {
    dtype: DataType,
    shape: TensorShape,
    buffer: BufferRef,
    location: AllocatorInfo,
    owns_buffer: bool,
}

/// Bytes needed to store `shape` elements of `dtype`
pub fn required_bytes(dtype: DataType, shape: &TensorShape) -> ForgeResult<usize> {
    shape
        .dims()
        .iter()
        .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| ForgeError::InvalidArgument(format!("tensor size overflow for shape {}", shape)))
}

impl Tensor {
    /// Tensor that owns `buffer`, which must be exactly the required size
    pub fn new_owned(
        dtype: DataType,
        shape: TensorShape,
        buffer: BufferRef,
        location: AllocatorInfo,
    ) -> ForgeResult<Self> {
        let required = required_bytes(dtype, &shape)?;
        if buffer.size() != required {
            return Err(ForgeError::InvalidArgument(format!(
                "owning tensor {} {} needs {} bytes, buffer has {}",
                dtype,
                shape,
                required,
                buffer.size()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            buffer,
            location,
            owns_buffer: true,
        })
    }

    /// Tensor aliasing a buffer owned elsewhere, which must be large enough
    pub fn new_aliased(
        dtype: DataType,
        shape: TensorShape,
        buffer: BufferRef,
        location: AllocatorInfo,
    ) -> ForgeResult<Self> {
        let required = required_bytes(dtype, &shape)?;
        if buffer.size() < required {
            return Err(ForgeError::InvalidArgument(format!(
                "buffer of {} bytes too small for {} {} ({} bytes)",
                buffer.size(),
                dtype,
                shape,
                required
            )));
        }
        Ok(Self {
            dtype,
            shape,
            buffer,
            location,
            owns_buffer: false,
        })
    }

    /// Allocate a zeroed owning tensor
    pub fn allocate(allocator: &dyn Allocator, dtype: DataType, shape: TensorShape) -> ForgeResult<Self> {
        let bytes = required_bytes(dtype, &shape)?;
        let buffer = allocator.alloc(bytes)?;
        Self::new_owned(dtype, shape, buffer, allocator.info().clone())
    }

    /// Allocate a tensor and fill it from `data`
    pub fn from_vec<T: TensorElement>(
        allocator: &dyn Allocator,
        shape: impl Into<TensorShape>,
        data: &[T],
    ) -> ForgeResult<Self> {
        let tensor = Self::allocate(allocator, T::DTYPE, shape.into())?;
        tensor.write_from(data)?;
        Ok(tensor)
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn location(&self) -> &AllocatorInfo {
        &self.location
    }

    pub fn buffer(&self) -> &BufferRef {
        &self.buffer
    }

    pub fn owns_buffer(&self) -> bool {
        self.owns_buffer
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.shape.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes covered by this tensor (may be less than the buffer when aliasing)
    pub fn byte_size(&self) -> usize {
        self.dtype.size() * self.shape.size()
    }

    /// True if both tensors address the same physical buffer
    pub fn shares_buffer_with(&self, other: &Tensor) -> bool {
        self.buffer.same_buffer(&other.buffer)
    }

    fn check_dtype<T: TensorElement>(&self) -> ForgeResult<()> {
        if T::DTYPE != self.dtype {
            return Err(ForgeError::InvalidArgument(format!(
                "tensor holds {}, requested {}",
                self.dtype,
                T::DTYPE
            )));
        }
        Ok(())
    }

    /// Copy the elements out
    pub fn to_vec<T: TensorElement>(&self) -> ForgeResult<Vec<T>> {
        self.check_dtype::<T>()?;
        let width = self.dtype.size();
        let len = self.len();
        Ok(self.buffer.read(|bytes| {
            bytes[..len * width]
                .chunks_exact(width)
                .map(T::read_le)
                .collect()
        }))
    }

    /// Overwrite the elements from `data`, which must have exactly `len()` items
    pub fn write_from<T: TensorElement>(&self, data: &[T]) -> ForgeResult<()> {
        self.check_dtype::<T>()?;
        if data.len() != self.len() {
            return Err(ForgeError::InvalidArgument(format!(
                "expected {} elements for shape {}, got {}",
                self.len(),
                self.shape,
                data.len()
            )));
        }
        let width = self.dtype.size();
        self.buffer.write(|bytes| {
            for (chunk, value) in bytes.chunks_exact_mut(width).zip(data) {
                value.write_le(chunk);
            }
        });
        Ok(())
    }

    /// Raw bytes of the tensor
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.byte_size();
        self.buffer.read(|bytes| bytes[..n].to_vec())
    }

    /// Copy raw bytes into the tensor (at most `byte_size()` bytes)
    pub fn copy_from_bytes(&self, src: &[u8]) -> ForgeResult<()> {
        if src.len() != self.byte_size() {
            return Err(ForgeError::InvalidArgument(format!(
                "byte copy of {} into tensor of {} bytes",
                src.len(),
                self.byte_size()
            )));
        }
        self.buffer.write(|bytes| bytes[..src.len()].copy_from_slice(src));
        Ok(())
    }

    /// Deep copy into a new tensor from `allocator`
    pub fn copy_to(&self, allocator: &dyn Allocator) -> ForgeResult<Tensor> {
        let target = Tensor::allocate(allocator, self.dtype, self.shape.clone())?;
        target.copy_from_bytes(&self.to_bytes())?;
        Ok(target)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("location", &self.location.to_string())
            .field("buffer", &self.buffer.handle())
            .field("owns_buffer", &self.owns_buffer)
            .finish()
    }
}
