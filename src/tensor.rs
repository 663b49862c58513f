//! Tensor values moved through the rendezvous.
//!
//! A [`Tensor`] is an element type, a shape and a buffer. Types whose
//! elements are plain bytes ([`DataType::can_use_memcpy`]) keep one
//! contiguous [`Bytes`] buffer that can be written to the wire without
//! copying. The others (strings, variants, resource handles) keep one byte
//! string per element and travel as a [`SerializedTensor`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::{Result, WorkerError};

/// Microseconds since the Unix epoch, as stamped on requests and responses.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int8,
    UInt8,
    Int16,
    Int32,
    Int64,
    Half,
    BFloat16,
    Float,
    Double,
    String,
    Variant,
    Resource,
}

impl DataType {
    /// Size of one element in bytes, or `None` for types without a fixed
    /// byte layout.
    pub fn element_size(self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => Some(1),
            DataType::Int16 | DataType::Half | DataType::BFloat16 => Some(2),
            DataType::Int32 | DataType::Float => Some(4),
            DataType::Int64 | DataType::Double => Some(8),
            DataType::String | DataType::Variant | DataType::Resource => None,
        }
    }

    /// Whether the buffer can be bulk-copied byte for byte.
    #[inline]
    pub fn can_use_memcpy(self) -> bool {
        self.element_size().is_some()
    }
}

/// Dimensions of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TensorShape(Vec<u64>);

impl TensorShape {
    pub fn new(dims: Vec<u64>) -> Self {
        Self(dims)
    }

    /// A rank-0 shape (one element).
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn dims(&self) -> &[u64] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of elements (1 for a scalar), `None` if it overflows `u64`.
    ///
    /// Any zero dimension makes the count 0 regardless of the others.
    pub fn checked_num_elements(&self) -> Option<u64> {
        if self.0.contains(&0) {
            return Some(0);
        }
        self.0.iter().try_fold(1u64, |acc, &dim| acc.checked_mul(dim))
    }

    /// Number of elements, saturating at `u64::MAX`.
    pub fn num_elements(&self) -> u64 {
        self.checked_num_elements().unwrap_or(u64::MAX)
    }

    /// Bytes needed by `element_size`-byte elements, `None` on overflow.
    pub fn checked_byte_len(&self, element_size: usize) -> Option<usize> {
        let count = usize::try_from(self.checked_num_elements()?).ok()?;
        count.checked_mul(element_size)
    }
}

impl From<Vec<u64>> for TensorShape {
    fn from(dims: Vec<u64>) -> Self {
        Self(dims)
    }
}

/// Storage behind a tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorBuffer {
    /// Contiguous element bytes (bulk-copyable types).
    Contiguous(Bytes),
    /// One byte string per element (string, variant, resource).
    Elements(Arc<[Bytes]>),
}

/// A typed, shaped value.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DataType,
    shape: TensorShape,
    buffer: TensorBuffer,
}

impl Tensor {
    /// Build a tensor over contiguous bytes.
    ///
    /// # Errors
    ///
    /// Fails if `dtype` has no fixed layout or `data` has the wrong length.
    pub fn from_bytes(dtype: DataType, shape: impl Into<TensorShape>, data: Bytes) -> Result<Self> {
        let shape = shape.into();
        let size = dtype.element_size().ok_or_else(|| {
            WorkerError::Internal(format!("{:?} tensors cannot be built from raw bytes", dtype))
        })?;
        let expected = shape.checked_byte_len(size).ok_or_else(|| {
            WorkerError::Protocol(format!("{:?} tensor of shape {:?} is too large", dtype, shape.dims()))
        })?;
        if data.len() != expected {
            return Err(WorkerError::Internal(format!(
                "{:?} tensor of shape {:?} needs {} bytes, got {}",
                dtype,
                shape.dims(),
                expected,
                data.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            buffer: TensorBuffer::Contiguous(data),
        })
    }

    /// Build a tensor from one byte string per element.
    ///
    /// # Errors
    ///
    /// Fails if `dtype` is bulk-copyable or the element count doesn't match.
    pub fn from_elements(
        dtype: DataType,
        shape: impl Into<TensorShape>,
        elements: Vec<Bytes>,
    ) -> Result<Self> {
        let shape = shape.into();
        if dtype.can_use_memcpy() {
            return Err(WorkerError::Internal(format!(
                "{:?} tensors must be built from contiguous bytes",
                dtype
            )));
        }
        let Some(count) = shape.checked_num_elements() else {
            return Err(WorkerError::Protocol(format!(
                "shape {:?} has too many elements",
                shape.dims()
            )));
        };
        if elements.len() as u64 != count {
            return Err(WorkerError::Internal(format!(
                "shape {:?} needs {} elements, got {}",
                shape.dims(),
                count,
                elements.len()
            )));
        }
        Ok(Self {
            dtype,
            shape,
            buffer: TensorBuffer::Elements(elements.into()),
        })
    }

    /// Float tensor of shape `[0]`; the value handed out for dead slots.
    pub fn empty() -> Self {
        Self {
            dtype: DataType::Float,
            shape: TensorShape::new(vec![0]),
            buffer: TensorBuffer::Contiguous(Bytes::new()),
        }
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn buffer(&self) -> &TensorBuffer {
        &self.buffer
    }

    /// Contiguous bytes, if this is a bulk-copyable tensor.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.buffer {
            TensorBuffer::Contiguous(bytes) => Some(bytes),
            TensorBuffer::Elements(_) => None,
        }
    }

    /// Per-element byte strings, if this is a non bulk-copyable tensor.
    pub fn elements(&self) -> Option<&[Bytes]> {
        match &self.buffer {
            TensorBuffer::Contiguous(_) => None,
            TensorBuffer::Elements(elements) => Some(elements),
        }
    }

    /// Bytes held by the buffer.
    pub fn total_bytes(&self) -> usize {
        match &self.buffer {
            TensorBuffer::Contiguous(bytes) => bytes.len(),
            TensorBuffer::Elements(elements) => elements.iter().map(Bytes::len).sum(),
        }
    }

    pub fn num_elements(&self) -> u64 {
        self.shape.num_elements()
    }

    /// True when the tensor holds no elements.
    pub fn is_empty(&self) -> bool {
        self.num_elements() == 0
    }

    /// Serialized form of this tensor.
    pub fn to_serialized(&self) -> SerializedTensor {
        let (content, elements) = match &self.buffer {
            TensorBuffer::Contiguous(bytes) => (ByteBuf::from(bytes.to_vec()), Vec::new()),
            TensorBuffer::Elements(elements) => (
                ByteBuf::new(),
                elements.iter().map(|e| ByteBuf::from(e.to_vec())).collect(),
            ),
        };
        SerializedTensor {
            dtype: self.dtype,
            shape: self.shape.dims().to_vec(),
            content,
            elements,
        }
    }
}

/// Self-describing wire form of a tensor.
///
/// Used for element types that cannot be bulk-copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedTensor {
    pub dtype: DataType,
    pub shape: Vec<u64>,
    /// Contiguous element bytes (bulk-copyable types only).
    pub content: ByteBuf,
    /// One entry per element (other types).
    pub elements: Vec<ByteBuf>,
}

impl SerializedTensor {
    /// Rebuild the tensor.
    pub fn into_tensor(self) -> Result<Tensor> {
        if self.dtype.can_use_memcpy() {
            Tensor::from_bytes(self.dtype, self.shape, Bytes::from(self.content.into_vec()))
        } else {
            let elements = self
                .elements
                .into_iter()
                .map(|e| Bytes::from(e.into_vec()))
                .collect();
            Tensor::from_elements(self.dtype, self.shape, elements)
        }
    }
}
