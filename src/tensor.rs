//! Tensor storage for operator inputs and outputs
//!
//! This module provides the `Tensor` type used across the dispatch engine.
//! Because a single convolution node mixes element types (float or 8-bit
//! activations, 8-bit weights, 32-bit integer bias, float scales), storage is
//! dtype-tagged rather than generic: `TensorData` carries one of the four
//! supported element types and `Tensor` pairs it with a shape.
//!
//! Constant initializers (weights, quantization parameters, bias) are marked
//! with a constancy flag at construction. The engine enforces constancy via
//! precondition checks; it never re-validates graph eligibility.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DespacharError, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    F32,
    /// Signed 8-bit integer
    I8,
    /// Unsigned 8-bit integer
    U8,
    /// Signed 32-bit integer (bias on quantized paths)
    I32,
}

impl DType {
    /// Size of one element in bytes
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::I8 | DType::U8 => 1,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F32 => "f32",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I32 => "i32",
        };
        write!(f, "{name}")
    }
}

/// Dtype-tagged element storage
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// 32-bit float elements
    F32(Vec<f32>),
    /// Signed 8-bit elements
    I8(Vec<i8>),
    /// Unsigned 8-bit elements
    U8(Vec<u8>),
    /// Signed 32-bit elements
    I32(Vec<i32>),
}

impl TensorData {
    /// Element type of this storage
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I8(_) => DType::I8,
            TensorData::U8(_) => DType::U8,
            TensorData::I32(_) => DType::I32,
        }
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::I32(v) => v.len(),
        }
    }

    /// True if the storage holds no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// N-dimensional tensor with dtype-tagged storage
///
/// Data is flattened in row-major order. Unlike weight and parameter tensors,
/// runtime activations may legally carry zero extents (a zero batch produces
/// an empty output), so zero dimensions are accepted here and handled by the
/// execution dispatcher.
///
/// # Examples
///
/// ```
/// use despachar::tensor::{Tensor, TensorData};
///
/// let t = Tensor::new(vec![2, 3], TensorData::F32(vec![0.0; 6])).unwrap();
/// assert_eq!(t.shape(), &[2, 3]);
/// assert_eq!(t.size(), 6);
/// assert!(!t.is_constant());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    /// Shape of the tensor
    shape: Vec<usize>,
    /// Flattened data in row-major order
    data: TensorData,
    /// True for constant initializers known at build time
    constant: bool,
}

impl Tensor {
    /// Create a runtime tensor from a shape and tagged data
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or the element count doesn't match
    /// the shape product.
    pub fn new(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        Self::validated(shape, data, false)
    }

    /// Create a constant-initializer tensor (weight, scale, zero point, bias)
    ///
    /// # Errors
    ///
    /// Returns `Err` if the shape is empty or the element count doesn't match
    /// the shape product.
    pub fn constant(shape: Vec<usize>, data: TensorData) -> Result<Self> {
        Self::validated(shape, data, true)
    }

    fn validated(shape: Vec<usize>, data: TensorData, constant: bool) -> Result<Self> {
        if shape.is_empty() {
            return Err(DespacharError::InvalidShape {
                reason: "Shape cannot be empty; scalars use shape [1]".to_string(),
            });
        }

        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DespacharError::DataShapeMismatch {
                data_size: data.len(),
                shape,
                expected,
            });
        }

        Ok(Self {
            shape,
            data,
            constant,
        })
    }

    /// Get the shape of the tensor
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get the total number of elements
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Element type of the tensor
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// True if this tensor is a constant initializer
    #[must_use]
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// Get a reference to the tagged storage
    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Typed access to `f32` elements
    ///
    /// # Errors
    ///
    /// Returns `DtypeMismatch` if the tensor holds another element type.
    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Ok(v),
            other => Err(DespacharError::DtypeMismatch {
                expected: DType::F32,
                actual: other.dtype(),
            }),
        }
    }

    /// Typed access to `i8` elements
    ///
    /// # Errors
    ///
    /// Returns `DtypeMismatch` if the tensor holds another element type.
    pub fn as_i8(&self) -> Result<&[i8]> {
        match &self.data {
            TensorData::I8(v) => Ok(v),
            other => Err(DespacharError::DtypeMismatch {
                expected: DType::I8,
                actual: other.dtype(),
            }),
        }
    }

    /// Typed access to `u8` elements
    ///
    /// # Errors
    ///
    /// Returns `DtypeMismatch` if the tensor holds another element type.
    pub fn as_u8(&self) -> Result<&[u8]> {
        match &self.data {
            TensorData::U8(v) => Ok(v),
            other => Err(DespacharError::DtypeMismatch {
                expected: DType::U8,
                actual: other.dtype(),
            }),
        }
    }

    /// Typed access to `i32` elements
    ///
    /// # Errors
    ///
    /// Returns `DtypeMismatch` if the tensor holds another element type.
    pub fn as_i32(&self) -> Result<&[i32]> {
        match &self.data {
            TensorData::I32(v) => Ok(v),
            other => Err(DespacharError::DtypeMismatch {
                expected: DType::I32,
                actual: other.dtype(),
            }),
        }
    }

    /// Extract a single `f32` value from a scalar or one-element vector
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the tensor has more than one element, or
    /// `DtypeMismatch` if it is not `f32`.
    pub fn scalar_f32(&self) -> Result<f32> {
        if self.size() != 1 {
            return Err(DespacharError::InvalidShape {
                reason: format!(
                    "Expected a single-element tensor, got shape {:?}",
                    self.shape
                ),
            });
        }
        Ok(self.as_f32()?[0])
    }

    /// Extract a zero point as `i32` from a scalar integer tensor
    ///
    /// The value is read at the tensor's declared integer width, so
    /// representability is enforced by the storage type itself.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` for multi-element tensors or `DtypeMismatch`
    /// for float storage.
    pub fn scalar_zero_point(&self) -> Result<i32> {
        if self.size() != 1 {
            return Err(DespacharError::InvalidShape {
                reason: format!(
                    "Expected a single-element tensor, got shape {:?}",
                    self.shape
                ),
            });
        }
        match &self.data {
            TensorData::I8(v) => Ok(i32::from(v[0])),
            TensorData::U8(v) => Ok(i32::from(v[0])),
            TensorData::I32(v) => Ok(v[0]),
            TensorData::F32(_) => Err(DespacharError::DtypeMismatch {
                expected: DType::I8,
                actual: DType::F32,
            }),
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={:?}, dtype={}, constant={})",
            self.shape,
            self.dtype(),
            self.constant
        )
    }
}
