//! Quantization parameter classification
//!
//! Inspects the constant zero-point/scale inputs of a quantized convolution
//! node and decides which numeric kernel path applies. The decision is made
//! once at operator construction and never changes.
//!
//! All six parameter tensors must be constant initializers; anything else is
//! a partitioning defect and fails the build with a precondition error
//! before any backend call is attempted.

use serde::{Deserialize, Serialize};

use crate::error::{DespacharError, Result};
use crate::tensor::{DType, Tensor};

/// Numeric kernel path, decided once at classification time
///
/// Modeled as a closed tag so dispatch over the five paths stays exhaustive;
/// the `Invalid` tag is turned into a build failure by the kernel factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    /// Full-precision float
    Fp32,
    /// Signed 8-bit, per-tensor weight scale
    Qs8,
    /// Signed 8-bit, per-channel weight scales
    Qc8,
    /// Unsigned 8-bit, per-tensor weight scale
    Qu8,
    /// Input dtype maps to no supported path
    Invalid,
}

impl Precision {
    /// True for the three 8-bit paths
    #[must_use]
    pub fn is_quantized(self) -> bool {
        matches!(self, Precision::Qs8 | Precision::Qc8 | Precision::Qu8)
    }

    /// Element type of activations and outputs on this path
    #[must_use]
    pub fn activation_dtype(self) -> Option<DType> {
        match self {
            Precision::Fp32 => Some(DType::F32),
            Precision::Qs8 | Precision::Qc8 => Some(DType::I8),
            Precision::Qu8 => Some(DType::U8),
            Precision::Invalid => None,
        }
    }
}

/// Weight scale: a single value or one value per output channel
///
/// Exactly one representation exists per operator; which one is fixed by the
/// classification outcome (`Qc8` retains the full array).
#[derive(Debug, Clone, PartialEq)]
pub enum WeightScale {
    /// One scale for the whole weight tensor
    PerTensor(f32),
    /// One scale per output channel
    PerChannel(Vec<f32>),
}

impl WeightScale {
    /// The per-tensor scale, if this is the per-tensor representation
    #[must_use]
    pub fn per_tensor(&self) -> Option<f32> {
        match self {
            WeightScale::PerTensor(scale) => Some(*scale),
            WeightScale::PerChannel(_) => None,
        }
    }

    /// The per-channel scale array, if this is the per-channel representation
    #[must_use]
    pub fn per_channel(&self) -> Option<&[f32]> {
        match self {
            WeightScale::PerTensor(_) => None,
            WeightScale::PerChannel(scales) => Some(scales),
        }
    }
}

/// Classified quantization parameters for one convolution node
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    /// Input zero point
    pub x_zero_point: i32,
    /// Input scale
    pub x_scale: f32,
    /// Weight zero point (used by the unsigned path only)
    pub w_zero_point: i32,
    /// Weight scale(s)
    pub w_scale: WeightScale,
    /// Output zero point
    pub y_zero_point: i32,
    /// Output scale
    pub y_scale: f32,
}

/// The six constant parameter tensors of a quantized conv node
#[derive(Debug, Clone, Copy)]
pub struct QuantInputs<'a> {
    /// Input scale tensor
    pub x_scale: &'a Tensor,
    /// Input zero-point tensor
    pub x_zero_point: &'a Tensor,
    /// Weight scale tensor (scalar or per-output-channel vector)
    pub w_scale: &'a Tensor,
    /// Weight zero-point tensor
    pub w_zero_point: &'a Tensor,
    /// Output scale tensor
    pub y_scale: &'a Tensor,
    /// Output zero-point tensor
    pub y_zero_point: &'a Tensor,
}

fn require_constant(tensor: &Tensor, name: &str) -> Result<()> {
    if !tensor.is_constant() {
        return Err(DespacharError::PreconditionViolation {
            input: name.to_string(),
            reason: "not a constant initializer; the partitioning layer should not have claimed this node"
                .to_string(),
        });
    }
    Ok(())
}

/// Classify the numeric path and extract quantization parameters
///
/// Signed 8-bit input selects the per-channel path when the weight-scale
/// tensor carries more than one element, otherwise the per-tensor signed
/// path. Unsigned 8-bit input always selects the unsigned path. Any other
/// dtype yields [`Precision::Invalid`]; the kernel factory turns that into
/// a build-time failure.
///
/// # Errors
///
/// Returns `PreconditionViolation` if any parameter tensor is not a constant
/// initializer, and shape/dtype errors if a scalar parameter is malformed.
pub fn classify(x_dtype: DType, inputs: &QuantInputs<'_>) -> Result<(Precision, QuantParams)> {
    require_constant(inputs.x_scale, "x_scale")?;
    require_constant(inputs.x_zero_point, "x_zero_point")?;
    require_constant(inputs.w_scale, "w_scale")?;
    require_constant(inputs.w_zero_point, "w_zero_point")?;
    require_constant(inputs.y_scale, "y_scale")?;
    require_constant(inputs.y_zero_point, "y_zero_point")?;

    let x_zero_point = inputs.x_zero_point.scalar_zero_point()?;
    let w_zero_point = inputs.w_zero_point.scalar_zero_point()?;
    let y_zero_point = inputs.y_zero_point.scalar_zero_point()?;
    let x_scale = inputs.x_scale.scalar_f32()?;
    let y_scale = inputs.y_scale.scalar_f32()?;

    let (precision, w_scale) = match x_dtype {
        DType::I8 => {
            if inputs.w_scale.size() > 1 {
                let scales = inputs.w_scale.as_f32()?.to_vec();
                (Precision::Qc8, WeightScale::PerChannel(scales))
            } else {
                (Precision::Qs8, WeightScale::PerTensor(inputs.w_scale.scalar_f32()?))
            }
        }
        DType::U8 => (
            Precision::Qu8,
            WeightScale::PerTensor(inputs.w_scale.scalar_f32()?),
        ),
        DType::F32 | DType::I32 => (
            Precision::Invalid,
            WeightScale::PerTensor(inputs.w_scale.scalar_f32()?),
        ),
    };

    Ok((
        precision,
        QuantParams {
            x_zero_point,
            x_scale,
            w_zero_point,
            w_scale,
            y_zero_point,
            y_scale,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorData;

    fn scalar_f32(value: f32) -> Tensor {
        Tensor::constant(vec![1], TensorData::F32(vec![value])).expect("test")
    }

    fn scalar_i8(value: i8) -> Tensor {
        Tensor::constant(vec![1], TensorData::I8(vec![value])).expect("test")
    }

    fn scalar_u8(value: u8) -> Tensor {
        Tensor::constant(vec![1], TensorData::U8(vec![value])).expect("test")
    }

    struct Params {
        x_scale: Tensor,
        x_zp: Tensor,
        w_scale: Tensor,
        w_zp: Tensor,
        y_scale: Tensor,
        y_zp: Tensor,
    }

    fn signed_params(w_scale: Tensor) -> Params {
        Params {
            x_scale: scalar_f32(0.1),
            x_zp: scalar_i8(2),
            w_scale,
            w_zp: scalar_i8(0),
            y_scale: scalar_f32(0.05),
            y_zp: scalar_i8(-1),
        }
    }

    fn inputs(p: &Params) -> QuantInputs<'_> {
        QuantInputs {
            x_scale: &p.x_scale,
            x_zero_point: &p.x_zp,
            w_scale: &p.w_scale,
            w_zero_point: &p.w_zp,
            y_scale: &p.y_scale,
            y_zero_point: &p.y_zp,
        }
    }

    #[test]
    fn test_signed_scalar_scale_is_per_tensor() {
        let p = signed_params(scalar_f32(0.2));
        let (precision, quant) = classify(DType::I8, &inputs(&p)).expect("test");
        assert_eq!(precision, Precision::Qs8);
        assert_eq!(quant.w_scale.per_tensor(), Some(0.2));
        assert_eq!(quant.x_zero_point, 2);
        assert_eq!(quant.y_zero_point, -1);
    }

    #[test]
    fn test_signed_multi_element_scale_is_per_channel() {
        // One scale per output channel selects the per-channel path
        let w_scale =
            Tensor::constant(vec![8], TensorData::F32(vec![0.1; 8])).expect("test");
        let p = signed_params(w_scale);
        let (precision, quant) = classify(DType::I8, &inputs(&p)).expect("test");
        assert_eq!(precision, Precision::Qc8);
        assert_eq!(quant.w_scale.per_channel().map(<[f32]>::len), Some(8));
        assert!(quant.w_scale.per_tensor().is_none());
    }

    #[test]
    fn test_unsigned_is_always_per_tensor() {
        let p = Params {
            x_scale: scalar_f32(0.1),
            x_zp: scalar_u8(128),
            w_scale: scalar_f32(0.2),
            w_zp: scalar_u8(128),
            y_scale: scalar_f32(0.05),
            y_zp: scalar_u8(0),
        };
        let (precision, quant) = classify(DType::U8, &inputs(&p)).expect("test");
        assert_eq!(precision, Precision::Qu8);
        assert_eq!(quant.x_zero_point, 128);
        assert_eq!(quant.w_zero_point, 128);
        assert_eq!(quant.y_zero_point, 0);
    }

    #[test]
    fn test_unsupported_dtype_is_invalid() {
        let p = signed_params(scalar_f32(0.2));
        let (precision, _) = classify(DType::I32, &inputs(&p)).expect("test");
        assert_eq!(precision, Precision::Invalid);
    }

    #[test]
    fn test_non_constant_scale_fails_precondition() {
        let mut p = signed_params(scalar_f32(0.2));
        p.w_scale = Tensor::new(vec![1], TensorData::F32(vec![0.2])).expect("test");
        let err = classify(DType::I8, &inputs(&p)).unwrap_err();
        assert!(matches!(
            err,
            DespacharError::PreconditionViolation { ref input, .. } if input == "w_scale"
        ));
    }

    #[test]
    fn test_precision_helpers() {
        assert!(Precision::Qc8.is_quantized());
        assert!(!Precision::Fp32.is_quantized());
        assert_eq!(Precision::Qu8.activation_dtype(), Some(DType::U8));
        assert_eq!(Precision::Invalid.activation_dtype(), None);
    }
}
