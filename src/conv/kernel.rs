//! Kernel handle construction
//!
//! Builds the backend kernel for exactly one of the numeric paths, applying
//! the path-specific clamp, zero-point, and bias semantics. The resulting
//! [`KernelHandle`] owns the backend resource and releases it exactly once
//! when dropped, on every exit path including error unwinding.

use std::fmt;
use std::sync::Arc;

use crate::backend::{
    BackendStatus, ConvBackend, ConvGeometry, F32ConvParams, KernelId, Qc8ConvParams,
    Qs8ConvParams, Qu8ConvParams,
};
use crate::error::{DespacharError, Result};
use crate::tensor::{DType, Tensor};

use super::attributes::{AutoPad, ConvAttributes};
use super::quant::{Precision, QuantParams};

/// Signed 8-bit output clamp bounds
///
/// One step inside the full i8 range on both signed paths.
const QS8_OUTPUT_MIN: i8 = -126;
/// Upper bound of the signed 8-bit output clamp
const QS8_OUTPUT_MAX: i8 = 126;

/// Owned backend kernel, released on drop
pub struct KernelHandle {
    id: KernelId,
    backend: Arc<dyn ConvBackend>,
}

impl KernelHandle {
    fn new(id: KernelId, backend: Arc<dyn ConvBackend>) -> Self {
        Self { id, backend }
    }

    /// The backend identifier of this kernel
    #[must_use]
    pub fn id(&self) -> KernelId {
        self.id
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle").field("id", &self.id).finish()
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        self.backend.release_conv2d(self.id);
    }
}

fn zero_point_i8(value: i32, input: &str) -> Result<i8> {
    i8::try_from(value).map_err(|_| DespacharError::PreconditionViolation {
        input: input.to_string(),
        reason: format!("zero point {value} is not representable as i8"),
    })
}

fn zero_point_u8(value: i32, input: &str) -> Result<u8> {
    u8::try_from(value).map_err(|_| DespacharError::PreconditionViolation {
        input: input.to_string(),
        reason: format!("zero point {value} is not representable as u8"),
    })
}

fn quant_for(precision: Precision, quant: Option<&QuantParams>) -> Result<&QuantParams> {
    quant.ok_or_else(|| DespacharError::PreconditionViolation {
        input: "quant_params".to_string(),
        reason: format!("{precision:?} path requires quantization parameters"),
    })
}

fn per_tensor_scale(quant: &QuantParams) -> Result<f32> {
    quant
        .w_scale
        .per_tensor()
        .ok_or_else(|| DespacharError::PreconditionViolation {
            input: "w_scale".to_string(),
            reason: "per-tensor path classified with a per-channel weight scale".to_string(),
        })
}

/// Build the backend kernel for the classified numeric path
///
/// Called exactly once per operator, from the prepack event, because the
/// packed weight the backend needs only exists from that point on.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_kernel(
    backend: &Arc<dyn ConvBackend>,
    attrs: &ConvAttributes,
    kernel_shape: [usize; 2],
    channels_in: usize,
    channels_out: usize,
    packed_weight: &Arc<Tensor>,
    bias: Option<&Tensor>,
    precision: Precision,
    quant: Option<&QuantParams>,
    x_dtype: DType,
) -> Result<KernelHandle> {
    // One group-aware geometry covers depthwise and regular conv alike.
    let padding = if attrs.auto_pad == AutoPad::Valid {
        [0; 4]
    } else {
        attrs.pads
    };
    let geometry = ConvGeometry {
        padding,
        kernel: kernel_shape,
        stride: attrs.strides,
        dilation: attrs.dilations,
        groups: attrs.group,
        group_channels_in: channels_in / attrs.group,
        group_channels_out: channels_out / attrs.group,
        input_channel_stride: channels_in,
        output_channel_stride: channels_out,
        same_upper_padding: attrs.auto_pad == AutoPad::SameUpper,
    };

    let created: std::result::Result<KernelId, BackendStatus> = match precision {
        Precision::Fp32 => {
            let (output_min, output_max) = attrs
                .clip_min_max
                .unwrap_or((f32::NEG_INFINITY, f32::INFINITY));
            let bias = bias.map(|b| b.as_f32().map(<[f32]>::to_vec)).transpose()?;
            backend.create_conv2d_f32(F32ConvParams {
                geometry,
                weights: Arc::clone(packed_weight),
                bias,
                output_min,
                output_max,
            })
        }
        Precision::Qs8 => {
            let quant = quant_for(precision, quant)?;
            let bias = bias.map(|b| b.as_i32().map(<[i32]>::to_vec)).transpose()?;
            backend.create_conv2d_qs8(Qs8ConvParams {
                geometry,
                weights: Arc::clone(packed_weight),
                bias,
                x_zero_point: zero_point_i8(quant.x_zero_point, "x_zero_point")?,
                x_scale: quant.x_scale,
                w_scale: per_tensor_scale(quant)?,
                y_zero_point: zero_point_i8(quant.y_zero_point, "y_zero_point")?,
                y_scale: quant.y_scale,
                output_min: QS8_OUTPUT_MIN,
                output_max: QS8_OUTPUT_MAX,
            })
        }
        Precision::Qc8 => {
            let quant = quant_for(precision, quant)?;
            let bias = bias.map(|b| b.as_i32().map(<[i32]>::to_vec)).transpose()?;
            let w_scales = quant
                .w_scale
                .per_channel()
                .ok_or_else(|| DespacharError::PreconditionViolation {
                    input: "w_scale".to_string(),
                    reason: "per-channel path classified with a per-tensor weight scale"
                        .to_string(),
                })?
                .to_vec();
            backend.create_conv2d_qc8(Qc8ConvParams {
                geometry,
                weights: Arc::clone(packed_weight),
                bias,
                x_zero_point: zero_point_i8(quant.x_zero_point, "x_zero_point")?,
                x_scale: quant.x_scale,
                w_scales,
                y_zero_point: zero_point_i8(quant.y_zero_point, "y_zero_point")?,
                y_scale: quant.y_scale,
                output_min: QS8_OUTPUT_MIN,
                output_max: QS8_OUTPUT_MAX,
            })
        }
        Precision::Qu8 => {
            let quant = quant_for(precision, quant)?;
            let bias = bias.map(|b| b.as_i32().map(<[i32]>::to_vec)).transpose()?;
            // The unsigned path derives its clamp from the fused activation
            // when present; the signed paths never do.
            let (output_min, output_max) = match attrs.clip_min_max {
                Some((min, max)) => (min as u8, max as u8),
                None => (0, 255),
            };
            backend.create_conv2d_qu8(Qu8ConvParams {
                geometry,
                weights: Arc::clone(packed_weight),
                bias,
                x_zero_point: zero_point_u8(quant.x_zero_point, "x_zero_point")?,
                x_scale: quant.x_scale,
                w_zero_point: zero_point_u8(quant.w_zero_point, "w_zero_point")?,
                w_scale: per_tensor_scale(quant)?,
                y_zero_point: zero_point_u8(quant.y_zero_point, "y_zero_point")?,
                y_scale: quant.y_scale,
                output_min,
                output_max,
            })
        }
        Precision::Invalid => {
            return Err(DespacharError::UnsupportedPrecision { dtype: x_dtype });
        }
    };

    match created {
        Ok(id) => Ok(KernelHandle::new(id, Arc::clone(backend))),
        Err(status) => Err(DespacharError::KernelConstruction { status }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ReferenceBackend;
    use crate::conv::quant::WeightScale;
    use crate::tensor::TensorData;

    fn backend() -> Arc<dyn ConvBackend> {
        Arc::new(ReferenceBackend::new())
    }

    fn packed_f32(m: usize, c: usize) -> Arc<Tensor> {
        Arc::new(
            Tensor::constant(vec![m, 1, 1, c], TensorData::F32(vec![1.0; m * c]))
                .expect("test"),
        )
    }

    #[test]
    fn test_fp32_kernel_builds() {
        let backend = backend();
        let handle = build_kernel(
            &backend,
            &ConvAttributes::default(),
            [1, 1],
            2,
            3,
            &packed_f32(3, 2),
            None,
            Precision::Fp32,
            None,
            DType::F32,
        )
        .expect("test");
        let _ = handle.id();
    }

    #[test]
    fn test_invalid_precision_is_rejected() {
        let backend = backend();
        let err = build_kernel(
            &backend,
            &ConvAttributes::default(),
            [1, 1],
            2,
            3,
            &packed_f32(3, 2),
            None,
            Precision::Invalid,
            None,
            DType::I32,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DespacharError::UnsupportedPrecision { dtype: DType::I32 }
        ));
    }

    #[test]
    fn test_backend_rejection_carries_status() {
        // Per-channel scale count doesn't match the output channel count
        let backend = backend();
        let weights = Arc::new(
            Tensor::constant(vec![4, 1, 1, 2], TensorData::I8(vec![0; 8])).expect("test"),
        );
        let quant = QuantParams {
            x_zero_point: 0,
            x_scale: 1.0,
            w_zero_point: 0,
            w_scale: WeightScale::PerChannel(vec![1.0; 3]),
            y_zero_point: 0,
            y_scale: 1.0,
        };
        let err = build_kernel(
            &backend,
            &ConvAttributes::default(),
            [1, 1],
            2,
            4,
            &weights,
            None,
            Precision::Qc8,
            Some(&quant),
            DType::I8,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DespacharError::KernelConstruction {
                status: BackendStatus::InvalidParameter
            }
        ));
    }

    #[test]
    fn test_qu8_clamp_falls_back_to_full_range() {
        // Captured by the reference backend's validation: a [0, 255] clamp is
        // accepted, and construction succeeds without a fused clip.
        let backend = backend();
        let weights = Arc::new(
            Tensor::constant(vec![1, 1, 1, 1], TensorData::U8(vec![128])).expect("test"),
        );
        let quant = QuantParams {
            x_zero_point: 128,
            x_scale: 0.1,
            w_zero_point: 128,
            w_scale: WeightScale::PerTensor(0.2),
            y_zero_point: 0,
            y_scale: 0.05,
        };
        let handle = build_kernel(
            &backend,
            &ConvAttributes::default(),
            [1, 1],
            1,
            1,
            &weights,
            None,
            Precision::Qu8,
            Some(&quant),
            DType::U8,
        );
        assert!(handle.is_ok());
    }

    #[test]
    fn test_drop_releases_backend_kernel() {
        let reference = Arc::new(ReferenceBackend::new());
        let backend: Arc<dyn ConvBackend> = reference.clone();
        let handle = build_kernel(
            &backend,
            &ConvAttributes::default(),
            [1, 1],
            1,
            1,
            &packed_f32(1, 1),
            None,
            Precision::Fp32,
            None,
            DType::F32,
        )
        .expect("test");
        assert_eq!(reference.kernel_count(), 1);
        drop(handle);
        assert_eq!(reference.kernel_count(), 0);
    }

    #[test]
    fn test_out_of_range_zero_point_fails() {
        let backend = backend();
        let weights = Arc::new(
            Tensor::constant(vec![1, 1, 1, 1], TensorData::I8(vec![1])).expect("test"),
        );
        let quant = QuantParams {
            x_zero_point: 300,
            x_scale: 1.0,
            w_zero_point: 0,
            w_scale: WeightScale::PerTensor(1.0),
            y_zero_point: 0,
            y_scale: 1.0,
        };
        let err = build_kernel(
            &backend,
            &ConvAttributes::default(),
            [1, 1],
            1,
            1,
            &weights,
            None,
            Precision::Qs8,
            Some(&quant),
            DType::I8,
        )
        .unwrap_err();
        assert!(matches!(err, DespacharError::PreconditionViolation { .. }));
    }
}
