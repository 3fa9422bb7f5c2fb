//! Quantization-aware 2-D convolution operator
//!
//! The operator lives through two phases. Construction classifies the
//! numeric path from the node's constant inputs and captures the static
//! shape facts (input channels from the NHWC input type, output channels
//! from the weight's first dim). The one-shot prepack event then transposes
//! the weight into the channel-last kernel layout and builds the backend
//! kernel handle — construction has to wait until then because the handle
//! needs the packed weight's data. Every inference call after that infers
//! the output shape, rebinds the live extents, and runs the handle.
//!
//! Prepack mutates operator state and must be serialized by the surrounding
//! runtime, strictly before the first `compute`. `compute` itself rebinds
//! the kernel's buffers, so concurrent calls on one instance are not safe;
//! distinct instances are independent.

pub mod attributes;
pub mod kernel;
pub mod prepack;
pub mod quant;

use std::sync::Arc;

use crate::backend::ConvBackend;
use crate::error::{DespacharError, Result};
use crate::tensor::{DType, Tensor, TensorData};

use self::attributes::{AutoPad, ConvAttributes};
use self::kernel::{build_kernel, KernelHandle};
use self::prepack::pack_weight_channels_last;
use self::quant::{classify, Precision, QuantInputs, QuantParams};

/// Input slot of the activation tensor (both signatures)
pub const IN_X: usize = 0;
/// Weight slot in the float signature
pub const IN_W_F32: usize = 1;
/// Bias slot in the float signature
pub const IN_BIAS_F32: usize = 2;
/// Input-scale slot in the quantized signature
pub const IN_X_SCALE: usize = 1;
/// Input zero-point slot in the quantized signature
pub const IN_X_ZERO_POINT: usize = 2;
/// Weight slot in the quantized signature
pub const IN_W: usize = 3;
/// Weight-scale slot in the quantized signature
pub const IN_W_SCALE: usize = 4;
/// Weight zero-point slot in the quantized signature
pub const IN_W_ZERO_POINT: usize = 5;
/// Output-scale slot in the quantized signature
pub const IN_Y_SCALE: usize = 6;
/// Output zero-point slot in the quantized signature
pub const IN_Y_ZERO_POINT: usize = 7;
/// Bias slot in the quantized signature
pub const IN_BIAS: usize = 8;

/// Indexed node inputs as handed over by the partitioning layer
///
/// Slots follow the operator signature: `[X, W, B]` for float nodes and
/// `[X, x_scale, x_zp, W, w_scale, w_zp, y_scale, y_zp, B]` for quantized
/// nodes. Missing trailing slots (an absent bias) simply aren't set.
#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    slots: Vec<Option<Tensor>>,
}

impl NodeInputs {
    /// Create an empty input set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a tensor in a slot, growing the slot list as needed
    #[must_use]
    pub fn with_input(mut self, index: usize, tensor: Tensor) -> Self {
        if self.slots.len() <= index {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(tensor);
        self
    }

    /// Tensor in a slot, if present
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Tensor> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Required constant-initializer lookup
    ///
    /// # Errors
    ///
    /// Returns `PreconditionViolation` if the slot is empty or holds a
    /// non-constant tensor; only nodes with constant parameters may reach
    /// this engine.
    pub fn constant(&self, index: usize, name: &str) -> Result<&Tensor> {
        match self.get(index) {
            Some(tensor) if tensor.is_constant() => Ok(tensor),
            Some(_) => Err(DespacharError::PreconditionViolation {
                input: name.to_string(),
                reason:
                    "not a constant initializer; the partitioning layer should not have claimed this node"
                        .to_string(),
            }),
            None => Err(DespacharError::PreconditionViolation {
                input: name.to_string(),
                reason: "required input is missing".to_string(),
            }),
        }
    }

    /// Optional constant-initializer lookup (bias)
    ///
    /// # Errors
    ///
    /// Returns `PreconditionViolation` if the slot is occupied by a
    /// non-constant tensor. An empty slot is `Ok(None)`.
    pub fn constant_opt(&self, index: usize, name: &str) -> Result<Option<&Tensor>> {
        match self.get(index) {
            None => Ok(None),
            Some(_) => self.constant(index, name).map(Some),
        }
    }
}

/// Two-phase kernel lifecycle
///
/// The handle is listed before the packed weight so it is released first.
#[derive(Debug)]
enum KernelState {
    /// Weight not offered yet; execution is a precondition error
    Unbuilt,
    /// Prepack happened and the kernel exists
    Ready {
        handle: KernelHandle,
        packed_weight: Arc<Tensor>,
    },
}

/// 2-D NHWC convolution operator with multi-precision kernel dispatch
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use despachar::backend::ReferenceBackend;
/// use despachar::conv::attributes::ConvAttributes;
/// use despachar::conv::{Conv2d, NodeInputs, IN_W_F32};
/// use despachar::tensor::{DType, Tensor, TensorData};
///
/// let weight = Tensor::constant(vec![1, 1, 1, 1], TensorData::F32(vec![2.0])).unwrap();
/// let inputs = NodeInputs::new().with_input(IN_W_F32, weight.clone());
/// let mut conv = Conv2d::new(
///     ConvAttributes::default(),
///     &inputs,
///     DType::F32,
///     1,
///     Arc::new(ReferenceBackend::new()),
/// ).unwrap();
///
/// assert!(conv.prepack(IN_W_F32, &weight).unwrap());
/// let x = Tensor::new(vec![1, 1, 1, 1], TensorData::F32(vec![3.0])).unwrap();
/// let y = conv.compute(&x).unwrap();
/// assert_eq!(y.as_f32().unwrap(), &[6.0]);
/// ```
pub struct Conv2d {
    attrs: ConvAttributes,
    kernel_shape: [usize; 2],
    x_dtype: DType,
    precision: Precision,
    quant: Option<QuantParams>,
    channels_in: usize,
    channels_out: usize,
    bias: Option<Tensor>,
    state: KernelState,
    backend: Arc<dyn ConvBackend>,
}

impl std::fmt::Debug for Conv2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conv2d")
            .field("precision", &self.precision)
            .field("kernel_shape", &self.kernel_shape)
            .field("channels_in", &self.channels_in)
            .field("channels_out", &self.channels_out)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl Conv2d {
    /// Build the operator from a claimed node
    ///
    /// `x_dtype` and `input_channels` are static facts about the NHWC input;
    /// the partitioning layer guarantees the channel dim is known. The weight
    /// is read for its shape only — its data flows in later through
    /// [`Conv2d::prepack`].
    ///
    /// # Errors
    ///
    /// Returns `PreconditionViolation` for missing/non-constant inputs or a
    /// group count that doesn't divide the channel counts, `InvalidShape`
    /// for a malformed weight, and `DtypeMismatch` for a bias whose element
    /// type doesn't fit the numeric path.
    pub fn new(
        attrs: ConvAttributes,
        inputs: &NodeInputs,
        x_dtype: DType,
        input_channels: usize,
        backend: Arc<dyn ConvBackend>,
    ) -> Result<Self> {
        if attrs.auto_pad == AutoPad::SameLower {
            return Err(DespacharError::PreconditionViolation {
                input: "auto_pad".to_string(),
                reason: "SAME_LOWER nodes are not claimed by this engine".to_string(),
            });
        }

        let (weight_slot, bias_slot) = if x_dtype == DType::F32 {
            (IN_W_F32, IN_BIAS_F32)
        } else {
            (IN_W, IN_BIAS)
        };

        let weight = inputs.constant(weight_slot, "weight")?;
        let kernel_shape = attrs.resolve_kernel_shape(weight.shape())?;
        let channels_out = weight.shape()[0];
        attrs.validate_groups(input_channels, channels_out)?;
        if weight.shape()[1] * attrs.group != input_channels {
            return Err(DespacharError::InvalidShape {
                reason: format!(
                    "Weight channel dim {} doesn't match input channels {} with group {}",
                    weight.shape()[1],
                    input_channels,
                    attrs.group
                ),
            });
        }

        let (precision, quant) = if x_dtype == DType::F32 {
            (Precision::Fp32, None)
        } else {
            let quant_inputs = QuantInputs {
                x_scale: inputs.constant(IN_X_SCALE, "x_scale")?,
                x_zero_point: inputs.constant(IN_X_ZERO_POINT, "x_zero_point")?,
                w_scale: inputs.constant(IN_W_SCALE, "w_scale")?,
                w_zero_point: inputs.constant(IN_W_ZERO_POINT, "w_zero_point")?,
                y_scale: inputs.constant(IN_Y_SCALE, "y_scale")?,
                y_zero_point: inputs.constant(IN_Y_ZERO_POINT, "y_zero_point")?,
            };
            let (precision, quant) = classify(x_dtype, &quant_inputs)?;
            if precision == Precision::Qc8 {
                let scales = quant.w_scale.per_channel().map_or(0, <[f32]>::len);
                if scales != channels_out {
                    return Err(DespacharError::PreconditionViolation {
                        input: "w_scale".to_string(),
                        reason: format!(
                            "per-channel scale count {scales} doesn't match output channels {channels_out}"
                        ),
                    });
                }
            }
            (precision, Some(quant))
        };

        let bias = inputs.constant_opt(bias_slot, "bias")?.cloned();
        if let Some(b) = &bias {
            let expected = if x_dtype == DType::F32 {
                DType::F32
            } else {
                DType::I32
            };
            if b.dtype() != expected {
                return Err(DespacharError::DtypeMismatch {
                    expected,
                    actual: b.dtype(),
                });
            }
            if b.size() != channels_out {
                return Err(DespacharError::InvalidShape {
                    reason: format!(
                        "Bias has {} elements, expected one per output channel ({channels_out})",
                        b.size()
                    ),
                });
            }
        }

        Ok(Self {
            attrs,
            kernel_shape,
            x_dtype,
            precision,
            quant,
            channels_in: input_channels,
            channels_out,
            bias,
            state: KernelState::Unbuilt,
            backend,
        })
    }

    /// Classified numeric path of this operator
    #[must_use]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// True once the weight is packed and the kernel handle exists
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, KernelState::Ready { .. })
    }

    /// Output channel count (M)
    #[must_use]
    pub fn output_channels(&self) -> usize {
        self.channels_out
    }

    /// The owned channel-last weight, once prepack has run
    ///
    /// The kernel handle references this buffer for its whole lifetime; it
    /// is released together with the handle when the operator is dropped,
    /// handle first.
    #[must_use]
    pub fn packed_weight(&self) -> Option<&Tensor> {
        match &self.state {
            KernelState::Unbuilt => None,
            KernelState::Ready { packed_weight, .. } => Some(packed_weight),
        }
    }

    /// Offer a constant input for prepacking
    ///
    /// Only the weight slot is claimed; offers for other slots return
    /// `Ok(false)` and leave the tensor with the caller. Claiming transposes
    /// the weight into the channel-last layout and builds the kernel handle.
    /// A second offer for the weight slot is a no-op reporting `Ok(true)`;
    /// the handle is never rebuilt.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the offered weight contradicts the shape
    /// captured at construction, any error of the weight transform, and the
    /// kernel factory's `UnsupportedPrecision`/`KernelConstruction` errors.
    pub fn prepack(&mut self, input_index: usize, tensor: &Tensor) -> Result<bool> {
        let weight_slot = if self.x_dtype == DType::F32 {
            IN_W_F32
        } else {
            IN_W
        };
        if input_index != weight_slot {
            return Ok(false);
        }
        if self.is_ready() {
            return Ok(true);
        }

        let expected = [
            self.channels_out,
            self.channels_in / self.attrs.group,
            self.kernel_shape[0],
            self.kernel_shape[1],
        ];
        if tensor.shape() != expected {
            return Err(DespacharError::InvalidShape {
                reason: format!(
                    "Offered weight shape {:?} doesn't match the node's weight shape {expected:?}",
                    tensor.shape()
                ),
            });
        }

        let packed_weight = Arc::new(pack_weight_channels_last(tensor)?);
        let handle = build_kernel(
            &self.backend,
            &self.attrs,
            self.kernel_shape,
            self.channels_in,
            self.channels_out,
            &packed_weight,
            self.bias.as_ref(),
            self.precision,
            self.quant.as_ref(),
            self.x_dtype,
        )?;
        self.state = KernelState::Ready {
            handle,
            packed_weight,
        };
        Ok(true)
    }

    /// Run one inference through the kernel handle
    ///
    /// Infers the NHWC output shape, rebinds the live extents (they may
    /// change between calls even though the handle is fixed), and executes
    /// the kernel synchronously. A zero-element output returns immediately
    /// without touching the backend.
    ///
    /// # Errors
    ///
    /// Returns `PreconditionViolation` if called before prepack,
    /// `InvalidShape`/`DtypeMismatch` for a malformed input, and `Execution`
    /// wrapping the backend status if setup or run fails. Execution failures
    /// don't corrupt the operator; the caller may retry the call.
    pub fn compute(&self, input: &Tensor) -> Result<Tensor> {
        let KernelState::Ready { handle, .. } = &self.state else {
            return Err(DespacharError::PreconditionViolation {
                input: "weight".to_string(),
                reason: "compute called before the weight was prepacked".to_string(),
            });
        };

        if input.dtype() != self.x_dtype {
            return Err(DespacharError::DtypeMismatch {
                expected: self.x_dtype,
                actual: input.dtype(),
            });
        }
        if input.ndim() != 4 {
            return Err(DespacharError::InvalidShape {
                reason: format!("Input must be NHWC (4-D), got shape {:?}", input.shape()),
            });
        }
        if input.shape()[3] != self.channels_in {
            return Err(DespacharError::InvalidShape {
                reason: format!(
                    "Input has {} channels, the node was built for {}",
                    input.shape()[3],
                    self.channels_in
                ),
            });
        }

        let (batch, height, width) = (input.shape()[0], input.shape()[1], input.shape()[2]);
        let [out_height, out_width] = self
            .attrs
            .infer_output_dims(self.kernel_shape, [height, width])?;
        // NHWC throughout: batch first, spatial dims, output channels last.
        let output_shape = vec![batch, out_height, out_width, self.channels_out];
        let output_len = batch * out_height * out_width * self.channels_out;

        let mut output_data = match self.precision.activation_dtype() {
            Some(DType::F32) => TensorData::F32(vec![0.0; output_len]),
            Some(DType::I8) => TensorData::I8(vec![0; output_len]),
            Some(DType::U8) => TensorData::U8(vec![0; output_len]),
            Some(DType::I32) | None => {
                return Err(DespacharError::UnsupportedPrecision {
                    dtype: self.x_dtype,
                })
            }
        };

        if output_len == 0 {
            return Tensor::new(output_shape, output_data);
        }

        let status = self
            .backend
            .setup_conv2d(handle.id(), batch, height, width);
        if status != crate::backend::BackendStatus::Success {
            return Err(DespacharError::Execution {
                stage: "setup",
                status,
            });
        }

        let status = self
            .backend
            .run_conv2d(handle.id(), input.data(), &mut output_data);
        if status != crate::backend::BackendStatus::Success {
            return Err(DespacharError::Execution {
                stage: "run",
                status,
            });
        }

        Tensor::new(output_shape, output_data)
    }
}
