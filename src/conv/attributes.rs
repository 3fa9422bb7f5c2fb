//! Convolution attributes and shape inference
//!
//! `ConvAttributes` is the immutable logical description of a convolution
//! node: kernel extent, padding, strides, dilations, group count, and an
//! optional fused-activation clamp. Missing attributes resolve to the
//! conventional defaults (zero pads, unit strides and dilations); an omitted
//! kernel shape is taken from the weight's spatial dims.
//!
//! Output shape inference lives here because both the execution dispatcher
//! and the tests need it, and it must not depend on any backend state.

use serde::{Deserialize, Serialize};

use crate::error::{DespacharError, Result};

/// Auto-padding mode of the node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoPad {
    /// Explicit pads are used as given
    #[default]
    NotSet,
    /// TensorFlow-style SAME with the larger half of the padding at
    /// bottom/right; output extent is `ceil(input / stride)`
    SameUpper,
    /// SAME with the larger half at top/left; not claimed by this engine
    SameLower,
    /// No padding regardless of the pads attribute
    Valid,
}

/// Logical convolution description, immutable after construction
///
/// # Examples
///
/// ```
/// use despachar::conv::attributes::ConvAttributes;
///
/// let attrs = ConvAttributes::default()
///     .with_kernel_shape([3, 3])
///     .with_strides([2, 2])
///     .with_group(1);
/// assert_eq!(attrs.strides, [2, 2]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvAttributes {
    /// Auto-padding mode
    pub auto_pad: AutoPad,
    /// Kernel spatial extent; `None` means "take it from the weight"
    pub kernel_shape: Option<[usize; 2]>,
    /// Explicit input padding: top, left, bottom, right
    pub pads: [usize; 4],
    /// Stride per spatial axis
    pub strides: [usize; 2],
    /// Dilation per spatial axis
    pub dilations: [usize; 2],
    /// Number of convolution groups
    pub group: usize,
    /// Output clamp fused from a downstream Clip/Relu, if any
    pub clip_min_max: Option<(f32, f32)>,
    /// Name of the fused activation, if any
    pub activation: Option<String>,
}

impl Default for ConvAttributes {
    fn default() -> Self {
        Self {
            auto_pad: AutoPad::NotSet,
            kernel_shape: None,
            pads: [0; 4],
            strides: [1, 1],
            dilations: [1, 1],
            group: 1,
            clip_min_max: None,
            activation: None,
        }
    }
}

impl ConvAttributes {
    /// Set the kernel spatial extent
    #[must_use]
    pub fn with_kernel_shape(mut self, kernel_shape: [usize; 2]) -> Self {
        self.kernel_shape = Some(kernel_shape);
        self
    }

    /// Set explicit pads (top, left, bottom, right)
    #[must_use]
    pub fn with_pads(mut self, pads: [usize; 4]) -> Self {
        self.pads = pads;
        self
    }

    /// Set strides
    #[must_use]
    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.strides = strides;
        self
    }

    /// Set dilations
    #[must_use]
    pub fn with_dilations(mut self, dilations: [usize; 2]) -> Self {
        self.dilations = dilations;
        self
    }

    /// Set the group count
    #[must_use]
    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    /// Set the auto-padding mode
    #[must_use]
    pub fn with_auto_pad(mut self, auto_pad: AutoPad) -> Self {
        self.auto_pad = auto_pad;
        self
    }

    /// Attach a fused activation clamp
    #[must_use]
    pub fn with_clip(mut self, min: f32, max: f32) -> Self {
        self.clip_min_max = Some((min, max));
        self
    }

    /// Attach a fused activation tag
    #[must_use]
    pub fn with_activation(mut self, activation: impl Into<String>) -> Self {
        self.activation = Some(activation.into());
        self
    }

    /// Resolve the kernel spatial extent against the weight shape
    ///
    /// The weight is still in the `{M, C/g, kH, kW}` layout at this point
    /// (resolution happens before prepack). An explicit kernel shape must
    /// match the weight's spatial dims.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` on a non-4D weight or a mismatched explicit
    /// kernel shape, or if any kernel extent is zero.
    pub fn resolve_kernel_shape(&self, weight_shape: &[usize]) -> Result<[usize; 2]> {
        if weight_shape.len() != 4 {
            return Err(DespacharError::InvalidShape {
                reason: format!("Weight must be 4-D, got shape {weight_shape:?}"),
            });
        }
        let from_weight = [weight_shape[2], weight_shape[3]];
        let kernel_shape = match self.kernel_shape {
            Some(explicit) => {
                if explicit != from_weight {
                    return Err(DespacharError::InvalidShape {
                        reason: format!(
                            "kernel_shape attribute {explicit:?} doesn't match weight spatial dims {from_weight:?}"
                        ),
                    });
                }
                explicit
            }
            None => from_weight,
        };
        if kernel_shape.contains(&0) {
            return Err(DespacharError::InvalidShape {
                reason: "Kernel extents must be non-zero".to_string(),
            });
        }
        Ok(kernel_shape)
    }

    /// Check that the group count divides both channel counts evenly
    ///
    /// # Errors
    ///
    /// Returns `PreconditionViolation` if `group` is zero or doesn't divide
    /// `channels_in` / `channels_out`.
    pub fn validate_groups(&self, channels_in: usize, channels_out: usize) -> Result<()> {
        if self.group == 0 {
            return Err(DespacharError::PreconditionViolation {
                input: "group".to_string(),
                reason: "group count must be at least 1".to_string(),
            });
        }
        if channels_in % self.group != 0 || channels_out % self.group != 0 {
            return Err(DespacharError::PreconditionViolation {
                input: "group".to_string(),
                reason: format!(
                    "group count {} must divide input channels {} and output channels {}",
                    self.group, channels_in, channels_out
                ),
            });
        }
        Ok(())
    }

    /// Infer the output spatial extents for the given input extents
    ///
    /// Pure function of the attributes, so repeated calls with the same input
    /// always agree. A zero input extent yields a zero output extent; the
    /// dispatcher turns any zero-element output into an early return.
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the dilated kernel window doesn't fit the
    /// padded input.
    pub fn infer_output_dims(
        &self,
        kernel_shape: [usize; 2],
        input_hw: [usize; 2],
    ) -> Result<[usize; 2]> {
        let height = self.infer_axis(input_hw[0], kernel_shape[0], self.strides[0], self.dilations[0], self.pads[0], self.pads[2])?;
        let width = self.infer_axis(input_hw[1], kernel_shape[1], self.strides[1], self.dilations[1], self.pads[1], self.pads[3])?;
        Ok([height, width])
    }

    fn infer_axis(
        &self,
        extent: usize,
        kernel: usize,
        stride: usize,
        dilation: usize,
        pad_begin: usize,
        pad_end: usize,
    ) -> Result<usize> {
        if extent == 0 {
            return Ok(0);
        }
        match self.auto_pad {
            AutoPad::SameUpper | AutoPad::SameLower => Ok(extent.div_ceil(stride)),
            AutoPad::NotSet | AutoPad::Valid => {
                let (pad_begin, pad_end) = if self.auto_pad == AutoPad::Valid {
                    (0, 0)
                } else {
                    (pad_begin, pad_end)
                };
                let effective_kernel = dilation * (kernel - 1) + 1;
                let padded = extent + pad_begin + pad_end;
                if padded < effective_kernel {
                    return Err(DespacharError::InvalidShape {
                        reason: format!(
                            "Dilated kernel extent {effective_kernel} exceeds padded input extent {padded}"
                        ),
                    });
                }
                Ok((padded - effective_kernel) / stride + 1)
            }
        }
    }
}
