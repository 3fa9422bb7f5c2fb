//! Backend numeric-library boundary
//!
//! The dispatch engine never computes a convolution itself; it builds kernels
//! through this seam and feeds buffers through them. The boundary mirrors a
//! native NHWC kernel library: one creation entry point per numeric path,
//! matching setup/run entry points, and a small status enumeration with a
//! single success value. The engine compares statuses against
//! [`BackendStatus::Success`] and otherwise carries them opaquely in errors.
//!
//! [`ConvBackend`] is object-safe so operators hold `Arc<dyn ConvBackend>`;
//! tests substitute counting stubs through the same seam.

pub mod reference;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tensor::{Tensor, TensorData};

pub use reference::ReferenceBackend;

/// Status codes reported by a kernel backend
///
/// Exactly one value denotes success; callers must not interpret the others
/// beyond attaching them to errors for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendStatus {
    /// The call completed
    Success,
    /// A parameter was rejected (shape, scale count, clamp ordering, ...)
    InvalidParameter,
    /// The configuration is valid but not supported by this backend
    UnsupportedConfiguration,
    /// A backend-internal allocation failed
    OutOfMemory,
    /// The kernel is unknown, released, or not yet set up
    InvalidState,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendStatus::Success => "success",
            BackendStatus::InvalidParameter => "invalid_parameter",
            BackendStatus::UnsupportedConfiguration => "unsupported_configuration",
            BackendStatus::OutOfMemory => "out_of_memory",
            BackendStatus::InvalidState => "invalid_state",
        };
        write!(f, "{name}")
    }
}

/// Opaque identifier of a backend kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(u64);

impl KernelId {
    /// Wrap a raw backend identifier
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Geometry shared by every conv2d kernel variant
///
/// Channel counts are split per group; the channel *strides* are the full
/// input/output channel counts, which lets one construction path cover both
/// depthwise (`groups == channels`) and standard (`groups == 1`) convolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Explicit input padding: top, left, bottom, right
    pub padding: [usize; 4],
    /// Kernel spatial extent: height, width
    pub kernel: [usize; 2],
    /// Stride per spatial axis
    pub stride: [usize; 2],
    /// Dilation per spatial axis
    pub dilation: [usize; 2],
    /// Number of convolution groups
    pub groups: usize,
    /// Input channels per group
    pub group_channels_in: usize,
    /// Output channels per group
    pub group_channels_out: usize,
    /// Distance between pixels in the input, in elements (total input channels)
    pub input_channel_stride: usize,
    /// Distance between pixels in the output, in elements (total output channels)
    pub output_channel_stride: usize,
    /// TensorFlow-style SAME padding: ignore `padding` and derive pads from
    /// the live input extents at setup time, extra padding at bottom/right
    pub same_upper_padding: bool,
}

/// Parameters for the full-precision float path
#[derive(Debug, Clone)]
pub struct F32ConvParams {
    /// Shared conv geometry
    pub geometry: ConvGeometry,
    /// Packed weight in `{M, kH, kW, C/g}` layout, `f32`
    pub weights: Arc<Tensor>,
    /// Optional per-output-channel bias
    pub bias: Option<Vec<f32>>,
    /// Lower output clamp
    pub output_min: f32,
    /// Upper output clamp
    pub output_max: f32,
}

/// Parameters for the per-tensor signed 8-bit path
#[derive(Debug, Clone)]
pub struct Qs8ConvParams {
    /// Shared conv geometry
    pub geometry: ConvGeometry,
    /// Packed weight in `{M, kH, kW, C/g}` layout, `i8`
    pub weights: Arc<Tensor>,
    /// Optional per-output-channel bias, 32-bit accumulator domain
    pub bias: Option<Vec<i32>>,
    /// Input zero point
    pub x_zero_point: i8,
    /// Input scale
    pub x_scale: f32,
    /// Weight scale (single value for the whole tensor)
    pub w_scale: f32,
    /// Output zero point
    pub y_zero_point: i8,
    /// Output scale
    pub y_scale: f32,
    /// Lower output clamp
    pub output_min: i8,
    /// Upper output clamp
    pub output_max: i8,
}

/// Parameters for the per-channel signed 8-bit path
#[derive(Debug, Clone)]
pub struct Qc8ConvParams {
    /// Shared conv geometry
    pub geometry: ConvGeometry,
    /// Packed weight in `{M, kH, kW, C/g}` layout, `i8`
    pub weights: Arc<Tensor>,
    /// Optional per-output-channel bias, 32-bit accumulator domain
    pub bias: Option<Vec<i32>>,
    /// Input zero point
    pub x_zero_point: i8,
    /// Input scale
    pub x_scale: f32,
    /// Weight scales, one per output channel
    pub w_scales: Vec<f32>,
    /// Output zero point
    pub y_zero_point: i8,
    /// Output scale
    pub y_scale: f32,
    /// Lower output clamp
    pub output_min: i8,
    /// Upper output clamp
    pub output_max: i8,
}

/// Parameters for the per-tensor unsigned 8-bit path
///
/// Unlike the signed paths, the weight carries its own zero point.
#[derive(Debug, Clone)]
pub struct Qu8ConvParams {
    /// Shared conv geometry
    pub geometry: ConvGeometry,
    /// Packed weight in `{M, kH, kW, C/g}` layout, `u8`
    pub weights: Arc<Tensor>,
    /// Optional per-output-channel bias, 32-bit accumulator domain
    pub bias: Option<Vec<i32>>,
    /// Input zero point
    pub x_zero_point: u8,
    /// Input scale
    pub x_scale: f32,
    /// Weight zero point
    pub w_zero_point: u8,
    /// Weight scale (single value for the whole tensor)
    pub w_scale: f32,
    /// Output zero point
    pub y_zero_point: u8,
    /// Output scale
    pub y_scale: f32,
    /// Lower output clamp
    pub output_min: u8,
    /// Upper output clamp
    pub output_max: u8,
}

/// NHWC convolution kernel backend
///
/// Creation consumes the parameter struct; the backend owns everything it
/// needs for the kernel's lifetime. `setup_conv2d` binds the batch and
/// spatial extents for the next run and must be repeated whenever they
/// change; `run_conv2d` executes synchronously against the supplied buffers.
/// `release_conv2d` must be called exactly once per created kernel;
/// operations on a released id report [`BackendStatus::InvalidState`].
pub trait ConvBackend: Send + Sync {
    /// Create a full-precision float conv2d kernel
    ///
    /// # Errors
    ///
    /// Returns the backend status code on rejection.
    fn create_conv2d_f32(&self, params: F32ConvParams) -> Result<KernelId, BackendStatus>;

    /// Create a per-tensor signed 8-bit conv2d kernel
    ///
    /// # Errors
    ///
    /// Returns the backend status code on rejection.
    fn create_conv2d_qs8(&self, params: Qs8ConvParams) -> Result<KernelId, BackendStatus>;

    /// Create a per-channel signed 8-bit conv2d kernel
    ///
    /// # Errors
    ///
    /// Returns the backend status code on rejection.
    fn create_conv2d_qc8(&self, params: Qc8ConvParams) -> Result<KernelId, BackendStatus>;

    /// Create a per-tensor unsigned 8-bit conv2d kernel
    ///
    /// # Errors
    ///
    /// Returns the backend status code on rejection.
    fn create_conv2d_qu8(&self, params: Qu8ConvParams) -> Result<KernelId, BackendStatus>;

    /// Bind batch and spatial extents for the next run
    fn setup_conv2d(&self, kernel: KernelId, batch: usize, height: usize, width: usize)
        -> BackendStatus;

    /// Execute the kernel once, synchronously
    fn run_conv2d(
        &self,
        kernel: KernelId,
        input: &TensorData,
        output: &mut TensorData,
    ) -> BackendStatus;

    /// Release the kernel's backend resources
    fn release_conv2d(&self, kernel: KernelId);
}
