//! Reference CPU implementation of the conv2d backend
//!
//! A validating, pure-Rust backend behind the [`ConvBackend`] seam. Kernels
//! live in a registry keyed by id; creation validates the configuration the
//! way a native library would (rejecting with a status code, not an error
//! type), setup binds extents and derives the output geometry, and run walks
//! the NHWC input directly.
//!
//! The arithmetic is scalar and unoptimized on purpose: this backend is the
//! semantic oracle the dispatch engine is tested against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::tensor::{DType, TensorData};

use super::{
    BackendStatus, ConvBackend, ConvGeometry, F32ConvParams, KernelId, Qc8ConvParams,
    Qs8ConvParams, Qu8ConvParams,
};

/// Bound extents plus the output geometry derived from them at setup time
#[derive(Debug, Clone, Copy)]
struct Bound {
    batch: usize,
    height: usize,
    width: usize,
    out_height: usize,
    out_width: usize,
    pads: [usize; 4],
}

/// One kernel per numeric path; the variant fixes which buffers are valid
#[derive(Debug, Clone)]
enum KernelParams {
    F32(F32ConvParams),
    Qs8(Qs8ConvParams),
    Qc8(Qc8ConvParams),
    Qu8(Qu8ConvParams),
}

impl KernelParams {
    fn geometry(&self) -> &ConvGeometry {
        match self {
            KernelParams::F32(p) => &p.geometry,
            KernelParams::Qs8(p) => &p.geometry,
            KernelParams::Qc8(p) => &p.geometry,
            KernelParams::Qu8(p) => &p.geometry,
        }
    }

    fn activation_dtype(&self) -> DType {
        match self {
            KernelParams::F32(_) => DType::F32,
            KernelParams::Qs8(_) | KernelParams::Qc8(_) => DType::I8,
            KernelParams::Qu8(_) => DType::U8,
        }
    }
}

#[derive(Debug, Clone)]
struct KernelRecord {
    params: KernelParams,
    bound: Option<Bound>,
}

/// Validating scalar CPU backend
///
/// # Examples
///
/// ```
/// use despachar::backend::{ConvBackend, ReferenceBackend};
///
/// let backend = ReferenceBackend::new();
/// assert_eq!(backend.kernel_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct ReferenceBackend {
    kernels: Mutex<HashMap<u64, KernelRecord>>,
    next_id: AtomicU64,
}

impl ReferenceBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (created, not yet released) kernels
    ///
    /// # Panics
    ///
    /// Panics if the internal registry lock is poisoned.
    #[must_use]
    pub fn kernel_count(&self) -> usize {
        self.kernels.lock().expect("kernel registry poisoned").len()
    }

    fn register(&self, params: KernelParams) -> KernelId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.kernels
            .lock()
            .expect("kernel registry poisoned")
            .insert(id, KernelRecord {
                params,
                bound: None,
            });
        KernelId::new(id)
    }

    fn record(&self, kernel: KernelId) -> Option<KernelRecord> {
        self.kernels
            .lock()
            .expect("kernel registry poisoned")
            .get(&kernel.raw())
            .cloned()
    }
}

fn scale_ok(scale: f32) -> bool {
    scale.is_finite() && scale > 0.0
}

/// Shared geometry/weight validation for all four creation paths
fn validate_geometry(
    geometry: &ConvGeometry,
    weights: &crate::tensor::Tensor,
    weight_dtype: DType,
    bias_len: Option<usize>,
) -> Option<BackendStatus> {
    let g = geometry;
    if g.groups == 0 || g.group_channels_in == 0 || g.group_channels_out == 0 {
        return Some(BackendStatus::InvalidParameter);
    }
    if g.kernel.contains(&0) || g.stride.contains(&0) || g.dilation.contains(&0) {
        return Some(BackendStatus::InvalidParameter);
    }
    if g.input_channel_stride != g.groups * g.group_channels_in
        || g.output_channel_stride != g.groups * g.group_channels_out
    {
        return Some(BackendStatus::InvalidParameter);
    }

    let out_channels = g.groups * g.group_channels_out;
    if weights.dtype() != weight_dtype {
        return Some(BackendStatus::InvalidParameter);
    }
    if weights.shape() != [out_channels, g.kernel[0], g.kernel[1], g.group_channels_in] {
        return Some(BackendStatus::InvalidParameter);
    }
    if let Some(len) = bias_len {
        if len != out_channels {
            return Some(BackendStatus::InvalidParameter);
        }
    }
    None
}

/// SAME padding with the larger half at the end of the axis
fn same_upper_axis_pads(extent: usize, kernel: usize, stride: usize, dilation: usize) -> (usize, usize) {
    if extent == 0 {
        return (0, 0);
    }
    let effective_kernel = dilation * (kernel - 1) + 1;
    let out = extent.div_ceil(stride);
    let total = ((out - 1) * stride + effective_kernel).saturating_sub(extent);
    let begin = total / 2;
    (begin, total - begin)
}

fn output_extent(
    extent: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_begin: usize,
    pad_end: usize,
    same: bool,
) -> Option<usize> {
    if extent == 0 {
        return Some(0);
    }
    if same {
        return Some(extent.div_ceil(stride));
    }
    let effective_kernel = dilation * (kernel - 1) + 1;
    let padded = extent + pad_begin + pad_end;
    if padded < effective_kernel {
        return None;
    }
    Some((padded - effective_kernel) / stride + 1)
}

/// Derive pads and output extents for the bound input extents
fn bind(geometry: &ConvGeometry, batch: usize, height: usize, width: usize) -> Option<Bound> {
    let pads = if geometry.same_upper_padding {
        let (top, bottom) =
            same_upper_axis_pads(height, geometry.kernel[0], geometry.stride[0], geometry.dilation[0]);
        let (left, right) =
            same_upper_axis_pads(width, geometry.kernel[1], geometry.stride[1], geometry.dilation[1]);
        [top, left, bottom, right]
    } else {
        geometry.padding
    };

    let out_height = output_extent(
        height,
        geometry.kernel[0],
        geometry.stride[0],
        geometry.dilation[0],
        pads[0],
        pads[2],
        geometry.same_upper_padding,
    )?;
    let out_width = output_extent(
        width,
        geometry.kernel[1],
        geometry.stride[1],
        geometry.dilation[1],
        pads[1],
        pads[3],
        geometry.same_upper_padding,
    )?;

    Some(Bound {
        batch,
        height,
        width,
        out_height,
        out_width,
        pads,
    })
}

fn conv_loop_f32(p: &F32ConvParams, b: &Bound, x: &[f32], w: &[f32], y: &mut [f32]) {
    let g = &p.geometry;
    let out_channels = g.output_channel_stride;
    for n in 0..b.batch {
        for oh in 0..b.out_height {
            for ow in 0..b.out_width {
                let out_px = ((n * b.out_height + oh) * b.out_width + ow) * out_channels;
                for oc in 0..out_channels {
                    let group = oc / g.group_channels_out;
                    let ic_base = group * g.group_channels_in;
                    let mut acc = p.bias.as_ref().map_or(0.0, |bias| bias[oc]);
                    for kh in 0..g.kernel[0] {
                        let ih = (oh * g.stride[0] + kh * g.dilation[0]) as isize
                            - b.pads[0] as isize;
                        if ih < 0 || ih >= b.height as isize {
                            continue;
                        }
                        for kw in 0..g.kernel[1] {
                            let iw = (ow * g.stride[1] + kw * g.dilation[1]) as isize
                                - b.pads[1] as isize;
                            if iw < 0 || iw >= b.width as isize {
                                continue;
                            }
                            let in_px = ((n * b.height + ih as usize) * b.width + iw as usize)
                                * g.input_channel_stride;
                            let w_px =
                                ((oc * g.kernel[0] + kh) * g.kernel[1] + kw) * g.group_channels_in;
                            for ic in 0..g.group_channels_in {
                                acc += x[in_px + ic_base + ic] * w[w_px + ic];
                            }
                        }
                    }
                    y[out_px + oc] = acc.clamp(p.output_min, p.output_max);
                }
            }
        }
    }
}

/// Integer accumulation shared by the three quantized paths
///
/// `multipliers` carries one requantization factor per output channel
/// (`x_scale * w_scale[oc] / y_scale`); the per-tensor paths broadcast a
/// single value. `w_zero_point` is zero on the signed paths.
#[allow(clippy::too_many_arguments)]
fn conv_loop_quantized(
    g: &ConvGeometry,
    b: &Bound,
    x: &[i32],
    w: &[i32],
    bias: Option<&[i32]>,
    x_zero_point: i32,
    w_zero_point: i32,
    multipliers: &[f32],
    y_zero_point: i32,
    out_min: i32,
    out_max: i32,
    mut emit: impl FnMut(usize, i32),
) {
    let out_channels = g.output_channel_stride;
    for n in 0..b.batch {
        for oh in 0..b.out_height {
            for ow in 0..b.out_width {
                let out_px = ((n * b.out_height + oh) * b.out_width + ow) * out_channels;
                for oc in 0..out_channels {
                    let group = oc / g.group_channels_out;
                    let ic_base = group * g.group_channels_in;
                    let mut acc: i32 = bias.map_or(0, |bias| bias[oc]);
                    for kh in 0..g.kernel[0] {
                        let ih = (oh * g.stride[0] + kh * g.dilation[0]) as isize
                            - b.pads[0] as isize;
                        if ih < 0 || ih >= b.height as isize {
                            continue;
                        }
                        for kw in 0..g.kernel[1] {
                            let iw = (ow * g.stride[1] + kw * g.dilation[1]) as isize
                                - b.pads[1] as isize;
                            if iw < 0 || iw >= b.width as isize {
                                continue;
                            }
                            let in_px = ((n * b.height + ih as usize) * b.width + iw as usize)
                                * g.input_channel_stride;
                            let w_px =
                                ((oc * g.kernel[0] + kh) * g.kernel[1] + kw) * g.group_channels_in;
                            for ic in 0..g.group_channels_in {
                                acc += (x[in_px + ic_base + ic] - x_zero_point)
                                    * (w[w_px + ic] - w_zero_point);
                            }
                        }
                    }
                    let requantized =
                        (acc as f32 * multipliers[oc]).round() as i32 + y_zero_point;
                    emit(out_px + oc, requantized.clamp(out_min, out_max));
                }
            }
        }
    }
}

impl ConvBackend for ReferenceBackend {
    fn create_conv2d_f32(&self, params: F32ConvParams) -> Result<KernelId, BackendStatus> {
        if let Some(status) = validate_geometry(
            &params.geometry,
            &params.weights,
            DType::F32,
            params.bias.as_ref().map(Vec::len),
        ) {
            return Err(status);
        }
        if params.output_min.is_nan()
            || params.output_max.is_nan()
            || params.output_min > params.output_max
        {
            return Err(BackendStatus::InvalidParameter);
        }
        Ok(self.register(KernelParams::F32(params)))
    }

    fn create_conv2d_qs8(&self, params: Qs8ConvParams) -> Result<KernelId, BackendStatus> {
        if let Some(status) = validate_geometry(
            &params.geometry,
            &params.weights,
            DType::I8,
            params.bias.as_ref().map(Vec::len),
        ) {
            return Err(status);
        }
        if params.output_min > params.output_max
            || !scale_ok(params.x_scale)
            || !scale_ok(params.w_scale)
            || !scale_ok(params.y_scale)
        {
            return Err(BackendStatus::InvalidParameter);
        }
        Ok(self.register(KernelParams::Qs8(params)))
    }

    fn create_conv2d_qc8(&self, params: Qc8ConvParams) -> Result<KernelId, BackendStatus> {
        if let Some(status) = validate_geometry(
            &params.geometry,
            &params.weights,
            DType::I8,
            params.bias.as_ref().map(Vec::len),
        ) {
            return Err(status);
        }
        let out_channels = params.geometry.groups * params.geometry.group_channels_out;
        if params.w_scales.len() != out_channels {
            return Err(BackendStatus::InvalidParameter);
        }
        if params.output_min > params.output_max
            || !scale_ok(params.x_scale)
            || !scale_ok(params.y_scale)
            || !params.w_scales.iter().copied().all(scale_ok)
        {
            return Err(BackendStatus::InvalidParameter);
        }
        Ok(self.register(KernelParams::Qc8(params)))
    }

    fn create_conv2d_qu8(&self, params: Qu8ConvParams) -> Result<KernelId, BackendStatus> {
        if let Some(status) = validate_geometry(
            &params.geometry,
            &params.weights,
            DType::U8,
            params.bias.as_ref().map(Vec::len),
        ) {
            return Err(status);
        }
        if params.output_min > params.output_max
            || !scale_ok(params.x_scale)
            || !scale_ok(params.w_scale)
            || !scale_ok(params.y_scale)
        {
            return Err(BackendStatus::InvalidParameter);
        }
        Ok(self.register(KernelParams::Qu8(params)))
    }

    fn setup_conv2d(
        &self,
        kernel: KernelId,
        batch: usize,
        height: usize,
        width: usize,
    ) -> BackendStatus {
        let mut kernels = self.kernels.lock().expect("kernel registry poisoned");
        let Some(record) = kernels.get_mut(&kernel.raw()) else {
            return BackendStatus::InvalidState;
        };
        let Some(bound) = bind(record.params.geometry(), batch, height, width) else {
            return BackendStatus::InvalidParameter;
        };
        record.bound = Some(bound);
        BackendStatus::Success
    }

    fn run_conv2d(
        &self,
        kernel: KernelId,
        input: &TensorData,
        output: &mut TensorData,
    ) -> BackendStatus {
        let Some(record) = self.record(kernel) else {
            return BackendStatus::InvalidState;
        };
        let Some(bound) = record.bound else {
            return BackendStatus::InvalidState;
        };

        let g = record.params.geometry();
        if input.dtype() != record.params.activation_dtype()
            || output.dtype() != record.params.activation_dtype()
        {
            return BackendStatus::InvalidParameter;
        }
        let expected_in = bound.batch * bound.height * bound.width * g.input_channel_stride;
        let expected_out =
            bound.batch * bound.out_height * bound.out_width * g.output_channel_stride;
        if input.len() != expected_in || output.len() != expected_out {
            return BackendStatus::InvalidParameter;
        }
        if expected_out == 0 {
            return BackendStatus::Success;
        }

        match (&record.params, input, output) {
            (KernelParams::F32(p), TensorData::F32(x), TensorData::F32(y)) => {
                let Ok(w) = p.weights.as_f32() else {
                    return BackendStatus::InvalidState;
                };
                conv_loop_f32(p, &bound, x, w, y);
                BackendStatus::Success
            }
            (KernelParams::Qs8(p), TensorData::I8(x), TensorData::I8(y)) => {
                let Ok(w) = p.weights.as_i8() else {
                    return BackendStatus::InvalidState;
                };
                let x: Vec<i32> = x.iter().copied().map(i32::from).collect();
                let w: Vec<i32> = w.iter().copied().map(i32::from).collect();
                let out_channels = p.geometry.output_channel_stride;
                let multipliers =
                    vec![p.x_scale * p.w_scale / p.y_scale; out_channels];
                conv_loop_quantized(
                    &p.geometry,
                    &bound,
                    &x,
                    &w,
                    p.bias.as_deref(),
                    i32::from(p.x_zero_point),
                    0,
                    &multipliers,
                    i32::from(p.y_zero_point),
                    i32::from(p.output_min),
                    i32::from(p.output_max),
                    |idx, value| y[idx] = value as i8,
                );
                BackendStatus::Success
            }
            (KernelParams::Qc8(p), TensorData::I8(x), TensorData::I8(y)) => {
                let Ok(w) = p.weights.as_i8() else {
                    return BackendStatus::InvalidState;
                };
                let x: Vec<i32> = x.iter().copied().map(i32::from).collect();
                let w: Vec<i32> = w.iter().copied().map(i32::from).collect();
                let multipliers: Vec<f32> = p
                    .w_scales
                    .iter()
                    .map(|w_scale| p.x_scale * w_scale / p.y_scale)
                    .collect();
                conv_loop_quantized(
                    &p.geometry,
                    &bound,
                    &x,
                    &w,
                    p.bias.as_deref(),
                    i32::from(p.x_zero_point),
                    0,
                    &multipliers,
                    i32::from(p.y_zero_point),
                    i32::from(p.output_min),
                    i32::from(p.output_max),
                    |idx, value| y[idx] = value as i8,
                );
                BackendStatus::Success
            }
            (KernelParams::Qu8(p), TensorData::U8(x), TensorData::U8(y)) => {
                let Ok(w) = p.weights.as_u8() else {
                    return BackendStatus::InvalidState;
                };
                let x: Vec<i32> = x.iter().copied().map(i32::from).collect();
                let w: Vec<i32> = w.iter().copied().map(i32::from).collect();
                let out_channels = p.geometry.output_channel_stride;
                let multipliers =
                    vec![p.x_scale * p.w_scale / p.y_scale; out_channels];
                conv_loop_quantized(
                    &p.geometry,
                    &bound,
                    &x,
                    &w,
                    p.bias.as_deref(),
                    i32::from(p.x_zero_point),
                    i32::from(p.w_zero_point),
                    &multipliers,
                    i32::from(p.y_zero_point),
                    i32::from(p.output_min),
                    i32::from(p.output_max),
                    |idx, value| y[idx] = value as u8,
                );
                BackendStatus::Success
            }
            _ => BackendStatus::InvalidParameter,
        }
    }

    fn release_conv2d(&self, kernel: KernelId) {
        self.kernels
            .lock()
            .expect("kernel registry poisoned")
            .remove(&kernel.raw());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tensor::Tensor;

    fn unit_geometry(channels: usize, kernel: [usize; 2]) -> ConvGeometry {
        ConvGeometry {
            padding: [0; 4],
            kernel,
            stride: [1, 1],
            dilation: [1, 1],
            groups: 1,
            group_channels_in: channels,
            group_channels_out: channels,
            input_channel_stride: channels,
            output_channel_stride: channels,
            same_upper_padding: false,
        }
    }

    fn identity_1x1_f32(channels: usize) -> F32ConvParams {
        // 1x1 kernel whose weight matrix is the identity over channels
        let mut w = vec![0.0f32; channels * channels];
        for c in 0..channels {
            w[c * channels + c] = 1.0;
        }
        F32ConvParams {
            geometry: unit_geometry(channels, [1, 1]),
            weights: Arc::new(
                Tensor::constant(vec![channels, 1, 1, channels], TensorData::F32(w)).expect("test"),
            ),
            bias: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        }
    }

    #[test]
    fn test_f32_identity_conv() {
        let backend = ReferenceBackend::new();
        let id = backend.create_conv2d_f32(identity_1x1_f32(2)).expect("test");

        assert_eq!(backend.setup_conv2d(id, 1, 2, 2), BackendStatus::Success);

        let input = TensorData::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let mut output = TensorData::F32(vec![0.0; 8]);
        assert_eq!(
            backend.run_conv2d(id, &input, &mut output),
            BackendStatus::Success
        );
        assert_eq!(output, input);
    }

    #[test]
    fn test_f32_bias_and_clamp() {
        let backend = ReferenceBackend::new();
        let mut params = identity_1x1_f32(1);
        params.bias = Some(vec![10.0]);
        params.output_max = 10.5;
        let id = backend.create_conv2d_f32(params).expect("test");

        backend.setup_conv2d(id, 1, 1, 2);
        let input = TensorData::F32(vec![0.0, 2.0]);
        let mut output = TensorData::F32(vec![0.0; 2]);
        backend.run_conv2d(id, &input, &mut output);
        // 0 + 10 = 10, 2 + 10 = 12 clamped to 10.5
        assert_eq!(output, TensorData::F32(vec![10.0, 10.5]));
    }

    #[test]
    fn test_f32_3x3_valid_window() {
        // Sum-pooling weight over one channel: every output is the window sum
        let backend = ReferenceBackend::new();
        let params = F32ConvParams {
            geometry: unit_geometry(1, [3, 3]),
            weights: Arc::new(
                Tensor::constant(vec![1, 3, 3, 1], TensorData::F32(vec![1.0; 9])).expect("test"),
            ),
            bias: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        };
        let id = backend.create_conv2d_f32(params).expect("test");
        backend.setup_conv2d(id, 1, 3, 3);

        let input = TensorData::F32((1..=9).map(|v| v as f32).collect());
        let mut output = TensorData::F32(vec![0.0; 1]);
        backend.run_conv2d(id, &input, &mut output);
        assert_eq!(output, TensorData::F32(vec![45.0]));
    }

    #[test]
    fn test_depthwise_and_regular_both_succeed() {
        // Same channel counts, groups 1 vs groups == channels
        let backend = ReferenceBackend::new();

        let regular = identity_1x1_f32(4);
        assert!(backend.create_conv2d_f32(regular).is_ok());

        let depthwise = F32ConvParams {
            geometry: ConvGeometry {
                groups: 4,
                group_channels_in: 1,
                group_channels_out: 1,
                ..unit_geometry(4, [1, 1])
            },
            weights: Arc::new(
                Tensor::constant(vec![4, 1, 1, 1], TensorData::F32(vec![1.0; 4])).expect("test"),
            ),
            bias: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        };
        assert!(backend.create_conv2d_f32(depthwise).is_ok());
    }

    #[test]
    fn test_depthwise_scales_channels_independently() {
        let backend = ReferenceBackend::new();
        let params = F32ConvParams {
            geometry: ConvGeometry {
                groups: 2,
                group_channels_in: 1,
                group_channels_out: 1,
                ..unit_geometry(2, [1, 1])
            },
            weights: Arc::new(
                Tensor::constant(vec![2, 1, 1, 1], TensorData::F32(vec![2.0, 3.0])).expect("test"),
            ),
            bias: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        };
        let id = backend.create_conv2d_f32(params).expect("test");
        backend.setup_conv2d(id, 1, 1, 1);

        let input = TensorData::F32(vec![5.0, 7.0]);
        let mut output = TensorData::F32(vec![0.0; 2]);
        backend.run_conv2d(id, &input, &mut output);
        assert_eq!(output, TensorData::F32(vec![10.0, 21.0]));
    }

    #[test]
    fn test_qu8_zero_point_math() {
        // x_zp 128, w_zp 128, scales 0.1/0.2/0.05: one 1x1 element
        // acc = (130-128)*(131-128) = 6; requant = 6 * (0.1*0.2/0.05) = 2.4 -> 2
        let backend = ReferenceBackend::new();
        let params = Qu8ConvParams {
            geometry: unit_geometry(1, [1, 1]),
            weights: Arc::new(
                Tensor::constant(vec![1, 1, 1, 1], TensorData::U8(vec![131])).expect("test"),
            ),
            bias: None,
            x_zero_point: 128,
            x_scale: 0.1,
            w_zero_point: 128,
            w_scale: 0.2,
            y_zero_point: 0,
            y_scale: 0.05,
            output_min: 0,
            output_max: 255,
        };
        let id = backend.create_conv2d_qu8(params).expect("test");
        backend.setup_conv2d(id, 1, 1, 1);

        let input = TensorData::U8(vec![130]);
        let mut output = TensorData::U8(vec![0]);
        assert_eq!(
            backend.run_conv2d(id, &input, &mut output),
            BackendStatus::Success
        );
        assert_eq!(output, TensorData::U8(vec![2]));
    }

    #[test]
    fn test_qs8_clamps_at_126() {
        let backend = ReferenceBackend::new();
        let params = Qs8ConvParams {
            geometry: unit_geometry(1, [1, 1]),
            weights: Arc::new(
                Tensor::constant(vec![1, 1, 1, 1], TensorData::I8(vec![127])).expect("test"),
            ),
            bias: None,
            x_zero_point: 0,
            x_scale: 1.0,
            w_scale: 1.0,
            y_zero_point: 0,
            y_scale: 1.0,
            output_min: -126,
            output_max: 126,
        };
        let id = backend.create_conv2d_qs8(params).expect("test");
        backend.setup_conv2d(id, 1, 1, 1);

        let input = TensorData::I8(vec![127]);
        let mut output = TensorData::I8(vec![0]);
        backend.run_conv2d(id, &input, &mut output);
        // 127 * 127 = 16129 clamps to the configured 126, not i8::MAX
        assert_eq!(output, TensorData::I8(vec![126]));
    }

    #[test]
    fn test_qc8_per_channel_scales() {
        let backend = ReferenceBackend::new();
        let params = Qc8ConvParams {
            geometry: ConvGeometry {
                group_channels_out: 2,
                output_channel_stride: 2,
                ..unit_geometry(1, [1, 1])
            },
            weights: Arc::new(
                Tensor::constant(vec![2, 1, 1, 1], TensorData::I8(vec![10, 10])).expect("test"),
            ),
            bias: None,
            x_zero_point: 0,
            x_scale: 1.0,
            w_scales: vec![0.5, 1.0],
            y_zero_point: 0,
            y_scale: 1.0,
            output_min: -126,
            output_max: 126,
        };
        let id = backend.create_conv2d_qc8(params).expect("test");
        backend.setup_conv2d(id, 1, 1, 1);

        let input = TensorData::I8(vec![4]);
        let mut output = TensorData::I8(vec![0, 0]);
        backend.run_conv2d(id, &input, &mut output);
        // Same accumulator (40), different per-channel multipliers
        assert_eq!(output, TensorData::I8(vec![20, 40]));
    }

    #[test]
    fn test_same_upper_padding_preserves_extent() {
        let backend = ReferenceBackend::new();
        let params = F32ConvParams {
            geometry: ConvGeometry {
                same_upper_padding: true,
                ..unit_geometry(1, [3, 3])
            },
            weights: Arc::new(
                Tensor::constant(vec![1, 3, 3, 1], TensorData::F32(vec![1.0; 9])).expect("test"),
            ),
            bias: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        };
        let id = backend.create_conv2d_f32(params).expect("test");
        backend.setup_conv2d(id, 1, 4, 4);

        let input = TensorData::F32(vec![1.0; 16]);
        let mut output = TensorData::F32(vec![0.0; 16]);
        assert_eq!(
            backend.run_conv2d(id, &input, &mut output),
            BackendStatus::Success
        );
        // Center pixels see the full 3x3 window of ones
        let TensorData::F32(values) = &output else {
            panic!("dtype changed");
        };
        assert_eq!(values[4 + 1], 9.0);
    }

    #[test]
    fn test_run_before_setup_is_invalid_state() {
        let backend = ReferenceBackend::new();
        let id = backend.create_conv2d_f32(identity_1x1_f32(1)).expect("test");
        let input = TensorData::F32(vec![1.0]);
        let mut output = TensorData::F32(vec![0.0]);
        assert_eq!(
            backend.run_conv2d(id, &input, &mut output),
            BackendStatus::InvalidState
        );
    }

    #[test]
    fn test_release_invalidates_kernel() {
        let backend = ReferenceBackend::new();
        let id = backend.create_conv2d_f32(identity_1x1_f32(1)).expect("test");
        assert_eq!(backend.kernel_count(), 1);
        backend.release_conv2d(id);
        assert_eq!(backend.kernel_count(), 0);
        assert_eq!(
            backend.setup_conv2d(id, 1, 1, 1),
            BackendStatus::InvalidState
        );
    }

    #[test]
    fn test_create_rejects_bad_weight_shape() {
        let backend = ReferenceBackend::new();
        let mut params = identity_1x1_f32(2);
        // Weight still in the pre-prepack {M, C/g, kH, kW} layout order
        params.weights = Arc::new(
            Tensor::constant(vec![2, 2, 1, 1], TensorData::F32(vec![0.0; 4])).expect("test"),
        );
        assert_eq!(
            backend.create_conv2d_f32(params).unwrap_err(),
            BackendStatus::InvalidParameter
        );
    }

    #[test]
    fn test_create_rejects_inverted_clamp() {
        let backend = ReferenceBackend::new();
        let mut params = identity_1x1_f32(1);
        params.output_min = 1.0;
        params.output_max = 0.0;
        assert_eq!(
            backend.create_conv2d_f32(params).unwrap_err(),
            BackendStatus::InvalidParameter
        );
    }

    #[test]
    fn test_setup_rejects_window_larger_than_input() {
        let backend = ReferenceBackend::new();
        let params = F32ConvParams {
            geometry: unit_geometry(1, [3, 3]),
            weights: Arc::new(
                Tensor::constant(vec![1, 3, 3, 1], TensorData::F32(vec![0.0; 9])).expect("test"),
            ),
            bias: None,
            output_min: f32::NEG_INFINITY,
            output_max: f32::INFINITY,
        };
        let id = backend.create_conv2d_f32(params).expect("test");
        assert_eq!(
            backend.setup_conv2d(id, 1, 2, 2),
            BackendStatus::InvalidParameter
        );
    }
}
