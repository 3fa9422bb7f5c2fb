//! One-shot weight layout transform
//!
//! Backend kernels consume weights in the channel-last `{M, kH, kW, C/g}`
//! layout, while graph weights arrive channel-first as `{M, C/g, kH, kW}`.
//! The transform is the fixed permutation `{0, 2, 3, 1}` — axis 1 moves to
//! the end, the other axes keep their order — so it is implemented as a
//! single specialized copy rather than a generic permutation.
//!
//! The source data type is preserved unchanged; no numeric conversion
//! happens here.

use crate::error::{DespacharError, Result};
use crate::tensor::{Tensor, TensorData};

/// Transpose a channel-first weight into the channel-last kernel layout
///
/// Returns a new constant tensor of shape `{M, kH, kW, C/g}`; the source is
/// left untouched.
///
/// # Errors
///
/// Returns `InvalidShape` for non-4D weights and `AllocationFailed` if the
/// destination buffer cannot be obtained.
pub fn pack_weight_channels_last(weight: &Tensor) -> Result<Tensor> {
    if weight.ndim() != 4 {
        return Err(DespacharError::InvalidShape {
            reason: format!("Weight must be 4-D for prepacking, got shape {:?}", weight.shape()),
        });
    }
    let [m, channels, kernel_h, kernel_w] = [
        weight.shape()[0],
        weight.shape()[1],
        weight.shape()[2],
        weight.shape()[3],
    ];

    let data = match weight.data() {
        TensorData::F32(src) => TensorData::F32(move_axis_1_last(src, m, channels, kernel_h, kernel_w)?),
        TensorData::I8(src) => TensorData::I8(move_axis_1_last(src, m, channels, kernel_h, kernel_w)?),
        TensorData::U8(src) => TensorData::U8(move_axis_1_last(src, m, channels, kernel_h, kernel_w)?),
        TensorData::I32(src) => TensorData::I32(move_axis_1_last(src, m, channels, kernel_h, kernel_w)?),
    };

    Tensor::constant(vec![m, kernel_h, kernel_w, channels], data)
}

/// Move axis 1 of a `{d0, d1, d2, d3}` tensor to the last position
fn move_axis_1_last<T: Copy>(
    src: &[T],
    d0: usize,
    d1: usize,
    d2: usize,
    d3: usize,
) -> Result<Vec<T>> {
    let mut dst = Vec::new();
    dst.try_reserve_exact(src.len())
        .map_err(|_| DespacharError::AllocationFailed {
            bytes: src.len() * std::mem::size_of::<T>(),
        })?;

    // Destination order is {d0, d2, d3, d1}: the innermost pushes walk the
    // old axis 1, which is the new trailing axis.
    for i0 in 0..d0 {
        for i2 in 0..d2 {
            for i3 in 0..d3 {
                for i1 in 0..d1 {
                    dst.push(src[((i0 * d1 + i1) * d2 + i2) * d3 + i3]);
                }
            }
        }
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_shape() {
        let weight = Tensor::constant(
            vec![2, 3, 4, 5],
            TensorData::F32(vec![0.0; 120]),
        )
        .expect("test");
        let packed = pack_weight_channels_last(&weight).expect("test");
        assert_eq!(packed.shape(), &[2, 4, 5, 3]);
        assert_eq!(packed.size(), 120);
        assert!(packed.is_constant());
    }

    #[test]
    fn test_known_values() {
        // {1, 2, 2, 2}: channel-first [c0: 0 1 2 3, c1: 4 5 6 7]
        // channel-last interleaves the channels per pixel
        let weight = Tensor::constant(
            vec![1, 2, 2, 2],
            TensorData::F32(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]),
        )
        .expect("test");
        let packed = pack_weight_channels_last(&weight).expect("test");
        assert_eq!(
            packed.as_f32().expect("test"),
            &[0.0, 4.0, 1.0, 5.0, 2.0, 6.0, 3.0, 7.0]
        );
    }

    #[test]
    fn test_dtype_preserved() {
        let weight =
            Tensor::constant(vec![1, 2, 1, 1], TensorData::I8(vec![-3, 7])).expect("test");
        let packed = pack_weight_channels_last(&weight).expect("test");
        assert_eq!(packed.dtype(), weight.dtype());
        assert_eq!(packed.as_i8().expect("test"), &[-3, 7]);
    }

    #[test]
    fn test_rejects_non_4d() {
        let weight = Tensor::constant(vec![2, 3], TensorData::F32(vec![0.0; 6])).expect("test");
        assert!(matches!(
            pack_weight_channels_last(&weight).unwrap_err(),
            DespacharError::InvalidShape { .. }
        ));
    }
}
