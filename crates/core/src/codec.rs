//! Conversion between 8-bit HWC patches and the engine's NCHW tensors.

use anyhow::{bail, Result};
use half::{f16, slice::HalfFloatSliceExt};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4};

use crate::engine::{PatchTensor, Precision};
use crate::types::ChannelOrder;

/// Encode an `(H, W, 3)` patch as a contiguous `(1, 3, H, W)` tensor in RGB
/// order with intensities in `[0, 1]`.
pub fn encode(
    patch: ArrayView3<'_, u8>,
    order: ChannelOrder,
    precision: Precision,
) -> Result<PatchTensor> {
    let (h, w, _) = patch.dim();
    let planar = Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
        patch[[y, x, order.rgb_source_index(c)]] as f32 / 255.0
    });

    match precision {
        Precision::F32 => Ok(PatchTensor::F32(planar)),
        Precision::F16 => {
            let (f32_data, _) = planar.into_raw_vec_and_offset();
            let mut half_data = vec![f16::ZERO; f32_data.len()];
            half_data.convert_from_f32_slice(&f32_data);
            Ok(PatchTensor::F16(Array4::from_shape_vec((1, 3, h, w), half_data)?))
        }
    }
}

/// Decode a `(1, 3, H, W)` tensor back into an `(H, W, 3)` patch in `order`.
pub fn decode(tensor: &PatchTensor, order: ChannelOrder) -> Result<Array3<u8>> {
    let (n, c, _, _) = tensor.dim();
    if n != 1 {
        bail!("expected batch size 1, got {n}");
    }
    if c != 3 {
        bail!("expected 3 channels, got {c}");
    }

    match tensor {
        PatchTensor::F32(arr) => Ok(planar_to_hwc(arr.view(), order)),
        PatchTensor::F16(arr) => {
            let standard = arr.as_standard_layout();
            let mut f32_data = vec![0.0f32; standard.len()];
            match standard.as_slice() {
                Some(src) => src.convert_to_f32_slice(&mut f32_data),
                None => bail!("f16 tensor is not contiguous"),
            }
            let widened = Array4::from_shape_vec(standard.dim(), f32_data)?;
            Ok(planar_to_hwc(widened.view(), order))
        }
    }
}

fn planar_to_hwc(planar: ArrayView4<'_, f32>, order: ChannelOrder) -> Array3<u8> {
    let (_, _, h, w) = planar.dim();
    Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
        // Writing channel c in `order` means reading the RGB channel whose
        // source index is c; the mapping is its own inverse.
        to_u8(planar[[0, order.rgb_source_index(c), y, x]])
    })
}

fn to_u8(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_patch() -> Array3<u8> {
        Array3::from_shape_fn((3, 4, 3), |(y, x, c)| (y * 40 + x * 10 + c * 3) as u8)
    }

    #[test]
    fn test_encode_is_nchw_rgb_unit_range() {
        let patch = sample_patch();
        let tensor = encode(patch.view(), ChannelOrder::Rgb, Precision::F32).unwrap();
        let PatchTensor::F32(arr) = tensor else {
            panic!("expected f32 tensor");
        };
        assert_eq!(arr.dim(), (1, 3, 3, 4));
        assert!(arr.is_standard_layout());
        assert!((arr[[0, 1, 2, 3]] - patch[[2, 3, 1]] as f32 / 255.0).abs() < 1e-6);
        assert!(arr.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_encode_reorders_bgr_to_rgb() {
        let mut patch = Array3::<u8>::zeros((1, 1, 3));
        patch[[0, 0, 0]] = 255; // blue in BGR
        let PatchTensor::F32(arr) = encode(patch.view(), ChannelOrder::Bgr, Precision::F32).unwrap() else {
            panic!("expected f32 tensor");
        };
        assert_eq!(arr[[0, 2, 0, 0]], 1.0);
        assert_eq!(arr[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_identity_round_trip_within_one() {
        let patch = sample_patch();
        for precision in [Precision::F32, Precision::F16] {
            for order in [ChannelOrder::Rgb, ChannelOrder::Bgr] {
                let tensor = encode(patch.view(), order, precision).unwrap();
                assert_eq!(tensor.precision(), precision);
                let back = decode(&tensor, order).unwrap();
                for (a, b) in patch.iter().zip(back.iter()) {
                    assert!((*a as i16 - *b as i16).abs() <= 1, "{a} vs {b}");
                }
            }
        }
    }

    #[test]
    fn test_decode_clips_out_of_range_values() {
        let mut arr = Array4::<f32>::zeros((1, 3, 1, 2));
        arr[[0, 0, 0, 0]] = 1.7;
        arr[[0, 1, 0, 0]] = -0.3;
        arr[[0, 2, 0, 1]] = f32::NAN;
        let out = decode(&PatchTensor::F32(arr), ChannelOrder::Rgb).unwrap();
        assert_eq!(out[[0, 0, 0]], 255);
        assert_eq!(out[[0, 0, 1]], 0);
        assert_eq!(out[[0, 1, 2]], 0);
    }

    #[test]
    fn test_decode_rejects_bad_batch_or_channels() {
        let batch = PatchTensor::F32(Array4::zeros((2, 3, 2, 2)));
        assert!(decode(&batch, ChannelOrder::Rgb).is_err());
        let channels = PatchTensor::F32(Array4::zeros((1, 4, 2, 2)));
        assert!(decode(&channels, ChannelOrder::Rgb).is_err());
    }
}
