//! Slice downscaling before inference and label upscaling after it.
//!
//! Large planes can be shrunk by a `scale_factor` in `(0, 1]` so the model
//! runs on fewer pixels. Intensity planes are resampled with the `image`
//! crate; label planes come back with nearest-neighbour index mapping so
//! no label value is ever interpolated.

use std::fmt;

use image::{ImageBuffer, Luma};
use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::types::PipelineError;
use crate::volume::{LabelPlane, Slice};

/// Resampling filter used when downscaling intensity planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleFilter {
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    #[default]
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Gaussian: moderate speed, smooth output.
    Gaussian,
    /// Lanczos with 3 lobes: slowest, sharpest.
    Lanczos3,
}

impl ScaleFilter {
    const fn to_image_filter(self) -> image::imageops::FilterType {
        match self {
            Self::Nearest => image::imageops::FilterType::Nearest,
            Self::Triangle => image::imageops::FilterType::Triangle,
            Self::CatmullRom => image::imageops::FilterType::CatmullRom,
            Self::Gaussian => image::imageops::FilterType::Gaussian,
            Self::Lanczos3 => image::imageops::FilterType::Lanczos3,
        }
    }
}

impl fmt::Display for ScaleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => f.write_str("nearest"),
            Self::Triangle => f.write_str("triangle"),
            Self::CatmullRom => f.write_str("catmull-rom"),
            Self::Gaussian => f.write_str("gaussian"),
            Self::Lanczos3 => f.write_str("lanczos3"),
        }
    }
}

/// Whether `factor` is an accepted scale factor.
#[must_use]
pub fn is_valid_factor(factor: f64) -> bool {
    factor.is_finite() && factor > 0.0 && factor <= 1.0
}

/// Target plane size for `factor`, never smaller than 1x1.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn scaled_size(height: usize, width: usize, factor: f64) -> (usize, usize) {
    let scale = |len: usize| ((len as f64 * factor).round() as usize).max(1);
    (scale(height), scale(width))
}

/// Downscale every sample plane of `slice` by `factor`.
///
/// Returns the slice unchanged when the factor is 1 or the target size
/// equals the current size.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] for a factor outside
/// `(0, 1]` and [`PipelineError::PlaneTooLarge`] when a plane does not
/// fit the `image` crate's `u32` dimensions.
pub fn downscale(slice: &Slice, factor: f64, filter: ScaleFilter) -> Result<Slice, PipelineError> {
    if !is_valid_factor(factor) {
        return Err(PipelineError::InvalidConfig(format!(
            "scale factor must be in (0, 1], got {factor}"
        )));
    }

    let (height, width) = (slice.height(), slice.width());
    let (new_height, new_width) = scaled_size(height, width, factor);
    if (new_height, new_width) == (height, width) {
        return Ok(slice.clone());
    }

    let mut data = Array3::<f32>::zeros((slice.samples(), new_height, new_width));
    for (sample, mut out) in data.axis_iter_mut(Axis(0)).enumerate() {
        out.assign(&resize_plane(
            slice.plane(sample),
            new_height,
            new_width,
            filter,
        )?);
    }
    Ok(Slice::new(data))
}

/// Resize one intensity plane.
///
/// `image` clamps `f32` pixels to `[0, 1]`, so the plane is mapped into
/// that range for resampling and mapped back afterwards.
fn resize_plane(
    plane: ArrayView2<'_, f32>,
    new_height: usize,
    new_width: usize,
    filter: ScaleFilter,
) -> Result<Array2<f32>, PipelineError> {
    let (height, width) = plane.dim();
    let too_large = || PipelineError::PlaneTooLarge { height, width };
    let to_u32 = |v: usize| u32::try_from(v).map_err(|_| too_large());

    let (lo, hi) = plane
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let range = hi - lo;
    if !range.is_finite() || range <= 0.0 {
        let fill = if lo.is_finite() { lo } else { 0.0 };
        return Ok(Array2::from_elem((new_height, new_width), fill));
    }

    let unit: Vec<f32> = plane.iter().map(|&v| (v - lo) / range).collect();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(to_u32(width)?, to_u32(height)?, unit).ok_or_else(too_large)?;
    let resized = image::imageops::resize(
        &buffer,
        to_u32(new_width)?,
        to_u32(new_height)?,
        filter.to_image_filter(),
    );

    let values: Vec<f32> = resized.into_raw().into_iter().map(|v| v.mul_add(range, lo)).collect();
    Array2::from_shape_vec((new_height, new_width), values).map_err(|_| too_large())
}

/// Bring a label plane back to `height x width` by nearest-neighbour
/// lookup. Label ids are copied, never blended.
#[must_use]
pub fn upscale_labels(labels: &LabelPlane, height: usize, width: usize) -> LabelPlane {
    let (src_height, src_width) = labels.dim();
    if (src_height, src_width) == (height, width) {
        return labels.clone();
    }
    if src_height == 0 || src_width == 0 {
        return Array2::zeros((height, width));
    }
    Array2::from_shape_fn((height, width), |(y, x)| {
        labels[[y * src_height / height, x * src_width / width]]
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::array;

    use super::*;

    fn ramp_slice(height: usize, width: usize) -> Slice {
        #[allow(clippy::cast_precision_loss)]
        let plane = Array2::from_shape_fn((height, width), |(y, x)| (y * width + x) as f32);
        Slice::from_plane(plane)
    }

    #[test]
    fn default_filter_is_triangle() {
        assert_eq!(ScaleFilter::default(), ScaleFilter::Triangle);
    }

    #[test]
    fn unit_factor_is_noop() {
        let slice = ramp_slice(10, 6);
        let out = downscale(&slice, 1.0, ScaleFilter::Triangle).unwrap();
        assert_eq!(out, slice);
    }

    #[test]
    fn half_factor_halves_each_axis() {
        let slice = ramp_slice(64, 32);
        let out = downscale(&slice, 0.5, ScaleFilter::Triangle).unwrap();
        assert_eq!((out.height(), out.width()), (32, 16));
        assert_eq!(out.samples(), 1);
    }

    #[test]
    fn resampled_values_stay_in_input_range() {
        let slice = ramp_slice(40, 40);
        let out = downscale(&slice, 0.25, ScaleFilter::Lanczos3).unwrap();
        let max = 40.0 * 40.0 - 1.0;
        for &v in out.data() {
            assert!((-1.0..=max + 1.0).contains(&v), "value {v} outside input range");
        }
    }

    #[test]
    fn constant_plane_stays_constant() {
        let slice = Slice::from_plane(Array2::from_elem((8, 8), 3.5));
        let out = downscale(&slice, 0.5, ScaleFilter::Gaussian).unwrap();
        assert!(out.data().iter().all(|&v| (v - 3.5).abs() < f32::EPSILON));
    }

    #[test]
    fn invalid_factor_is_rejected() {
        let slice = ramp_slice(4, 4);
        for factor in [0.0, -0.5, 1.5, f64::NAN] {
            assert!(matches!(
                downscale(&slice, factor, ScaleFilter::Triangle),
                Err(PipelineError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn scaled_size_never_collapses() {
        assert_eq!(scaled_size(3, 100, 0.1), (1, 10));
    }

    #[test]
    fn upscale_labels_repeats_ids() {
        let labels = array![[1_u32, 2], [3, 0]];
        let out = upscale_labels(&labels, 4, 4);
        assert_eq!(out.dim(), (4, 4));
        assert_eq!(out[[0, 0]], 1);
        assert_eq!(out[[1, 1]], 1);
        assert_eq!(out[[0, 3]], 2);
        assert_eq!(out[[3, 0]], 3);
        assert_eq!(out[[3, 3]], 0);
    }

    #[test]
    fn upscale_labels_same_size_is_identity() {
        let labels = array![[5_u32, 0], [0, 6]];
        assert_eq!(upscale_labels(&labels, 2, 2), labels);
    }
}
