//! Percentile intensity normalization.
//!
//! Pretrained nucleus models expect inputs scaled so that the `low`
//! percentile maps to 0 and the `high` percentile maps to 1:
//!
//! ```text
//! out = (x - p_low) / (p_high - p_low + 1e-20)
//! ```
//!
//! Values outside the percentile range are not clipped. Each sample plane
//! of a slice is normalized on its own.

use ndarray::{Array2, Array3, ArrayView2, Axis};

use crate::volume::Slice;

const EPSILON: f32 = 1e-20;

/// Linearly interpolated percentile of `sorted` (ascending), `q` in
/// `[0, 100]`. Returns 0.0 for an empty slice.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn percentile(sorted: &[f32], q: f32) -> f32 {
    let Some(&last) = sorted.last() else {
        return 0.0;
    };
    if sorted.len() == 1 {
        return last;
    }
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f32;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}

/// Normalize one plane between its `low` and `high` percentiles.
///
/// A constant plane (zero percentile spread) normalizes to all zeros.
/// Non-finite values are ignored when computing the percentiles.
#[must_use]
pub fn normalize_plane(plane: ArrayView2<'_, f32>, low: f32, high: f32) -> Array2<f32> {
    let mut values: Vec<f32> = plane.iter().copied().filter(|v| v.is_finite()).collect();
    values.sort_unstable_by(f32::total_cmp);

    let p_low = percentile(&values, low);
    let p_high = percentile(&values, high);
    let spread = p_high - p_low;
    if spread.abs() <= f32::EPSILON {
        return Array2::zeros(plane.raw_dim());
    }
    plane.mapv(|v| (v - p_low) / (spread + EPSILON))
}

/// Normalize every sample plane of a slice.
#[must_use]
pub fn normalize_slice(slice: &Slice, low: f32, high: f32) -> Slice {
    let mut data = Array3::<f32>::zeros(slice.data().raw_dim());
    for (sample, mut out) in data.axis_iter_mut(Axis(0)).enumerate() {
        out.assign(&normalize_plane(slice.plane(sample), low, high));
    }
    Slice::new(data)
}
