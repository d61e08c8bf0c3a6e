//! Segmentation backends: turn one 2D slice into a label plane.
//!
//! This module defines the [`Segmenter`] trait the slicing loop calls for
//! every slice, and [`ThresholdSegmenter`], an in-process backend built on
//! `imageproc` that needs no model files.
//!
//! Backends that shell out to an external model command live in
//! `stackseg-io`, since they need the filesystem.

use std::path::PathBuf;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use serde::{Deserialize, Serialize};

use crate::slices::SliceIndex;
use crate::volume::{LabelPlane, Slice};

/// Errors a backend can report for one slice.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    /// The model command could not be started.
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The model command exited unsuccessfully.
    #[error("`{program}` exited with {status}: {stderr}")]
    CommandFailed {
        /// Program name.
        program: String,
        /// Exit status description.
        status: String,
        /// Tail of the command's standard error.
        stderr: String,
    },

    /// The model command succeeded but wrote no output.
    #[error("segmentation output {} was not produced", .0.display())]
    MissingOutput(PathBuf),

    /// The output could not be interpreted as a 2D label image.
    #[error("unexpected segmentation output: {0}")]
    UnexpectedOutput(String),

    /// Filesystem error while staging input or collecting output.
    #[error("I/O error during segmentation: {0}")]
    Io(#[from] std::io::Error),

    /// Backend-specific failure.
    #[error("{0}")]
    Backend(String),
}

/// A 2D instance segmentation backend.
///
/// Called once per slice, strictly sequentially. Implementations may keep
/// state between calls (loaded models, embedding caches).
pub trait Segmenter {
    /// Short backend name for logs and reports.
    fn name(&self) -> &str;

    /// Segment one slice. The returned plane should have the slice's
    /// height and width; other shapes are clipped during reassembly.
    ///
    /// # Errors
    ///
    /// Returns a [`SegmentError`] when the backend fails on this slice.
    fn segment(&mut self, slice: &Slice, index: SliceIndex) -> Result<LabelPlane, SegmentError>;

    /// Whether the backend normalizes intensities itself. Slices handed to
    /// such a backend skip the pipeline's percentile normalization.
    fn normalizes_input(&self) -> bool {
        false
    }
}

/// Otsu threshold followed by connected-component labelling.
///
/// Works on the slice's luminance, so color slices are accepted too.
/// Bright objects on a dark background become foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSegmenter {
    /// Objects with fewer pixels are discarded.
    pub min_size: usize,
    /// Whether diagonal neighbours belong to the same object.
    pub diagonal: bool,
}

impl Default for ThresholdSegmenter {
    fn default() -> Self {
        Self {
            min_size: 4,
            diagonal: true,
        }
    }
}

impl Segmenter for ThresholdSegmenter {
    fn name(&self) -> &'static str {
        "threshold"
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn segment(&mut self, slice: &Slice, _index: SliceIndex) -> Result<LabelPlane, SegmentError> {
        let luminance = slice.luminance();
        let (height, width) = luminance.dim();
        let too_large =
            || SegmentError::UnexpectedOutput(format!("plane of {height}x{width} is too large"));
        let h = u32::try_from(height).map_err(|_| too_large())?;
        let w = u32::try_from(width).map_err(|_| too_large())?;

        let (lo, hi) = luminance
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        let range = hi - lo;
        if !range.is_finite() || range <= 0.0 {
            return Ok(LabelPlane::zeros((height, width)));
        }

        let gray = GrayImage::from_fn(w, h, |x, y| {
            let v = luminance[[y as usize, x as usize]];
            let scaled = if v.is_finite() { (v - lo) / range } else { 0.0 };
            Luma([(scaled * 255.0).round().clamp(0.0, 255.0) as u8])
        });
        let level = imageproc::contrast::otsu_level(&gray);
        let binary = GrayImage::from_fn(w, h, |x, y| {
            if gray.get_pixel(x, y)[0] > level {
                Luma([255])
            } else {
                Luma([0])
            }
        });

        let connectivity = if self.diagonal {
            Connectivity::Eight
        } else {
            Connectivity::Four
        };
        let components = connected_components(&binary, connectivity, Luma([0u8]));

        let raw = LabelPlane::from_shape_fn((height, width), |(y, x)| {
            components.get_pixel(x as u32, y as u32)[0]
        });
        Ok(filter_small_objects(&raw, self.min_size))
    }
}

/// Drop objects smaller than `min_size` pixels and renumber the rest
/// `1..=n` in order of first appearance.
#[must_use]
pub fn filter_small_objects(labels: &LabelPlane, min_size: usize) -> LabelPlane {
    let max = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut sizes = vec![0_usize; max + 1];
    for &label in labels {
        sizes[label as usize] += 1;
    }

    let mut remap = vec![0_u32; max + 1];
    let mut next = 0_u32;
    for &label in labels {
        let label = label as usize;
        if label != 0 && remap[label] == 0 && sizes[label] >= min_size {
            next += 1;
            remap[label] = next;
        }
    }
    labels.mapv(|label| remap[label as usize])
}

/// Number of distinct objects in a label plane.
#[must_use]
pub fn count_objects(labels: &LabelPlane) -> usize {
    let mut ids: Vec<u32> = labels.iter().copied().filter(|&l| l != 0).collect();
    ids.sort_unstable();
    ids.dedup();
    ids.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::{Array2, array};

    use super::*;

    const ORIGIN: SliceIndex = SliceIndex { t: 0, z: 0, c: 0 };

    /// Two bright squares on a dark background.
    fn two_blobs() -> Slice {
        let mut plane = Array2::<f32>::from_elem((20, 20), 10.0);
        for y in 2..7 {
            for x in 2..7 {
                plane[[y, x]] = 200.0;
            }
        }
        for y in 12..18 {
            for x in 11..16 {
                plane[[y, x]] = 180.0;
            }
        }
        Slice::from_plane(plane)
    }

    #[test]
    fn finds_two_objects() {
        let labels = ThresholdSegmenter::default()
            .segment(&two_blobs(), ORIGIN)
            .unwrap();
        assert_eq!(labels.dim(), (20, 20));
        assert_eq!(count_objects(&labels), 2);
        assert_eq!(labels[[0, 0]], 0);
        assert_ne!(labels[[4, 4]], 0);
        assert_ne!(labels[[4, 4]], labels[[14, 13]]);
    }

    #[test]
    fn constant_slice_has_no_objects() {
        let slice = Slice::from_plane(Array2::from_elem((8, 8), 42.0));
        let labels = ThresholdSegmenter::default().segment(&slice, ORIGIN).unwrap();
        assert_eq!(count_objects(&labels), 0);
    }

    #[test]
    fn min_size_discards_specks() {
        let mut plane = Array2::<f32>::zeros((10, 10));
        plane[[1, 1]] = 1.0;
        for y in 5..9 {
            for x in 5..9 {
                plane[[y, x]] = 1.0;
            }
        }
        let mut segmenter = ThresholdSegmenter {
            min_size: 4,
            diagonal: true,
        };
        let labels = segmenter.segment(&Slice::from_plane(plane), ORIGIN).unwrap();
        assert_eq!(count_objects(&labels), 1);
        assert_eq!(labels[[1, 1]], 0);
        assert_eq!(labels[[6, 6]], 1);
    }

    #[test]
    fn filter_small_objects_renumbers_consecutively() {
        let labels = array![[0_u32, 5, 5], [9, 0, 5], [9, 2, 0]];
        let out = filter_small_objects(&labels, 2);
        assert_eq!(out, array![[0_u32, 1, 1], [2, 0, 1], [2, 0, 0]]);
    }

    #[test]
    fn count_objects_ignores_background() {
        assert_eq!(count_objects(&array![[0_u32, 3], [3, 7]]), 2);
    }
}
