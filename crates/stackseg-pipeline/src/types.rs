//! Shared configuration and error types for the slicing pipeline.

use serde::{Deserialize, Serialize};

use crate::axes::AxisError;
use crate::scale::{self, ScaleFilter};
use crate::segment::SegmentError;
use crate::selection::Selection;
use crate::slices::{OutputLayout, Selections, SliceIndex};

/// Configuration for segmenting one volume.
///
/// All fields have defaults, so a job parameter file only needs to name
/// what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Channels to segment. An empty or malformed value selects channel 0.
    #[serde(deserialize_with = "crate::selection::deserialize_channels")]
    pub channels: Selection,

    /// Focal planes to segment.
    pub z_slices: Selection,

    /// Time points to segment.
    pub time_points: Selection,

    /// Factor in `(0, 1]` applied to each plane before inference.
    pub scale_factor: f64,

    /// Resampling filter used when `scale_factor < 1`.
    pub scale_filter: ScaleFilter,

    /// Whether to percentile-normalize each slice before inference.
    pub normalize: bool,

    /// Lower normalization percentile.
    pub norm_low: f32,

    /// Upper normalization percentile.
    pub norm_high: f32,

    /// Whether unselected positions are kept in the output.
    pub layout: OutputLayout,
}

impl PipelineConfig {
    /// Default [`scale_factor`](Self::scale_factor).
    pub const DEFAULT_SCALE_FACTOR: f64 = 1.0;

    /// Default [`norm_low`](Self::norm_low).
    pub const DEFAULT_NORM_LOW: f32 = 1.0;

    /// Default [`norm_high`](Self::norm_high).
    pub const DEFAULT_NORM_HIGH: f32 = 99.8;

    /// The three axis selections.
    #[must_use]
    pub fn selections(&self) -> Selections {
        Selections {
            time_points: self.time_points.clone(),
            z_slices: self.z_slices.clone(),
            channels: self.channels.clone(),
        }
    }

    /// Check the numeric parameters.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidConfig`] when the scale factor is
    /// outside `(0, 1]` or the percentiles are not
    /// `0 <= norm_low < norm_high <= 100`.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !scale::is_valid_factor(self.scale_factor) {
            return Err(PipelineError::InvalidConfig(format!(
                "scale_factor must be in (0, 1], got {}",
                self.scale_factor
            )));
        }
        let percentiles_ok = (0.0..=100.0).contains(&self.norm_low)
            && (0.0..=100.0).contains(&self.norm_high)
            && self.norm_low < self.norm_high;
        if !percentiles_ok {
            return Err(PipelineError::InvalidConfig(format!(
                "normalization percentiles must satisfy 0 <= low < high <= 100, got {} and {}",
                self.norm_low, self.norm_high
            )));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channels: Selection::All,
            z_slices: Selection::All,
            time_points: Selection::All,
            scale_factor: Self::DEFAULT_SCALE_FACTOR,
            scale_filter: ScaleFilter::default(),
            normalize: true,
            norm_low: Self::DEFAULT_NORM_LOW,
            norm_high: Self::DEFAULT_NORM_HIGH,
            layout: OutputLayout::default(),
        }
    }
}

/// Errors that can occur while segmenting a volume.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The axis string does not fit the data.
    #[error(transparent)]
    Axes(#[from] AxisError),

    /// Pipeline configuration is invalid.
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// A plane exceeds the dimensions the resampler supports.
    #[error("plane of {height}x{width} pixels is too large to resample")]
    PlaneTooLarge {
        /// Plane height.
        height: usize,
        /// Plane width.
        width: usize,
    },

    /// The segmentation backend failed on a slice.
    #[error("segmentation of slice {index} failed: {source}")]
    Segment {
        /// The slice being segmented.
        index: SliceIndex,
        /// The backend error.
        #[source]
        source: SegmentError,
    },

    /// A result was addressed outside the label volume.
    #[error("destination ({t}, {z}, {c}) lies outside the label volume {shape:?}")]
    DestinationOutOfBounds {
        /// Output time index.
        t: usize,
        /// Output z index.
        z: usize,
        /// Output channel index.
        c: usize,
        /// Label volume shape.
        shape: [usize; 5],
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn bad_percentiles_are_rejected() {
        let config = PipelineConfig {
            norm_low: 99.0,
            norm_high: 1.0,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn bad_scale_factor_is_rejected() {
        let config = PipelineConfig {
            scale_factor: 2.0,
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"channels": 1, "z_slices": "0-2", "layout": "full"}"#)
                .unwrap();
        assert_eq!(config.channels, Selection::single(1));
        assert_eq!(config.z_slices, Selection::indices([0, 1, 2]));
        assert_eq!(config.time_points, Selection::All);
        assert_eq!(config.layout, OutputLayout::Full);
        assert!((config.norm_high - 99.8).abs() < f32::EPSILON);
    }

    #[test]
    fn unusable_channel_selection_selects_first_channel() {
        for channels in [r#""""#, r#""abc""#, r#""-1""#] {
            let config: PipelineConfig =
                serde_json::from_str(&format!(r#"{{"channels": {channels}}}"#)).unwrap();
            assert_eq!(config.channels, Selection::single(0), "channels {channels}");
        }
        assert!(serde_json::from_str::<PipelineConfig>(r#"{"z_slices": "abc"}"#).is_err());
    }
}
