//! The slicing loop: cut every selected 2D slice out of a volume,
//! segment it, and write its labels back into a label volume.
//!
//! ```rust
//! # use stackseg_pipeline::{PipelineConfig, PipelineError, ThresholdSegmenter, Volume};
//! # use stackseg_pipeline::diagnostics::Clock;
//! # fn run<C: Clock>(volume: &Volume, clock: &C) -> Result<(), PipelineError> {
//! let mut backend = ThresholdSegmenter::default();
//! let (labels, diagnostics) =
//!     stackseg_pipeline::segment_volume(volume, &PipelineConfig::default(), &mut backend, clock)?;
//! println!("{}", diagnostics.report());
//! # let _ = labels;
//! # Ok(())
//! # }
//! ```
//!
//! Slices are processed one at a time in [`SlicePlan`] order. Nothing is
//! written for positions outside the selections, so they stay background.

use tracing::{debug, warn};

use crate::diagnostics::{Clock, SliceDiagnostics, VolumeDiagnostics};
use crate::normalize::normalize_slice;
use crate::reassemble::place;
use crate::scale::{downscale, upscale_labels};
use crate::segment::{Segmenter, count_objects};
use crate::slices::SlicePlan;
use crate::types::{PipelineConfig, PipelineError};
use crate::volume::{LabelVolume, Volume};

/// Progress of the slicing loop, reported after every slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Slices finished so far.
    pub done: usize,
    /// Slices in the plan.
    pub total: usize,
}

/// Segment every selected slice of `volume` with `segmenter`.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidConfig`] for out-of-range parameters
/// and [`PipelineError::Segment`] when the backend fails on a slice. The
/// first failing slice aborts the volume.
pub fn segment_volume<C: Clock>(
    volume: &Volume,
    config: &PipelineConfig,
    segmenter: &mut dyn Segmenter,
    clock: &C,
) -> Result<(LabelVolume, VolumeDiagnostics), PipelineError> {
    segment_volume_with_progress(volume, config, segmenter, clock, |_| {})
}

/// [`segment_volume`] with a callback invoked after each slice.
///
/// # Errors
///
/// See [`segment_volume`].
pub fn segment_volume_with_progress<C: Clock>(
    volume: &Volume,
    config: &PipelineConfig,
    segmenter: &mut dyn Segmenter,
    clock: &C,
    mut on_progress: impl FnMut(Progress),
) -> Result<(LabelVolume, VolumeDiagnostics), PipelineError> {
    config.validate()?;
    let start = clock.now();

    let input_shape = volume.shape();
    let (height, width) = (volume.height(), volume.width());
    let plan = SlicePlan::new(
        input_shape,
        &config.selections(),
        config.layout,
        volume.modality(),
    );
    let output_shape = plan.output_shape(height, width);
    let mut labels = LabelVolume::zeros(output_shape);

    debug!(
        backend = segmenter.name(),
        ?input_shape,
        ?output_shape,
        slices = plan.len(),
        modality = ?volume.modality(),
        "segmenting volume"
    );

    let normalize = config.normalize && !segmenter.normalizes_input();
    let total = plan.len();
    let mut slices = Vec::with_capacity(total);
    for (done, index) in plan.iter().enumerate() {
        let slice_start = clock.now();
        let (Some(slice), Some(destination)) = (volume.slice(index), plan.destination(index))
        else {
            continue;
        };

        let slice = if normalize {
            normalize_slice(&slice, config.norm_low, config.norm_high)
        } else {
            slice
        };
        let slice = downscale(&slice, config.scale_factor, config.scale_filter)?;
        let inference_size = (slice.height(), slice.width());

        let segment_start = clock.now();
        let plane = segmenter
            .segment(&slice, index)
            .map_err(|source| PipelineError::Segment { index, source })?;
        let segment_duration = clock.elapsed(&segment_start);

        let plane = if inference_size == (height, width) {
            plane
        } else {
            upscale_labels(&plane, height, width)
        };
        let placement = place(&mut labels, destination, plane.view())?;
        if placement.clipped {
            warn!(
                %index,
                got = ?plane.dim(),
                expected = ?(height, width),
                "label plane does not match slice size; copied the overlap"
            );
        }

        let object_count = count_objects(&plane);
        debug!(%index, objects = object_count, "slice segmented");
        slices.push(SliceDiagnostics {
            index,
            destination,
            inference_size,
            object_count,
            placement,
            segment_duration,
            total_duration: clock.elapsed(&slice_start),
        });
        on_progress(Progress {
            done: done + 1,
            total,
        });
    }

    let diagnostics = VolumeDiagnostics {
        backend: segmenter.name().to_owned(),
        input_shape,
        output_shape,
        modality: volume.modality(),
        slices,
        total_duration: clock.elapsed(&start),
    };
    Ok((labels, diagnostics))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use ndarray::{Array2, ArrayD, IxDyn};

    use super::*;
    use crate::axes::Axes;
    use crate::segment::SegmentError;
    use crate::selection::Selection;
    use crate::slices::{OutputLayout, SliceIndex};
    use crate::volume::{LabelPlane, Modality, Slice};

    /// Clock that advances one millisecond per reading.
    #[derive(Default)]
    struct TickClock(Cell<u64>);

    impl Clock for TickClock {
        type Instant = u64;

        fn now(&self) -> u64 {
            let t = self.0.get();
            self.0.set(t + 1);
            t
        }

        fn elapsed(&self, since: &u64) -> Duration {
            Duration::from_millis(self.0.get().saturating_sub(*since))
        }
    }

    /// Labels every pixel with `1 + t*100 + z*10 + c` and records calls.
    #[derive(Default)]
    struct TagSegmenter {
        calls: Vec<SliceIndex>,
        seen_samples: Vec<usize>,
        fail_on: Option<SliceIndex>,
        shape_override: Option<(usize, usize)>,
        own_normalization: bool,
        seen_max: Vec<f32>,
    }

    impl Segmenter for TagSegmenter {
        fn name(&self) -> &'static str {
            "tag"
        }

        fn segment(
            &mut self,
            slice: &Slice,
            index: SliceIndex,
        ) -> Result<LabelPlane, SegmentError> {
            self.calls.push(index);
            self.seen_samples.push(slice.samples());
            self.seen_max
                .push(slice.luminance().iter().copied().fold(f32::MIN, f32::max));
            if self.fail_on == Some(index) {
                return Err(SegmentError::UnexpectedOutput("boom".to_owned()));
            }
            let tag = u32::try_from(1 + index.t * 100 + index.z * 10 + index.c).unwrap();
            let shape = self
                .shape_override
                .unwrap_or((slice.height(), slice.width()));
            Ok(Array2::from_elem(shape, tag))
        }

        fn normalizes_input(&self) -> bool {
            self.own_normalization
        }
    }

    fn volume(axes: &str, shape: &[usize]) -> Volume {
        let len: usize = shape.iter().product();
        #[allow(clippy::cast_precision_loss)]
        let data = ArrayD::from_shape_vec(IxDyn(shape), (0..len).map(|v| v as f32).collect())
            .unwrap();
        Volume::new(data, Axes::parse(axes).unwrap()).unwrap()
    }

    #[test]
    fn every_slice_is_segmented_in_order() {
        let volume = volume("TZCYX", &[2, 2, 2, 4, 4]);
        let mut backend = TagSegmenter::default();
        let (labels, diagnostics) = segment_volume(
            &volume,
            &PipelineConfig::default(),
            &mut backend,
            &TickClock::default(),
        )
        .unwrap();

        assert_eq!(backend.calls.len(), 8);
        assert_eq!(backend.calls[1], SliceIndex { t: 0, z: 0, c: 1 });
        assert_eq!(labels.shape(), [2, 2, 2, 4, 4]);
        assert_eq!(labels.plane(1, 0, 1)[[0, 0]], 102);
        assert_eq!(diagnostics.slices.len(), 8);
        assert_eq!(diagnostics.backend, "tag");
    }

    #[test]
    fn self_normalizing_backend_receives_raw_slices() {
        let volume = volume("YX", &[4, 4]);
        let mut backend = TagSegmenter::default();
        segment_volume(&volume, &PipelineConfig::default(), &mut backend, &TickClock::default())
            .unwrap();
        assert!(backend.seen_max[0] <= 1.5, "normalized max {}", backend.seen_max[0]);

        let mut backend = TagSegmenter {
            own_normalization: true,
            ..TagSegmenter::default()
        };
        segment_volume(&volume, &PipelineConfig::default(), &mut backend, &TickClock::default())
            .unwrap();
        assert!((backend.seen_max[0] - 15.0).abs() < f32::EPSILON);
    }

    #[test]
    fn compact_selection_shrinks_output() {
        let volume = volume("ZCYX", &[3, 3, 4, 4]);
        let config = PipelineConfig {
            channels: Selection::single(2),
            z_slices: Selection::indices([0, 2]),
            ..PipelineConfig::default()
        };
        let mut backend = TagSegmenter::default();
        let (labels, _) =
            segment_volume(&volume, &config, &mut backend, &TickClock::default()).unwrap();
        assert_eq!(labels.shape(), [1, 2, 1, 4, 4]);
        assert_eq!(labels.plane(0, 1, 0)[[2, 2]], 1 + 20 + 2);
    }

    #[test]
    fn full_layout_leaves_unselected_background() {
        let volume = volume("ZCYX", &[3, 2, 4, 4]);
        let config = PipelineConfig {
            channels: Selection::single(1),
            layout: OutputLayout::Full,
            ..PipelineConfig::default()
        };
        let mut backend = TagSegmenter::default();
        let (labels, _) =
            segment_volume(&volume, &config, &mut backend, &TickClock::default()).unwrap();
        assert_eq!(labels.shape(), [1, 3, 2, 4, 4]);
        for z in 0..3 {
            assert!(labels.plane(0, z, 0).iter().all(|&v| v == 0));
            assert!(labels.plane(0, z, 1).iter().all(|&v| v != 0));
        }
    }

    #[test]
    fn color_slices_carry_three_samples() {
        let volume = volume("YXS", &[4, 4, 3]);
        assert_eq!(volume.modality(), Modality::Color);
        let mut backend = TagSegmenter::default();
        let (labels, _) = segment_volume(
            &volume,
            &PipelineConfig::default(),
            &mut backend,
            &TickClock::default(),
        )
        .unwrap();
        assert_eq!(backend.seen_samples, vec![3]);
        assert_eq!(labels.shape(), [1, 1, 1, 4, 4]);
    }

    #[test]
    fn scaled_labels_return_to_full_size() {
        let volume = volume("YX", &[16, 8]);
        let config = PipelineConfig {
            scale_factor: 0.5,
            ..PipelineConfig::default()
        };
        let mut backend = TagSegmenter::default();
        let (labels, diagnostics) =
            segment_volume(&volume, &config, &mut backend, &TickClock::default()).unwrap();
        assert_eq!(labels.shape(), [1, 1, 1, 16, 8]);
        assert_eq!(diagnostics.slices[0].inference_size, (8, 4));
        assert!(labels.plane(0, 0, 0).iter().all(|&v| v == 1));
    }

    #[test]
    fn mismatched_labels_are_clipped_not_fatal() {
        let volume = volume("YX", &[4, 4]);
        let mut backend = TagSegmenter {
            shape_override: Some((2, 6)),
            ..TagSegmenter::default()
        };
        let (labels, diagnostics) = segment_volume(
            &volume,
            &PipelineConfig::default(),
            &mut backend,
            &TickClock::default(),
        )
        .unwrap();
        assert_eq!(diagnostics.clipped_count(), 1);
        assert_eq!(labels.plane(0, 0, 0)[[1, 3]], 1);
        assert_eq!(labels.plane(0, 0, 0)[[2, 0]], 0);
    }

    #[test]
    fn backend_failure_names_the_slice() {
        let volume = volume("ZYX", &[3, 4, 4]);
        let failing = SliceIndex { t: 0, z: 1, c: 0 };
        let mut backend = TagSegmenter {
            fail_on: Some(failing),
            ..TagSegmenter::default()
        };
        let err = segment_volume(
            &volume,
            &PipelineConfig::default(),
            &mut backend,
            &TickClock::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Segment { index, .. } if index == failing));
        assert_eq!(backend.calls.len(), 2);
    }

    #[test]
    fn progress_is_reported_per_slice() {
        let volume = volume("ZYX", &[3, 4, 4]);
        let mut seen = Vec::new();
        segment_volume_with_progress(
            &volume,
            &PipelineConfig::default(),
            &mut TagSegmenter::default(),
            &TickClock::default(),
            |p| seen.push((p.done, p.total)),
        )
        .unwrap();
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[test]
    fn invalid_config_fails_before_segmenting() {
        let volume = volume("YX", &[4, 4]);
        let config = PipelineConfig {
            scale_factor: 0.0,
            ..PipelineConfig::default()
        };
        let mut backend = TagSegmenter::default();
        assert!(segment_volume(&volume, &config, &mut backend, &TickClock::default()).is_err());
        assert!(backend.calls.is_empty());
    }
}
