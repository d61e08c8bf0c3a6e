//! stackseg-pipeline: slice-wise segmentation of N-D microscopy volumes (sans-IO).
//!
//! Turns an N-D intensity array into a label volume of the same layout:
//! axis normalization -> slice planning -> per-slice normalization and
//! scaling -> 2D segmentation (pluggable backend) -> reassembly.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! arrays and returns structured data. TIFF decoding, model commands and
//! the job workflow live in `stackseg-io`.

pub mod axes;
pub mod diagnostics;
pub mod normalize;
pub mod pipeline;
pub mod reassemble;
pub mod scale;
pub mod segment;
pub mod selection;
pub mod slices;
pub mod types;
pub mod volume;

pub use axes::{Axes, Axis, AxisError};
pub use pipeline::{Progress, segment_volume, segment_volume_with_progress};
pub use scale::ScaleFilter;
pub use segment::{SegmentError, Segmenter, ThresholdSegmenter};
pub use selection::Selection;
pub use slices::{OutputLayout, SliceIndex, SlicePlan};
pub use types::{PipelineConfig, PipelineError};
pub use volume::{LabelPlane, LabelVolume, Modality, Slice, Volume};
