//! Per-slice timing and object counts.
//!
//! Every call to [`segment_volume`](crate::segment_volume) collects a
//! [`VolumeDiagnostics`] alongside the label volume. Time is read through
//! the [`Clock`] trait so this crate stays free of platform time sources.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reassemble::Placement;
use crate::slices::SliceIndex;
use crate::volume::Modality;

/// Source of monotonic timestamps.
pub trait Clock {
    /// Opaque timestamp type.
    type Instant;

    /// The current time.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Diagnostics for one segmented slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceDiagnostics {
    /// Original position of the slice.
    pub index: SliceIndex,
    /// Output position of its labels.
    pub destination: (usize, usize, usize),
    /// Plane size handed to the backend, after scaling.
    pub inference_size: (usize, usize),
    /// Objects found in the slice.
    pub object_count: usize,
    /// How the labels were written back.
    pub placement: Placement,
    /// Time spent in the backend.
    #[serde(with = "duration_serde")]
    pub segment_duration: Duration,
    /// Time for the whole slice including pre- and post-processing.
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

/// Diagnostics for one segmented volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeDiagnostics {
    /// Backend name.
    pub backend: String,
    /// Canonical input shape `[T, Z, C, Y, X]`.
    pub input_shape: [usize; 5],
    /// Canonical label volume shape.
    pub output_shape: [usize; 5],
    /// Detected modality.
    pub modality: Modality,
    /// One entry per slice, in processing order.
    pub slices: Vec<SliceDiagnostics>,
    /// Wall-clock duration of the whole volume.
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl VolumeDiagnostics {
    /// Objects found across all slices.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.slices.iter().map(|s| s.object_count).sum()
    }

    /// Slices whose labels did not match the destination shape.
    #[must_use]
    pub fn clipped_count(&self) -> usize {
        self.slices.iter().filter(|s| s.placement.clipped).count()
    }

    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Segmentation Report\n{}", "=".repeat(60)));
        lines.push(format!("Backend: {} ({:?})", self.backend, self.modality));
        lines.push(format!(
            "Input TZCYX: {:?}  Output TZCYX: {:?}",
            self.input_shape, self.output_shape
        ));
        lines.push(format!(
            "Slices: {}  Objects: {}  Clipped: {}",
            self.slices.len(),
            self.object_count(),
            self.clipped_count()
        ));
        lines.push(format!("Total duration: {:.3}ms", duration_ms(self.total_duration)));
        lines.push(String::new());

        lines.push(format!(
            "{:<20} {:>12} {:>10} {:>10}",
            "Slice", "Size", "Objects", "Segment"
        ));
        lines.push("-".repeat(60));
        for slice in &self.slices {
            let (h, w) = slice.inference_size;
            lines.push(format!(
                "{:<20} {:>12} {:>10} {:>8.1}ms",
                slice.index.to_string(),
                format!("{h}x{w}"),
                slice.object_count,
                duration_ms(slice.segment_duration),
            ));
        }

        lines.join("\n")
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> VolumeDiagnostics {
        let slice = |c: usize, objects: usize, clipped: bool| SliceDiagnostics {
            index: SliceIndex { t: 0, z: 0, c },
            destination: (0, 0, c),
            inference_size: (16, 16),
            object_count: objects,
            placement: Placement {
                rows: 16,
                cols: 16,
                clipped,
            },
            segment_duration: Duration::from_millis(5),
            total_duration: Duration::from_millis(7),
        };
        VolumeDiagnostics {
            backend: "threshold".to_owned(),
            input_shape: [1, 1, 2, 16, 16],
            output_shape: [1, 1, 2, 16, 16],
            modality: Modality::Grayscale,
            slices: vec![slice(0, 3, false), slice(1, 4, true)],
            total_duration: Duration::from_millis(20),
        }
    }

    #[test]
    fn totals_sum_over_slices() {
        let diagnostics = sample();
        assert_eq!(diagnostics.object_count(), 7);
        assert_eq!(diagnostics.clipped_count(), 1);
    }

    #[test]
    fn report_lists_every_slice() {
        let report = sample().report();
        assert!(report.contains("Backend: threshold"));
        assert!(report.contains("t=0 z=0 c=0"));
        assert!(report.contains("t=0 z=0 c=1"));
        assert!(report.contains("Objects: 7"));
    }

    #[test]
    fn durations_serialize_as_seconds() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!((json["total_duration"].as_f64().unwrap() - 0.02).abs() < 1e-9);
        let back: VolumeDiagnostics = serde_json::from_value(json).unwrap();
        assert_eq!(back.total_duration, Duration::from_millis(20));
    }

    #[test]
    fn negative_duration_is_rejected() {
        let mut json = serde_json::to_value(sample()).unwrap();
        json["total_duration"] = serde_json::json!(-1.0);
        assert!(serde_json::from_value::<VolumeDiagnostics>(json).is_err());
    }
}
