//! Enumeration of the 2D slices a volume is segmented in.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::selection::{IndexMap, Selection};
use crate::volume::Modality;

/// Original `(t, z, c)` position of a slice in the canonical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceIndex {
    /// Time point.
    pub t: usize,
    /// Focal plane.
    pub z: usize,
    /// Channel.
    pub c: usize,
}

impl fmt::Display for SliceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t={} z={} c={}", self.t, self.z, self.c)
    }
}

/// Shape of the label volume relative to the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// Only selected time points, focal planes and channels occupy the
    /// output.
    #[default]
    Compact,
    /// The output has the input's shape; unselected positions stay
    /// background.
    Full,
}

/// The per-axis selections for one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selections {
    /// Time points.
    pub time_points: Selection,
    /// Focal planes.
    pub z_slices: Selection,
    /// Channels.
    pub channels: Selection,
}

/// Every slice to segment, plus where its result goes.
#[derive(Debug, Clone)]
pub struct SlicePlan {
    time: IndexMap,
    z: IndexMap,
    channel: IndexMap,
}

impl SlicePlan {
    /// Build the plan for a canonical `[T, Z, C, Y, X]` shape.
    ///
    /// In [`Modality::Color`] the samples of a slice are consumed
    /// together, so the channel axis contributes a single entry and the
    /// channel selection is ignored.
    #[must_use]
    pub fn new(
        shape: [usize; 5],
        selections: &Selections,
        layout: OutputLayout,
        modality: Modality,
    ) -> Self {
        let [nt, nz, nc, _, _] = shape;
        let build = |selection: &Selection, len: usize| {
            let selected = selection.resolve(len);
            match layout {
                OutputLayout::Compact => IndexMap::compact(selected, len.max(1)),
                OutputLayout::Full => IndexMap::identity(selected, len.max(1)),
            }
        };

        let channel = match modality {
            Modality::Grayscale => build(&selections.channels, nc),
            Modality::Color => IndexMap::compact(vec![0], 1),
        };

        Self {
            time: build(&selections.time_points, nt),
            z: build(&selections.z_slices, nz),
            channel,
        }
    }

    /// Number of slices: `|T| * |Z| * |C|`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.time.selected().len() * self.z.selected().len() * self.channel.selected().len()
    }

    /// Never `true`: every selection resolves to at least one index.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slices in processing order: time outermost, channel innermost.
    pub fn iter(&self) -> impl Iterator<Item = SliceIndex> + '_ {
        self.time.selected().iter().flat_map(move |&t| {
            self.z.selected().iter().flat_map(move |&z| {
                self.channel
                    .selected()
                    .iter()
                    .map(move |&c| SliceIndex { t, z, c })
            })
        })
    }

    /// Output `(t, z, c)` coordinates for a slice, if it is part of the plan.
    #[must_use]
    pub fn destination(&self, index: SliceIndex) -> Option<(usize, usize, usize)> {
        Some((
            self.time.get(index.t)?,
            self.z.get(index.z)?,
            self.channel.get(index.c)?,
        ))
    }

    /// Canonical shape of the label volume for planes of `height x width`.
    #[must_use]
    pub const fn output_shape(&self, height: usize, width: usize) -> [usize; 5] {
        [
            self.time.output_len(),
            self.z.output_len(),
            self.channel.output_len(),
            height,
            width,
        ]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn selections(t: &str, z: &str, c: &str) -> Selections {
        Selections {
            time_points: t.parse().unwrap(),
            z_slices: z.parse().unwrap(),
            channels: c.parse().unwrap(),
        }
    }

    #[test]
    fn all_selects_the_full_cross_product() {
        let plan = SlicePlan::new(
            [2, 3, 2, 8, 8],
            &Selections::default(),
            OutputLayout::Compact,
            Modality::Grayscale,
        );
        assert_eq!(plan.len(), 12);
        assert_eq!(plan.iter().count(), 12);
        assert_eq!(plan.output_shape(8, 8), [2, 3, 2, 8, 8]);
    }

    #[test]
    fn iteration_order_is_t_then_z_then_c() {
        let plan = SlicePlan::new(
            [2, 1, 2, 4, 4],
            &Selections::default(),
            OutputLayout::Compact,
            Modality::Grayscale,
        );
        let order: Vec<(usize, usize, usize)> = plan.iter().map(|i| (i.t, i.z, i.c)).collect();
        assert_eq!(order, vec![(0, 0, 0), (0, 0, 1), (1, 0, 0), (1, 0, 1)]);
    }

    #[test]
    fn compact_layout_maps_selected_channel_to_zero() {
        let plan = SlicePlan::new(
            [1, 4, 3, 4, 4],
            &selections("all", "1,3", "2"),
            OutputLayout::Compact,
            Modality::Grayscale,
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.output_shape(4, 4), [1, 2, 1, 4, 4]);
        assert_eq!(
            plan.destination(SliceIndex { t: 0, z: 3, c: 2 }),
            Some((0, 1, 0))
        );
        assert_eq!(plan.destination(SliceIndex { t: 0, z: 2, c: 2 }), None);
    }

    #[test]
    fn full_layout_keeps_input_shape() {
        let plan = SlicePlan::new(
            [1, 4, 3, 4, 4],
            &selections("all", "1,3", "2"),
            OutputLayout::Full,
            Modality::Grayscale,
        );
        assert_eq!(plan.output_shape(4, 4), [1, 4, 3, 4, 4]);
        assert_eq!(
            plan.destination(SliceIndex { t: 0, z: 3, c: 2 }),
            Some((0, 3, 2))
        );
    }

    #[test]
    fn invalid_channel_falls_back_to_synthetic_channel() {
        let plan = SlicePlan::new(
            [1, 1, 1, 4, 4],
            &selections("all", "all", "5"),
            OutputLayout::Compact,
            Modality::Grayscale,
        );
        let slices: Vec<SliceIndex> = plan.iter().collect();
        assert_eq!(slices, vec![SliceIndex { t: 0, z: 0, c: 0 }]);
    }

    #[test]
    fn color_modality_uses_one_channel_entry() {
        let plan = SlicePlan::new(
            [1, 2, 3, 4, 4],
            &selections("all", "all", "1,2"),
            OutputLayout::Full,
            Modality::Color,
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.output_shape(4, 4), [1, 2, 1, 4, 4]);
        assert!(plan.iter().all(|i| i.c == 0));
    }
}
