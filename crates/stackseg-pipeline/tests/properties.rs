#![allow(clippy::unwrap_used)]

use std::cell::Cell;
use std::time::Duration;

use ndarray::{Array2, ArrayD, IxDyn};
use proptest::prelude::*;
use stackseg_pipeline::diagnostics::Clock;
use stackseg_pipeline::{
    Axes, Axis, LabelPlane, Modality, OutputLayout, PipelineConfig, SegmentError, Segmenter,
    Selection, Slice, SliceIndex, SlicePlan, Volume, segment_volume,
};

struct CountingClock(Cell<u64>);

impl Clock for CountingClock {
    type Instant = u64;

    fn now(&self) -> u64 {
        let t = self.0.get();
        self.0.set(t + 1);
        t
    }

    fn elapsed(&self, since: &u64) -> Duration {
        Duration::from_micros(self.0.get() - since)
    }
}

/// Labels every foreground slice with 1.
struct OnesSegmenter;

impl Segmenter for OnesSegmenter {
    fn name(&self) -> &'static str {
        "ones"
    }

    fn segment(&mut self, slice: &Slice, _index: SliceIndex) -> Result<LabelPlane, SegmentError> {
        Ok(Array2::ones((slice.height(), slice.width())))
    }
}

/// A random ordering of `Y`, `X` and any subset of `T`, `Z`, `C`.
fn axis_order() -> impl Strategy<Value = Vec<Axis>> {
    proptest::sample::subsequence(vec![Axis::T, Axis::Z, Axis::C], 0..=3).prop_flat_map(|mut axes| {
        axes.extend([Axis::Y, Axis::X]);
        Just(axes).prop_shuffle()
    })
}

fn selection(max: usize) -> impl Strategy<Value = Selection> {
    prop_oneof![
        Just(Selection::All),
        prop::collection::vec(0..max + 2, 1..4).prop_map(Selection::indices),
    ]
}

fn axes_of(order: &[Axis]) -> Axes {
    let text: String = order.iter().map(|a| a.letter()).collect();
    Axes::parse(&text).unwrap()
}

proptest! {
    #[test]
    fn normalization_preserves_every_value(
        order in axis_order(),
        sizes in prop::collection::vec(1_usize..4, 5),
    ) {
        let shape: Vec<usize> = sizes[..order.len()].to_vec();
        let len: usize = shape.iter().product();
        let data = ArrayD::from_shape_vec(IxDyn(&shape), (0..len).collect::<Vec<usize>>()).unwrap();
        let axes = axes_of(&order);

        let canonical = axes.normalize(data.clone()).unwrap();
        prop_assert_eq!(canonical.len(), len);
        for (axis, &n) in order.iter().zip(&shape) {
            let slot = CANONICAL_SLOTS.iter().position(|a| a == axis).unwrap();
            prop_assert_eq!(canonical.shape()[slot], n);
        }

        let back = axes.from_canonical(canonical).unwrap();
        prop_assert_eq!(back, data);
    }

    #[test]
    fn dimension_order_is_a_permutation_of_xyzct(order in axis_order()) {
        let dims = axes_of(&order).output_axes().ome_dimension_order();
        prop_assert!(dims.starts_with("XY"));
        let mut letters: Vec<char> = dims.chars().collect();
        letters.sort_unstable();
        prop_assert_eq!(letters, vec!['C', 'T', 'X', 'Y', 'Z']);
    }

    #[test]
    fn plan_covers_the_cross_product(
        nt in 1_usize..4,
        nz in 1_usize..5,
        nc in 1_usize..4,
        t in selection(3),
        z in selection(4),
        c in selection(3),
    ) {
        let selections = stackseg_pipeline::slices::Selections {
            time_points: t.clone(),
            z_slices: z.clone(),
            channels: c.clone(),
        };
        let plan = SlicePlan::new([nt, nz, nc, 2, 2], &selections, OutputLayout::Compact, Modality::Grayscale);
        let expected = t.resolve(nt).len() * z.resolve(nz).len() * c.resolve(nc).len();
        prop_assert_eq!(plan.len(), expected);
        prop_assert_eq!(plan.iter().count(), expected);
        for index in plan.iter() {
            prop_assert!(index.t < nt && index.z < nz && index.c < nc);
            prop_assert!(plan.destination(index).is_some());
        }
    }

    #[test]
    fn unselected_positions_stay_background(
        nz in 1_usize..5,
        nc in 1_usize..4,
        z in selection(4),
        c in selection(3),
    ) {
        let len = nz * nc * 3 * 3;
        #[allow(clippy::cast_precision_loss)]
        let data = ArrayD::from_shape_vec(IxDyn(&[nz, nc, 3, 3]), (0..len).map(|v| v as f32).collect()).unwrap();
        let volume = Volume::new(data, Axes::parse("ZCYX").unwrap()).unwrap();
        let config = PipelineConfig {
            z_slices: z.clone(),
            channels: c.clone(),
            layout: OutputLayout::Full,
            ..PipelineConfig::default()
        };
        let (labels, _) = segment_volume(&volume, &config, &mut OnesSegmenter, &CountingClock(Cell::new(0))).unwrap();
        prop_assert_eq!(labels.shape(), [1, nz, nc, 3, 3]);

        let zs = z.resolve(nz);
        let cs = c.resolve(nc);
        for zi in 0..nz {
            for ci in 0..nc {
                let selected = zs.contains(&zi) && cs.contains(&ci);
                let plane = labels.plane(0, zi, ci);
                prop_assert!(plane.iter().all(|&v| v == u32::from(selected)));
            }
        }
    }
}

const CANONICAL_SLOTS: [Axis; 5] = [Axis::T, Axis::Z, Axis::C, Axis::Y, Axis::X];
