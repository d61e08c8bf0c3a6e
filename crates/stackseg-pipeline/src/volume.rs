//! Canonical image and label volumes and the slices cut from them.

use ndarray::{Array2, Array3, Array5, ArrayD, ArrayView2, Axis as ArrayAxis, s};
use serde::{Deserialize, Serialize};

use crate::axes::{Axes, AxisError, Axis};
use crate::slices::SliceIndex;

/// A 2D label image: 0 is background, every object has its own id.
pub type LabelPlane = Array2<u32>;

/// How the channel axis of a volume is turned into model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// One intensity plane per channel (fluorescence, or RGB data whose
    /// three samples are identical).
    #[default]
    Grayscale,
    /// Three distinct color samples that the model consumes together
    /// (e.g. H&E brightfield).
    Color,
}

/// An input image in canonical `TZCYX` order.
#[derive(Debug, Clone)]
pub struct Volume {
    data: Array5<f32>,
    axes: Axes,
    modality: Modality,
}

impl Volume {
    /// Normalize `data`, laid out in `axes` order, into a canonical volume.
    ///
    /// When `axes` carries an `S` axis with three or four samples, the
    /// alpha sample (if any) is dropped and [`detect_modality`] decides
    /// whether the samples collapse into a single grayscale channel.
    ///
    /// # Errors
    ///
    /// Propagates [`AxisError`] from [`Axes::normalize`].
    pub fn new(data: ArrayD<f32>, axes: Axes) -> Result<Self, AxisError> {
        let samples = axes
            .position(Axis::S)
            .and_then(|i| data.shape().get(i).copied())
            .unwrap_or(1);

        let mut canonical = axes.normalize(data)?;
        let mut modality = Modality::Grayscale;

        if samples >= 3 {
            canonical = canonical.slice_move(s![.., .., 0..3, .., ..]);
            modality = detect_modality(&canonical);
            if modality == Modality::Grayscale {
                canonical = canonical.slice_move(s![.., .., 0..1, .., ..]);
            }
        }

        Ok(Self {
            data: canonical.as_standard_layout().into_owned(),
            axes,
            modality,
        })
    }

    /// The canonical `[T, Z, C, Y, X]` shape.
    #[must_use]
    pub fn shape(&self) -> [usize; 5] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3], s[4]]
    }

    /// Plane height (`Y`).
    #[must_use]
    pub fn height(&self) -> usize {
        self.data.len_of(ArrayAxis(3))
    }

    /// Plane width (`X`).
    #[must_use]
    pub fn width(&self) -> usize {
        self.data.len_of(ArrayAxis(4))
    }

    /// The axis order the image was read in.
    #[must_use]
    pub const fn axes(&self) -> &Axes {
        &self.axes
    }

    /// Whether channels are segmented one at a time or together.
    #[must_use]
    pub const fn modality(&self) -> Modality {
        self.modality
    }

    /// The canonical data.
    #[must_use]
    pub const fn data(&self) -> &Array5<f32> {
        &self.data
    }

    /// Cut the model input for one slice.
    ///
    /// In [`Modality::Color`] the channel index is ignored and all three
    /// samples are returned.
    ///
    /// Returns `None` when the index is outside the volume.
    #[must_use]
    pub fn slice(&self, index: SliceIndex) -> Option<Slice> {
        let [nt, nz, nc, _, _] = self.shape();
        if index.t >= nt || index.z >= nz || index.c >= nc {
            return None;
        }
        let data = match self.modality {
            Modality::Grayscale => self
                .data
                .slice(s![index.t, index.z, index.c..=index.c, .., ..])
                .to_owned(),
            Modality::Color => self.data.slice(s![index.t, index.z, .., .., ..]).to_owned(),
        };
        Some(Slice { data })
    }
}

/// Decide whether three color samples are really one grayscale image.
///
/// `data` must carry at least three entries on the channel axis.
/// Returns [`Modality::Grayscale`] only if the first three channels are
/// identical everywhere.
#[must_use]
pub fn detect_modality(data: &Array5<f32>) -> Modality {
    if data.len_of(ArrayAxis(2)) < 3 {
        return Modality::Grayscale;
    }
    let red = data.index_axis(ArrayAxis(2), 0);
    let green = data.index_axis(ArrayAxis(2), 1);
    let blue = data.index_axis(ArrayAxis(2), 2);
    if red == green && red == blue {
        Modality::Grayscale
    } else {
        Modality::Color
    }
}

/// Model input for one `(t, z, c)` position: `(samples, Y, X)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice {
    data: Array3<f32>,
}

impl Slice {
    /// Wrap a `(samples, Y, X)` array.
    #[must_use]
    pub const fn new(data: Array3<f32>) -> Self {
        Self { data }
    }

    /// Single-sample slice from a 2D plane.
    #[must_use]
    pub fn from_plane(plane: Array2<f32>) -> Self {
        Self {
            data: plane.insert_axis(ArrayAxis(0)),
        }
    }

    /// Number of samples per pixel (1 or 3).
    #[must_use]
    pub fn samples(&self) -> usize {
        self.data.len_of(ArrayAxis(0))
    }

    /// Plane height.
    #[must_use]
    pub fn height(&self) -> usize {
        self.data.len_of(ArrayAxis(1))
    }

    /// Plane width.
    #[must_use]
    pub fn width(&self) -> usize {
        self.data.len_of(ArrayAxis(2))
    }

    /// One sample plane.
    #[must_use]
    pub fn plane(&self, sample: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(ArrayAxis(0), sample)
    }

    /// The `(samples, Y, X)` data.
    #[must_use]
    pub const fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Consume the slice and return its data.
    #[must_use]
    pub fn into_data(self) -> Array3<f32> {
        self.data
    }

    /// Single-plane intensity image.
    ///
    /// Three-sample slices use the standard luminance weights
    /// `0.299*R + 0.587*G + 0.114*B`; any other sample count is averaged.
    #[must_use]
    pub fn luminance(&self) -> Array2<f32> {
        match self.samples() {
            1 => self.plane(0).to_owned(),
            3 => {
                let mut out = self.plane(0).mapv(|r| 0.299 * r);
                out.scaled_add(0.587, &self.plane(1));
                out.scaled_add(0.114, &self.plane(2));
                out
            }
            _ => self
                .data
                .mean_axis(ArrayAxis(0))
                .unwrap_or_else(|| Array2::zeros((self.height(), self.width()))),
        }
    }
}

/// Segmentation output in canonical `TZCYX` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelVolume {
    data: Array5<u32>,
}

impl LabelVolume {
    /// An all-background volume.
    #[must_use]
    pub fn zeros(shape: [usize; 5]) -> Self {
        Self {
            data: Array5::zeros(shape),
        }
    }

    /// Wrap labels already in canonical order.
    #[must_use]
    pub const fn from_canonical(data: Array5<u32>) -> Self {
        Self { data }
    }

    /// The canonical `[T, Z, C, Y, X]` shape.
    #[must_use]
    pub fn shape(&self) -> [usize; 5] {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3], s[4]]
    }

    /// Objects counted plane by plane: the distinct non-zero ids of every
    /// `YX` plane, summed. An object spanning two planes counts twice.
    #[must_use]
    pub fn object_count(&self) -> usize {
        let mut ids = Vec::new();
        let mut total = 0;
        for stack in self.data.outer_iter() {
            for planes in stack.outer_iter() {
                for plane in planes.outer_iter() {
                    ids.clear();
                    ids.extend(plane.iter().copied().filter(|&id| id != 0));
                    ids.sort_unstable();
                    ids.dedup();
                    total += ids.len();
                }
            }
        }
        total
    }

    /// The canonical data.
    #[must_use]
    pub const fn data(&self) -> &Array5<u32> {
        &self.data
    }

    /// Mutable access for reassembly.
    pub const fn data_mut(&mut self) -> &mut Array5<u32> {
        &mut self.data
    }

    /// Largest label id (0 for an empty volume).
    #[must_use]
    pub fn max_label(&self) -> u32 {
        self.data.iter().copied().max().unwrap_or(0)
    }

    /// One `YX` label plane.
    #[must_use]
    pub fn plane(&self, t: usize, z: usize, c: usize) -> ArrayView2<'_, u32> {
        self.data.slice(s![t, z, c, .., ..])
    }

    /// Reorder into `axes` (see [`Axes::from_canonical`]).
    ///
    /// # Errors
    ///
    /// Propagates [`AxisError::NotSqueezable`].
    pub fn to_axes(&self, axes: &Axes) -> Result<ArrayD<u32>, AxisError> {
        axes.from_canonical(self.data.clone())
    }
}
