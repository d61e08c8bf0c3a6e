//! Axis strings and canonical 5D normalization.
//!
//! Microscopy files store their dimensions in many different orders
//! (`ZYX`, `CZYX`, `TZCYX`, `YXS`, ...). Everything downstream of the
//! reader works on a single canonical order, `TZCYX`, so the slicing loop
//! never has to branch on layout.
//!
//! Normalization:
//!
//! 1. checks the axis string against the array rank,
//! 2. folds the RGB samples axis `S` into the channel axis `C`,
//! 3. reorders the present axes into `T, Z, C, Y, X`,
//! 4. inserts length-1 axes for the missing ones.
//!
//! [`Axes::from_canonical`] runs the same steps backwards so label volumes
//! can be written in the order the input arrived in.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array5, ArrayD, Axis as ArrayAxis, Ix5};
use serde::{Deserialize, Serialize};

/// One named image dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Horizontal plane axis.
    X,
    /// Vertical plane axis.
    Y,
    /// Focal plane.
    Z,
    /// Fluorescence channel.
    C,
    /// Time point.
    T,
    /// Interleaved color samples (RGB).
    S,
}

impl Axis {
    /// The upper-case letter used in axis strings.
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
            Self::C => 'C',
            Self::T => 'T',
            Self::S => 'S',
        }
    }

    /// Parse a single axis letter (case-insensitive).
    #[must_use]
    pub const fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'X' => Some(Self::X),
            'Y' => Some(Self::Y),
            'Z' => Some(Self::Z),
            'C' => Some(Self::C),
            'T' => Some(Self::T),
            'S' => Some(Self::S),
            _ => None,
        }
    }

    /// The canonical slot this axis occupies once `S` is folded into `C`.
    const fn canonical_slot(self) -> usize {
        match self {
            Self::T => 0,
            Self::Z => 1,
            Self::C | Self::S => 2,
            Self::Y => 3,
            Self::X => 4,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// The canonical axis order used by [`crate::Volume`] and
/// [`crate::LabelVolume`].
pub const CANONICAL: [Axis; 5] = [Axis::T, Axis::Z, Axis::C, Axis::Y, Axis::X];

/// Errors from parsing axis strings or reshaping arrays with them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AxisError {
    /// The axis string contained no letters.
    #[error("axis string is empty")]
    Empty,

    /// A letter outside `XYZCTS` was found.
    #[error("unknown axis '{0}'")]
    Unknown(char),

    /// The same axis was named twice.
    #[error("axis '{0}' appears more than once")]
    Duplicate(char),

    /// Both plane axes are required.
    #[error("axis string '{0}' must contain both Y and X")]
    MissingPlane(String),

    /// The axis string does not describe an array of this rank.
    #[error("axis string '{axes}' names {expected} axes but the array has rank {rank}")]
    RankMismatch {
        /// The offending axis string.
        axes: String,
        /// Number of axes in the string.
        expected: usize,
        /// Rank of the array.
        rank: usize,
    },

    /// No heuristic applies to an array of this rank.
    #[error("cannot infer an axis order for an array of rank {0}")]
    Uninferable(usize),

    /// Channels and color samples cannot both be folded into `C`.
    #[error("both C ({channels}) and S ({samples}) carry more than one entry")]
    ChannelConflict {
        /// Length of the `C` axis.
        channels: usize,
        /// Length of the `S` axis.
        samples: usize,
    },

    /// A canonical axis absent from the target order had length > 1.
    #[error("axis {axis} of length {len} is not part of '{target}'")]
    NotSqueezable {
        /// The canonical axis that would be dropped.
        axis: Axis,
        /// Its length.
        len: usize,
        /// The requested target order.
        target: String,
    },
}

/// An ordered, duplicate-free axis string such as `"CZYX"`.
///
/// Serialized as its string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Axes(Vec<Axis>);

impl Axes {
    /// Parse an axis string (case-insensitive, surrounding whitespace
    /// ignored).
    ///
    /// # Errors
    ///
    /// Returns [`AxisError::Empty`], [`AxisError::Unknown`],
    /// [`AxisError::Duplicate`] or [`AxisError::MissingPlane`].
    pub fn parse(text: &str) -> Result<Self, AxisError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AxisError::Empty);
        }

        let mut axes = Vec::with_capacity(trimmed.len());
        for letter in trimmed.chars() {
            let axis = Axis::from_letter(letter).ok_or(AxisError::Unknown(letter))?;
            if axes.contains(&axis) {
                return Err(AxisError::Duplicate(axis.letter()));
            }
            axes.push(axis);
        }

        if !axes.contains(&Axis::Y) || !axes.contains(&Axis::X) {
            return Err(AxisError::MissingPlane(trimmed.to_ascii_uppercase()));
        }
        Ok(Self(axes))
    }

    /// The canonical `TZCYX` order.
    #[must_use]
    pub fn canonical() -> Self {
        Self(CANONICAL.to_vec())
    }

    /// Guess an axis order from the array shape alone.
    ///
    /// Only used when the file carries no axis metadata:
    ///
    /// | rank | guess |
    /// |------|-------|
    /// | 2 | `YX` |
    /// | 3 | `YXS` if the last dimension is 3 or 4, else `ZYX` |
    /// | 4 | `ZYXS` if the last dimension is 3 or 4, else `CZYX` |
    /// | 5 | `TZCYX` |
    ///
    /// # Errors
    ///
    /// Returns [`AxisError::Uninferable`] for any other rank.
    pub fn infer(shape: &[usize]) -> Result<Self, AxisError> {
        let rgb_last = matches!(shape.last(), Some(3 | 4));
        let guess = match shape.len() {
            2 => "YX",
            3 if rgb_last => "YXS",
            3 => "ZYX",
            4 if rgb_last => "ZYXS",
            4 => "CZYX",
            5 => "TZCYX",
            rank => return Err(AxisError::Uninferable(rank)),
        };
        Self::parse(guess)
    }

    /// Number of axes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false`: a parsed axis string contains at least `Y` and `X`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The axes in order.
    #[must_use]
    pub fn as_slice(&self) -> &[Axis] {
        &self.0
    }

    /// Position of `axis` in this order, if present.
    #[must_use]
    pub fn position(&self, axis: Axis) -> Option<usize> {
        self.0.iter().position(|&a| a == axis)
    }

    /// Whether `axis` is present.
    #[must_use]
    pub fn contains(&self, axis: Axis) -> bool {
        self.0.contains(&axis)
    }

    /// Reorder `data` (laid out in this axis order) into canonical `TZCYX`.
    ///
    /// # Errors
    ///
    /// Returns [`AxisError::RankMismatch`] when the array rank differs from
    /// the number of axes, and [`AxisError::ChannelConflict`] when both `C`
    /// and `S` have more than one entry.
    pub fn normalize<T: Clone>(&self, data: ArrayD<T>) -> Result<Array5<T>, AxisError> {
        if data.ndim() != self.len() {
            return Err(self.rank_mismatch(data.ndim()));
        }

        let mut order = self.0.clone();
        let mut data = data;

        // Only one of C and S can survive into the channel slot.
        if let (Some(c), Some(s)) = (self.position(Axis::C), self.position(Axis::S)) {
            let (channels, samples) = (data.len_of(ArrayAxis(c)), data.len_of(ArrayAxis(s)));
            let drop = match (channels, samples) {
                (_, 1) => s,
                (1, _) => c,
                _ => return Err(AxisError::ChannelConflict { channels, samples }),
            };
            data = data.index_axis_move(ArrayAxis(drop), 0);
            order.remove(drop);
        }

        let mut present: Vec<(usize, usize)> = order
            .iter()
            .enumerate()
            .map(|(source, axis)| (axis.canonical_slot(), source))
            .collect();
        present.sort_unstable();
        let permutation: Vec<usize> = present.iter().map(|&(_, source)| source).collect();
        let mut data = data.permuted_axes(permutation);

        for slot in 0..CANONICAL.len() {
            if !present.iter().any(|&(s, _)| s == slot) {
                data = data.insert_axis(ArrayAxis(slot));
            }
        }

        let data = data
            .into_dimensionality::<Ix5>()
            .map_err(|_| self.rank_mismatch(self.len()))?;
        Ok(data.as_standard_layout().into_owned())
    }

    /// Reorder a canonical `TZCYX` array into this axis order.
    ///
    /// Canonical axes missing from `self` are dropped and must have
    /// length 1. An `S` axis in `self` takes the channel slot.
    ///
    /// # Errors
    ///
    /// Returns [`AxisError::NotSqueezable`] if a dropped axis has more
    /// than one entry.
    pub fn from_canonical<T: Clone>(&self, data: Array5<T>) -> Result<ArrayD<T>, AxisError> {
        let mut data = data.into_dyn();
        let mut kept = Vec::with_capacity(self.len());

        for (slot, axis) in CANONICAL.iter().enumerate().rev() {
            let wanted = self.0.iter().any(|a| a.canonical_slot() == slot);
            if wanted {
                kept.push(slot);
                continue;
            }
            let len = data.len_of(ArrayAxis(slot));
            if len != 1 {
                return Err(AxisError::NotSqueezable {
                    axis: *axis,
                    len,
                    target: self.to_string(),
                });
            }
            data = data.index_axis_move(ArrayAxis(slot), 0);
        }
        kept.reverse();

        let permutation: Vec<usize> = self
            .0
            .iter()
            .filter_map(|axis| kept.iter().position(|&slot| slot == axis.canonical_slot()))
            .collect();
        if permutation.len() != kept.len() {
            return Err(self.rank_mismatch(kept.len()));
        }
        let data = data.permuted_axes(permutation);
        Ok(data.as_standard_layout().into_owned())
    }

    /// The order label volumes derived from this input are written in.
    ///
    /// The samples axis is dropped. The remaining order is kept when it
    /// ends in `YX` (one TIFF page per plane); otherwise the present axes
    /// are listed in canonical order.
    #[must_use]
    pub fn output_axes(&self) -> Self {
        let kept: Vec<Axis> = self.0.iter().copied().filter(|&a| a != Axis::S).collect();
        if kept.ends_with(&[Axis::Y, Axis::X]) {
            return Self(kept);
        }
        Self(CANONICAL.iter().copied().filter(|a| kept.contains(a)).collect())
    }

    /// The OME `DimensionOrder` attribute for an array in this order.
    ///
    /// OME lists axes fastest-varying first and always names all five
    /// of `X, Y, Z, C, T`; axes absent here are appended in `Z, C, T`
    /// order.
    #[must_use]
    pub fn ome_dimension_order(&self) -> String {
        let mut order = String::from("XY");
        for axis in self.0.iter().rev() {
            if matches!(axis, Axis::Z | Axis::C | Axis::T) {
                order.push(axis.letter());
            }
        }
        for axis in [Axis::Z, Axis::C, Axis::T] {
            if !order.contains(axis.letter()) {
                order.push(axis.letter());
            }
        }
        order
    }

    fn rank_mismatch(&self, rank: usize) -> AxisError {
        AxisError::RankMismatch {
            axes: self.to_string(),
            expected: self.len(),
            rank,
        }
    }
}

impl fmt::Display for Axes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for axis in &self.0 {
            write!(f, "{axis}")?;
        }
        Ok(())
    }
}

impl FromStr for Axes {
    type Err = AxisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Axes {
    type Error = AxisError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Axes> for String {
    fn from(value: Axes) -> Self {
        value.to_string()
    }
}
