//! Writing per-slice results into the label volume.

use ndarray::{ArrayView2, s};
use serde::{Deserialize, Serialize};

use crate::types::PipelineError;
use crate::volume::LabelVolume;

/// How a label plane was written into its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    /// Rows copied.
    pub rows: usize,
    /// Columns copied.
    pub cols: usize,
    /// `true` when the plane and the destination differed in shape and
    /// only their overlap was copied.
    pub clipped: bool,
}

/// Copy `plane` into `volume` at output coordinates `(t, z, c)`.
///
/// Only the overlap of the plane and the destination is written. A
/// smaller plane leaves the rest of the destination as background, a
/// larger one is cut off; neither is an error.
///
/// # Errors
///
/// Returns [`PipelineError::DestinationOutOfBounds`] when `(t, z, c)` is
/// outside the volume.
pub fn place(
    volume: &mut LabelVolume,
    (t, z, c): (usize, usize, usize),
    plane: ArrayView2<'_, u32>,
) -> Result<Placement, PipelineError> {
    let shape = volume.shape();
    let [nt, nz, nc, height, width] = shape;
    if t >= nt || z >= nz || c >= nc {
        return Err(PipelineError::DestinationOutOfBounds { t, z, c, shape });
    }

    let (src_rows, src_cols) = plane.dim();
    let rows = src_rows.min(height);
    let cols = src_cols.min(width);

    volume
        .data_mut()
        .slice_mut(s![t, z, c, ..rows, ..cols])
        .assign(&plane.slice(s![..rows, ..cols]));

    Ok(Placement {
        rows,
        cols,
        clipped: (src_rows, src_cols) != (height, width),
    })
}
