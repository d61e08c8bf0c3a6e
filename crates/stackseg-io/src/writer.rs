//! TIFF encoding: OME-TIFF label volumes and single-slice model inputs.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use stackseg_pipeline::{Axes, Axis, LabelVolume, Slice};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tracing::debug;

use crate::error::IoError;
use crate::ome::{self, OmeImage, OmePixels, PixelType};

/// What [`write_labels`] put on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenLabels {
    /// Axis order of the stored array.
    pub axes: Axes,
    /// Stored pixel type.
    pub pixel_type: PixelType,
    /// Number of TIFF pages.
    pub pages: usize,
}

/// The axis order a label volume is stored in.
///
/// Normally [`Axes::output_axes`] of the input. When the label volume has
/// an axis longer than 1 that order would drop (a two-sample input whose
/// samples were segmented as channels), the present axes are listed in
/// canonical order instead.
#[must_use]
pub fn label_axes(input: &Axes, shape: [usize; 5]) -> Axes {
    let preferred = input.output_axes();
    let canonical = Axes::canonical();
    let needed = |axis: &Axis| {
        canonical
            .position(*axis)
            .is_some_and(|slot| shape[slot] > 1)
    };
    if canonical.as_slice().iter().filter(|a| needed(*a)).all(|a| preferred.contains(*a)) {
        return preferred;
    }
    let letters: String = canonical
        .as_slice()
        .iter()
        .filter(|a| matches!(a, Axis::Y | Axis::X) || needed(*a) || preferred.contains(**a))
        .map(|a| a.letter())
        .collect();
    Axes::parse(&letters).unwrap_or(canonical)
}

/// Write a label volume as OME-TIFF.
///
/// One page per `YX` plane in the stored axis order, `uint16` when the
/// largest label fits, `uint32` otherwise. The OME-XML goes into the
/// first page's `ImageDescription`.
///
/// # Errors
///
/// Returns [`IoError`] when the file cannot be created or encoded.
pub fn write_labels(
    path: &Path,
    labels: &LabelVolume,
    input_axes: &Axes,
    name: &str,
) -> Result<WrittenLabels, IoError> {
    let shape = labels.shape();
    let [size_t, size_z, size_c, height, width] = shape;
    let axes = label_axes(input_axes, shape);
    let data = labels.to_axes(&axes).map_err(|e| IoError::axes(path, e))?;

    let pixel_type = if labels.max_label() <= u32::from(u16::MAX) {
        PixelType::Uint16
    } else {
        PixelType::Uint32
    };
    let description = ome::to_ome_xml(&OmeImage {
        name,
        pixels: OmePixels {
            dimension_order: axes.ome_dimension_order(),
            size_x: width,
            size_y: height,
            size_z,
            size_c,
            size_t,
        },
        pixel_type,
    });

    let (w, h) = page_size(path, width, height)?;
    let pages = size_t * size_z * size_c;
    match pixel_type {
        PixelType::Uint16 => {
            let pixels: Vec<u16> = data
                .iter()
                .map(|&v| u16::try_from(v).unwrap_or(u16::MAX))
                .collect();
            encode_pages::<colortype::Gray16>(path, w, h, Some(&description), &pixels)?;
        }
        PixelType::Uint32 => {
            let pixels: Vec<u32> = data.iter().copied().collect();
            encode_pages::<colortype::Gray32>(path, w, h, Some(&description), &pixels)?;
        }
    }

    debug!(path = %path.display(), %axes, ?pixel_type, pages, "wrote labels");
    Ok(WrittenLabels {
        axes,
        pixel_type,
        pages,
    })
}

/// Write one slice as a single-page float TIFF: gray for one sample,
/// RGB for three.
///
/// # Errors
///
/// Returns [`IoError::Unsupported`] for other sample counts and other
/// [`IoError`]s when encoding fails.
pub fn write_slice(path: &Path, slice: &Slice) -> Result<(), IoError> {
    let (w, h) = page_size(path, slice.width(), slice.height())?;
    match slice.samples() {
        1 => {
            let pixels: Vec<f32> = slice.plane(0).iter().copied().collect();
            encode_pages::<colortype::Gray32Float>(path, w, h, None, &pixels)
        }
        3 => {
            // Samples are interleaved per pixel.
            let interleaved = slice.data().view().permuted_axes([1, 2, 0]);
            let pixels: Vec<f32> = interleaved.iter().copied().collect();
            encode_pages::<colortype::RGB32Float>(path, w, h, None, &pixels)
        }
        n => Err(IoError::Unsupported {
            path: path.to_path_buf(),
            detail: format!("{n} samples per pixel"),
        }),
    }
}

fn page_size(path: &Path, width: usize, height: usize) -> Result<(u32, u32), IoError> {
    let too_large = || IoError::Unsupported {
        path: path.to_path_buf(),
        detail: format!("{width}x{height} page"),
    };
    Ok((
        u32::try_from(width).map_err(|_| too_large())?,
        u32::try_from(height).map_err(|_| too_large())?,
    ))
}

/// Encode `pixels` as consecutive pages of `width x height`.
fn encode_pages<C>(
    path: &Path,
    width: u32,
    height: u32,
    description: Option<&str>,
    pixels: &[C::Inner],
) -> Result<(), IoError>
where
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let file = File::create(path).map_err(|e| IoError::file(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(|e| IoError::tiff(path, e))?;

    let page_len = (width as usize * height as usize * C::BITS_PER_SAMPLE.len()).max(1);
    for (page, chunk) in pixels.chunks(page_len).enumerate() {
        let mut image = encoder
            .new_image::<C>(width, height)
            .map_err(|e| IoError::tiff(path, e))?;
        if page == 0
            && let Some(text) = description
        {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, text)
                .map_err(|e| IoError::tiff(path, e))?;
        }
        image.write_data(chunk).map_err(|e| IoError::tiff(path, e))?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ndarray::{Array2, Array3};
    use tempfile::TempDir;

    use super::*;
    use crate::reader::{AxesSource, read_label_plane, read_volume};

    fn labelled(shape: [usize; 5], max: u32) -> LabelVolume {
        let mut labels = LabelVolume::zeros(shape);
        for (i, v) in labels.data_mut().iter_mut().enumerate() {
            *v = u32::try_from(i).unwrap() % max;
        }
        labels
    }

    #[test]
    fn labels_round_trip_through_ome() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.tif");
        let labels = labelled([1, 3, 2, 4, 5], 1000);
        let input = Axes::parse("ZCYX").unwrap();

        let written = write_labels(&path, &labels, &input, "labels.tif").unwrap();
        assert_eq!(written.axes, input);
        assert_eq!(written.pixel_type, PixelType::Uint16);
        assert_eq!(written.pages, 6);

        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.source, AxesSource::Ome);
        assert_eq!(image.axes.to_string(), "TZCYX");
        assert_eq!(image.data.shape(), &[1, 3, 2, 4, 5]);
        let expected = labels.data().mapv(|v| v as f32).into_dyn();
        assert_eq!(image.data, expected);
    }

    #[test]
    fn large_labels_use_uint32() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.tif");
        let mut labels = LabelVolume::zeros([1, 1, 1, 2, 2]);
        labels.data_mut()[[0, 0, 0, 1, 1]] = 70_000;
        let written = write_labels(&path, &labels, &Axes::parse("YX").unwrap(), "big").unwrap();
        assert_eq!(written.pixel_type, PixelType::Uint32);
        assert_eq!(read_label_plane(&path).unwrap()[[1, 1]], 70_000);
    }

    #[test]
    fn samples_axis_is_dropped_from_output() {
        let axes = Axes::parse("ZYXS").unwrap();
        assert_eq!(label_axes(&axes, [1, 4, 1, 8, 8]).to_string(), "ZYX");
    }

    #[test]
    fn uncovered_channels_fall_back_to_canonical_order() {
        let axes = Axes::parse("YXS").unwrap();
        assert_eq!(label_axes(&axes, [1, 1, 2, 8, 8]).to_string(), "CYX");
    }

    #[test]
    fn gray_slice_is_written_as_float() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slice.tif");
        let plane = Array2::from_shape_fn((3, 4), |(y, x)| (y * 4 + x) as f32 / 10.0);
        write_slice(&path, &Slice::from_plane(plane)).unwrap();
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.data.shape(), &[3, 4]);
        assert!((image.data[[2, 3]] - 1.1).abs() < 1e-6);
    }

    #[test]
    fn rgb_slice_is_interleaved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rgb.tif");
        let data = Array3::from_shape_fn((3, 2, 2), |(s, y, x)| (s * 100 + y * 2 + x) as f32);
        write_slice(&path, &Slice::new(data)).unwrap();
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.axes.to_string(), "YXS");
        assert!((image.data[[1, 0, 2]] - 202.0).abs() < f32::EPSILON);
    }

    #[test]
    fn two_sample_slice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("two.tif");
        let slice = Slice::new(Array3::zeros((2, 2, 2)));
        assert!(matches!(
            write_slice(&path, &slice),
            Err(IoError::Unsupported { .. })
        ));
    }
}
