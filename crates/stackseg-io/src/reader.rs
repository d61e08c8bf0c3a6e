//! Multi-page TIFF decoding into N-D arrays.
//!
//! A TIFF stores a stack as a sequence of 2D pages (each optionally with
//! several samples per pixel). How those pages map onto `T`, `Z` and `C`
//! is recorded, if at all, in the first page's `ImageDescription`. The
//! axis order is resolved from, in order of precedence:
//!
//! 1. an explicit override,
//! 2. OME-XML (`DimensionOrder` with `Size*`),
//! 3. a tifffile-style JSON description (`shape`, optional `axes`),
//! 4. an ImageJ hyperstack description (`channels`, `slices`, `frames`),
//! 5. a guess: `ZYX` for stacks, `YX` for single pages, `S` appended for
//!    multi-sample pixels (the rules of [`Axes::infer`]).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::{Array2, ArrayD, IxDyn};
use stackseg_pipeline::{Axes, Axis, LabelPlane};
use tiff::ColorType;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::{debug, warn};

use crate::error::IoError;
use crate::ome;

/// A decoded image and the axis order of its array.
#[derive(Debug, Clone)]
pub struct RawImage {
    /// Pixel values, shaped according to `axes`.
    pub data: ArrayD<f32>,
    /// Axis order of `data`.
    pub axes: Axes,
    /// Where the axis order came from.
    pub source: AxesSource,
}

/// Which rule supplied the axis order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxesSource {
    /// Given by the caller.
    Override,
    /// OME-XML metadata.
    Ome,
    /// tifffile JSON description.
    Shaped,
    /// ImageJ hyperstack description.
    ImageJ,
    /// Inferred from the array rank.
    Inferred,
}

/// Decoded pages of one file.
struct Pages {
    width: usize,
    height: usize,
    samples: usize,
    count: usize,
    values: Vec<f32>,
    description: Option<String>,
}

/// Read every page of a TIFF into an array.
///
/// # Errors
///
/// Returns [`IoError`] when the file cannot be decoded, its pages
/// disagree in shape, or no axis order accounts for the page count.
pub fn read_volume(path: &Path, axes_override: Option<&Axes>) -> Result<RawImage, IoError> {
    let pages = read_pages(path)?;
    let plane: Vec<usize> = if pages.samples > 1 {
        vec![pages.height, pages.width, pages.samples]
    } else {
        vec![pages.height, pages.width]
    };

    let described = pages
        .description
        .as_deref()
        .and_then(|text| describe(text, &pages, &plane));

    let (axes, shape, source) = match (axes_override, described) {
        (Some(axes), Some((_, shape, _))) if shape.len() == axes.len() => {
            (axes.clone(), shape, AxesSource::Override)
        }
        (Some(axes), _) => (
            axes.clone(),
            override_shape(path, axes, &pages, &plane)?,
            AxesSource::Override,
        ),
        (None, Some(described)) => described,
        (None, None) => {
            // Same guesses as `Axes::infer`, but the sample count is known.
            let mut letters = String::new();
            let mut shape = Vec::new();
            if pages.count > 1 {
                letters.push('Z');
                shape.push(pages.count);
            }
            letters.push_str(if pages.samples > 1 { "YXS" } else { "YX" });
            shape.extend(&plane);
            let axes = Axes::parse(&letters).map_err(|e| IoError::axes(path, e))?;
            (axes, shape, AxesSource::Inferred)
        }
    };

    let expected: usize = shape.iter().product::<usize>() / plane.iter().product::<usize>().max(1);
    if expected != pages.count || shape.iter().product::<usize>() != pages.values.len() {
        return Err(IoError::PageCount {
            path: path.to_path_buf(),
            pages: pages.count,
            axes: axes.to_string(),
            expected,
        });
    }

    debug!(
        path = %path.display(),
        %axes,
        ?shape,
        ?source,
        "decoded image"
    );
    let data = ArrayD::from_shape_vec(IxDyn(&shape), pages.values).map_err(|_| {
        IoError::PageCount {
            path: path.to_path_buf(),
            pages: pages.count,
            axes: axes.to_string(),
            expected,
        }
    })?;
    Ok(RawImage { data, axes, source })
}

/// Shape for an override without matching metadata: the page count goes
/// to the first non-plane axis, any others get length 1.
fn override_shape(
    path: &Path,
    axes: &Axes,
    pages: &Pages,
    plane: &[usize],
) -> Result<Vec<usize>, IoError> {
    let page_axes = axes
        .as_slice()
        .iter()
        .filter(|a| !matches!(a, Axis::Y | Axis::X | Axis::S))
        .count();
    let has_samples = axes.contains(Axis::S);
    let mut plane = plane.to_vec();
    if has_samples != (pages.samples > 1) {
        if has_samples {
            plane.push(1);
        } else {
            return Err(IoError::axes(
                path,
                stackseg_pipeline::AxisError::RankMismatch {
                    axes: axes.to_string(),
                    expected: axes.len(),
                    rank: plane.len() + usize::from(pages.count > 1),
                },
            ));
        }
    }

    let mut shape = Vec::with_capacity(axes.len());
    let mut counted = false;
    for axis in axes.as_slice() {
        match axis {
            Axis::Y => shape.push(plane[0]),
            Axis::X => shape.push(plane[1]),
            Axis::S => shape.push(plane.get(2).copied().unwrap_or(1)),
            _ if !counted => {
                shape.push(pages.count);
                counted = true;
            }
            _ => shape.push(1),
        }
    }
    if page_axes == 0 && pages.count > 1 {
        return Err(IoError::PageCount {
            path: path.to_path_buf(),
            pages: pages.count,
            axes: axes.to_string(),
            expected: 1,
        });
    }
    if page_axes > 1 {
        warn!(
            path = %path.display(),
            %axes,
            "no metadata sizes the page axes; assigning every page to the first"
        );
    }
    Ok(shape)
}

/// Resolve axes from the description text, if any rule applies.
fn describe(text: &str, pages: &Pages, plane: &[usize]) -> Option<(Axes, Vec<usize>, AxesSource)> {
    if let Some(pixels) = ome::parse(text) {
        if let Some((axes, shape)) = from_ome(&pixels, pages, plane) {
            return Some((axes, shape, AxesSource::Ome));
        }
        warn!("OME-XML sizes do not match the page count; ignoring them");
    }
    if let Some((axes, shape)) = from_shaped(text, pages) {
        return Some((axes, shape, AxesSource::Shaped));
    }
    from_imagej(text, pages, plane).map(|(axes, shape)| (axes, shape, AxesSource::ImageJ))
}

fn from_ome(pixels: &ome::OmePixels, pages: &Pages, plane: &[usize]) -> Option<(Axes, Vec<usize>)> {
    if (pixels.size_y, pixels.size_x) != (pages.height, pages.width) {
        return None;
    }
    let mut letters = String::new();
    let mut shape = Vec::new();
    for letter in pixels.page_axes().chars() {
        let mut size = pixels.size(letter)?;
        // RGB files count their samples as channels.
        if letter == 'C' && pages.samples > 1 && size == pages.samples {
            size = 1;
        }
        letters.push(letter);
        shape.push(size);
    }
    letters.push_str(if pages.samples > 1 { "YXS" } else { "YX" });
    shape.extend(plane);

    let page_count: usize = shape[..shape.len() - plane.len()].iter().product();
    if page_count != pages.count {
        return None;
    }
    Some((Axes::parse(&letters).ok()?, shape))
}

/// tifffile writes `{"shape": [...]}` (and sometimes `"axes"`) into the
/// description of files it creates from plain arrays.
fn from_shaped(text: &str, pages: &Pages) -> Option<(Axes, Vec<usize>)> {
    let value: serde_json::Value = serde_json::from_str(text.trim()).ok()?;
    let shape: Vec<usize> = value
        .get("shape")?
        .as_array()?
        .iter()
        .map(|v| v.as_u64().and_then(|n| usize::try_from(n).ok()))
        .collect::<Option<_>>()?;
    if shape.iter().product::<usize>() != pages.values.len() {
        return None;
    }
    let axes = match value.get("axes").and_then(serde_json::Value::as_str) {
        Some(text) => Axes::parse(text).ok()?,
        None => Axes::infer(&shape).ok()?,
    };
    (axes.len() == shape.len()).then_some((axes, shape))
}

/// ImageJ hyperstacks store pages in `TZC` order.
fn from_imagej(text: &str, pages: &Pages, plane: &[usize]) -> Option<(Axes, Vec<usize>)> {
    if !text.starts_with("ImageJ=") {
        return None;
    }
    let field = |key: &str| {
        text.lines()
            .filter_map(|line| line.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
    };

    let mut letters = String::new();
    let mut shape = Vec::new();
    for (letter, key) in [('T', "frames"), ('Z', "slices"), ('C', "channels")] {
        if let Some(n) = field(key).filter(|&n| n > 1) {
            letters.push(letter);
            shape.push(n);
        }
    }
    let page_count: usize = shape.iter().product();
    if page_count != pages.count {
        return None;
    }
    letters.push_str(if pages.samples > 1 { "YXS" } else { "YX" });
    shape.extend(plane);
    Some((Axes::parse(&letters).ok()?, shape))
}

fn open(path: &Path) -> Result<Decoder<BufReader<File>>, IoError> {
    let file = File::open(path).map_err(|e| IoError::file(path, e))?;
    Decoder::new(BufReader::new(file))
        .map(|decoder| decoder.with_limits(Limits::unlimited()))
        .map_err(|e| IoError::tiff(path, e))
}

fn samples_per_pixel(path: &Path, color: ColorType) -> Result<usize, IoError> {
    match color {
        ColorType::Gray(_) => Ok(1),
        ColorType::GrayA(_) => Ok(2),
        ColorType::RGB(_) | ColorType::YCbCr(_) => Ok(3),
        ColorType::RGBA(_) | ColorType::CMYK(_) => Ok(4),
        other => Err(IoError::Unsupported {
            path: path.to_path_buf(),
            detail: format!("color type {other:?}"),
        }),
    }
}

fn read_pages(path: &Path) -> Result<Pages, IoError> {
    let mut decoder = open(path)?;
    let description = decoder.get_tag_ascii_string(Tag::ImageDescription).ok();

    let mut first: Option<(usize, usize, usize)> = None;
    let mut values = Vec::new();
    let mut count = 0;
    loop {
        let (width, height) = decoder.dimensions().map_err(|e| IoError::tiff(path, e))?;
        let color = decoder.colortype().map_err(|e| IoError::tiff(path, e))?;
        let layout = (
            height as usize,
            width as usize,
            samples_per_pixel(path, color)?,
        );
        match first {
            None => first = Some(layout),
            Some(expected) if expected != layout => {
                return Err(IoError::InconsistentPages {
                    path: path.to_path_buf(),
                    page: count,
                });
            }
            Some(_) => {}
        }

        let page = decoder.read_image().map_err(|e| IoError::tiff(path, e))?;
        append_as_f32(path, &mut values, page)?;
        count += 1;

        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| IoError::tiff(path, e))?;
    }

    let (height, width, samples) = first.unwrap_or((0, 0, 1));
    Ok(Pages {
        width,
        height,
        samples,
        count,
        values,
        description,
    })
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn append_as_f32(path: &Path, values: &mut Vec<f32>, page: DecodingResult) -> Result<(), IoError> {
    match page {
        DecodingResult::U8(v) => values.extend(v.into_iter().map(f32::from)),
        DecodingResult::U16(v) => values.extend(v.into_iter().map(f32::from)),
        DecodingResult::U32(v) => values.extend(v.into_iter().map(|x| x as f32)),
        DecodingResult::U64(v) => values.extend(v.into_iter().map(|x| x as f32)),
        DecodingResult::I8(v) => values.extend(v.into_iter().map(f32::from)),
        DecodingResult::I16(v) => values.extend(v.into_iter().map(f32::from)),
        DecodingResult::I32(v) => values.extend(v.into_iter().map(|x| x as f32)),
        DecodingResult::I64(v) => values.extend(v.into_iter().map(|x| x as f32)),
        DecodingResult::F32(v) => values.extend(v),
        DecodingResult::F64(v) => values.extend(v.into_iter().map(|x| x as f32)),
        #[allow(unreachable_patterns)]
        _ => return Err(unsupported_samples(path)),
    }
    Ok(())
}

fn unsupported_samples(path: &Path) -> IoError {
    IoError::Unsupported {
        path: path.to_path_buf(),
        detail: "sample format".to_owned(),
    }
}

/// Read the first page of a single-channel label image.
///
/// Integer and float pixel types are accepted; float labels must be
/// whole, non-negative numbers.
///
/// # Errors
///
/// Returns [`IoError::Unsupported`] for multi-sample pages or values that
/// are not valid label ids, and other [`IoError`]s for decoding failures.
pub fn read_label_plane(path: &Path) -> Result<LabelPlane, IoError> {
    let mut decoder = open(path)?;
    let (width, height) = decoder.dimensions().map_err(|e| IoError::tiff(path, e))?;
    let color = decoder.colortype().map_err(|e| IoError::tiff(path, e))?;
    if samples_per_pixel(path, color)? != 1 {
        return Err(IoError::Unsupported {
            path: path.to_path_buf(),
            detail: format!("label image has color type {color:?}"),
        });
    }
    if decoder.more_images() {
        warn!(path = %path.display(), "label image has several pages; using the first");
    }

    let invalid = |detail: &str| IoError::Unsupported {
        path: path.to_path_buf(),
        detail: detail.to_owned(),
    };
    let page = decoder.read_image().map_err(|e| IoError::tiff(path, e))?;
    let labels: Vec<u32> = match page {
        DecodingResult::U8(v) => v.into_iter().map(u32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(u32::from).collect(),
        DecodingResult::U32(v) => v,
        DecodingResult::U64(v) => v
            .into_iter()
            .map(u32::try_from)
            .collect::<Result<_, _>>()
            .map_err(|_| invalid("label id exceeds 32 bits"))?,
        DecodingResult::I8(v) => ints_to_labels(v.into_iter().map(i64::from))
            .ok_or_else(|| invalid("negative label id"))?,
        DecodingResult::I16(v) => ints_to_labels(v.into_iter().map(i64::from))
            .ok_or_else(|| invalid("negative label id"))?,
        DecodingResult::I32(v) => ints_to_labels(v.into_iter().map(i64::from))
            .ok_or_else(|| invalid("negative label id"))?,
        DecodingResult::I64(v) => {
            ints_to_labels(v.into_iter()).ok_or_else(|| invalid("label id out of range"))?
        }
        DecodingResult::F32(v) => floats_to_labels(v.into_iter().map(f64::from))
            .ok_or_else(|| invalid("label values are not whole numbers"))?,
        DecodingResult::F64(v) => floats_to_labels(v.into_iter())
            .ok_or_else(|| invalid("label values are not whole numbers"))?,
        #[allow(unreachable_patterns)]
        _ => return Err(unsupported_samples(path)),
    };

    Array2::from_shape_vec((height as usize, width as usize), labels)
        .map_err(|_| invalid("pixel count does not match the page size"))
}

fn ints_to_labels(values: impl Iterator<Item = i64>) -> Option<Vec<u32>> {
    values.map(|v| u32::try_from(v).ok()).collect()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn floats_to_labels(values: impl Iterator<Item = f64>) -> Option<Vec<u32>> {
    values
        .map(|v| {
            (v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX))
                .then_some(v as u32)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::BufWriter;

    use tempfile::TempDir;
    use tiff::encoder::{TiffEncoder, colortype};

    use super::*;

    /// Write `pages` planes of `height x width` u16 pixels with an
    /// optional description on the first page. Pixel value is its
    /// global index.
    fn write_stack(
        path: &Path,
        pages: usize,
        height: u32,
        width: u32,
        description: Option<&str>,
    ) {
        let file = BufWriter::new(File::create(path).unwrap());
        let mut encoder = TiffEncoder::new(file).unwrap();
        let plane = (height * width) as usize;
        for page in 0..pages {
            let data: Vec<u16> = (0..plane)
                .map(|i| u16::try_from(page * plane + i).unwrap())
                .collect();
            let mut image = encoder.new_image::<colortype::Gray16>(width, height).unwrap();
            if page == 0 {
                if let Some(text) = description {
                    image
                        .encoder()
                        .write_tag(Tag::ImageDescription, text)
                        .unwrap();
                }
            }
            image.write_data(&data).unwrap();
        }
    }

    #[test]
    fn single_page_is_yx() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plane.tif");
        write_stack(&path, 1, 4, 6, None);
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.axes.to_string(), "YX");
        assert_eq!(image.data.shape(), &[4, 6]);
        assert_eq!(image.source, AxesSource::Inferred);
        assert!((image.data[[1, 2]] - 8.0).abs() < f32::EPSILON);
    }

    #[test]
    fn bare_stack_is_inferred_as_z() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.tif");
        write_stack(&path, 3, 4, 4, None);
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.axes.to_string(), "ZYX");
        assert_eq!(image.data.shape(), &[3, 4, 4]);
        assert!((image.data[[2, 0, 0]] - 32.0).abs() < f32::EPSILON);
    }

    #[test]
    fn ome_metadata_names_the_axes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ome.tif");
        let xml = ome::to_ome_xml(&ome::OmeImage {
            name: "ome.tif",
            pixels: ome::OmePixels {
                dimension_order: "XYZCT".to_owned(),
                size_x: 4,
                size_y: 4,
                size_z: 3,
                size_c: 2,
                size_t: 1,
            },
            pixel_type: ome::PixelType::Uint16,
        });
        write_stack(&path, 6, 4, 4, Some(&xml));
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.source, AxesSource::Ome);
        assert_eq!(image.axes.to_string(), "TCZYX");
        assert_eq!(image.data.shape(), &[1, 2, 3, 4, 4]);
        // Page 4 is channel 1, plane 1.
        assert!((image.data[[0, 1, 1, 0, 0]] - 64.0).abs() < f32::EPSILON);
    }

    #[test]
    fn tifffile_shape_description() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shaped.tif");
        write_stack(&path, 6, 2, 2, Some(r#"{"shape": [2, 3, 2, 2], "axes": "CZYX"}"#));
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.source, AxesSource::Shaped);
        assert_eq!(image.axes.to_string(), "CZYX");
        assert_eq!(image.data.shape(), &[2, 3, 2, 2]);
    }

    #[test]
    fn imagej_hyperstack_description() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imagej.tif");
        let description = "ImageJ=1.53t\nimages=6\nchannels=2\nframes=3\nhyperstack=true\n";
        write_stack(&path, 6, 2, 2, Some(description));
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.source, AxesSource::ImageJ);
        assert_eq!(image.axes.to_string(), "TCYX");
        assert_eq!(image.data.shape(), &[3, 2, 2, 2]);
    }

    #[test]
    fn override_wins_over_metadata() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("override.tif");
        write_stack(&path, 4, 2, 2, Some(r#"{"shape": [4, 2, 2]}"#));
        let axes = Axes::parse("TYX").unwrap();
        let image = read_volume(&path, Some(&axes)).unwrap();
        assert_eq!(image.source, AxesSource::Override);
        assert_eq!(image.axes, axes);
        assert_eq!(image.data.shape(), &[4, 2, 2]);
    }

    #[test]
    fn override_without_page_axis_rejects_stacks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.tif");
        write_stack(&path, 2, 2, 2, None);
        let axes = Axes::parse("YX").unwrap();
        assert!(matches!(
            read_volume(&path, Some(&axes)),
            Err(IoError::PageCount { pages: 2, .. })
        ));
    }

    #[test]
    fn mismatched_metadata_falls_back_to_inference() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.tif");
        write_stack(&path, 3, 2, 2, Some("ImageJ=1.53t\nchannels=2\nslices=2\n"));
        let image = read_volume(&path, None).unwrap();
        assert_eq!(image.source, AxesSource::Inferred);
        assert_eq!(image.axes.to_string(), "ZYX");
    }

    #[test]
    fn label_plane_reads_u16() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("labels.tif");
        write_stack(&path, 1, 3, 2, None);
        let labels = read_label_plane(&path).unwrap();
        assert_eq!(labels.dim(), (3, 2));
        assert_eq!(labels[[2, 1]], 5);
    }

    #[test]
    fn float_labels_must_be_whole() {
        assert_eq!(floats_to_labels([0.0, 3.0].into_iter()), Some(vec![0, 3]));
        assert_eq!(floats_to_labels([1.5].into_iter()), None);
        assert_eq!(floats_to_labels([-1.0].into_iter()), None);
        assert_eq!(ints_to_labels([-2_i64].into_iter()), None);
    }

    #[test]
    fn missing_file_is_a_file_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            read_volume(&dir.path().join("absent.tif"), None),
            Err(IoError::File { .. })
        ));
    }
}
