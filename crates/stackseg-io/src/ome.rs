//! OME-XML generation and the small subset of parsing the reader needs.
//!
//! Only the `Pixels` element matters here: its `DimensionOrder` and
//! `Size*` attributes say how the TIFF pages of a file map onto axes.
//! `DimensionOrder` lists axes fastest-varying first, so `XYZCT` means a
//! `TCZYX` array.
//!
//! These are pure functions with no I/O.

use std::fmt::Write;

/// The `Pixels` attributes relevant for axis resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OmePixels {
    /// Five-letter order, fastest first (e.g. `XYZCT`).
    pub dimension_order: String,
    /// Width.
    pub size_x: usize,
    /// Height.
    pub size_y: usize,
    /// Focal planes.
    pub size_z: usize,
    /// Channels.
    pub size_c: usize,
    /// Time points.
    pub size_t: usize,
}

impl OmePixels {
    /// Size for an axis letter, `None` for letters OME does not know.
    #[must_use]
    pub const fn size(&self, letter: char) -> Option<usize> {
        match letter {
            'X' => Some(self.size_x),
            'Y' => Some(self.size_y),
            'Z' => Some(self.size_z),
            'C' => Some(self.size_c),
            'T' => Some(self.size_t),
            _ => None,
        }
    }

    /// The non-plane axes slowest first, e.g. `TCZ` for `XYZCT`.
    #[must_use]
    pub fn page_axes(&self) -> String {
        self.dimension_order
            .chars()
            .rev()
            .filter(|c| matches!(c, 'Z' | 'C' | 'T'))
            .collect()
    }
}

/// Extract the `Pixels` attributes from an OME-XML document.
///
/// Returns `None` when the text is not OME-XML or the `Pixels` element
/// lacks a valid `DimensionOrder`. Missing `Size*` attributes default
/// to 1.
#[must_use]
pub fn parse(xml: &str) -> Option<OmePixels> {
    if !xml.contains("<OME") {
        return None;
    }
    let start = xml.find("<Pixels")?;
    let rest = &xml[start + "<Pixels".len()..];
    let tag = &rest[..rest.find('>')?];

    let dimension_order = attribute(tag, "DimensionOrder")?.to_ascii_uppercase();
    let mut letters: Vec<char> = dimension_order.chars().collect();
    letters.sort_unstable();
    if letters != ['C', 'T', 'X', 'Y', 'Z'] || !dimension_order.starts_with("XY") {
        return None;
    }

    let size = |name: &str| {
        attribute(tag, name)
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1)
    };
    Some(OmePixels {
        dimension_order,
        size_x: size("SizeX"),
        size_y: size("SizeY"),
        size_z: size("SizeZ"),
        size_c: size("SizeC"),
        size_t: size("SizeT"),
    })
}

/// Value of `name="..."` inside a tag body.
fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let mut search = tag;
    while let Some(at) = search.find(name) {
        let boundary = at == 0 || search[..at].ends_with(char::is_whitespace);
        let after = search[at + name.len()..].trim_start();
        if boundary && let Some(after) = after.strip_prefix('=') {
            let after = after.trim_start();
            let quote = after.chars().next()?;
            if quote == '"' || quote == '\'' {
                let value = &after[1..];
                return value.find(quote).map(|end| &value[..end]);
            }
        }
        search = &search[at + name.len()..];
    }
    None
}

/// Pixel type names as written in `Pixels/@Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    /// 16-bit unsigned.
    Uint16,
    /// 32-bit unsigned.
    Uint32,
}

impl PixelType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Uint16 => "uint16",
            Self::Uint32 => "uint32",
        }
    }
}

/// Everything needed to describe a label image in OME-XML.
#[derive(Debug, Clone)]
pub struct OmeImage<'a> {
    /// Image name, usually the file name.
    pub name: &'a str,
    /// Layout of the pages.
    pub pixels: OmePixels,
    /// Stored pixel type.
    pub pixel_type: PixelType,
}

/// Serialize an OME-XML document for a single-image, one-sample-per-pixel
/// file whose pages are all planes in `dimension_order`.
#[must_use]
pub fn to_ome_xml(image: &OmeImage<'_>) -> String {
    let p = &image.pixels;
    let planes = p.size_z * p.size_c * p.size_t;
    let mut out = String::new();

    let _ = writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = writeln!(
        out,
        r#"<OME xmlns="http://www.openmicroscopy.org/Schemas/OME/2016-06" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:schemaLocation="http://www.openmicroscopy.org/Schemas/OME/2016-06 http://www.openmicroscopy.org/Schemas/OME/2016-06/ome.xsd" Creator="stackseg {}">"#,
        env!("CARGO_PKG_VERSION")
    );
    let _ = writeln!(
        out,
        r#"  <Image ID="Image:0" Name="{}">"#,
        escape(image.name)
    );
    let _ = writeln!(
        out,
        r#"    <Pixels ID="Pixels:0" DimensionOrder="{}" Type="{}" SizeX="{}" SizeY="{}" SizeZ="{}" SizeC="{}" SizeT="{}" BigEndian="false" Interleaved="false">"#,
        p.dimension_order,
        image.pixel_type.as_str(),
        p.size_x,
        p.size_y,
        p.size_z,
        p.size_c,
        p.size_t,
    );
    for c in 0..p.size_c {
        let _ = writeln!(
            out,
            r#"      <Channel ID="Channel:0:{c}" SamplesPerPixel="1"/>"#
        );
    }
    let _ = writeln!(out, r#"      <TiffData IFD="0" PlaneCount="{planes}"/>"#);
    let _ = writeln!(out, "    </Pixels>");
    let _ = writeln!(out, "  </Image>");
    let _ = write!(out, "</OME>");
    out
}

/// Escape text for use inside an XML attribute.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pixels(order: &str, z: usize, c: usize, t: usize) -> OmePixels {
        OmePixels {
            dimension_order: order.to_owned(),
            size_x: 32,
            size_y: 16,
            size_z: z,
            size_c: c,
            size_t: t,
        }
    }

    #[test]
    fn generated_xml_parses_back() {
        let image = OmeImage {
            name: "nuclei.tif",
            pixels: pixels("XYCZT", 5, 2, 3),
            pixel_type: PixelType::Uint16,
        };
        let xml = to_ome_xml(&image);
        assert!(xml.contains(r#"Type="uint16""#));
        assert!(xml.contains(r#"PlaneCount="30""#));
        assert_eq!(xml.matches("<Channel ").count(), 2);
        assert_eq!(parse(&xml).unwrap(), image.pixels);
    }

    #[test]
    fn name_is_escaped() {
        let image = OmeImage {
            name: r#"a<b>&"c""#,
            pixels: pixels("XYZCT", 1, 1, 1),
            pixel_type: PixelType::Uint32,
        };
        let xml = to_ome_xml(&image);
        assert!(xml.contains(r#"Name="a&lt;b&gt;&amp;&quot;c&quot;""#));
    }

    #[test]
    fn page_axes_are_slowest_first() {
        assert_eq!(pixels("XYZCT", 1, 1, 1).page_axes(), "TCZ");
        assert_eq!(pixels("XYCZT", 1, 1, 1).page_axes(), "TZC");
    }

    #[test]
    fn missing_sizes_default_to_one() {
        let xml = r#"<OME><Image><Pixels DimensionOrder="XYZTC" SizeX="8" SizeY="4" SizeZ="3"></Pixels></Image></OME>"#;
        let parsed = parse(xml).unwrap();
        assert_eq!(parsed.size_z, 3);
        assert_eq!(parsed.size_c, 1);
        assert_eq!(parsed.size_t, 1);
    }

    #[test]
    fn attribute_names_must_match_whole_words() {
        let tag = r#" ID="Pixels:0" PhysicalSizeX="0.5" SizeX="12""#;
        assert_eq!(attribute(tag, "SizeX"), Some("12"));
    }

    #[test]
    fn non_ome_text_is_ignored() {
        assert!(parse("ImageJ=1.53t\nimages=4").is_none());
        assert!(parse(r#"<OME><Pixels DimensionOrder="XYZ"/></OME>"#).is_none());
    }
}
