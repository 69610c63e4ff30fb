//! OME-XML for the `ImageDescription` of the first IFD.

use crate::pixel::PixelType;

const OME_NS: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";

pub struct OmeImage<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
    pub channels: &'a [String],
    /// Micrometres per pixel along X and Y.
    pub pixel_size_um: Option<(f64, f64)>,
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// One image, one plane per channel, Z = T = 1. Planes are stored as
/// consecutive IFDs starting at IFD 0.
pub fn ome_xml(image: &OmeImage<'_>) -> String {
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><OME xmlns="{ns}" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:schemaLocation="{ns} {ns}/ome.xsd">"#,
        ns = OME_NS
    );
    xml.push_str(&format!(
        r#"<Image ID="Image:0" Name="{}"><Pixels BigEndian="false" DimensionOrder="XYCZT" ID="Pixels:0""#,
        escape(image.name)
    ));
    if let Some((px, py)) = image.pixel_size_um {
        xml.push_str(&format!(
            r#" PhysicalSizeX="{px}" PhysicalSizeXUnit="µm" PhysicalSizeY="{py}" PhysicalSizeYUnit="µm""#
        ));
    }
    xml.push_str(&format!(
        r#" SizeC="{}" SizeT="1" SizeX="{}" SizeY="{}" SizeZ="1" Type="{}">"#,
        image.channels.len(),
        image.width,
        image.height,
        image.pixel_type.ome_name()
    ));
    for (i, name) in image.channels.iter().enumerate() {
        xml.push_str(&format!(
            r#"<Channel ID="Channel:0:{i}" Name="{}" SamplesPerPixel="1"><LightPath/></Channel>"#,
            escape(name)
        ));
    }
    xml.push_str(&format!(
        r#"<TiffData FirstC="0" FirstT="0" FirstZ="0" IFD="0" PlaneCount="{}"/>"#,
        image.channels.len()
    ));
    xml.push_str("</Pixels></Image></OME>");
    xml
}
