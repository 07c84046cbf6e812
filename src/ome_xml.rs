//! OME-XML record embedded in the first IFD's `ImageDescription`.
//!
//! Only the `Image/Pixels/Channel` subset this crate consumes is written or
//! read. The document is kept pure ASCII because TIFF ASCII fields cannot
//! carry anything else.

use std::collections::HashMap;
use std::str::FromStr;

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::metadata::{ChannelDescriptor, DimensionOrder, PixelType, SeriesMetadata};
use crate::tiff_utils::AnyResult;

const OME_NAMESPACE: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06";

pub fn to_ome_xml(meta: &SeriesMetadata) -> AnyResult<String> {
    let mut writer = Writer::new(Vec::with_capacity(512 + meta.channels.len() * 96));
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut ome = BytesStart::new("OME");
    ome.push_attribute(("xmlns", OME_NAMESPACE));
    writer.write_event(Event::Start(ome))?;

    let mut image = BytesStart::new("Image");
    image.push_attribute(("ID", "Image:0"));
    image.push_attribute(("Name", "Image:0"));
    writer.write_event(Event::Start(image))?;

    let mut pixels = BytesStart::new("Pixels");
    pixels.push_attribute(("ID", "Pixels:0"));
    pixels.push_attribute(("DimensionOrder", meta.dimension_order.as_ome()));
    pixels.push_attribute(("Type", meta.pixel_type.as_ome()));
    pixels.push_attribute(("BigEndian", meta.big_endian.to_string().as_str()));
    for (key, value) in [
        ("SizeX", meta.size_x as usize),
        ("SizeY", meta.size_y as usize),
        ("SizeZ", meta.size_z),
        ("SizeC", meta.size_c),
        ("SizeT", meta.size_t),
    ] {
        pixels.push_attribute((key, value.to_string().as_str()));
    }
    for (key, value) in ["PhysicalSizeX", "PhysicalSizeY", "PhysicalSizeZ"]
        .into_iter()
        .zip(meta.physical_size)
    {
        if let Some(v) = value {
            pixels.push_attribute((key, v.to_string().as_str()));
        }
    }
    writer.write_event(Event::Start(pixels))?;

    for channel in &meta.channels {
        let mut element = BytesStart::new("Channel");
        element.push_attribute(("ID", channel.id.as_str()));
        if let Some(name) = &channel.name {
            element.push_attribute(("Name", name.as_str()));
        }
        if let Some(color) = channel.color {
            element.push_attribute(("Color", color.to_string().as_str()));
        }
        element.push_attribute((
            "SamplesPerPixel",
            channel.samples_per_pixel.to_string().as_str(),
        ));
        writer.write_event(Event::Start(element))?;
        writer.write_event(Event::Empty(BytesStart::new("LightPath")))?;
        writer.write_event(Event::End(BytesEnd::new("Channel")))?;
    }

    let mut tiff_data = BytesStart::new("TiffData");
    tiff_data.push_attribute(("IFD", "0"));
    tiff_data.push_attribute(("PlaneCount", meta.plane_count().to_string().as_str()));
    writer.write_event(Event::Empty(tiff_data))?;

    for name in ["Pixels", "Image", "OME"] {
        writer.write_event(Event::End(BytesEnd::new(name)))?;
    }

    let xml = String::from_utf8(writer.into_inner())?;
    Ok(ascii_char_refs(&xml))
}

/// Parse the `Pixels` and `Channel` elements of a record. Namespace prefixes
/// are ignored, so `ome:Pixels` reads the same as `Pixels`.
pub fn from_ome_xml(xml: &str) -> AnyResult<SeriesMetadata> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut pixels: Option<HashMap<String, String>> = None;
    let mut channel_elements = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"Pixels" if pixels.is_none() => pixels = Some(attributes(&e)?),
                b"Channel" => channel_elements.push(attributes(&e)?),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    let pixels = pixels.ok_or("OME-XML has no Pixels element")?;

    let size_x: u32 = required(&pixels, "SizeX")?;
    let size_y: u32 = required(&pixels, "SizeY")?;
    let size_z: usize = required(&pixels, "SizeZ")?;
    let size_c: usize = required(&pixels, "SizeC")?;
    let size_t: usize = required(&pixels, "SizeT")?;

    let type_name = pixels.get("Type").ok_or("Pixels has no Type")?;
    let pixel_type = PixelType::from_ome(type_name)
        .ok_or_else(|| format!("Unsupported pixel type {type_name:?}"))?;

    let order_name = pixels
        .get("DimensionOrder")
        .ok_or("Pixels has no DimensionOrder")?;
    let dimension_order = DimensionOrder::from_ome(order_name)
        .ok_or_else(|| format!("Unknown dimension order {order_name:?}"))?;

    let big_endian = pixels.get("BigEndian").is_some_and(|v| v == "true");

    let physical_size = ["PhysicalSizeX", "PhysicalSizeY", "PhysicalSizeZ"]
        .map(|key| pixels.get(key).and_then(|v| v.parse::<f64>().ok()));

    let mut channels: Vec<ChannelDescriptor> = channel_elements
        .into_iter()
        .enumerate()
        .map(|(index, mut attrs)| ChannelDescriptor {
            id: attrs
                .remove("ID")
                .unwrap_or_else(|| format!("Channel:0:{index}")),
            name: attrs.remove("Name"),
            color: attrs.get("Color").and_then(|v| v.parse().ok()),
            samples_per_pixel: attrs
                .get("SamplesPerPixel")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        })
        .collect();
    // Writers that omit Channel elements still describe size_c channels
    while channels.len() < size_c {
        channels.push(ChannelDescriptor::new(channels.len()));
    }
    channels.truncate(size_c);

    Ok(SeriesMetadata {
        size_x,
        size_y,
        size_z,
        size_c,
        size_t,
        physical_size,
        pixel_type,
        dimension_order,
        big_endian,
        channels,
    })
}

/// Unescaped attribute values of one element, keyed by local name.
fn attributes(element: &BytesStart<'_>) -> AnyResult<HashMap<String, String>> {
    let mut values = HashMap::new();
    for attr in element.attributes() {
        let attr = attr?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        values.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(values)
}

fn required<T: FromStr>(pixels: &HashMap<String, String>, key: &str) -> AnyResult<T> {
    let raw = pixels
        .get(key)
        .ok_or_else(|| format!("Pixels has no {key}"))?;
    raw.parse::<T>()
        .map_err(|_| format!("Invalid {key} value {raw:?}").into())
}

/// Replace every non-ASCII character with a numeric character reference.
/// Element names are ASCII, so only attribute text is affected.
fn ascii_char_refs(xml: &str) -> String {
    if xml.is_ascii() {
        return xml.to_string();
    }
    let mut out = String::with_capacity(xml.len() + 16);
    for ch in xml.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            out.push_str(&format!("&#x{:X};", u32::from(ch)));
        }
    }
    out
}
