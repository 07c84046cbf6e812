//! OME-TIFF codec boundary.
//!
//! Planes are addressed positionally. Readers expose the plane order of the
//! file they read; every file written here is XYCZT with the OME-XML record
//! in the first IFD's `ImageDescription`.

use std::fs::File;
use std::path::{Path, PathBuf};

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{Compression, TiffEncoder, colortype};
use tiff::tags::Tag;

use crate::metadata::{PixelType, SeriesMetadata};
use crate::ome_xml::{from_ome_xml, to_ome_xml};
use crate::tiff_utils::{
    AnyResult, AsciiTagSlot, TAG_IMAGE_DESCRIPTION, capture_ascii_tag, read_image_description,
    restore_ascii_tag, rewrite_ascii_tag,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PlaneData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl PlaneData {
    #[must_use]
    pub fn pixel_type(&self) -> PixelType {
        match self {
            PlaneData::U8(_) => PixelType::UInt8,
            PlaneData::U16(_) => PixelType::UInt16,
            PlaneData::F32(_) => PixelType::Float32,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            PlaneData::U8(d) => d.len(),
            PlaneData::U16(d) => d.len(),
            PlaneData::F32(d) => d.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One X×Y image.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub width: u32,
    pub height: u32,
    pub data: PlaneData,
}

impl Plane {
    fn from_decoding(width: u32, height: u32, result: DecodingResult) -> AnyResult<Self> {
        let data = match result {
            DecodingResult::U8(d) => PlaneData::U8(d),
            DecodingResult::U16(d) => PlaneData::U16(d),
            DecodingResult::F32(d) => PlaneData::F32(d),
            _ => return Err("Unsupported sample type (expected uint8, uint16 or float)".into()),
        };
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(format!(
                "Decoded plane has {} samples (expected {expected}, multi-sample pixels are not supported)",
                data.len()
            )
            .into());
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }
}

/// Read side of the codec.
pub trait SeriesReader: Send {
    fn metadata(&self) -> &SeriesMetadata;

    /// Plane at positional `index`, per the reader's dimension order.
    fn read_plane(&mut self, index: usize) -> AnyResult<Plane>;
}

/// Write side of the codec. Planes are positional and arrive in
/// increasing index order.
pub trait SeriesWriter {
    fn write_plane(&mut self, index: usize, plane: &Plane) -> AnyResult<()>;

    fn finish(self) -> AnyResult<()>
    where
        Self: Sized;
}

/// Multi-page TIFF reader. Sequential forward reads are cheap; reading
/// backwards reopens the file.
pub struct OmeTiffReader {
    path: PathBuf,
    metadata: SeriesMetadata,
    decoder: Decoder<File>,
    current: usize,
}

impl OmeTiffReader {
    /// Open a file carrying an OME-XML record.
    pub fn open(path: &Path) -> AnyResult<Self> {
        let metadata = read_series_metadata(path)?;
        Self::with_metadata(path, metadata)
    }

    /// Open a file with caller-supplied metadata, for files whose embedded
    /// record is absent or not authoritative.
    pub fn with_metadata(path: &Path, metadata: SeriesMetadata) -> AnyResult<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            decoder: open_decoder(path)?,
            current: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SeriesReader for OmeTiffReader {
    fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    fn read_plane(&mut self, index: usize) -> AnyResult<Plane> {
        if index < self.current {
            self.decoder = open_decoder(&self.path)?;
            self.current = 0;
        }
        while self.current < index {
            if !self.decoder.more_images() {
                return Err(format!(
                    "Plane {index} out of range, {} has {} page(s)",
                    self.path.display(),
                    self.current + 1
                )
                .into());
            }
            self.decoder.next_image()?;
            self.current += 1;
        }

        let (width, height) = self.decoder.dimensions()?;
        let decoded = self.decoder.read_image()?;
        Plane::from_decoding(width, height, decoded)
    }
}

/// In-memory plane stack, used for fused results handed back by a
/// display-mode stitcher and for tests.
#[derive(Debug, Clone)]
pub struct MemorySeries {
    metadata: SeriesMetadata,
    planes: Vec<Plane>,
}

impl MemorySeries {
    pub fn new(metadata: SeriesMetadata, planes: Vec<Plane>) -> AnyResult<Self> {
        if planes.len() != metadata.plane_count() {
            return Err(format!(
                "Series describes {} planes but {} were supplied",
                metadata.plane_count(),
                planes.len()
            )
            .into());
        }
        Ok(Self { metadata, planes })
    }

    #[must_use]
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }
}

impl SeriesReader for MemorySeries {
    fn metadata(&self) -> &SeriesMetadata {
        &self.metadata
    }

    fn read_plane(&mut self, index: usize) -> AnyResult<Plane> {
        self.planes
            .get(index)
            .cloned()
            .ok_or_else(|| format!("Plane {index} out of range").into())
    }
}

/// Sequential multi-page writer, LZW-compressed. Planes must arrive in
/// index order.
pub struct OmeTiffWriter {
    path: PathBuf,
    metadata: SeriesMetadata,
    description: String,
    encoder: TiffEncoder<File>,
    next: usize,
}

impl OmeTiffWriter {
    pub fn create(path: &Path, metadata: &SeriesMetadata) -> AnyResult<Self> {
        let mut metadata = metadata.clone();
        metadata.big_endian = false;
        let description = to_ome_xml(&metadata)?;
        let encoder = TiffEncoder::new(File::create(path)?)?.with_compression(Compression::Lzw);
        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            description,
            encoder,
            next: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_plane(&mut self, index: usize, plane: &Plane) -> AnyResult<()> {
        if index != self.next {
            return Err(format!(
                "Plane {index} written out of order (expected {})",
                self.next
            )
            .into());
        }
        if index >= self.metadata.plane_count() {
            return Err(format!(
                "Plane {index} exceeds the {} planes described",
                self.metadata.plane_count()
            )
            .into());
        }
        if (plane.width, plane.height) != (self.metadata.size_x, self.metadata.size_y) {
            return Err(format!(
                "Plane is {}x{}, series is {}x{}",
                plane.width, plane.height, self.metadata.size_x, self.metadata.size_y
            )
            .into());
        }
        if plane.data.pixel_type() != self.metadata.pixel_type {
            return Err(format!(
                "Plane type {:?} does not match series type {:?}",
                plane.data.pixel_type(),
                self.metadata.pixel_type
            )
            .into());
        }

        let first = index == 0;
        let (w, h) = (plane.width, plane.height);
        match &plane.data {
            PlaneData::U8(data) => {
                let mut image = self.encoder.new_image::<colortype::Gray8>(w, h)?;
                if first {
                    image
                        .encoder()
                        .write_tag(Tag::ImageDescription, self.description.as_str())?;
                }
                image.write_data(data)?;
            }
            PlaneData::U16(data) => {
                let mut image = self.encoder.new_image::<colortype::Gray16>(w, h)?;
                if first {
                    image
                        .encoder()
                        .write_tag(Tag::ImageDescription, self.description.as_str())?;
                }
                image.write_data(data)?;
            }
            PlaneData::F32(data) => {
                let mut image = self.encoder.new_image::<colortype::Gray32Float>(w, h)?;
                if first {
                    image
                        .encoder()
                        .write_tag(Tag::ImageDescription, self.description.as_str())?;
                }
                image.write_data(data)?;
            }
        }

        self.next += 1;
        Ok(())
    }

    /// Close the file, failing if fewer planes were written than described.
    pub fn finish(self) -> AnyResult<()> {
        let expected = self.metadata.plane_count();
        if self.next != expected {
            return Err(format!(
                "{} closed after {} of {expected} planes",
                self.path.display(),
                self.next
            )
            .into());
        }
        Ok(())
    }
}

impl SeriesWriter for OmeTiffWriter {
    fn write_plane(&mut self, index: usize, plane: &Plane) -> AnyResult<()> {
        OmeTiffWriter::write_plane(self, index, plane)
    }

    fn finish(self) -> AnyResult<()> {
        OmeTiffWriter::finish(self)
    }
}

fn open_decoder(path: &Path) -> AnyResult<Decoder<File>> {
    let decoder = Decoder::new(File::open(path)?)?;
    Ok(decoder.with_limits(Limits::unlimited()))
}

/// Raw embedded metadata record of a file.
pub fn read_embedded_metadata(path: &Path) -> AnyResult<String> {
    read_image_description(path)
}

/// Replace the embedded metadata record of a file without touching pixels.
pub fn write_embedded_metadata(path: &Path, record: &str) -> AnyResult<()> {
    rewrite_ascii_tag(path, TAG_IMAGE_DESCRIPTION, record)
}

/// Raw location and bytes of the embedded record, for an exact restore.
pub fn capture_embedded_metadata(path: &Path) -> AnyResult<AsciiTagSlot> {
    capture_ascii_tag(path, TAG_IMAGE_DESCRIPTION)
}

pub fn restore_embedded_metadata(path: &Path, slot: &AsciiTagSlot) -> AnyResult<()> {
    restore_ascii_tag(path, slot)
}

pub fn read_series_metadata(path: &Path) -> AnyResult<SeriesMetadata> {
    let record = read_embedded_metadata(path)?;
    from_ome_xml(&record)
}

/// First page of a file, ignoring any embedded record.
pub fn read_single_plane(path: &Path) -> AnyResult<Plane> {
    let mut decoder = open_decoder(path)?;
    let (width, height) = decoder.dimensions()?;
    let decoded = decoder.read_image()?;
    Plane::from_decoding(width, height, decoded)
}

/// Metadata derived from the container itself: plane dimensions, sample
/// type and page count as Z. Used for engine output that carries no
/// OME-XML record.
pub fn container_metadata(path: &Path) -> AnyResult<SeriesMetadata> {
    let mut decoder = open_decoder(path)?;
    let (width, height) = decoder.dimensions()?;
    let sample_format = decoder.get_tag_u32(Tag::SampleFormat).unwrap_or(1);
    let pixel_type = match decoder.colortype()? {
        tiff::ColorType::Gray(8) => PixelType::UInt8,
        tiff::ColorType::Gray(16) => PixelType::UInt16,
        tiff::ColorType::Gray(32) if sample_format == 3 => PixelType::Float32,
        other => return Err(format!("Unsupported color type {other:?}").into()),
    };

    let mut pages = 1;
    while decoder.more_images() {
        decoder.next_image()?;
        pages += 1;
    }

    let mut metadata = SeriesMetadata::new(width, height, pages, 1, 1, pixel_type);
    if let Ok(embedded) = read_series_metadata(path) {
        metadata.physical_size = embedded.physical_size;
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ChannelDescriptor;
    use tempfile::TempDir;

    fn ramp(width: u32, height: u32, seed: u16) -> Plane {
        let data = (0..width * height).map(|i| seed * 100 + i as u16).collect();
        Plane {
            width,
            height,
            data: PlaneData::U16(data),
        }
    }

    #[test]
    fn test_write_then_read_planes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stack.ome.tif");
        let mut meta = SeriesMetadata::new(6, 4, 3, 2, 1, PixelType::UInt16);
        meta.channels[1] = ChannelDescriptor::new(1).with_name("GFP").with_color(-16711936);

        let mut writer = OmeTiffWriter::create(&path, &meta).unwrap();
        for i in 0..meta.plane_count() {
            writer.write_plane(i, &ramp(6, 4, i as u16)).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = OmeTiffReader::open(&path).unwrap();
        assert_eq!(reader.metadata(), &meta);
        assert_eq!(reader.read_plane(4).unwrap(), ramp(6, 4, 4));
        assert_eq!(reader.read_plane(1).unwrap(), ramp(6, 4, 1));
        assert_eq!(reader.read_plane(5).unwrap(), ramp(6, 4, 5));
        assert!(reader.read_plane(6).is_err());
    }

    #[test]
    fn test_written_planes_are_lzw_compressed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tile_0.ome.tif");
        let meta = SeriesMetadata::new(64, 64, 4, 1, 1, PixelType::UInt16);
        let flat = Plane {
            width: 64,
            height: 64,
            data: PlaneData::U16(vec![1234; 64 * 64]),
        };

        let mut writer = OmeTiffWriter::create(&path, &meta).unwrap();
        for i in 0..4 {
            writer.write_plane(i, &flat).unwrap();
        }
        writer.finish().unwrap();

        let mut decoder = Decoder::new(File::open(&path).unwrap()).unwrap();
        assert_eq!(decoder.get_tag_u32(Tag::Compression).unwrap(), 5);
        let raw_pixels = 4 * 64 * 64 * 2;
        assert!(std::fs::metadata(&path).unwrap().len() < raw_pixels);

        let mut reader = OmeTiffReader::open(&path).unwrap();
        assert_eq!(reader.read_plane(3).unwrap(), flat);
    }

    #[test]
    fn test_writer_rejects_out_of_order_and_short_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.ome.tif");
        let meta = SeriesMetadata::new(2, 2, 2, 1, 1, PixelType::UInt16);

        let mut writer = OmeTiffWriter::create(&path, &meta).unwrap();
        assert!(writer.write_plane(1, &ramp(2, 2, 0)).is_err());
        assert!(writer.write_plane(0, &ramp(3, 2, 0)).is_err());
        writer.write_plane(0, &ramp(2, 2, 0)).unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_container_metadata_without_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img_t1_z1_c1");
        let file = File::create(&path).unwrap();
        let mut encoder = TiffEncoder::new(file).unwrap();
        encoder
            .write_image::<colortype::Gray8>(5, 3, &[7u8; 15])
            .unwrap();

        let meta = container_metadata(&path).unwrap();
        assert_eq!((meta.size_x, meta.size_y, meta.size_z), (5, 3, 1));
        assert_eq!(read_single_plane(&path).unwrap().data, PlaneData::U8(vec![7; 15]));
        assert_eq!(meta.pixel_type, PixelType::UInt8);
        assert!(read_series_metadata(&path).is_err());
    }

    #[test]
    fn test_embedded_metadata_rewrite_keeps_pixels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tile.ome.tif");
        let meta = SeriesMetadata::new(4, 4, 2, 1, 7, PixelType::UInt8);
        let mut writer = OmeTiffWriter::create(&path, &meta).unwrap();
        let plane = Plane {
            width: 4,
            height: 4,
            data: PlaneData::U8(vec![9; 16]),
        };
        for i in 0..meta.plane_count() {
            writer.write_plane(i, &plane).unwrap();
        }
        writer.finish().unwrap();

        let derived = meta.tile_metadata(None).unwrap();
        write_embedded_metadata(&path, &to_ome_xml(&derived).unwrap()).unwrap();
        assert_eq!(read_series_metadata(&path).unwrap(), derived);

        let mut reader = OmeTiffReader::with_metadata(&path, derived).unwrap();
        assert_eq!(reader.read_plane(13).unwrap(), plane);
    }

    #[test]
    fn test_memory_series() {
        let meta = SeriesMetadata::new(2, 2, 2, 1, 1, PixelType::UInt16);
        assert!(MemorySeries::new(meta.clone(), vec![ramp(2, 2, 0)]).is_err());

        let mut series = MemorySeries::new(meta, vec![ramp(2, 2, 0), ramp(2, 2, 1)]).unwrap();
        assert_eq!(series.read_plane(1).unwrap(), ramp(2, 2, 1));
        assert!(series.read_plane(2).is_err());
    }
}
