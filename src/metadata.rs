//! In-memory pixel and channel descriptors.
//!
//! [`SeriesMetadata`] is a value object: every derivation (per-tile, fused
//! output) is a copy with a subset applied. Only the transplant step rewrites
//! metadata that already lives on disk.

use std::fmt;

/// Pixel sample type, named as in OME-XML `Pixels/@Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    UInt8,
    UInt16,
    Float32,
}

impl PixelType {
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PixelType::UInt8 => 1,
            PixelType::UInt16 => 2,
            PixelType::Float32 => 4,
        }
    }

    #[must_use]
    pub fn as_ome(&self) -> &'static str {
        match self {
            PixelType::UInt8 => "uint8",
            PixelType::UInt16 => "uint16",
            PixelType::Float32 => "float",
        }
    }

    #[must_use]
    pub fn from_ome(value: &str) -> Option<Self> {
        match value {
            "uint8" => Some(PixelType::UInt8),
            "uint16" => Some(PixelType::UInt16),
            "float" => Some(PixelType::Float32),
            _ => None,
        }
    }
}

/// Order in which planes are laid out in a multi-page file, fastest
/// varying first after X and Y.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionOrder {
    XYCZT,
    XYCTZ,
    XYZCT,
    XYZTC,
    XYTCZ,
    XYTZC,
}

impl DimensionOrder {
    #[must_use]
    pub fn from_ome(value: &str) -> Option<Self> {
        match value {
            "XYCZT" => Some(DimensionOrder::XYCZT),
            "XYCTZ" => Some(DimensionOrder::XYCTZ),
            "XYZCT" => Some(DimensionOrder::XYZCT),
            "XYZTC" => Some(DimensionOrder::XYZTC),
            "XYTCZ" => Some(DimensionOrder::XYTCZ),
            "XYTZC" => Some(DimensionOrder::XYTZC),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ome(&self) -> &'static str {
        match self {
            DimensionOrder::XYCZT => "XYCZT",
            DimensionOrder::XYCTZ => "XYCTZ",
            DimensionOrder::XYZCT => "XYZCT",
            DimensionOrder::XYZTC => "XYZTC",
            DimensionOrder::XYTCZ => "XYTCZ",
            DimensionOrder::XYTZC => "XYTZC",
        }
    }
}

impl fmt::Display for DimensionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ome())
    }
}

/// One channel of a series. Order within a series is significant.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    pub id: String,
    pub name: Option<String>,
    /// OME packed RGBA color
    pub color: Option<i32>,
    pub samples_per_pixel: u32,
}

impl ChannelDescriptor {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            id: channel_id(index),
            name: None,
            color: None,
            samples_per_pixel: 1,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[must_use]
    pub fn with_color(mut self, color: i32) -> Self {
        self.color = Some(color);
        self
    }

    /// Copy of this channel re-addressed to position `index` of a new series.
    #[must_use]
    pub fn renumbered(&self, index: usize) -> Self {
        Self {
            id: channel_id(index),
            ..self.clone()
        }
    }
}

fn channel_id(index: usize) -> String {
    format!("Channel:0:{index}")
}

/// Pixel geometry and channel list of one image series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesMetadata {
    pub size_x: u32,
    pub size_y: u32,
    pub size_z: usize,
    pub size_c: usize,
    pub size_t: usize,
    /// Physical pixel size (X, Y, Z) in microns
    pub physical_size: [Option<f64>; 3],
    pub pixel_type: PixelType,
    pub dimension_order: DimensionOrder,
    pub big_endian: bool,
    pub channels: Vec<ChannelDescriptor>,
}

impl SeriesMetadata {
    /// Series with default channels, XYCZT order, little-endian.
    #[must_use]
    pub fn new(
        size_x: u32,
        size_y: u32,
        size_z: usize,
        size_c: usize,
        size_t: usize,
        pixel_type: PixelType,
    ) -> Self {
        Self {
            size_x,
            size_y,
            size_z,
            size_c,
            size_t,
            physical_size: [None; 3],
            pixel_type,
            dimension_order: DimensionOrder::XYCZT,
            big_endian: false,
            channels: (0..size_c).map(ChannelDescriptor::new).collect(),
        }
    }

    #[must_use]
    pub fn plane_count(&self) -> usize {
        self.size_z * self.size_c * self.size_t
    }

    /// Planes per timepoint, the quantity the split policy is decided on.
    #[must_use]
    pub fn planes_per_timepoint(&self) -> usize {
        self.size_z * self.size_c
    }

    /// Positional index of plane (z, c, t) under this series' dimension order.
    #[must_use]
    pub fn plane_index(&self, z: usize, c: usize, t: usize) -> usize {
        let (sz, sc, st) = (self.size_z, self.size_c, self.size_t);
        match self.dimension_order {
            DimensionOrder::XYCZT => c + sc * (z + sz * t),
            DimensionOrder::XYCTZ => c + sc * (t + st * z),
            DimensionOrder::XYZCT => z + sz * (c + sc * t),
            DimensionOrder::XYZTC => z + sz * (t + st * c),
            DimensionOrder::XYTCZ => t + st * (c + sc * z),
            DimensionOrder::XYTZC => t + st * (z + sz * c),
        }
    }

    /// Metadata for a single tile file: one timepoint, XYCZT, little-endian,
    /// and either every channel or the single `channel` given. `None` when
    /// `channel` is out of range or the descriptors do not cover `size_c`.
    #[must_use]
    pub fn tile_metadata(&self, channel: Option<usize>) -> Option<SeriesMetadata> {
        if self.channels.len() < self.size_c {
            return None;
        }
        let channels: Vec<ChannelDescriptor> = match channel {
            Some(c) if c >= self.size_c => return None,
            Some(c) => vec![self.channels[c].renumbered(0)],
            None => self
                .channels
                .iter()
                .enumerate()
                .map(|(i, ch)| ch.renumbered(i))
                .collect(),
        };

        Some(SeriesMetadata {
            size_c: channels.len(),
            size_t: 1,
            dimension_order: DimensionOrder::XYCZT,
            big_endian: false,
            channels,
            ..self.clone()
        })
    }

    /// Metadata for a consolidated fused file. `self` is the basis read from
    /// the engine's first slice; slice count and channel identity come from
    /// the acquisition.
    #[must_use]
    pub fn fused_metadata(
        &self,
        size_z: usize,
        channel: &ChannelDescriptor,
        physical_size: [Option<f64>; 3],
    ) -> SeriesMetadata {
        let mut physical = self.physical_size;
        for (dst, src) in physical.iter_mut().zip(physical_size) {
            if dst.is_none() {
                *dst = src;
            }
        }

        SeriesMetadata {
            size_z,
            size_c: 1,
            size_t: 1,
            physical_size: physical,
            dimension_order: DimensionOrder::XYCZT,
            big_endian: false,
            channels: vec![channel.renumbered(0)],
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_size_z(mut self, size_z: usize) -> Self {
        self.size_z = size_z;
        self
    }

    #[must_use]
    pub fn with_dimensions(mut self, size_x: u32, size_y: u32) -> Self {
        self.size_x = size_x;
        self.size_y = size_y;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_series() -> SeriesMetadata {
        let mut meta = SeriesMetadata::new(64, 48, 10, 2, 5, PixelType::UInt16);
        meta.physical_size = [Some(0.65), Some(0.65), Some(2.0)];
        meta.channels = vec![
            ChannelDescriptor::new(0).with_name("DAPI").with_color(65535),
            ChannelDescriptor::new(1).with_name("GFP").with_color(16711935),
        ];
        meta
    }

    #[test]
    fn test_plane_index_xyczt() {
        let meta = sample_series();
        assert_eq!(meta.plane_index(0, 0, 0), 0);
        assert_eq!(meta.plane_index(0, 1, 0), 1);
        assert_eq!(meta.plane_index(1, 0, 0), 2);
        assert_eq!(meta.plane_index(0, 0, 1), 20);
        assert_eq!(meta.plane_index(9, 1, 4), meta.plane_count() - 1);
    }

    #[test]
    fn test_plane_index_other_orders_are_bijective() {
        let orders = [
            DimensionOrder::XYCZT,
            DimensionOrder::XYCTZ,
            DimensionOrder::XYZCT,
            DimensionOrder::XYZTC,
            DimensionOrder::XYTCZ,
            DimensionOrder::XYTZC,
        ];
        for order in orders {
            let mut meta = SeriesMetadata::new(4, 4, 3, 2, 4, PixelType::UInt8);
            meta.dimension_order = order;
            let mut seen = vec![false; meta.plane_count()];
            for t in 0..4 {
                for z in 0..3 {
                    for c in 0..2 {
                        let index = meta.plane_index(z, c, t);
                        assert!(!seen[index], "{order} repeats index {index}");
                        seen[index] = true;
                    }
                }
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn test_tile_metadata_single_channel() {
        let meta = sample_series();
        let tile = meta.tile_metadata(Some(1)).unwrap();
        assert_eq!(tile.size_t, 1);
        assert_eq!(tile.size_c, 1);
        assert_eq!(tile.size_z, 10);
        assert_eq!(tile.channels[0].name.as_deref(), Some("GFP"));
        assert_eq!(tile.channels[0].id, "Channel:0:0");
        assert_eq!(tile.physical_size, meta.physical_size);
    }

    #[test]
    fn test_tile_metadata_keeps_channel_order() {
        let mut meta = sample_series();
        meta.dimension_order = DimensionOrder::XYZCT;
        meta.big_endian = true;
        let tile = meta.tile_metadata(None).unwrap();
        assert_eq!(tile.size_t, 1);
        assert_eq!(tile.size_c, 2);
        assert_eq!(tile.dimension_order, DimensionOrder::XYCZT);
        assert!(!tile.big_endian);
        let names: Vec<_> = tile.channels.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec![Some("DAPI".into()), Some("GFP".into())]);
    }

    #[test]
    fn test_tile_metadata_rejects_unknown_channel() {
        let mut meta = sample_series();
        assert!(meta.tile_metadata(Some(2)).is_none());
        assert!(meta.tile_metadata(Some(1)).is_some());

        meta.channels.truncate(1);
        assert!(meta.tile_metadata(Some(1)).is_none());
        assert!(meta.tile_metadata(None).is_none());
    }

    #[test]
    fn test_fused_metadata_overrides() {
        let source = sample_series();
        let basis = SeriesMetadata::new(1800, 1300, 1, 1, 1, PixelType::UInt16);
        let fused = basis.fused_metadata(10, &source.channels[1], source.physical_size);
        assert_eq!((fused.size_x, fused.size_y), (1800, 1300));
        assert_eq!(fused.size_z, 10);
        assert_eq!(fused.channels.len(), 1);
        assert_eq!(fused.channels[0].name.as_deref(), Some("GFP"));
        assert_eq!(fused.channels[0].color, Some(16711935));
        assert_eq!(fused.physical_size[2], Some(2.0));
    }
}
