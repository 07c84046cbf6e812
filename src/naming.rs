//! Filename codec.
//!
//! Coordinates are tracked internally through [`TileManifest`](crate::decompose::TileManifest);
//! names produced here only matter at the boundary with the stitching engine
//! and with acquisition files on disk.
//!
//! Forms:
//! - compact tile: `tile_<T>.ome.tif`
//! - channel-split tile: `tile_<T>_channel_<C>.ome.tif`
//! - acquisition tile: `<prefix>Z<ZZ>_T<T>_C<C>.ome.tif`
//! - fused slice (engine output): `img_t1_z<padded>_c<k>`, 1-based `z`
//! - final output: `fused[_C<c>][_subset<N>].ome.tif`

use std::fmt;

use crate::error::{PipelineError, Result};

/// Extension of every OME-TIFF file this crate writes.
pub const TILE_EXTENSION: &str = ".ome.tif";

/// Placeholder the stitching engine substitutes with the tile index.
pub const INDEX_PLACEHOLDER: &str = "{i}";

/// Join key between decomposition and reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    /// Tile index (the acquisition's T dimension)
    pub tile: usize,
    /// Z slice
    pub slice: usize,
    pub channel: usize,
}

impl Coordinate {
    #[must_use]
    pub fn new(tile: usize, slice: usize, channel: usize) -> Self {
        Self {
            tile,
            slice,
            channel,
        }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T={} Z={} C={}", self.tile, self.slice, self.channel)
    }
}

/// Zero-padding width for slice indices, fixed once per run.
///
/// The width is the number of decimal digits in the total slice count, so a
/// 9-slice stack uses `z1..z9`, a 50-slice stack `z01..z50` and a 450-slice
/// stack `z001..z450`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceDigits(usize);

impl SliceDigits {
    #[must_use]
    pub fn for_count(slice_count: usize) -> Self {
        let mut width = 1;
        let mut rest = slice_count / 10;
        while rest > 0 {
            width += 1;
            rest /= 10;
        }
        Self(width)
    }

    #[must_use]
    pub fn fixed(width: usize) -> Self {
        Self(width.max(1))
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.0
    }

    #[must_use]
    pub fn pad(&self, value: usize) -> String {
        format!("{value:0width$}", width = self.0)
    }
}

/// How tile files are named on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileNaming {
    /// One file per timepoint: `tile_<T>`
    Compact,
    /// One file per timepoint and channel: `tile_<T>_channel_<C>`
    ChannelSplit,
    /// Acquisition-software names: `<prefix>Z<ZZ>_T<T>_C<C>`
    Acquisition { prefix: String, digits: SliceDigits },
}

impl TileNaming {
    #[must_use]
    pub fn encode(&self, coord: Coordinate) -> String {
        match self {
            TileNaming::Compact => format!("tile_{}{TILE_EXTENSION}", coord.tile),
            TileNaming::ChannelSplit => {
                format!("tile_{}_channel_{}{TILE_EXTENSION}", coord.tile, coord.channel)
            }
            TileNaming::Acquisition { prefix, digits } => format!(
                "{prefix}Z{}_T{}_C{}{TILE_EXTENSION}",
                digits.pad(coord.slice),
                coord.tile,
                coord.channel
            ),
        }
    }

    /// Inverse of [`encode`](Self::encode). Fragments a form does not carry
    /// decode as 0.
    pub fn decode(&self, name: &str) -> Result<Coordinate> {
        let stem = name
            .strip_suffix(TILE_EXTENSION)
            .ok_or_else(|| missing(name, "extension"))?;

        match self {
            TileNaming::Compact => {
                let rest = stem.strip_prefix("tile_").ok_or_else(|| missing(name, "tile"))?;
                let (tile, rest) = take_number(rest).ok_or_else(|| missing(name, "T"))?;
                if !rest.is_empty() {
                    return Err(missing(name, "end of name"));
                }
                Ok(Coordinate::new(tile, 0, 0))
            }
            TileNaming::ChannelSplit => {
                let rest = stem.strip_prefix("tile_").ok_or_else(|| missing(name, "tile"))?;
                let (tile, rest) = take_number(rest).ok_or_else(|| missing(name, "T"))?;
                let rest = rest
                    .strip_prefix("_channel_")
                    .ok_or_else(|| missing(name, "channel"))?;
                let (channel, rest) = take_number(rest).ok_or_else(|| missing(name, "C"))?;
                if !rest.is_empty() {
                    return Err(missing(name, "end of name"));
                }
                Ok(Coordinate::new(tile, 0, channel))
            }
            TileNaming::Acquisition { prefix, .. } => {
                let rest = stem
                    .strip_prefix(prefix.as_str())
                    .ok_or_else(|| missing(name, "prefix"))?;
                let rest = rest.strip_prefix('Z').ok_or_else(|| missing(name, "Z"))?;
                let (slice, rest) = take_number(rest).ok_or_else(|| missing(name, "Z"))?;
                let rest = rest.strip_prefix("_T").ok_or_else(|| missing(name, "T"))?;
                let (tile, rest) = take_number(rest).ok_or_else(|| missing(name, "T"))?;
                let rest = rest.strip_prefix("_C").ok_or_else(|| missing(name, "C"))?;
                let (channel, rest) = take_number(rest).ok_or_else(|| missing(name, "C"))?;
                if !rest.is_empty() {
                    return Err(missing(name, "end of name"));
                }
                Ok(Coordinate::new(tile, slice, channel))
            }
        }
    }

    /// Templated name handed to the stitching engine, with `{i}` in place of
    /// the tile index.
    #[must_use]
    pub fn encode_pattern(&self, channel: Option<usize>) -> String {
        match (self, channel) {
            (TileNaming::Compact, _) => format!("tile_{INDEX_PLACEHOLDER}{TILE_EXTENSION}"),
            (TileNaming::ChannelSplit, c) => format!(
                "tile_{INDEX_PLACEHOLDER}_channel_{}{TILE_EXTENSION}",
                c.unwrap_or(0)
            ),
            (TileNaming::Acquisition { prefix, digits }, c) => format!(
                "{prefix}Z{}_T{INDEX_PLACEHOLDER}_C{}{TILE_EXTENSION}",
                digits.pad(0),
                c.unwrap_or(0)
            ),
        }
    }
}

/// Name the engine gives fused slice `slice` (0-based) of a run.
#[must_use]
pub fn fused_slice_name(slice: usize, channel_in_file: usize, digits: SliceDigits, ext: &str) -> String {
    format!("img_t1_z{}_c{channel_in_file}{ext}", digits.pad(slice + 1))
}

/// Returns the 0-based slice index encoded in an engine output name.
pub fn decode_fused_slice(name: &str) -> Result<usize> {
    let rest = name.strip_prefix("img_t1_z").ok_or_else(|| missing(name, "z"))?;
    let (slice, rest) = take_number(rest).ok_or_else(|| missing(name, "z"))?;
    if !rest.starts_with("_c") {
        return Err(missing(name, "c"));
    }
    slice.checked_sub(1).ok_or_else(|| missing(name, "1-based z"))
}

/// Name of a consolidated output file.
#[must_use]
pub fn fused_output_name(channel: Option<usize>, subset: Option<usize>) -> String {
    let mut name = String::from("fused");
    if let Some(c) = channel {
        name.push_str(&format!("_C{c}"));
    }
    if let Some(n) = subset {
        name.push_str(&format!("_subset{n}"));
    }
    name.push_str(TILE_EXTENSION);
    name
}

fn take_number(s: &str) -> Option<(usize, &str)> {
    let end = s.find(|ch: char| !ch.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    let value = s[..end].parse().ok()?;
    Some((value, &s[end..]))
}

fn missing(name: &str, fragment: &'static str) -> PipelineError {
    PipelineError::Naming {
        name: name.to_string(),
        fragment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_digits() {
        assert_eq!(SliceDigits::for_count(1).width(), 1);
        assert_eq!(SliceDigits::for_count(9).width(), 1);
        assert_eq!(SliceDigits::for_count(10).width(), 2);
        assert_eq!(SliceDigits::for_count(99).width(), 2);
        assert_eq!(SliceDigits::for_count(100).width(), 3);
        assert_eq!(SliceDigits::for_count(450).width(), 3);
        assert_eq!(SliceDigits::for_count(0).width(), 1);
    }

    #[test]
    fn test_round_trip_all_forms() {
        let forms = [
            TileNaming::Compact,
            TileNaming::ChannelSplit,
            TileNaming::Acquisition {
                prefix: "scan_".to_string(),
                digits: SliceDigits::fixed(1),
            },
            TileNaming::Acquisition {
                prefix: "scan_".to_string(),
                digits: SliceDigits::fixed(2),
            },
            TileNaming::Acquisition {
                prefix: "run7-".to_string(),
                digits: SliceDigits::fixed(3),
            },
        ];

        for naming in &forms {
            for tile in [0, 1, 9, 10, 123] {
                for slice in [0, 5, 9] {
                    for channel in [0, 1, 3] {
                        let coord = match naming {
                            TileNaming::Compact => Coordinate::new(tile, 0, 0),
                            TileNaming::ChannelSplit => Coordinate::new(tile, 0, channel),
                            TileNaming::Acquisition { .. } => {
                                Coordinate::new(tile, slice, channel)
                            }
                        };
                        let name = naming.encode(coord);
                        assert_eq!(naming.decode(&name).unwrap(), coord, "{name}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_encoded_names() {
        let coord = Coordinate::new(4, 0, 1);
        assert_eq!(TileNaming::Compact.encode(coord), "tile_4.ome.tif");
        assert_eq!(
            TileNaming::ChannelSplit.encode(coord),
            "tile_4_channel_1.ome.tif"
        );
        let acq = TileNaming::Acquisition {
            prefix: "exp1_".to_string(),
            digits: SliceDigits::fixed(2),
        };
        assert_eq!(acq.encode(coord), "exp1_Z00_T4_C1.ome.tif");
    }

    #[test]
    fn test_patterns() {
        assert_eq!(TileNaming::Compact.encode_pattern(None), "tile_{i}.ome.tif");
        assert_eq!(
            TileNaming::ChannelSplit.encode_pattern(Some(2)),
            "tile_{i}_channel_2.ome.tif"
        );
    }

    #[test]
    fn test_decode_missing_fragment() {
        let err = TileNaming::ChannelSplit
            .decode("tile_3.ome.tif")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Naming { fragment: "channel", .. }));

        let acq = TileNaming::Acquisition {
            prefix: "scan_".to_string(),
            digits: SliceDigits::fixed(2),
        };
        let err = acq.decode("scan_Z00_C1.ome.tif").unwrap_err();
        assert!(matches!(err, PipelineError::Naming { fragment: "T", .. }));

        let err = TileNaming::Compact.decode("tile_3.tif").unwrap_err();
        assert!(matches!(err, PipelineError::Naming { fragment: "extension", .. }));
    }

    #[test]
    fn test_fused_slice_names() {
        let digits = SliceDigits::for_count(9);
        assert_eq!(fused_slice_name(0, 1, digits, ""), "img_t1_z1_c1");

        let digits = SliceDigits::for_count(50);
        assert_eq!(fused_slice_name(0, 1, digits, ""), "img_t1_z01_c1");
        assert_eq!(fused_slice_name(49, 2, digits, ""), "img_t1_z50_c2");

        let digits = SliceDigits::for_count(450);
        assert_eq!(fused_slice_name(36, 1, digits, ".tif"), "img_t1_z037_c1.tif");

        for count in [1, 9, 10, 99, 100, 450] {
            let digits = SliceDigits::for_count(count);
            for slice in [0, count / 2, count - 1] {
                let name = fused_slice_name(slice, 1, digits, "");
                assert_eq!(decode_fused_slice(&name).unwrap(), slice);
            }
        }
    }

    #[test]
    fn test_output_names() {
        assert_eq!(fused_output_name(None, None), "fused.ome.tif");
        assert_eq!(fused_output_name(Some(0), None), "fused_C0.ome.tif");
        assert_eq!(fused_output_name(Some(1), Some(2)), "fused_C1_subset2.ome.tif");
    }
}
