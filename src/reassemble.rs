//! Mosaic reassembly.
//!
//! The stitching engine leaves one file per fused slice. The reassembler
//! copies those planes, in increasing slice order, into multi-page files of
//! at most `max_slices_per_file` slices each. The final metadata takes its
//! pixel geometry from the first fused slice and its channel identity from
//! the acquisition, since the engine's own record does not carry channel
//! names or colors.

use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::decompose::partial_path;
use crate::error::{PipelineError, Result};
use crate::metadata::{ChannelDescriptor, SeriesMetadata};
use crate::naming::{SliceDigits, fused_output_name, fused_slice_name};
use crate::ome_tiff::{
    MemorySeries, OmeTiffWriter, Plane, SeriesReader, SeriesWriter, container_metadata,
    read_single_plane,
};

pub const DEFAULT_MAX_SLICES_PER_FILE: usize = 200;

/// Split `[0, size_z)` into consecutive runs of at most `max_slices`.
#[must_use]
pub fn partition_chunks(size_z: usize, max_slices: usize) -> Vec<Range<usize>> {
    let step = max_slices.max(1);
    (0..size_z)
        .step_by(step)
        .map(|start| start..(start + step).min(size_z))
        .collect()
}

/// Fused slices of one channel, as produced by one stitch invocation.
pub trait FusedSlices {
    fn slice_count(&self) -> usize;

    /// Where slice `slice` lives, for diagnostics.
    fn locate(&self, slice: usize) -> PathBuf;

    fn contains(&self, slice: usize) -> bool;

    /// Series metadata of the first slice.
    fn basis(&mut self) -> Result<SeriesMetadata>;

    fn read_slice(&mut self, slice: usize) -> Result<Plane>;
}

/// Per-slice files written by the engine into one output directory.
#[derive(Debug, Clone)]
pub struct SliceDirectory {
    directory: PathBuf,
    size_z: usize,
    channel_in_file: usize,
    digits: SliceDigits,
    extension: String,
}

impl SliceDirectory {
    /// Slices `img_t1_z<padded>_c<channel_in_file>` for a run of `size_z`
    /// slices. The padding width is derived from `size_z`.
    #[must_use]
    pub fn new(directory: &Path, size_z: usize, channel_in_file: usize) -> Self {
        Self {
            directory: directory.to_path_buf(),
            size_z,
            channel_in_file,
            digits: SliceDigits::for_count(size_z),
            extension: String::new(),
        }
    }

    #[must_use]
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.to_string();
        self
    }
}

impl FusedSlices for SliceDirectory {
    fn slice_count(&self) -> usize {
        self.size_z
    }

    fn locate(&self, slice: usize) -> PathBuf {
        self.directory.join(fused_slice_name(
            slice,
            self.channel_in_file,
            self.digits,
            &self.extension,
        ))
    }

    fn contains(&self, slice: usize) -> bool {
        self.locate(slice).is_file()
    }

    fn basis(&mut self) -> Result<SeriesMetadata> {
        let path = self.locate(0);
        container_metadata(&path).map_err(|e| PipelineError::reassembly(0, &path, e))
    }

    fn read_slice(&mut self, slice: usize) -> Result<Plane> {
        let path = self.locate(slice);
        read_single_plane(&path).map_err(|e| PipelineError::reassembly(slice, &path, e))
    }
}

/// One channel of a fused stack handed back in memory.
#[derive(Debug, Clone)]
pub struct DisplayedSlices {
    series: MemorySeries,
    channel: usize,
}

impl DisplayedSlices {
    /// `channel` is the 0-based channel within `series`.
    #[must_use]
    pub fn new(series: MemorySeries, channel: usize) -> Self {
        Self { series, channel }
    }
}

impl FusedSlices for DisplayedSlices {
    fn slice_count(&self) -> usize {
        self.series.metadata().size_z
    }

    fn locate(&self, slice: usize) -> PathBuf {
        PathBuf::from(format!("<displayed>/c{}/z{slice}", self.channel))
    }

    fn contains(&self, slice: usize) -> bool {
        slice < self.slice_count() && self.channel < self.series.metadata().size_c
    }

    fn basis(&mut self) -> Result<SeriesMetadata> {
        Ok(self.series.metadata().clone())
    }

    fn read_slice(&mut self, slice: usize) -> Result<Plane> {
        let index = self.series.metadata().plane_index(slice, self.channel, 0);
        self.series
            .read_plane(index)
            .map_err(|e| PipelineError::reassembly(slice, &self.locate(slice), e))
    }
}

/// A consolidated output file and the slices it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub path: PathBuf,
    pub channel: Option<usize>,
    pub slices: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct Reassembler {
    output_dir: PathBuf,
    max_slices_per_file: usize,
}

impl Reassembler {
    #[must_use]
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            max_slices_per_file: DEFAULT_MAX_SLICES_PER_FILE,
        }
    }

    #[must_use]
    pub fn with_max_slices_per_file(mut self, max: usize) -> Self {
        self.max_slices_per_file = max.max(1);
        self
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write every slice of `source` into chunk files named for `channel`.
    ///
    /// A chunk is only renamed into place once all of its planes are
    /// written. A missing slice aborts with the slice index; chunks written
    /// before it are kept.
    pub fn reassemble(
        &self,
        source: &mut dyn FusedSlices,
        channel: Option<usize>,
        descriptor: &ChannelDescriptor,
        physical_size: [Option<f64>; 3],
    ) -> Result<Vec<OutputChunk>> {
        let size_z = source.slice_count();
        if size_z == 0 {
            return Err(PipelineError::reassembly(0, &source.locate(0), "no fused slices expected"));
        }
        if !source.contains(0) {
            return Err(PipelineError::reassembly(
                0,
                &source.locate(0),
                "expected fused slice is missing",
            ));
        }
        let basis = source.basis()?;

        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| PipelineError::reassembly(0, &self.output_dir, e))?;

        let chunks = partition_chunks(size_z, self.max_slices_per_file);
        let numbered = chunks.len() > 1;
        info!(
            channel = ?channel,
            slices = size_z,
            chunks = chunks.len(),
            output_dir = %self.output_dir.display(),
            "reassembling fused slices"
        );

        let mut written = Vec::with_capacity(chunks.len());
        for (n, slices) in chunks.into_iter().enumerate() {
            let name = fused_output_name(channel, numbered.then_some(n));
            let path = self.output_dir.join(name);

            if let Some(missing) = slices.clone().find(|&z| !source.contains(z)) {
                return Err(PipelineError::reassembly(
                    missing,
                    &source.locate(missing),
                    "expected fused slice is missing",
                ));
            }

            let metadata = basis.fused_metadata(slices.len(), descriptor, physical_size);
            write_chunk(source, &metadata, slices.clone(), &path)?;
            debug!(chunk = n, path = %path.display(), slices = ?slices, "chunk written");

            written.push(OutputChunk {
                path,
                channel,
                slices,
            });
        }
        Ok(written)
    }
}

fn write_chunk(
    source: &mut dyn FusedSlices,
    metadata: &SeriesMetadata,
    slices: Range<usize>,
    path: &Path,
) -> Result<()> {
    let partial = partial_path(path);
    let result = OmeTiffWriter::create(&partial, metadata)
        .map_err(|e| PipelineError::reassembly(slices.start, path, e))
        .and_then(|writer| copy_slices(source, writer, slices.clone(), path));

    match result {
        Ok(()) => std::fs::rename(&partial, path)
            .map_err(|e| PipelineError::reassembly(slices.start, path, e)),
        Err(err) => {
            // a half-written chunk must not look like output
            if let Err(e) = std::fs::remove_file(&partial) {
                debug!(path = %partial.display(), %e, "partial chunk not removed");
            }
            Err(err)
        }
    }
}

fn copy_slices<W: SeriesWriter>(
    source: &mut dyn FusedSlices,
    mut writer: W,
    slices: Range<usize>,
    path: &Path,
) -> Result<()> {
    let last = slices.end.saturating_sub(1);
    for (index, z) in slices.enumerate() {
        let plane = source.read_slice(z)?;
        writer
            .write_plane(index, &plane)
            .map_err(|e| PipelineError::reassembly(z, path, e))?;
    }
    writer
        .finish()
        .map_err(|e| PipelineError::reassembly(last, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PixelType;
    use crate::ome_tiff::{OmeTiffReader, PlaneData, read_series_metadata};
    use std::fs::File;
    use tempfile::TempDir;
    use tiff::encoder::{TiffEncoder, colortype};

    fn write_slices(dir: &Path, size_z: usize, channel_in_file: usize, skip: Option<usize>) {
        let digits = SliceDigits::for_count(size_z);
        for z in 0..size_z {
            if Some(z) == skip {
                continue;
            }
            let path = dir.join(fused_slice_name(z, channel_in_file, digits, ""));
            let mut encoder = TiffEncoder::new(File::create(path).unwrap()).unwrap();
            encoder
                .write_image::<colortype::Gray16>(4, 3, &[z as u16; 12])
                .unwrap();
        }
    }

    fn first_sample(plane: &Plane) -> u16 {
        match &plane.data {
            PlaneData::U16(d) => d[0],
            _ => panic!("unexpected sample type"),
        }
    }

    fn gfp() -> ChannelDescriptor {
        ChannelDescriptor::new(1).with_name("GFP").with_color(-16711936)
    }

    #[test]
    fn test_partition_chunks() {
        assert_eq!(partition_chunks(450, 200), vec![0..200, 200..400, 400..450]);
        assert_eq!(partition_chunks(200, 200), vec![0..200]);
        assert_eq!(partition_chunks(201, 200), vec![0..200, 200..201]);
        assert!(partition_chunks(0, 200).is_empty());
    }

    #[test]
    fn test_single_chunk_carries_channel_identity() {
        let slices_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_slices(slices_dir.path(), 10, 2, None);

        let mut source = SliceDirectory::new(slices_dir.path(), 10, 2);
        let chunks = Reassembler::new(out.path())
            .reassemble(&mut source, Some(1), &gfp(), [Some(0.5), Some(0.5), Some(2.0)])
            .unwrap();

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].path, out.path().join("fused_C1.ome.tif"));
        let meta = read_series_metadata(&chunks[0].path).unwrap();
        assert_eq!((meta.size_x, meta.size_y, meta.size_z, meta.size_c, meta.size_t), (4, 3, 10, 1, 1));
        assert_eq!(meta.pixel_type, PixelType::UInt16);
        assert_eq!(meta.channels[0].name.as_deref(), Some("GFP"));
        assert_eq!(meta.channels[0].color, Some(-16711936));
        assert_eq!(meta.physical_size, [Some(0.5), Some(0.5), Some(2.0)]);
    }

    #[test]
    fn test_chunks_cover_every_slice_in_order() {
        let slices_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_slices(slices_dir.path(), 25, 1, None);

        let mut source = SliceDirectory::new(slices_dir.path(), 25, 1);
        let chunks = Reassembler::new(out.path())
            .with_max_slices_per_file(10)
            .reassemble(&mut source, Some(0), &ChannelDescriptor::new(0), [None; 3])
            .unwrap();

        let names: Vec<_> = chunks
            .iter()
            .map(|c| c.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec!["fused_C0_subset0.ome.tif", "fused_C0_subset1.ome.tif", "fused_C0_subset2.ome.tif"]
        );

        let mut seen = Vec::new();
        for chunk in &chunks {
            let mut reader = OmeTiffReader::open(&chunk.path).unwrap();
            let size_z = reader.metadata().size_z;
            assert_eq!(size_z, chunk.slices.len());
            for i in 0..size_z {
                seen.push(first_sample(&reader.read_plane(i).unwrap()) as usize);
            }
        }
        assert_eq!(seen, (0..25).collect::<Vec<_>>());
    }

    #[test]
    fn test_missing_slice_is_reported() {
        let slices_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_slices(slices_dir.path(), 50, 1, Some(37));

        let mut source = SliceDirectory::new(slices_dir.path(), 50, 1);
        let err = Reassembler::new(out.path())
            .reassemble(&mut source, Some(0), &ChannelDescriptor::new(0), [None; 3])
            .unwrap_err();

        match err {
            PipelineError::Reassembly { slice, path, .. } => {
                assert_eq!(slice, 37);
                assert!(path.ends_with("img_t1_z38_c1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!out.path().join("fused_C0.ome.tif").exists());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_slice_keeps_earlier_chunks() {
        let slices_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        write_slices(slices_dir.path(), 50, 1, Some(37));

        let mut source = SliceDirectory::new(slices_dir.path(), 50, 1);
        let err = Reassembler::new(out.path())
            .with_max_slices_per_file(20)
            .reassemble(&mut source, Some(0), &ChannelDescriptor::new(0), [None; 3])
            .unwrap_err();

        assert!(matches!(err, PipelineError::Reassembly { slice: 37, .. }));
        let kept = out.path().join("fused_C0_subset0.ome.tif");
        assert_eq!(read_series_metadata(&kept).unwrap().size_z, 20);
        assert!(!out.path().join("fused_C0_subset1.ome.tif").exists());
        assert!(!out.path().join("fused_C0_subset2.ome.tif").exists());
    }

    #[test]
    fn test_padding_must_match_slice_count() {
        let slices_dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        // written for a 120-slice run, read as if the run had 12
        write_slices(slices_dir.path(), 120, 1, None);

        let mut source = SliceDirectory::new(slices_dir.path(), 12, 1);
        let err = Reassembler::new(out.path())
            .reassemble(&mut source, None, &ChannelDescriptor::new(0), [None; 3])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Reassembly { slice: 0, .. }));
    }

    #[test]
    fn test_displayed_stack_is_chunked_per_channel() {
        let out = TempDir::new().unwrap();
        let meta = SeriesMetadata::new(5, 2, 3, 2, 1, PixelType::UInt8);
        let planes = (0..meta.plane_count())
            .map(|i| Plane {
                width: 5,
                height: 2,
                data: PlaneData::U8(vec![i as u8; 10]),
            })
            .collect();
        let series = MemorySeries::new(meta.clone(), planes).unwrap();

        let mut source = DisplayedSlices::new(series, 1);
        let chunks = Reassembler::new(out.path())
            .with_max_slices_per_file(2)
            .reassemble(&mut source, Some(1), &gfp(), [None; 3])
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].slices, 2..3);

        let mut reader = OmeTiffReader::open(&chunks[1].path).unwrap();
        assert_eq!((reader.metadata().size_x, reader.metadata().size_y), (5, 2));
        let plane = reader.read_plane(0).unwrap();
        assert_eq!(plane.data, PlaneData::U8(vec![meta.plane_index(2, 1, 0) as u8; 10]));
    }
}
