//! Reversible metadata transplant.
//!
//! The stitching engine introspects each tile's embedded metadata and
//! assumes a single-timepoint series named by its `{i}` pattern. A
//! [`TransplantGuard`] rewrites the embedded record of every tile to its
//! derived per-tile metadata and renames tiles into the engine's naming,
//! after capturing the original record and filename of each. Dropping the
//! guard, or calling [`TransplantGuard::restore`], replays the captured state.
//!
//! ```rust,ignore
//! let guard = TransplantGuard::acquire(&manifest)?;
//! let outcome = stitcher.invoke(&job);
//! guard.restore()?;
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::decompose::{TileManifest, file_name};
use crate::error::{PipelineError, Result};
use crate::naming::{Coordinate, TileNaming};
use crate::ome_tiff::{
    capture_embedded_metadata, read_embedded_metadata, restore_embedded_metadata,
    write_embedded_metadata,
};
use crate::ome_xml::to_ome_xml;
use crate::tiff_utils::AsciiTagSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransplantState {
    Original,
    Transplanted,
    Restored,
}

/// State of one tile before any mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedTile {
    pub coordinate: Coordinate,
    pub original_path: PathBuf,
    pub original_record: String,
    /// Where and how the original record was stored in the file
    pub original_slot: AsciiTagSlot,
    pub transplanted_record: String,
    pub stitch_path: PathBuf,
}

pub struct TransplantGuard {
    directory: PathBuf,
    original_naming: TileNaming,
    stitch_naming: TileNaming,
    captured: Vec<CapturedTile>,
    state: TransplantState,
}

impl TransplantGuard {
    /// Capture every tile, then rewrite and rename them. If any tile fails
    /// to transplant, the ones already touched are restored before the error
    /// is returned.
    pub fn acquire(manifest: &TileManifest) -> Result<Self> {
        let stitch_naming = manifest.strategy.naming();
        let mut captured = Vec::with_capacity(manifest.tiles.len());

        for tile in &manifest.tiles {
            let original_record = read_embedded_metadata(&tile.path)
                .map_err(|e| PipelineError::transplant(&tile.path, e))?;
            let original_slot = capture_embedded_metadata(&tile.path)
                .map_err(|e| PipelineError::transplant(&tile.path, e))?;
            let stitch_path = manifest.directory.join(stitch_naming.encode(tile.coordinate));
            if stitch_path != tile.path && stitch_path.exists() {
                return Err(PipelineError::transplant(
                    &tile.path,
                    format!("rename target {} already exists", stitch_path.display()),
                ));
            }
            captured.push(CapturedTile {
                coordinate: tile.coordinate,
                original_path: tile.path.clone(),
                original_record,
                original_slot,
                transplanted_record: to_ome_xml(&tile.metadata)
                    .map_err(|e| PipelineError::transplant(&tile.path, e))?,
                stitch_path,
            });
        }

        let mut guard = Self {
            directory: manifest.directory.clone(),
            original_naming: manifest.naming.clone(),
            stitch_naming,
            captured,
            state: TransplantState::Original,
        };

        info!(
            tiles = guard.captured.len(),
            directory = %guard.directory.display(),
            "transplanting tile metadata"
        );

        for tile in &guard.captured {
            if let Err(err) = transplant_tile(tile) {
                if let Err(restore_err) = guard.restore_all() {
                    error!(%restore_err, "restoration after failed transplant also failed");
                }
                guard.state = TransplantState::Restored;
                return Err(err);
            }
        }

        guard.state = TransplantState::Transplanted;
        Ok(guard)
    }

    #[must_use]
    pub fn state(&self) -> TransplantState {
        self.state
    }

    #[must_use]
    pub fn captured(&self) -> &[CapturedTile] {
        &self.captured
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// `{i}` pattern of the transplanted tiles, for one channel when tiles
    /// are split by channel.
    #[must_use]
    pub fn stitch_pattern(&self, channel: Option<usize>) -> String {
        self.stitch_naming.encode_pattern(channel)
    }

    /// Replay captured names and records, consuming the guard.
    pub fn restore(mut self) -> Result<()> {
        let result = self.restore_all();
        // Drop must not retry; a failed restore is reported to the caller
        self.state = TransplantState::Restored;
        result
    }

    fn restore_all(&self) -> Result<()> {
        let mut first_error = None;
        for tile in &self.captured {
            if let Err(err) = self.restore_tile(tile) {
                error!(path = %tile.original_path.display(), %err, "tile restore failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(tiles = self.captured.len(), "tile metadata restored");
                Ok(())
            }
        }
    }

    fn restore_tile(&self, tile: &CapturedTile) -> Result<()> {
        if tile.stitch_path != tile.original_path && tile.stitch_path.exists() {
            let stitch_name = file_name(&tile.stitch_path)?;
            let decoded = self.stitch_naming.decode(&stitch_name)?;
            // stitch names carry no slice; the captured one completes the coordinate
            let coordinate = Coordinate {
                slice: tile.coordinate.slice,
                ..decoded
            };
            let original_name = self.original_naming.encode(coordinate);
            let captured_name = file_name(&tile.original_path)?;
            if coordinate != tile.coordinate || original_name != captured_name {
                return Err(PipelineError::transplant(
                    &tile.stitch_path,
                    format!("decodes to {original_name}, which is not the captured name"),
                ));
            }
            std::fs::rename(&tile.stitch_path, &tile.original_path)
                .map_err(|e| PipelineError::transplant(&tile.stitch_path, e))?;
        }

        if !tile.original_path.is_file() {
            return Err(PipelineError::transplant(
                &tile.original_path,
                "tile disappeared while transplanted",
            ));
        }

        restore_embedded_metadata(&tile.original_path, &tile.original_slot)
            .map_err(|e| PipelineError::transplant(&tile.original_path, e))?;
        debug!(path = %tile.original_path.display(), "tile restored");
        Ok(())
    }
}

impl Drop for TransplantGuard {
    fn drop(&mut self) {
        if self.state == TransplantState::Transplanted {
            if let Err(err) = self.restore_all() {
                error!(%err, "tiles left transplanted: restore during unwind failed");
            }
            self.state = TransplantState::Restored;
        }
    }
}

fn transplant_tile(tile: &CapturedTile) -> Result<()> {
    write_embedded_metadata(&tile.original_path, &tile.transplanted_record)
        .map_err(|e| PipelineError::transplant(&tile.original_path, e))?;
    if tile.stitch_path != tile.original_path {
        std::fs::rename(&tile.original_path, &tile.stitch_path)
            .map_err(|e| PipelineError::transplant(&tile.original_path, e))?;
    }
    debug!(
        from = %tile.original_path.display(),
        to = %tile.stitch_path.display(),
        "tile transplanted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompose::{SplitStrategy, TileManifest};
    use crate::metadata::{ChannelDescriptor, PixelType, SeriesMetadata};
    use crate::naming::SliceDigits;
    use crate::ome_tiff::{OmeTiffWriter, Plane, PlaneData, read_series_metadata};
    use tempfile::TempDir;

    fn acquisition(dir: &Path) -> TileManifest {
        let mut series = SeriesMetadata::new(4, 4, 3, 2, 3, PixelType::UInt8);
        series.channels = vec![
            ChannelDescriptor::new(0).with_name("DAPI"),
            ChannelDescriptor::new(1).with_name("GFP"),
        ];
        let naming = TileNaming::Acquisition {
            prefix: "scan_".to_string(),
            digits: SliceDigits::fixed(2),
        };
        let manifest =
            TileManifest::plan(dir, &series, SplitStrategy::ChannelSplit, naming).unwrap();

        // acquisition files embed the whole series, not their own subset
        let mut file_meta = series.clone();
        file_meta.size_c = 1;
        file_meta.size_t = 1;
        file_meta.channels.truncate(1);
        for tile in &manifest.tiles {
            let mut writer = OmeTiffWriter::create(&tile.path, &file_meta).unwrap();
            for z in 0..3 {
                let plane = Plane {
                    width: 4,
                    height: 4,
                    data: PlaneData::U8(vec![z as u8; 16]),
                };
                writer.write_plane(z, &plane).unwrap();
            }
            writer.finish().unwrap();
            write_embedded_metadata(&tile.path, &to_ome_xml(&series).unwrap()).unwrap();
        }
        manifest
    }

    fn snapshot(manifest: &TileManifest) -> Vec<(PathBuf, String)> {
        manifest
            .tiles
            .iter()
            .map(|t| (t.path.clone(), read_embedded_metadata(&t.path).unwrap()))
            .collect()
    }

    #[test]
    fn test_transplant_renames_and_rewrites() {
        let dir = TempDir::new().unwrap();
        let manifest = acquisition(dir.path());

        let guard = TransplantGuard::acquire(&manifest).unwrap();
        assert_eq!(guard.state(), TransplantState::Transplanted);
        assert_eq!(guard.stitch_pattern(Some(1)), "tile_{i}_channel_1.ome.tif");

        let stitched = dir.path().join("tile_2_channel_1.ome.tif");
        assert!(stitched.is_file());
        assert!(!dir.path().join("scan_Z00_T2_C1.ome.tif").exists());
        let meta = read_series_metadata(&stitched).unwrap();
        assert_eq!((meta.size_t, meta.size_c, meta.size_z), (1, 1, 3));
        assert_eq!(meta.channels[0].name.as_deref(), Some("GFP"));

        guard.restore().unwrap();
    }

    #[test]
    fn test_restore_after_success() {
        let dir = TempDir::new().unwrap();
        let manifest = acquisition(dir.path());
        let before = snapshot(&manifest);

        let guard = TransplantGuard::acquire(&manifest).unwrap();
        guard.restore().unwrap();

        assert_eq!(snapshot(&manifest), before);
        assert!(!dir.path().join("tile_0_channel_0.ome.tif").exists());
    }

    fn file_bytes(manifest: &TileManifest) -> Vec<Vec<u8>> {
        manifest
            .tiles
            .iter()
            .map(|t| std::fs::read(&t.path).unwrap())
            .collect()
    }

    #[test]
    fn test_repeated_brackets_leave_tiles_byte_identical() {
        let dir = TempDir::new().unwrap();
        let manifest = acquisition(dir.path());
        let before = file_bytes(&manifest);

        for _ in 0..3 {
            TransplantGuard::acquire(&manifest).unwrap().restore().unwrap();
        }
        drop(TransplantGuard::acquire(&manifest).unwrap());

        assert_eq!(file_bytes(&manifest), before);
    }

    #[test]
    fn test_restore_keeps_nonzero_slice_field() {
        let dir = TempDir::new().unwrap();
        let planned = acquisition(dir.path());
        for tile in &planned.tiles {
            let name = file_name(&tile.path).unwrap().replace("_Z00_", "_Z01_");
            std::fs::rename(&tile.path, dir.path().join(name)).unwrap();
        }
        let manifest = TileManifest::scan_acquisition(dir.path(), "scan_").unwrap();
        let before = file_bytes(&manifest);

        let guard = TransplantGuard::acquire(&manifest).unwrap();
        assert!(dir.path().join("tile_2_channel_1.ome.tif").is_file());
        guard.restore().unwrap();

        assert!(dir.path().join("scan_Z01_T2_C1.ome.tif").is_file());
        assert!(!dir.path().join("tile_2_channel_1.ome.tif").exists());
        assert_eq!(file_bytes(&manifest), before);
    }

    #[test]
    fn test_drop_restores_after_failure() {
        let dir = TempDir::new().unwrap();
        let manifest = acquisition(dir.path());
        let before = snapshot(&manifest);

        let simulated: Result<()> = (|| {
            let _guard = TransplantGuard::acquire(&manifest)?;
            Err(PipelineError::StitchInvocation {
                pattern: "tile_{i}_channel_0.ome.tif".to_string(),
                message: "engine crashed".to_string(),
            })
        })();

        assert!(simulated.is_err());
        assert_eq!(snapshot(&manifest), before);
    }

    #[test]
    fn test_acquire_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        let manifest = acquisition(dir.path());
        let before = snapshot(&manifest);

        // a stray file occupying a rename target blocks the transplant
        std::fs::write(dir.path().join("tile_2_channel_1.ome.tif"), b"stray").unwrap();
        assert!(TransplantGuard::acquire(&manifest).is_err());
        assert_eq!(snapshot(&manifest), before);
    }

    #[test]
    fn test_decomposed_tiles_keep_their_names() {
        let dir = TempDir::new().unwrap();
        let series = SeriesMetadata::new(2, 2, 1, 1, 2, PixelType::UInt8);
        let manifest =
            TileManifest::plan(dir.path(), &series, SplitStrategy::Compact, TileNaming::Compact)
                .unwrap();
        for tile in &manifest.tiles {
            let mut writer = OmeTiffWriter::create(&tile.path, &series).unwrap();
            for i in 0..series.plane_count() {
                let plane = Plane {
                    width: 2,
                    height: 2,
                    data: PlaneData::U8(vec![i as u8; 4]),
                };
                writer.write_plane(i, &plane).unwrap();
            }
            writer.finish().unwrap();
        }
        let before = snapshot(&manifest);

        let guard = TransplantGuard::acquire(&manifest).unwrap();
        assert!(dir.path().join("tile_1.ome.tif").is_file());
        assert_eq!(
            read_series_metadata(&dir.path().join("tile_1.ome.tif")).unwrap().size_t,
            1
        );
        drop(guard);

        assert_eq!(snapshot(&manifest), before);
    }
}
