//! Tile decomposition.
//!
//! Splits a multi-dimensional source series into one OME-TIFF per tile
//! (timepoint), or per tile and channel when a timepoint holds more planes
//! than the split threshold. The resulting [`TileManifest`] is the ordered
//! Coordinate -> path mapping every later phase works from.
//!
//! # Example
//!
//! ```rust,ignore
//! use tilefuse::{OmeTiffReader, TileDecomposer};
//!
//! let reader = OmeTiffReader::open(&source)?;
//! let handle = TileDecomposer::new(&tiles_dir).spawn(Box::new(reader));
//! let manifest = handle.wait(Some(Duration::from_secs(600))).await?;
//! println!("{} tiles written", manifest.tiles.len());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cleanup::glob_in;
use crate::error::{PipelineError, Result};
use crate::metadata::SeriesMetadata;
use crate::naming::{Coordinate, SliceDigits, TILE_EXTENSION, TileNaming};
use crate::ome_tiff::{OmeTiffWriter, SeriesReader, read_series_metadata};

/// Planes per timepoint above which tiles are split by channel.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 100;

/// Suffix of a tile file still being written.
pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    /// One file per timepoint holding every channel and slice.
    Compact,
    /// One file per timepoint and channel holding every slice.
    ChannelSplit,
}

impl SplitStrategy {
    #[must_use]
    pub fn for_series(series: &SeriesMetadata, threshold: usize) -> Self {
        if series.planes_per_timepoint() > threshold {
            SplitStrategy::ChannelSplit
        } else {
            SplitStrategy::Compact
        }
    }

    /// Names the stitching engine expects for tiles of this layout.
    #[must_use]
    pub fn naming(&self) -> TileNaming {
        match self {
            SplitStrategy::Compact => TileNaming::Compact,
            SplitStrategy::ChannelSplit => TileNaming::ChannelSplit,
        }
    }
}

/// One tile file and the metadata it should carry.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFile {
    pub coordinate: Coordinate,
    pub path: PathBuf,
    /// Source channel held by this file, `None` when it holds all of them
    pub channel: Option<usize>,
    pub metadata: SeriesMetadata,
}

#[derive(Debug, Clone)]
pub struct TileManifest {
    pub directory: PathBuf,
    pub strategy: SplitStrategy,
    /// How tile files are currently named on disk
    pub naming: TileNaming,
    /// The acquisition the tiles were cut from
    pub series: SeriesMetadata,
    /// Tiles in (timepoint, channel) order
    pub tiles: Vec<TileFile>,
}

impl TileManifest {
    /// Every tile the given layout produces for `series`, named by `naming`.
    /// Fails when the series carries fewer channel descriptors than `size_c`.
    pub fn plan(
        directory: &Path,
        series: &SeriesMetadata,
        strategy: SplitStrategy,
        naming: TileNaming,
    ) -> Result<Self> {
        let tile_metadata = |coordinate: Coordinate, channel: Option<usize>| {
            series.tile_metadata(channel).ok_or_else(|| {
                PipelineError::decomposition(
                    Some(coordinate),
                    None,
                    format!(
                        "series describes {} channels but carries {} descriptors",
                        series.size_c,
                        series.channels.len()
                    ),
                )
            })
        };

        let mut tiles = Vec::new();
        for t in 0..series.size_t {
            match strategy {
                SplitStrategy::Compact => {
                    let coordinate = Coordinate::new(t, 0, 0);
                    tiles.push(TileFile {
                        coordinate,
                        path: directory.join(naming.encode(coordinate)),
                        channel: None,
                        metadata: tile_metadata(coordinate, None)?,
                    });
                }
                SplitStrategy::ChannelSplit => {
                    for c in 0..series.size_c {
                        let coordinate = Coordinate::new(t, 0, c);
                        tiles.push(TileFile {
                            coordinate,
                            path: directory.join(naming.encode(coordinate)),
                            channel: Some(c),
                            metadata: tile_metadata(coordinate, Some(c))?,
                        });
                    }
                }
            }
        }

        Ok(Self {
            directory: directory.to_path_buf(),
            strategy,
            naming,
            series: series.clone(),
            tiles,
        })
    }

    /// Build a manifest from pre-split acquisition files named
    /// `<prefix>Z<ZZ>_T<T>_C<C>.ome.tif`, one per tile and channel, whose
    /// embedded metadata describes the whole acquisition.
    ///
    /// Tiles keep the paths found on disk, including their slice field.
    pub fn scan_acquisition(directory: &Path, prefix: &str) -> Result<Self> {
        let pattern = glob_in(
            directory,
            &format!("{}Z*_T*_C*{TILE_EXTENSION}", glob::Pattern::escape(prefix)),
        );
        let paths = glob::glob(&pattern)
            .map_err(|e| PipelineError::decomposition(None, Some(directory), e))?;

        let decoder = TileNaming::Acquisition {
            prefix: prefix.to_string(),
            digits: SliceDigits::fixed(1),
        };
        let mut found: BTreeMap<(usize, usize), (Coordinate, PathBuf)> = BTreeMap::new();
        let mut width = None;
        for entry in paths {
            let path = entry.map_err(|e| PipelineError::decomposition(None, Some(directory), e))?;
            let name = file_name(&path)?;
            let coordinate = decoder.decode(&name)?;
            let z_width = name[prefix.len() + 1..]
                .find(|ch: char| !ch.is_ascii_digit())
                .unwrap_or(1);
            let expected = *width.get_or_insert(z_width);
            if z_width != expected {
                return Err(PipelineError::decomposition(
                    Some(coordinate),
                    Some(&path),
                    format!("slice field is {z_width} digits wide, earlier files use {expected}"),
                ));
            }
            let key = (coordinate.tile, coordinate.channel);
            if let Some((_, earlier)) = found.insert(key, (coordinate, path.clone())) {
                return Err(PipelineError::decomposition(
                    Some(coordinate),
                    Some(&path),
                    format!("same tile and channel as {}", earlier.display()),
                ));
            }
        }

        let Some((first_coordinate, first)) = found.values().next() else {
            return Err(PipelineError::decomposition(
                None,
                Some(directory),
                format!("no acquisition tiles match {pattern}"),
            ));
        };
        let series = read_series_metadata(first)
            .map_err(|e| PipelineError::decomposition(None, Some(first), e))?;

        let tiles_seen: BTreeSet<usize> = found.keys().map(|&(t, _)| t).collect();
        let channels_seen: BTreeSet<usize> = found.keys().map(|&(_, c)| c).collect();
        if tiles_seen.len() != series.size_t || channels_seen.len() != series.size_c {
            warn!(
                tiles = tiles_seen.len(),
                channels = channels_seen.len(),
                size_t = series.size_t,
                size_c = series.size_c,
                "acquisition file set does not match its embedded dimensions"
            );
        }

        let naming = TileNaming::Acquisition {
            prefix: prefix.to_string(),
            digits: SliceDigits::fixed(width.unwrap_or(1)),
        };
        let default_slice = first_coordinate.slice;
        let mut manifest = Self::plan(directory, &series, SplitStrategy::ChannelSplit, naming)?;
        for tile in &mut manifest.tiles {
            let key = (tile.coordinate.tile, tile.coordinate.channel);
            match found.get(&key) {
                Some((coordinate, path)) => {
                    tile.coordinate = *coordinate;
                    tile.path = path.clone();
                }
                None => {
                    // missing tiles take the slice field of the others
                    tile.coordinate.slice = default_slice;
                    tile.path = directory.join(manifest.naming.encode(tile.coordinate));
                }
            }
        }
        manifest.verify_complete()?;
        Ok(manifest)
    }

    /// The tile whose existence marks the end of decomposition: the final
    /// (timepoint, channel) pair.
    #[must_use]
    pub fn last_expected(&self) -> Option<&TileFile> {
        self.tiles
            .iter()
            .max_by_key(|tile| (tile.coordinate.tile, tile.coordinate.channel))
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tiles.iter().all(|tile| tile.path.is_file())
    }

    /// Fails with the first tile missing from disk.
    pub fn verify_complete(&self) -> Result<()> {
        if let Some(last) = self.last_expected()
            && !last.path.is_file()
        {
            return Err(PipelineError::decomposition(
                Some(last.coordinate),
                Some(&last.path),
                "last expected tile is missing",
            ));
        }
        match self.tiles.iter().find(|tile| !tile.path.is_file()) {
            Some(missing) => Err(PipelineError::decomposition(
                Some(missing.coordinate),
                Some(&missing.path),
                "expected tile is missing",
            )),
            None => Ok(()),
        }
    }

    /// Number of grid positions handed to the stitcher.
    #[must_use]
    pub fn grid_tiles(&self) -> usize {
        self.series.size_t
    }

    /// Tiles the stitcher reads for one source channel.
    pub fn tiles_for_channel(&self, channel: usize) -> impl Iterator<Item = &TileFile> {
        self.tiles
            .iter()
            .filter(move |tile| tile.channel.is_none_or(|c| c == channel))
    }
}

/// Cooperative cancellation shared between a handle and its task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct TileDecomposer {
    directory: PathBuf,
    split_threshold: usize,
}

impl TileDecomposer {
    #[must_use]
    pub fn new(directory: &Path) -> Self {
        Self {
            directory: directory.to_path_buf(),
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    /// Manifest this decomposer would write for `series`.
    pub fn plan(&self, series: &SeriesMetadata) -> Result<TileManifest> {
        let strategy = SplitStrategy::for_series(series, self.split_threshold);
        TileManifest::plan(&self.directory, series, strategy, strategy.naming())
    }

    /// Write every tile, returning once the last one is on disk.
    pub fn decompose(
        &self,
        reader: &mut dyn SeriesReader,
        cancel: &CancelToken,
    ) -> Result<TileManifest> {
        let series = reader.metadata().clone();
        let manifest = self.plan(&series)?;

        std::fs::create_dir_all(&self.directory)
            .map_err(|e| PipelineError::decomposition(None, Some(&self.directory), e))?;

        info!(
            strategy = ?manifest.strategy,
            tiles = manifest.tiles.len(),
            planes_per_timepoint = series.planes_per_timepoint(),
            directory = %self.directory.display(),
            "decomposing series"
        );

        for (done, tile) in manifest.tiles.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    remaining: manifest.tiles.len() - done,
                });
            }
            write_tile(reader, &series, tile)?;
        }

        manifest.verify_complete()?;
        Ok(manifest)
    }

    /// Run [`decompose`](Self::decompose) on the blocking pool. Must be
    /// called from within a tokio runtime.
    pub fn spawn(self, mut reader: Box<dyn SeriesReader>) -> DecompositionHandle {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let task = tokio::task::spawn_blocking(move || self.decompose(reader.as_mut(), &token));
        DecompositionHandle { task, cancel }
    }
}

/// Completion handle for a running decomposition.
pub struct DecompositionHandle {
    task: JoinHandle<Result<TileManifest>>,
    cancel: CancelToken,
}

impl DecompositionHandle {
    /// Ask the task to stop before its next tile.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Resolve once every expected tile exists on disk. When `timeout`
    /// elapses first the task is cancelled and awaited before returning.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<TileManifest> {
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.task).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.cancel.cancel();
                    match self.task.await {
                        Ok(Ok(manifest)) => debug!(
                            tiles = manifest.tiles.len(),
                            "decomposition finished after the timeout"
                        ),
                        Ok(Err(err)) => debug!(%err, "decomposition stopped after the timeout"),
                        Err(err) => warn!(%err, "decomposition task failed after the timeout"),
                    }
                    return Err(PipelineError::Timeout {
                        seconds: limit.as_secs_f64(),
                    });
                }
            },
            None => self.task.await,
        };

        let manifest = joined.map_err(|e| {
            PipelineError::decomposition(None, None, format!("decomposition task failed: {e}"))
        })??;
        manifest.verify_complete()?;
        Ok(manifest)
    }
}

fn write_tile(reader: &mut dyn SeriesReader, series: &SeriesMetadata, tile: &TileFile) -> Result<()> {
    let t = tile.coordinate.tile;
    let partial = partial_path(&tile.path);
    let fail = |e: &dyn std::fmt::Display| {
        PipelineError::decomposition(Some(tile.coordinate), Some(&tile.path), e)
    };

    let mut writer = OmeTiffWriter::create(&partial, &tile.metadata).map_err(|e| fail(&e))?;
    let channels: Vec<usize> = match tile.channel {
        Some(c) => vec![c],
        None => (0..series.size_c).collect(),
    };

    for z in 0..series.size_z {
        for (tile_c, &source_c) in channels.iter().enumerate() {
            let source_index = series.plane_index(z, source_c, t);
            let plane = reader.read_plane(source_index).map_err(|e| fail(&e))?;
            let tile_index = tile.metadata.plane_index(z, tile_c, 0);
            writer.write_plane(tile_index, &plane).map_err(|e| fail(&e))?;
        }
    }
    writer.finish().map_err(|e| fail(&e))?;
    std::fs::rename(&partial, &tile.path).map_err(|e| fail(&e))?;

    debug!(tile = t, channel = ?tile.channel, path = %tile.path.display(), "tile written");
    Ok(())
}

pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub(crate) fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PipelineError::Naming {
            name: path.display().to_string(),
            fragment: "file name",
        })
}
