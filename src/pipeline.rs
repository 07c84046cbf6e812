//! End-to-end control flow.
//!
//! Decompose → transplant → stitch (once per channel) → reassemble → restore
//! → cleanup. The transplant bracket is closed on every path out of the
//! stitch and reassembly phases.
//!
//! ```rust,ignore
//! use tilefuse::{FijiStitcher, GridStitchPipeline, StitchOptions};
//!
//! let options = StitchOptions::default().with_grid(3, 3);
//! let pipeline = GridStitchPipeline::new(FijiStitcher::from_env(), options);
//! let report = pipeline.run_source(Path::new("/data/run42")).await?;
//! for chunk in &report.outputs {
//!     println!("{}", chunk.path.display());
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cleanup::{glob_in, remove_matching, remove_path, remove_stitch_artifacts};
use crate::decompose::{DEFAULT_SPLIT_THRESHOLD, SplitStrategy, TileDecomposer, TileManifest};
use crate::error::{CleanupWarning, PipelineError, Result};
use crate::metadata::ChannelDescriptor;
use crate::ome_tiff::{OmeTiffReader, SeriesReader};
use crate::reassemble::{
    DEFAULT_MAX_SLICES_PER_FILE, DisplayedSlices, OutputChunk, Reassembler, SliceDirectory,
};
use crate::stitcher::{
    ABSOLUTE_DISPLACEMENT_THRESHOLD, MAX_AVG_DISPLACEMENT_THRESHOLD, OutputMode,
    REGRESSION_THRESHOLD, StitchJob, StitchOutcome, Stitcher, TILE_OVERLAP_PERCENT,
};
use crate::transplant::TransplantGuard;

pub const COMPLETION_TIMEOUT_ENV: &str = "TILEFUSE_COMPLETION_TIMEOUT_SECS";
pub const KEEP_TILES_ENV: &str = "TILEFUSE_KEEP_TILES";

/// Per-channel engine output directories inside the tiles directory.
pub const SLICE_DIR_PREFIX: &str = "stitched_c";

/// Run configuration.
#[derive(Debug, Clone)]
pub struct StitchOptions {
    pub grid_x: usize,
    pub grid_y: usize,
    pub tile_overlap: u32,
    pub regression_threshold: f64,
    pub max_avg_displacement_threshold: f64,
    pub absolute_displacement_threshold: f64,
    /// Planes per timepoint above which tiles are split by channel
    pub split_threshold: usize,
    pub max_slices_per_file: usize,
    pub output_mode: OutputMode,
    /// Upper bound on waiting for decomposition
    pub completion_timeout: Option<Duration>,
    /// Leave decomposed tiles and engine output on disk
    pub keep_tiles: bool,
    pub tiles_subdir: String,
    pub source_extension: String,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            grid_x: 3,
            grid_y: 3,
            tile_overlap: TILE_OVERLAP_PERCENT,
            regression_threshold: REGRESSION_THRESHOLD,
            max_avg_displacement_threshold: MAX_AVG_DISPLACEMENT_THRESHOLD,
            absolute_displacement_threshold: ABSOLUTE_DISPLACEMENT_THRESHOLD,
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_slices_per_file: DEFAULT_MAX_SLICES_PER_FILE,
            output_mode: OutputMode::WriteToDisk,
            completion_timeout: std::env::var(COMPLETION_TIMEOUT_ENV)
                .ok()
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|secs| *secs > 0.0)
                .map(Duration::from_secs_f64),
            keep_tiles: std::env::var(KEEP_TILES_ENV)
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            tiles_subdir: "tiles".to_string(),
            source_extension: "tiff".to_string(),
        }
    }
}

impl StitchOptions {
    #[must_use]
    pub fn with_grid(mut self, grid_x: usize, grid_y: usize) -> Self {
        self.grid_x = grid_x;
        self.grid_y = grid_y;
        self
    }

    #[must_use]
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    #[must_use]
    pub fn with_split_threshold(mut self, threshold: usize) -> Self {
        self.split_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_slices_per_file(mut self, max: usize) -> Self {
        self.max_slices_per_file = max;
        self
    }

    #[must_use]
    pub fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_keep_tiles(mut self, keep: bool) -> Self {
        self.keep_tiles = keep;
        self
    }

    #[must_use]
    pub fn with_tiles_subdir(mut self, subdir: &str) -> Self {
        self.tiles_subdir = subdir.to_string();
        self
    }

    fn job(&self, directory: &Path, pattern: &str) -> StitchJob {
        StitchJob::new(self.grid_x, self.grid_y, directory, pattern)
            .with_overlap(self.tile_overlap)
            .with_thresholds(
                self.regression_threshold,
                self.max_avg_displacement_threshold,
                self.absolute_displacement_threshold,
            )
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub strategy: SplitStrategy,
    pub tiles: usize,
    /// Whether a complete tiles directory from an earlier run was used
    pub reused_tiles: bool,
    pub stitch_invocations: usize,
    pub outputs: Vec<OutputChunk>,
    pub warnings: Vec<CleanupWarning>,
}

/// First file with `extension` in `input_dir`, by name.
pub fn find_source(input_dir: &Path, extension: &str) -> Result<PathBuf> {
    let pattern = glob_in(input_dir, &format!("*.{}", glob::Pattern::escape(extension)));
    let mut candidates: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| PipelineError::decomposition(None, Some(input_dir), e))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    candidates.sort();
    candidates.into_iter().next().ok_or_else(|| {
        PipelineError::decomposition(
            None,
            Some(input_dir),
            format!("no *.{extension} source file found"),
        )
    })
}

pub struct GridStitchPipeline<S> {
    stitcher: Arc<S>,
    options: StitchOptions,
}

impl<S> Clone for GridStitchPipeline<S> {
    fn clone(&self) -> Self {
        Self {
            stitcher: Arc::clone(&self.stitcher),
            options: self.options.clone(),
        }
    }
}

impl<S: Stitcher + 'static> GridStitchPipeline<S> {
    #[must_use]
    pub fn new(stitcher: S, options: StitchOptions) -> Self {
        Self {
            stitcher: Arc::new(stitcher),
            options,
        }
    }

    #[must_use]
    pub fn options(&self) -> &StitchOptions {
        &self.options
    }

    #[must_use]
    pub fn stitcher(&self) -> &S {
        &self.stitcher
    }

    /// Stitch the first source file of `input_dir`.
    ///
    /// Tiles go to `<input_dir>/<tiles_subdir>`; a tiles directory left
    /// complete by an earlier run is reused. Fused files are written to
    /// `input_dir`. Must be called from within a tokio runtime.
    pub async fn run_source(&self, input_dir: &Path) -> Result<RunReport> {
        let source = find_source(input_dir, &self.options.source_extension)?;
        let tiles_dir = input_dir.join(&self.options.tiles_subdir);
        let reader = OmeTiffReader::open(&source)
            .map_err(|e| PipelineError::decomposition(None, Some(&source), e))?;

        let decomposer =
            TileDecomposer::new(&tiles_dir).with_split_threshold(self.options.split_threshold);
        let planned = decomposer.plan(reader.metadata())?;
        let reused = planned.is_complete();
        let manifest = if reused {
            info!(tiles = planned.tiles.len(), directory = %tiles_dir.display(), "reusing decomposed tiles");
            planned
        } else {
            info!(source = %source.display(), "decomposing source");
            decomposer
                .spawn(Box::new(reader))
                .wait(self.options.completion_timeout)
                .await?
        };

        let this = self.clone();
        let output_dir = input_dir.to_path_buf();
        let pattern = manifest.strategy.naming().encode_pattern(None);
        let mut report =
            tokio::task::spawn_blocking(move || this.stitch_manifest(&manifest, &output_dir))
                .await
                .map_err(|e| PipelineError::StitchInvocation {
                    pattern,
                    message: format!("stitch task failed: {e}"),
                })??;
        if !self.options.keep_tiles {
            report.warnings.extend(remove_path(&tiles_dir));
        }
        report.reused_tiles = reused;
        Ok(report)
    }

    /// Stitch a pre-split acquisition named `<prefix>Z<ZZ>_T<T>_C<C>.ome.tif`.
    /// The acquisition files are restored, never removed.
    pub fn run_acquisition(&self, directory: &Path, prefix: &str) -> Result<RunReport> {
        let manifest = TileManifest::scan_acquisition(directory, prefix)?;
        self.stitch_manifest(&manifest, directory)
    }

    /// Transplant, stitch and reassemble every channel of `manifest`,
    /// writing fused files to `output_dir`.
    ///
    /// Tiles are restored whether or not stitching succeeds. If restoring
    /// fails, that error is returned and any earlier failure is logged.
    pub fn stitch_manifest(&self, manifest: &TileManifest, output_dir: &Path) -> Result<RunReport> {
        let guard = TransplantGuard::acquire(manifest)?;
        let stitched = self.stitch_channels(&guard, manifest, output_dir);
        let restored = guard.restore();

        let mut warnings = Vec::new();
        if !self.options.keep_tiles {
            warnings.extend(self.remove_engine_output(&manifest.directory));
        }

        let (outputs, stitch_invocations) = match (stitched, restored) {
            (Ok(done), Ok(())) => done,
            (Err(err), Ok(())) => return Err(err),
            (Ok(_), Err(restore_err)) => return Err(restore_err),
            (Err(err), Err(restore_err)) => {
                error!(%err, "run failed and its tiles could not be restored");
                return Err(restore_err);
            }
        };

        info!(
            strategy = ?manifest.strategy,
            tiles = manifest.tiles.len(),
            invocations = stitch_invocations,
            outputs = outputs.len(),
            "stitching complete"
        );

        Ok(RunReport {
            strategy: manifest.strategy,
            tiles: manifest.tiles.len(),
            reused_tiles: false,
            stitch_invocations,
            outputs,
            warnings,
        })
    }

    fn stitch_channels(
        &self,
        guard: &TransplantGuard,
        manifest: &TileManifest,
        output_dir: &Path,
    ) -> Result<(Vec<OutputChunk>, usize)> {
        let series = &manifest.series;
        let grid = self.options.grid_x * self.options.grid_y;
        if grid != manifest.grid_tiles() {
            warn!(
                grid_x = self.options.grid_x,
                grid_y = self.options.grid_y,
                tiles = manifest.grid_tiles(),
                "grid size does not match the number of tiles"
            );
        }

        let channels_in_tile = match manifest.strategy {
            SplitStrategy::Compact => series.size_c,
            SplitStrategy::ChannelSplit => 1,
        };
        let reassembler =
            Reassembler::new(output_dir).with_max_slices_per_file(self.options.max_slices_per_file);

        let mut outputs = Vec::new();
        let mut invocations = 0;
        for channel in 0..series.size_c {
            let (pattern, index_in_tile) = match manifest.strategy {
                SplitStrategy::Compact => (guard.stitch_pattern(None), channel),
                SplitStrategy::ChannelSplit => (guard.stitch_pattern(Some(channel)), 0),
            };
            let slice_dir = manifest
                .directory
                .join(format!("{SLICE_DIR_PREFIX}{channel}"));
            let job = self
                .options
                .job(guard.directory(), &pattern)
                .with_output(self.options.output_mode, &slice_dir)
                .with_channel(channel, index_in_tile, channels_in_tile);

            let outcome = self.stitcher.invoke(&job)?;
            invocations += 1;

            let descriptor = series
                .channels
                .get(channel)
                .cloned()
                .unwrap_or_else(|| ChannelDescriptor::new(channel));
            let chunks = match outcome {
                StitchOutcome::Written { output_directory } => {
                    let mut slices =
                        SliceDirectory::new(&output_directory, series.size_z, job.channel_in_tile);
                    reassembler.reassemble(&mut slices, Some(channel), &descriptor, series.physical_size)?
                }
                StitchOutcome::Displayed(stack) => {
                    let mut slices = DisplayedSlices::new(stack, index_in_tile);
                    reassembler.reassemble(&mut slices, Some(channel), &descriptor, series.physical_size)?
                }
            };
            outputs.extend(chunks);
        }
        Ok((outputs, invocations))
    }

    fn remove_engine_output(&self, tiles_dir: &Path) -> Vec<CleanupWarning> {
        let mut warnings =
            remove_matching(&glob_in(tiles_dir, &format!("{SLICE_DIR_PREFIX}*")));
        warnings.extend(remove_stitch_artifacts(tiles_dir));
        warnings
    }
}
