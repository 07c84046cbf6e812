//! External stitching engine adapter.
//!
//! The engine is an injected capability: the pipeline builds a [`StitchJob`]
//! and hands it to a [`Stitcher`]. Registration and blending happen entirely
//! inside the engine. The adapter does not check the engine's output; the
//! reassembler reports any expected slice that did not appear.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::naming::{INDEX_PLACEHOLDER, SliceDigits, fused_slice_name};
use crate::ome_tiff::{MemorySeries, OmeTiffReader, SeriesReader, container_metadata};

pub const TILE_OVERLAP_PERCENT: u32 = 20;
pub const REGRESSION_THRESHOLD: f64 = 0.30;
pub const MAX_AVG_DISPLACEMENT_THRESHOLD: f64 = 2.50;
pub const ABSOLUTE_DISPLACEMENT_THRESHOLD: f64 = 3.50;
pub const FUSION_METHOD: &str = "Linear Blending";

/// File the Fiji adapter saves a displayed fusion to.
pub const DISPLAY_CAPTURE_NAME: &str = "fused_display.tif";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Fuse into memory and hand the stack back.
    Display,
    /// Write one file per fused slice into the output directory.
    WriteToDisk,
}

/// Parameter record for one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StitchJob {
    pub grid_x: usize,
    pub grid_y: usize,
    /// Tile overlap in percent
    pub tile_overlap: u32,
    pub first_file_index: usize,
    /// Directory holding the tiles
    pub directory: PathBuf,
    /// Tile filename with one `{i}` placeholder
    pub file_pattern: String,
    pub regression_threshold: f64,
    pub max_avg_displacement_threshold: f64,
    pub absolute_displacement_threshold: f64,
    pub output_mode: OutputMode,
    pub output_directory: PathBuf,
    /// Source channel this invocation fuses
    pub channel: usize,
    /// 1-based position of `channel` within each tile file
    pub channel_in_tile: usize,
    /// Channels stored in each tile file
    pub channels_in_tile: usize,
}

impl StitchJob {
    #[must_use]
    pub fn new(grid_x: usize, grid_y: usize, directory: &Path, file_pattern: &str) -> Self {
        Self {
            grid_x,
            grid_y,
            tile_overlap: TILE_OVERLAP_PERCENT,
            first_file_index: 0,
            directory: directory.to_path_buf(),
            file_pattern: file_pattern.to_string(),
            regression_threshold: REGRESSION_THRESHOLD,
            max_avg_displacement_threshold: MAX_AVG_DISPLACEMENT_THRESHOLD,
            absolute_displacement_threshold: ABSOLUTE_DISPLACEMENT_THRESHOLD,
            output_mode: OutputMode::WriteToDisk,
            output_directory: directory.join("fused"),
            channel: 0,
            channel_in_tile: 1,
            channels_in_tile: 1,
        }
    }

    #[must_use]
    pub fn with_output(mut self, mode: OutputMode, directory: &Path) -> Self {
        self.output_mode = mode;
        self.output_directory = directory.to_path_buf();
        self
    }

    /// Fuse source `channel`, stored at 0-based `index_in_tile` of tiles
    /// holding `channels_in_tile` channels.
    #[must_use]
    pub fn with_channel(mut self, channel: usize, index_in_tile: usize, channels_in_tile: usize) -> Self {
        self.channel = channel;
        self.channel_in_tile = index_in_tile + 1;
        self.channels_in_tile = channels_in_tile.max(1);
        self
    }

    #[must_use]
    pub fn with_overlap(mut self, percent: u32) -> Self {
        self.tile_overlap = percent;
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, regression: f64, max_avg: f64, absolute: f64) -> Self {
        self.regression_threshold = regression;
        self.max_avg_displacement_threshold = max_avg;
        self.absolute_displacement_threshold = absolute;
        self
    }

    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.grid_x * self.grid_y
    }

    /// Reject records no engine could act on.
    pub fn validate(&self) -> Result<()> {
        let reject = |message: &str| PipelineError::StitchInvocation {
            pattern: self.file_pattern.clone(),
            message: message.to_string(),
        };
        if self.grid_x == 0 || self.grid_y == 0 {
            return Err(reject("grid dimensions must be positive"));
        }
        if self.file_pattern.matches(INDEX_PLACEHOLDER).count() != 1 {
            return Err(reject("file pattern must contain exactly one {i} placeholder"));
        }
        if self.tile_overlap >= 100 {
            return Err(reject("tile overlap must be below 100%"));
        }
        if self.channel_in_tile == 0 || self.channel_in_tile > self.channels_in_tile {
            return Err(reject("channel index outside the tile's channels"));
        }
        Ok(())
    }

    /// Option string of the Grid/Collection stitching plugin.
    #[must_use]
    pub fn macro_options(&self) -> String {
        let image_output = match self.output_mode {
            OutputMode::Display => "image_output=[Fuse and display]".to_string(),
            OutputMode::WriteToDisk => format!(
                "image_output=[Write to disk] output_directory=[{}]",
                self.output_directory.display()
            ),
        };
        format!(
            "type=[Grid: snake by rows] order=[Right & Down                ] \
             grid_size_x={} grid_size_y={} tile_overlap={} first_file_index_i={} \
             directory=[{}] file_names={} \
             output_textfile_name=TileConfiguration.txt fusion_method=[{FUSION_METHOD}] \
             regression_threshold={:.2} max/avg_displacement_threshold={:.2} \
             absolute_displacement_threshold={:.2} compute_overlap \
             computation_parameters=[Save memory (but be slower)] {image_output}",
            self.grid_x,
            self.grid_y,
            self.tile_overlap,
            self.first_file_index,
            self.directory.display(),
            self.file_pattern,
            self.regression_threshold,
            self.max_avg_displacement_threshold,
            self.absolute_displacement_threshold,
        )
    }

    /// Where the engine writes fused slice `slice` (0-based) in
    /// write-to-disk mode.
    #[must_use]
    pub fn expected_slice_path(&self, slice: usize, digits: SliceDigits, extension: &str) -> PathBuf {
        self.output_directory
            .join(fused_slice_name(slice, self.channel_in_tile, digits, extension))
    }
}

/// What an invocation produced.
#[derive(Debug)]
pub enum StitchOutcome {
    /// Per-slice files in the job's output directory
    Written { output_directory: PathBuf },
    /// Fused stack held in memory, planes in XYCZT order
    Displayed(MemorySeries),
}

/// The stitching engine, invoked synchronously.
pub trait Stitcher: Send + Sync {
    fn invoke(&self, job: &StitchJob) -> Result<StitchOutcome>;
}

/// Runs Fiji's Grid/Collection stitching plugin headless.
#[derive(Debug, Clone)]
pub struct FijiStitcher {
    executable: PathBuf,
    extra_args: Vec<String>,
}

impl FijiStitcher {
    #[must_use]
    pub fn new(executable: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
            extra_args: Vec::new(),
        }
    }

    /// Executable from `TILEFUSE_FIJI`, else `ImageJ-linux64` on `PATH`.
    #[must_use]
    pub fn from_env() -> Self {
        let executable = std::env::var("TILEFUSE_FIJI").unwrap_or_else(|_| "ImageJ-linux64".to_string());
        Self::new(Path::new(&executable))
    }

    /// Extra launcher arguments, e.g. JVM memory flags.
    #[must_use]
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.extra_args = args.iter().map(|a| (*a).to_string()).collect();
        self
    }

    /// ImageJ macro the launcher evaluates.
    #[must_use]
    pub fn macro_script(&self, job: &StitchJob) -> String {
        let mut script = format!(
            "run(\"Grid/Collection stitching\", \"{}\");",
            escape_macro(&job.macro_options())
        );
        if job.output_mode == OutputMode::Display {
            let capture = job.output_directory.join(DISPLAY_CAPTURE_NAME);
            script.push_str(&format!(
                " saveAs(\"Tiff\", \"{}\"); close();",
                escape_macro(&capture.display().to_string())
            ));
        }
        script
    }

    fn load_display_capture(&self, job: &StitchJob) -> Result<MemorySeries> {
        let capture = job.output_directory.join(DISPLAY_CAPTURE_NAME);
        let fail = |message: String| PipelineError::StitchInvocation {
            pattern: job.file_pattern.clone(),
            message,
        };

        let mut meta = container_metadata(&capture)
            .map_err(|e| fail(format!("cannot read {}: {e}", capture.display())))?;
        let pages = meta.size_z;
        if pages % job.channels_in_tile != 0 {
            return Err(fail(format!(
                "{pages} fused page(s) do not divide into {} channel(s)",
                job.channels_in_tile
            )));
        }
        meta.size_c = job.channels_in_tile;
        meta.size_z = pages / job.channels_in_tile;
        meta.channels = (0..meta.size_c)
            .map(crate::metadata::ChannelDescriptor::new)
            .collect();

        let mut reader = OmeTiffReader::with_metadata(&capture, meta.clone())
            .map_err(|e| fail(e.to_string()))?;
        let planes = (0..pages)
            .map(|i| reader.read_plane(i))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| fail(e.to_string()))?;
        MemorySeries::new(meta, planes).map_err(|e| fail(e.to_string()))
    }
}

impl Stitcher for FijiStitcher {
    fn invoke(&self, job: &StitchJob) -> Result<StitchOutcome> {
        job.validate()?;
        let fail = |message: String| PipelineError::StitchInvocation {
            pattern: job.file_pattern.clone(),
            message,
        };

        std::fs::create_dir_all(&job.output_directory).map_err(|e| {
            fail(format!(
                "cannot create output directory {}: {e}",
                job.output_directory.display()
            ))
        })?;

        let script = self.macro_script(job);
        debug!(%script, "stitching macro");
        info!(
            pattern = %job.file_pattern,
            grid_x = job.grid_x,
            grid_y = job.grid_y,
            channel = job.channel,
            "invoking Fiji grid stitching"
        );

        let output = Command::new(&self.executable)
            .args(&self.extra_args)
            .arg("--headless")
            .arg("--console")
            .arg("-eval")
            .arg(&script)
            .output()
            .map_err(|e| fail(format!("failed to execute {}: {e}", self.executable.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!("engine exited with {}: {stderr}", output.status)));
        }

        match job.output_mode {
            OutputMode::WriteToDisk => Ok(StitchOutcome::Written {
                output_directory: job.output_directory.clone(),
            }),
            OutputMode::Display => Ok(StitchOutcome::Displayed(self.load_display_capture(job)?)),
        }
    }
}

fn escape_macro(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> StitchJob {
        StitchJob::new(3, 3, Path::new("/data/tiles"), "tile_{i}.ome.tif")
    }

    #[test]
    fn test_defaults_follow_fixed_contract() {
        let job = job();
        assert_eq!(job.tile_overlap, 20);
        assert_eq!(job.first_file_index, 0);
        assert_eq!(job.tile_count(), 9);
        assert!((job.regression_threshold - 0.30).abs() < f64::EPSILON);
        assert!((job.max_avg_displacement_threshold - 2.50).abs() < f64::EPSILON);
        assert!((job.absolute_displacement_threshold - 3.50).abs() < f64::EPSILON);
    }

    #[test]
    fn test_macro_options() {
        let options = job()
            .with_output(OutputMode::WriteToDisk, Path::new("/data/tiles/fused_c0"))
            .macro_options();
        assert!(options.contains("grid_size_x=3 grid_size_y=3 tile_overlap=20 first_file_index_i=0"));
        assert!(options.contains("directory=[/data/tiles] file_names=tile_{i}.ome.tif"));
        assert!(options.contains("fusion_method=[Linear Blending]"));
        assert!(options.contains("regression_threshold=0.30"));
        assert!(options.contains("max/avg_displacement_threshold=2.50"));
        assert!(options.contains("absolute_displacement_threshold=3.50"));
        assert!(options.ends_with("image_output=[Write to disk] output_directory=[/data/tiles/fused_c0]"));

        let display = job().with_output(OutputMode::Display, Path::new("/x")).macro_options();
        assert!(display.ends_with("image_output=[Fuse and display]"));
    }

    #[test]
    fn test_validate() {
        assert!(job().validate().is_ok());
        assert!(StitchJob::new(0, 3, Path::new("/t"), "tile_{i}.ome.tif").validate().is_err());
        assert!(StitchJob::new(3, 3, Path::new("/t"), "tile.ome.tif").validate().is_err());
        assert!(job().with_channel(2, 2, 2).validate().is_err());
        assert!(job().with_channel(1, 1, 2).validate().is_ok());
    }

    #[test]
    fn test_expected_slice_paths() {
        let job = job()
            .with_output(OutputMode::WriteToDisk, Path::new("/out"))
            .with_channel(1, 1, 2);
        let digits = SliceDigits::for_count(10);
        assert_eq!(
            job.expected_slice_path(0, digits, ""),
            Path::new("/out/img_t1_z01_c2")
        );
        assert_eq!(
            job.expected_slice_path(9, digits, ""),
            Path::new("/out/img_t1_z10_c2")
        );
    }

    #[test]
    fn test_display_macro_saves_capture() {
        let stitcher = FijiStitcher::new(Path::new("fiji"));
        let script = stitcher.macro_script(&job().with_output(OutputMode::Display, Path::new("/out")));
        assert!(script.starts_with("run(\"Grid/Collection stitching\", \""));
        assert!(script.contains("saveAs(\"Tiff\", \"/out/fused_display.tif\")"));
    }

    #[test]
    fn test_missing_engine_is_invocation_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let stitcher = FijiStitcher::new(Path::new("/nonexistent/ImageJ-linux64"));
        let job = StitchJob::new(2, 2, dir.path(), "tile_{i}.ome.tif")
            .with_output(OutputMode::WriteToDisk, &dir.path().join("fused"));
        let err = stitcher.invoke(&job).unwrap_err();
        assert!(matches!(err, PipelineError::StitchInvocation { .. }));
    }
}
