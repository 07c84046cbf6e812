//! # tilefuse - Grid mosaic stitching around an external engine
//!
//! Cuts a multi-dimensional microscopy acquisition (T tiles × Z slices × C
//! channels) into one OME-TIFF per tile, hands those tiles to an external
//! grid-stitching engine through its filename conventions, and reassembles
//! the engine's per-slice output into a few size-bounded multi-page files
//! that keep the acquisition's channel names and colors.
//!
//! ## Features
//!
//! - **Split policy**: compact tiles (all channels) or one file per channel
//!   once a timepoint exceeds 100 planes
//! - **Reversible transplant**: tile metadata and names are rewritten for the
//!   engine and restored afterwards, even when stitching fails
//! - **Completion handle**: decomposition runs on tokio's blocking pool with
//!   timeout and cancellation
//! - **Chunked output**: fused stacks are written in files of at most 200
//!   slices
//! - **Pluggable engine**: anything implementing [`Stitcher`]; [`FijiStitcher`]
//!   drives Fiji's Grid/Collection stitching plugin headless
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tilefuse::{FijiStitcher, GridStitchPipeline, StitchOptions};
//!
//! let pipeline = GridStitchPipeline::new(
//!     FijiStitcher::from_env(),
//!     StitchOptions::default().with_grid(3, 3),
//! );
//! let report = pipeline.run_source(Path::new("/data/run42")).await?;
//! println!("{} invocations, {} files", report.stitch_invocations, report.outputs.len());
//! ```
//!
//! ## Architecture
//!
//! - [`naming`]: filename codec for tiles and fused slices
//! - [`metadata`]: series metadata and its per-tile / fused derivations
//! - [`ome_xml`]: OME-XML record encoding over `quick-xml`
//! - [`ome_tiff`]: plane reader/writer over the `tiff` crate
//! - [`tiff_utils`]: in-place rewriting of the embedded record
//! - [`decompose`]: tile decomposition and its completion handle
//! - [`transplant`]: the mutate/restore bracket around stitching
//! - [`stitcher`]: engine parameter record and adapters
//! - [`reassemble`]: chunked reassembly of fused slices
//! - [`cleanup`]: best-effort removal of temporary files
//! - [`pipeline`]: end-to-end control flow and configuration

// ============================================================================
// Public modules
// ============================================================================

pub mod cleanup;
pub mod decompose;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod ome_tiff;
pub mod ome_xml;
pub mod pipeline;
pub mod reassemble;
pub mod stitcher;
pub mod tiff_utils;
pub mod transplant;

// ============================================================================
// Errors
// ============================================================================

pub use error::{
    CleanupWarning,
    Phase,
    PipelineError,
    Result,
};

// ============================================================================
// Naming & Metadata
// ============================================================================

pub use naming::{
    Coordinate,
    SliceDigits,
    TileNaming,
    fused_output_name,
    fused_slice_name,
};

pub use metadata::{
    ChannelDescriptor,
    DimensionOrder,
    PixelType,
    SeriesMetadata,
};

// ============================================================================
// Codec
// ============================================================================

pub use ome_tiff::{
    MemorySeries,
    OmeTiffReader,
    OmeTiffWriter,
    Plane,
    PlaneData,
    SeriesReader,
    SeriesWriter,
    capture_embedded_metadata,
    read_embedded_metadata,
    restore_embedded_metadata,
    write_embedded_metadata,
};

// ============================================================================
// Pipeline Phases
// ============================================================================

pub use decompose::{
    CancelToken,
    DecompositionHandle,
    SplitStrategy,
    TileDecomposer,
    TileFile,
    TileManifest,
};

pub use transplant::{
    TransplantGuard,
    TransplantState,
};

pub use stitcher::{
    FijiStitcher,
    OutputMode,
    StitchJob,
    StitchOutcome,
    Stitcher,
};

pub use reassemble::{
    DisplayedSlices,
    FusedSlices,
    OutputChunk,
    Reassembler,
    SliceDirectory,
    partition_chunks,
};

// ============================================================================
// Pipeline
// ============================================================================

pub use pipeline::{
    GridStitchPipeline,
    RunReport,
    StitchOptions,
    find_source,
};
