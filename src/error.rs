//! Error taxonomy for the stitching pipeline.
//!
//! Low-level codec helpers return [`AnyResult`](crate::tiff_utils::AnyResult);
//! pipeline phases convert those failures into a [`PipelineError`] that names
//! the phase and carries the file and coordinate the failure was observed at.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::naming::Coordinate;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Pipeline phase a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Naming,
    Decomposition,
    Transplant,
    Stitch,
    Reassembly,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Naming => "naming",
            Phase::Decomposition => "decomposition",
            Phase::Transplant => "transplant",
            Phase::Stitch => "stitch",
            Phase::Reassembly => "reassembly",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A filename did not carry a fragment the codec requires.
    #[error("cannot decode {name:?}: missing {fragment} fragment")]
    Naming { name: String, fragment: &'static str },

    /// Source read or tile write failure.
    #[error("decomposition failed{}: {message}", context(.coordinate, .path))]
    Decomposition {
        coordinate: Option<Coordinate>,
        path: Option<PathBuf>,
        message: String,
    },

    /// Metadata rewrite or rename failure while transplanting or restoring.
    #[error("metadata transplant failed for {}: {message}", .path.display())]
    Transplant { path: PathBuf, message: String },

    /// The stitching engine could not be run or rejected its parameters.
    #[error("stitcher invocation failed for pattern {pattern:?}: {message}")]
    StitchInvocation { pattern: String, message: String },

    /// An expected fused slice is missing or unreadable.
    #[error("reassembly failed at slice {slice} ({}): {message}", .path.display())]
    Reassembly {
        slice: usize,
        path: PathBuf,
        message: String,
    },

    #[error("decomposition cancelled before {remaining} tile(s) were written")]
    Cancelled { remaining: usize },

    #[error("decomposition did not complete within {seconds:.1}s")]
    Timeout { seconds: f64 },
}

fn context(coordinate: &Option<Coordinate>, path: &Option<PathBuf>) -> String {
    match (coordinate, path) {
        (Some(c), Some(p)) => format!(" at {c} ({})", p.display()),
        (Some(c), None) => format!(" at {c}"),
        (None, Some(p)) => format!(" ({})", p.display()),
        (None, None) => String::new(),
    }
}

impl PipelineError {
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            PipelineError::Naming { .. } => Phase::Naming,
            PipelineError::Decomposition { .. }
            | PipelineError::Cancelled { .. }
            | PipelineError::Timeout { .. } => Phase::Decomposition,
            PipelineError::Transplant { .. } => Phase::Transplant,
            PipelineError::StitchInvocation { .. } => Phase::Stitch,
            PipelineError::Reassembly { .. } => Phase::Reassembly,
        }
    }

    pub(crate) fn decomposition(
        coordinate: Option<Coordinate>,
        path: Option<&Path>,
        message: impl fmt::Display,
    ) -> Self {
        PipelineError::Decomposition {
            coordinate,
            path: path.map(Path::to_path_buf),
            message: message.to_string(),
        }
    }

    pub(crate) fn transplant(path: &Path, message: impl fmt::Display) -> Self {
        PipelineError::Transplant {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    pub(crate) fn reassembly(slice: usize, path: &Path, message: impl fmt::Display) -> Self {
        PipelineError::Reassembly {
            slice,
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

/// Non-fatal cleanup failure. Logged and reported, never propagated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not remove {}: {}", self.path.display(), self.message)
    }
}
