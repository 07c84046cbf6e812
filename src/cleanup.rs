//! Best-effort removal of temporary artifacts.
//!
//! Nothing here fails a run. Every removal that does not succeed is logged
//! at `warn` and returned as a [`CleanupWarning`].

use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::CleanupWarning;

/// Engine artifacts left in a tiles directory after stitching.
pub const STITCH_ARTIFACT_PATTERNS: &[&str] = &["img_t1_z*_c*", "TileConfiguration*.txt"];

/// Glob pattern for `pattern` inside `directory`. The directory is matched
/// literally even when its name holds `[`, `]`, `*` or `?`.
#[must_use]
pub fn glob_in(directory: &Path, pattern: &str) -> String {
    let literal = glob::Pattern::escape(&directory.to_string_lossy());
    Path::new(&literal).join(pattern).to_string_lossy().into_owned()
}

/// Remove every file or directory matching a glob pattern.
pub fn remove_matching(pattern: &str) -> Vec<CleanupWarning> {
    let mut warnings = Vec::new();
    let entries = match glob::glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(%pattern, %e, "invalid cleanup pattern");
            warnings.push(CleanupWarning {
                path: pattern.into(),
                message: e.to_string(),
            });
            return warnings;
        }
    };

    for entry in entries {
        match entry {
            Ok(path) => warnings.extend(remove_path(&path)),
            Err(e) => {
                warn!(path = %e.path().display(), error = %e.error(), "cleanup entry unreadable");
                warnings.push(CleanupWarning {
                    path: e.path().to_path_buf(),
                    message: e.error().to_string(),
                });
            }
        }
    }
    warnings
}

/// Remove a file or a whole directory tree. A path that is already gone is
/// not a warning.
pub fn remove_path(path: &Path) -> Option<CleanupWarning> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            None
        }
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            let warning = CleanupWarning {
                path: path.to_path_buf(),
                message: e.to_string(),
            };
            warn!(%warning, "cleanup skipped a path");
            Some(warning)
        }
    }
}

/// Remove engine artifacts from `directory`, leaving tiles in place.
pub fn remove_stitch_artifacts(directory: &Path) -> Vec<CleanupWarning> {
    STITCH_ARTIFACT_PATTERNS
        .iter()
        .flat_map(|pattern| remove_matching(&glob_in(directory, pattern)))
        .collect()
}
