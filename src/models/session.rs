//! Scan session descriptors and source-tree discovery.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AppError, Result};

/// One scan session to be staged into the working tree and consumed by jobs.
///
/// Immutable once staged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionDescriptor {
    /// Subject the session belongs to (the base name for single-subject runs).
    pub subject_id: String,
    /// Session identifier, e.g. `ses-01`.
    pub session_id: String,
    /// Directory holding the session's input data.
    pub source_path: PathBuf,
    /// Directory in the working tree the data is staged into.
    pub dest_path: PathBuf,
}

impl SessionDescriptor {
    /// Describe `session_id` as living directly under `source_root` and
    /// staging directly under `work_root`.
    #[must_use]
    pub fn under_roots(
        subject_id: &str,
        session_id: &str,
        source_root: &Path,
        work_root: &Path,
    ) -> Self {
        Self {
            subject_id: subject_id.to_owned(),
            session_id: session_id.to_owned(),
            source_path: source_root.join(session_id),
            dest_path: work_root.join(session_id),
        }
    }
}

/// Discover session identifiers under `source_root` whose directory names
/// match `pattern` (a glob such as `ses-*`), sorted by name.
///
/// # Errors
///
/// Returns `AppError::Config` if the pattern is invalid or nothing matches.
pub fn discover_sessions(source_root: &Path, pattern: &str) -> Result<Vec<String>> {
    let full = source_root.join(pattern);
    let full = full.to_string_lossy();
    let entries = glob::glob(&full)
        .map_err(|err| AppError::Config(format!("invalid session pattern {pattern}: {err}")))?;

    let mut sessions: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter(|path| path.is_dir())
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    sessions.sort();

    if sessions.is_empty() {
        return Err(AppError::Config(format!(
            "no sessions matching {pattern} found in {}",
            source_root.display()
        )));
    }

    debug!(count = sessions.len(), pattern, "sessions discovered");
    Ok(sessions)
}
