//! Idempotent staging of session inputs into the working tree.
//!
//! Every source is verified before anything is copied: a missing source
//! fails the whole call so that no partially staged set is ever trusted.
//! Copies use skip-if-present semantics, so re-running after a complete or
//! interrupted run only fills in what is missing.

pub mod sync;

use std::time::Instant;

use tracing::{info, info_span};

use crate::models::session::SessionDescriptor;
use crate::{AppError, Result};

pub use sync::{copy_tree, SyncSummary};

/// Outcome of a [`DataStager::stage`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedCount {
    /// Sessions processed.
    pub sessions: u64,
    /// Files newly copied.
    pub files_copied: u64,
    /// Bytes newly copied.
    pub bytes_copied: u64,
    /// Files already present at the destination.
    pub files_skipped: u64,
}

impl StagedCount {
    /// Whether the call changed nothing on disk.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.files_copied == 0 && self.bytes_copied == 0
    }
}

/// Copies per-session input data into the working tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataStager;

impl DataStager {
    /// Construct a stager.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Stage every descriptor, never overwriting destination files.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Staging` naming the first missing source (before
    /// anything is copied), or `AppError::Io` if a copy fails.
    pub fn stage(&self, sessions: &[SessionDescriptor]) -> Result<StagedCount> {
        let span = info_span!("stage", sessions = sessions.len());
        let _guard = span.enter();

        if let Some(missing) = sessions.iter().find(|s| !s.source_path.is_dir()) {
            return Err(AppError::Staging {
                missing_source: missing.source_path.clone(),
                job_id: None,
                log_path: None,
            });
        }

        let started = Instant::now();
        let mut total = SyncSummary::default();
        for session in sessions {
            let summary = copy_tree(&session.source_path, &session.dest_path, true)?;
            info!(
                session = session.session_id,
                dest = %session.dest_path.display(),
                copied = summary.files_copied,
                skipped = summary.files_skipped,
                "session staged"
            );
            total.absorb(summary);
        }

        let count = StagedCount {
            sessions: sessions.len() as u64,
            files_copied: total.files_copied,
            bytes_copied: total.bytes_copied,
            files_skipped: total.files_skipped,
        };

        info!(
            files = count.files_copied,
            bytes = count.bytes_copied,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "staging complete"
        );
        Ok(count)
    }
}
