//! Structured run journal for chain events.
//!
//! Provides the [`JournalSink`] trait and associated types. The primary
//! implementation, [`JsonlJournalWriter`], appends JSONL records to
//! daily-rotating files in `<work_root>/.recon-supervisor/journal/`.

pub mod writer;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{JobState, LaunchDisposition};
use crate::Result;

pub use writer::JsonlJournalWriter;

/// Event type classification for journal entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    /// Control process began a chain.
    ChainStarted,
    /// A job's inputs were staged.
    JobStaged,
    /// A job was launched, resumed, or found finished.
    JobLaunched,
    /// The monitor observed a new state.
    JobState,
    /// A job reached `Finished`.
    JobFinished,
    /// A job reached `Failed` or `Unknown`.
    JobFailed,
    /// Every job in the chain finished.
    ChainFinished,
    /// The chain stopped before its last job.
    ChainAborted,
}

/// A structured record of one chain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// ISO 8601 timestamp with timezone.
    pub timestamp: DateTime<Utc>,
    /// Chain label.
    pub chain: String,
    /// Event classification.
    pub event_type: JournalEventType,
    /// Job concerned, absent for chain-level events.
    pub job_id: Option<String>,
    /// Observed state, when relevant.
    pub state: Option<JobState>,
    /// Launch action, for `job_launched`.
    pub disposition: Option<LaunchDisposition>,
    /// Job log, for job-level events.
    pub log_path: Option<PathBuf>,
    /// Free-form detail.
    pub detail: Option<String>,
}

impl JournalEntry {
    /// New entry stamped now with all optional fields empty.
    #[must_use]
    pub fn new(chain: &str, event_type: JournalEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            chain: chain.to_owned(),
            event_type,
            job_id: None,
            state: None,
            disposition: None,
            log_path: None,
            detail: None,
        }
    }

    /// Attach a job identifier.
    #[must_use]
    pub fn job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_owned());
        self
    }

    /// Attach a state.
    #[must_use]
    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attach a launch disposition.
    #[must_use]
    pub fn disposition(mut self, disposition: LaunchDisposition) -> Self {
        self.disposition = Some(disposition);
        self
    }

    /// Attach a log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Attach free-form detail.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Destination for journal entries.
pub trait JournalSink: Send + Sync {
    /// Persist one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be written.
    fn record(&self, entry: JournalEntry) -> Result<()>;
}

/// Sink that discards every entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

impl JournalSink for NoopJournal {
    fn record(&self, _entry: JournalEntry) -> Result<()> {
        Ok(())
    }
}
