//! Day-partitioned JSONL journal shared by every control process.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::NaiveDate;
use tracing::warn;

use super::{JournalEntry, JournalSink};
use crate::{AppError, Result};

/// Appends entries to `<dir>/journal-YYYY-MM-DD.jsonl`, picking the file
/// from the entry's own timestamp.
///
/// Each entry is encoded up front and handed to the kernel as one
/// `O_APPEND` write, so lines from separate processes sharing the journal
/// never interleave. No handle is kept between entries.
#[derive(Debug, Clone)]
pub struct JsonlJournalWriter {
    dir: PathBuf,
}

impl JsonlJournalWriter {
    /// Writer storing entries under `dir`, which is created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create journal directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    /// Journal file path for `date`.
    #[must_use]
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("journal-{date}.jsonl"))
    }
}

impl JournalSink for JsonlJournalWriter {
    fn record(&self, entry: JournalEntry) -> Result<()> {
        let path = self.path_for(entry.timestamp.date_naive());
        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| AppError::Io(format!("failed to encode journal entry: {e}")))?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Io(format!("failed to open journal {}: {e}", path.display())))?;
        file.write_all(&line).map_err(|e| {
            warn!(path = %path.display(), %e, "journal append failed");
            AppError::Io(format!("journal write failed: {e}"))
        })
    }
}
