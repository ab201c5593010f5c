//! Error types shared across the application.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use crate::models::job::JobState;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// A session's source directory does not exist; nothing is staged.
    Staging {
        /// Source path that was expected to exist.
        missing_source: PathBuf,
        /// Job being staged, once known.
        job_id: Option<String>,
        /// That job's log file.
        log_path: Option<PathBuf>,
    },
    /// The persistent session mechanism could not create or reach a session.
    Launch {
        /// Job whose launch failed.
        job_id: String,
        /// Log the job would write.
        log_path: PathBuf,
        /// Underlying cause.
        reason: String,
    },
    /// An identifier was rejected before being interpolated into a command.
    InvalidIdentifier(String),
    /// Another live control process holds the advisory lease for a job.
    Lease {
        /// Job whose lease is held.
        job_id: String,
        /// Description of the current holder.
        holder: String,
        /// That job's log file, once known.
        log_path: Option<PathBuf>,
    },
    /// `wait` gave up before the job reached a terminal state.
    MonitorTimeout {
        /// Job being waited on.
        job_id: String,
        /// Log of the job left running.
        log_path: PathBuf,
        /// Seconds spent waiting.
        waited_secs: u64,
        /// Last state observed before giving up.
        last_state: JobState,
    },
    /// An upstream job has neither output nor a live session, so waiting
    /// on it would never end.
    NotStarted {
        /// Upstream job.
        job_id: String,
        /// Log it would write.
        log_path: PathBuf,
    },
    /// The control loop was cancelled (the job itself keeps running).
    Cancelled(String),
    /// A job in a chain ended `Failed` or `Unknown`.
    Chain(ChainError),
}

/// Identifies the job that stopped a chain and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainError {
    /// Job that ended in a non-success terminal state.
    pub job_id: String,
    /// `Failed` or `Unknown`.
    pub state: JobState,
    /// Log file an operator should inspect.
    pub log_path: PathBuf,
    /// Trailing lines of the log, if it could be read.
    pub log_excerpt: String,
}

impl ChainError {
    /// Whether the log carried an explicit failure line (`JobFailed`) as
    /// opposed to an ambiguous ending (`JobUnknown`).
    #[must_use]
    pub fn is_explicit_failure(&self) -> bool {
        self.state == JobState::Failed
    }
}

impl Display for ChainError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_explicit_failure() {
            "job failed"
        } else {
            "job state unknown"
        };
        write!(
            f,
            "{kind}: {} (see {})",
            self.job_id,
            self.log_path.display()
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Staging { missing_source, .. } => {
                write!(f, "staging: missing source {}", missing_source.display())
            }
            Self::Launch { job_id, reason, .. } => write!(f, "launch: {job_id}: {reason}"),
            Self::InvalidIdentifier(msg) => write!(f, "invalid identifier: {msg}"),
            Self::Lease { job_id, holder, .. } => {
                write!(f, "lease: {job_id} is held by {holder}")
            }
            Self::MonitorTimeout {
                job_id,
                waited_secs,
                last_state,
                ..
            } => write!(
                f,
                "monitor timeout: {job_id} still {last_state} after {waited_secs}s"
            ),
            Self::NotStarted { job_id, .. } => {
                write!(f, "not started: {job_id} has no output and no session")
            }
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Chain(err) => write!(f, "chain: {err}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<ChainError> for AppError {
    fn from(err: ChainError) -> Self {
        Self::Chain(err)
    }
}

impl AppError {
    /// Job identifier associated with this error, when there is one.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Launch { job_id, .. }
            | Self::Lease { job_id, .. }
            | Self::MonitorTimeout { job_id, .. }
            | Self::NotStarted { job_id, .. } => Some(job_id),
            Self::Staging { job_id, .. } => job_id.as_deref(),
            Self::Chain(err) => Some(&err.job_id),
            _ => None,
        }
    }

    /// Log file an operator should look at, when there is one.
    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        match self {
            Self::Launch { log_path, .. }
            | Self::MonitorTimeout { log_path, .. }
            | Self::NotStarted { log_path, .. } => Some(log_path),
            Self::Staging { log_path, .. } | Self::Lease { log_path, .. } => log_path.as_deref(),
            Self::Chain(err) => Some(&err.log_path),
            _ => None,
        }
    }

    /// Multi-line text for an operator: the error, then the job, its log,
    /// and the last log lines when known.
    #[must_use]
    pub fn operator_report(&self) -> String {
        let mut out = format!("error: {self}\n");
        if let Some(job_id) = self.job_id() {
            out.push_str(&format!("  job: {job_id}\n"));
        }
        if let Some(log) = self.log_path() {
            out.push_str(&format!("  log: {}\n", log.display()));
        }
        if let Self::Chain(chain) = self {
            if !chain.log_excerpt.is_empty() {
                out.push_str("  last log lines:\n");
                for line in chain.log_excerpt.lines() {
                    out.push_str(&format!("    {line}\n"));
                }
            }
        }
        out
    }

    /// Attach the job being worked on to errors raised before a job was
    /// known (staging and leasing).
    #[must_use]
    pub fn for_job(self, job: &str, log: &Path) -> Self {
        match self {
            Self::Staging { missing_source, .. } => Self::Staging {
                missing_source,
                job_id: Some(job.to_owned()),
                log_path: Some(log.to_path_buf()),
            },
            Self::Lease { job_id, holder, .. } => Self::Lease {
                job_id,
                holder,
                log_path: Some(log.to_path_buf()),
            },
            other => other,
        }
    }
}
