//! Chain specifications and run reports.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{JobHandle, JobSpec, JobState, LaunchDisposition};

/// Ordered jobs where each depends on its predecessor.
///
/// `upstream` names a job owned by another chain (fan-out): it is waited on
/// until `Finished` but never staged or launched by this chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    /// Label used in logs and reports.
    pub name: String,
    /// Shared predecessor checked before the first job.
    pub upstream: Option<JobHandle>,
    /// Jobs in dependency order.
    pub jobs: Vec<JobSpec>,
}

impl ChainSpec {
    /// Chain without an upstream gate.
    #[must_use]
    pub fn new(name: impl Into<String>, jobs: Vec<JobSpec>) -> Self {
        Self {
            name: name.into(),
            upstream: None,
            jobs,
        }
    }

    /// Gate this chain on `upstream` reaching `Finished`.
    #[must_use]
    pub fn after(mut self, upstream: JobHandle) -> Self {
        self.upstream = Some(upstream);
        self
    }
}

/// Terminal record for one job of a chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobOutcome {
    /// Job identifier.
    pub job_id: String,
    /// Terminal state reached.
    pub state: JobState,
    /// How the job was started; `None` for an upstream that was only checked.
    pub disposition: Option<LaunchDisposition>,
    /// Files copied while staging this job's inputs.
    pub files_staged: u64,
    /// Wall time spent on this job by the control process.
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// Engine log file.
    pub log_path: PathBuf,
}

/// Per-chain observability summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChainReport {
    /// Chain label.
    pub chain: String,
    /// When the control process started the chain.
    pub started_at: DateTime<Utc>,
    /// When the last job reached `Finished`.
    pub finished_at: DateTime<Utc>,
    /// One entry per job, in chain order (upstream first when present).
    pub outcomes: Vec<JobOutcome>,
}

impl ChainReport {
    /// Total control-process time across all jobs.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.outcomes.iter().map(|o| o.duration).sum()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
