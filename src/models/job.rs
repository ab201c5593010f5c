//! Job specification, handle, and lifecycle state.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::session::SessionDescriptor;
use crate::orchestrator::command::EngineCommand;

/// Observable lifecycle state of an external reconstruction job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The job has not yet created its working structure.
    Pending,
    /// Inputs are in place in the working tree.
    Staged,
    /// A running marker is present.
    Running,
    /// The log carries the success terminal line.
    Finished,
    /// The log carries the failure terminal line.
    Failed,
    /// No marker and no terminal line: killed externally or the log
    /// contract drifted. Requires an operator.
    Unknown,
}

impl JobState {
    /// Whether polling should stop at this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Unknown)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// A job may be observed `Pending` again after staging (the engine has
    /// not created its structure yet), and `Running` may be re-observed
    /// after a resume.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Staged | Self::Running | Self::Pending)
                | (Self::Staged, Self::Pending | Self::Running)
                | (Self::Running, Self::Running)
                | (
                    Self::Pending | Self::Staged | Self::Running,
                    Self::Finished | Self::Failed | Self::Unknown
                )
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Staged => "staged",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Kind of engine invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fuses several sessions of one subject into a reference anatomy.
    Base,
    /// Processes one session against a previously built base.
    Longitudinal,
}

/// One invocation of the external engine. Never mutated after launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Stable identifier; also the engine's output directory name.
    pub job_id: String,
    /// Base build or longitudinal run.
    pub kind: JobKind,
    /// Validated engine command.
    pub command: EngineCommand,
    /// Sessions staged before launch, in order.
    pub input_sessions: Vec<SessionDescriptor>,
    /// Engine output directory for this job.
    pub work_dir: PathBuf,
    /// Engine log file, normally under `work_dir/scripts`.
    pub log_path: PathBuf,
}

impl JobSpec {
    /// `work_dir/scripts`, where markers and the log live.
    #[must_use]
    pub fn scripts_dir(&self) -> PathBuf {
        self.work_dir.join("scripts")
    }

    /// Handle for this job when its session names start with `name_prefix`.
    #[must_use]
    pub fn handle(&self, name_prefix: &str) -> JobHandle {
        JobHandle {
            job_id: self.job_id.clone(),
            session_name: session_name(name_prefix, &self.job_id),
            log_path: self.log_path.clone(),
            work_dir: self.work_dir.clone(),
        }
    }
}

/// Persistent session name for `job_id`. One name per job keeps at most
/// one session per job.
#[must_use]
pub fn session_name(name_prefix: &str, job_id: &str) -> String {
    format!("{name_prefix}-{job_id}")
}

/// Everything needed to poll or resume a job from a fresh process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct JobHandle {
    /// Job identifier.
    pub job_id: String,
    /// Name of the persistent session the job runs in.
    pub session_name: String,
    /// Engine log file.
    pub log_path: PathBuf,
    /// Engine output directory.
    pub work_dir: PathBuf,
}

impl JobHandle {
    /// `work_dir/scripts`, where markers and the log live.
    #[must_use]
    pub fn scripts_dir(&self) -> PathBuf {
        self.work_dir.join("scripts")
    }
}

/// What `launch` did to get the job going.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchDisposition {
    /// The log already showed success; nothing was created or resumed.
    AlreadyFinished,
    /// A fresh detached session was created running the command.
    Created,
    /// An existing session was found with the job still in flight; nothing
    /// was sent to it.
    Resumed,
    /// An existing session was found idle after a failure; the command was
    /// sent into it.
    Injected,
    /// The previous attempt ended without a terminal line. Nothing was
    /// created or sent; an operator has to look at the job.
    LeftForOperator,
}

impl Display for LaunchDisposition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::AlreadyFinished => "already_finished",
            Self::Created => "created",
            Self::Resumed => "resumed",
            Self::Injected => "injected",
            Self::LeftForOperator => "left_for_operator",
        };
        f.write_str(label)
    }
}

/// Result of a launch: the handle plus what was done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    /// Handle for polling.
    pub handle: JobHandle,
    /// Action taken.
    pub disposition: LaunchDisposition,
}

impl Launch {
    /// Whether the job was already complete before launch.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.disposition == LaunchDisposition::AlreadyFinished
    }
}
