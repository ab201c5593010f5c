//! Completion detection from on-disk artifacts.
//!
//! The engine exposes no status API. A job's state is read from three
//! things under its working directory: whether `scripts/` exists, whether a
//! running marker is present there, and which terminal line its log holds.
//! Interpretation of those artifacts lives behind [`CompletionClassifier`]
//! so that a change in the engine's wording touches one type.
//!
//! Nothing here keeps state between calls: a fresh process polling the same
//! [`JobHandle`] reaches the same verdict.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::MarkerConfig;
use crate::models::job::{JobHandle, JobState};
use crate::{AppError, Result};

/// Raw artifacts gathered for one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobArtifacts {
    /// Whether `<work_dir>/scripts` exists.
    pub scripts_dir_exists: bool,
    /// File names in `<work_dir>/scripts`.
    pub script_entries: Vec<String>,
    /// Log contents, if the log exists.
    pub log: Option<String>,
}

/// A classification plus an optional note worth surfacing to an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Classified state.
    pub state: JobState,
    /// Set when the artifacts were ambiguous.
    pub note: Option<String>,
}

impl From<JobState> for Verdict {
    fn from(state: JobState) -> Self {
        Self { state, note: None }
    }
}

/// Interprets job artifacts. Implementations are versioned so logs and
/// journals record which contract produced a verdict.
pub trait CompletionClassifier: Send + Sync {
    /// Contract identifier, e.g. `recon-all/1`.
    fn version(&self) -> &str;

    /// Whether `file_name` in `scripts/` signals an executing job.
    fn is_running_marker(&self, file_name: &str) -> bool;

    /// Classify the gathered artifacts.
    fn classify(&self, artifacts: &JobArtifacts) -> Verdict;
}

/// Classifier for the reconstruction engine's marker and log conventions.
///
/// Priority: no `scripts/` → `Pending`; any running marker → `Running`;
/// success line → `Finished`; failure line → `Failed`; otherwise `Unknown`.
/// When both terminal lines appear (a rerun appended to an old log), the
/// one occurring last wins and the verdict carries a note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconLogClassifier {
    running_prefix: String,
    success_line: String,
    failure_line: String,
}

impl ReconLogClassifier {
    /// Contract version reported by this classifier.
    pub const VERSION: &'static str = "recon-all/1";

    /// Classifier using the given marker prefix and terminal lines.
    #[must_use]
    pub fn new(
        running_prefix: impl Into<String>,
        success_line: impl Into<String>,
        failure_line: impl Into<String>,
    ) -> Self {
        Self {
            running_prefix: running_prefix.into(),
            success_line: success_line.into(),
            failure_line: failure_line.into(),
        }
    }
}

impl Default for ReconLogClassifier {
    fn default() -> Self {
        Self::from(&MarkerConfig::default())
    }
}

impl From<&MarkerConfig> for ReconLogClassifier {
    fn from(markers: &MarkerConfig) -> Self {
        Self::new(
            markers.running_prefix.clone(),
            markers.success_line.clone(),
            markers.failure_line.clone(),
        )
    }
}

impl CompletionClassifier for ReconLogClassifier {
    fn version(&self) -> &str {
        Self::VERSION
    }

    fn is_running_marker(&self, file_name: &str) -> bool {
        file_name.starts_with(&self.running_prefix)
    }

    fn classify(&self, artifacts: &JobArtifacts) -> Verdict {
        if !artifacts.scripts_dir_exists {
            return JobState::Pending.into();
        }
        if artifacts
            .script_entries
            .iter()
            .any(|name| self.is_running_marker(name))
        {
            return JobState::Running.into();
        }
        let Some(log) = artifacts.log.as_deref() else {
            return JobState::Unknown.into();
        };

        match (log.rfind(&self.success_line), log.rfind(&self.failure_line)) {
            (Some(_), None) => JobState::Finished.into(),
            (None, Some(_)) => JobState::Failed.into(),
            (Some(ok), Some(failed)) => {
                let state = if ok > failed {
                    JobState::Finished
                } else {
                    JobState::Failed
                };
                Verdict {
                    state,
                    note: Some(format!(
                        "log holds both terminal lines; the later one ({state}) wins"
                    )),
                }
            }
            (None, None) => JobState::Unknown.into(),
        }
    }
}

/// Backoff policy for [`CompletionMonitor::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Interval while the job has not created its structure.
    pub pending_interval: Duration,
    /// Interval while the job is executing.
    pub running_interval: Duration,
    /// Advisory deadline; the job keeps running when it passes.
    pub timeout: Option<Duration>,
    /// How long a relaunched job may keep showing its previous terminal
    /// state before that state is believed.
    pub restart_grace: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            pending_interval: Duration::from_secs(30),
            running_interval: Duration::from_secs(300),
            timeout: None,
            restart_grace: Duration::from_secs(120),
        }
    }
}

impl WaitPolicy {
    /// Sleep before the next poll given the last observed state.
    #[must_use]
    pub fn interval_for(&self, state: JobState) -> Duration {
        match state {
            JobState::Running => self.running_interval,
            _ => self.pending_interval,
        }
    }

    /// Same policy with a different timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Classifies jobs from disk, once or until a terminal state.
#[derive(Clone)]
pub struct CompletionMonitor {
    classifier: Arc<dyn CompletionClassifier>,
}

impl std::fmt::Debug for CompletionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionMonitor")
            .field("classifier", &self.classifier.version())
            .finish()
    }
}

impl CompletionMonitor {
    /// Monitor using `classifier`.
    #[must_use]
    pub fn new(classifier: Arc<dyn CompletionClassifier>) -> Self {
        Self { classifier }
    }

    /// Monitor using the engine classifier built from `markers`.
    #[must_use]
    pub fn from_markers(markers: &MarkerConfig) -> Self {
        Self::new(Arc::new(ReconLogClassifier::from(markers)))
    }

    /// Version of the active classifier.
    #[must_use]
    pub fn classifier_version(&self) -> &str {
        self.classifier.version()
    }

    /// Single non-blocking check.
    #[must_use]
    pub fn poll(&self, handle: &JobHandle) -> JobState {
        let artifacts = gather_artifacts(&handle.scripts_dir(), &handle.log_path);
        let verdict = self.classifier.classify(&artifacts);
        if let Some(note) = &verdict.note {
            warn!(
                job_id = handle.job_id,
                log_path = %handle.log_path.display(),
                classifier = self.classifier.version(),
                note,
                "ambiguous job artifacts"
            );
        }
        debug!(job_id = handle.job_id, state = %verdict.state, "job polled");
        verdict.state
    }

    /// Poll until a terminal state, the timeout, or cancellation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MonitorTimeout` when the policy's timeout passes
    /// first, or `AppError::Cancelled` when `cancel` fires. Neither affects
    /// the job itself.
    pub async fn wait(
        &self,
        handle: &JobHandle,
        policy: WaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<JobState> {
        self.wait_with(handle, policy, cancel, |_| {}).await
    }

    /// Like [`wait`](Self::wait), calling `on_change` for the first
    /// observation and every change of state afterwards.
    ///
    /// # Errors
    ///
    /// See [`wait`](Self::wait).
    pub async fn wait_with<F>(
        &self,
        handle: &JobHandle,
        policy: WaitPolicy,
        cancel: &CancellationToken,
        mut on_change: F,
    ) -> Result<JobState>
    where
        F: FnMut(JobState) + Send,
    {
        let span = info_span!("wait", job_id = handle.job_id);
        async move {
            let started = Instant::now();
            let mut last: Option<JobState> = None;

            loop {
                let state = self.poll(handle);
                if last != Some(state) {
                    info!(state = %state, "job state observed");
                    on_change(state);
                    last = Some(state);
                }
                if state.is_terminal() {
                    return Ok(state);
                }

                let mut sleep_for = policy.interval_for(state);
                if let Some(timeout) = policy.timeout {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        warn!(
                            log_path = %handle.log_path.display(),
                            "gave up waiting; job left running"
                        );
                        return Err(AppError::MonitorTimeout {
                            job_id: handle.job_id.clone(),
                            log_path: handle.log_path.clone(),
                            waited_secs: elapsed.as_secs(),
                            last_state: state,
                        });
                    }
                    sleep_for = sleep_for.min(timeout - elapsed);
                }

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("wait cancelled; job left running");
                        return Err(AppError::Cancelled(format!(
                            "stopped waiting for {}",
                            handle.job_id
                        )));
                    }
                    () = tokio::time::sleep(sleep_for) => {}
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl CompletionMonitor {
    /// After a relaunch, poll until the job stops showing a terminal state
    /// left by its previous attempt, or until `policy.restart_grace` passes.
    /// Returns the last observed state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Cancelled` when `cancel` fires.
    pub async fn await_restart(
        &self,
        handle: &JobHandle,
        policy: WaitPolicy,
        cancel: &CancellationToken,
    ) -> Result<JobState> {
        let deadline = Instant::now() + policy.restart_grace;
        loop {
            let state = self.poll(handle);
            if !state.is_terminal() {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    job_id = handle.job_id,
                    state = %state,
                    "relaunched job still shows its previous outcome"
                );
                return Ok(state);
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!(
                        "stopped waiting for {} to restart",
                        handle.job_id
                    )));
                }
                () = tokio::time::sleep(policy.pending_interval.min(deadline - now)) => {}
            }
        }
    }
}

/// Read the artifacts for one job. Unreadable paths count as absent.
fn gather_artifacts(scripts_dir: &Path, log_path: &Path) -> JobArtifacts {
    let entries = match fs::read_dir(scripts_dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %scripts_dir.display(), %err, "cannot list scripts directory");
            }
            return JobArtifacts::default();
        }
    };

    let script_entries = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();

    let log = match fs::read(log_path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %log_path.display(), %err, "cannot read job log");
            }
            None
        }
    };

    JobArtifacts {
        scripts_dir_exists: true,
        script_entries,
        log,
    }
}

/// Last `max_lines` lines of the log at `path`, or an empty string.
#[must_use]
pub fn log_excerpt(path: &Path, max_lines: usize) -> String {
    let Ok(bytes) = fs::read(path) else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
