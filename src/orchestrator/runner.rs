//! Launches jobs into persistent sessions.
//!
//! Launch is safe to repeat: a job whose log already shows success is not
//! touched, and a job whose session already exists is never given a second
//! session.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::config::{EngineConfig, GlobalConfig};
use crate::models::job::{JobHandle, JobSpec, JobState, Launch, LaunchDisposition};
use crate::orchestrator::monitor::CompletionMonitor;
use crate::orchestrator::session::SessionBackend;
use crate::{AppError, Result};

/// Starts or resumes jobs through a [`SessionBackend`].
#[derive(Clone)]
pub struct SessionRunner {
    backend: Arc<dyn SessionBackend>,
    monitor: CompletionMonitor,
    engine: EngineConfig,
    work_root: PathBuf,
    name_prefix: String,
}

impl std::fmt::Debug for SessionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRunner")
            .field("engine", &self.engine.program)
            .field("work_root", &self.work_root)
            .field("name_prefix", &self.name_prefix)
            .finish_non_exhaustive()
    }
}

impl SessionRunner {
    /// Runner using `backend` and `monitor`, with engine and naming
    /// settings taken from `config`.
    #[must_use]
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        monitor: CompletionMonitor,
        config: &GlobalConfig,
    ) -> Self {
        Self {
            backend,
            monitor,
            engine: config.engine.clone(),
            work_root: config.work_root.clone(),
            name_prefix: config.session.name_prefix.clone(),
        }
    }

    /// Handle `launch` would return for `job`.
    #[must_use]
    pub fn handle_for(&self, job: &JobSpec) -> JobHandle {
        job.handle(&self.name_prefix)
    }

    /// Shell line run inside the session for `job`.
    #[must_use]
    pub fn shell_line(&self, job: &JobSpec) -> String {
        job.command
            .command_line(&self.engine.program, &self.engine.extra_args, &self.work_root)
            .to_shell()
    }

    /// Whether the session for `handle` is alive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` when the session mechanism cannot be
    /// queried.
    pub async fn session_exists(&self, handle: &JobHandle) -> Result<bool> {
        self.backend
            .exists(&handle.session_name)
            .await
            .map_err(|err| AppError::Launch {
                job_id: handle.job_id.clone(),
                log_path: handle.log_path.clone(),
                reason: err.to_string(),
            })
    }

    /// Start `job`, resume it, or recognise it as already finished.
    ///
    /// A job that ended without a terminal line (`Unknown`) is never
    /// restarted. An existing session whose job is `Running` or `Pending`
    /// is left alone; one whose job ended `Failed` gets the command typed
    /// into it again.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Launch` when the session mechanism is unavailable
    /// or refuses the request. Not retried.
    pub async fn launch(&self, job: &JobSpec) -> Result<Launch> {
        let handle = self.handle_for(job);
        let span = info_span!(
            "launch",
            job_id = job.job_id,
            session = handle.session_name
        );

        async move {
            let state = self.monitor.poll(&handle);
            if state == JobState::Finished {
                info!("log already shows success; nothing to launch");
                return Ok(Launch {
                    handle,
                    disposition: LaunchDisposition::AlreadyFinished,
                });
            }

            if state == JobState::Unknown {
                warn!(
                    log_path = %handle.log_path.display(),
                    "previous attempt ended without a terminal line; left for an operator"
                );
                return Ok(Launch {
                    handle,
                    disposition: LaunchDisposition::LeftForOperator,
                });
            }

            let launch_error = |err: AppError| AppError::Launch {
                job_id: job.job_id.clone(),
                log_path: handle.log_path.clone(),
                reason: err.to_string(),
            };

            let exists = self
                .backend
                .exists(&handle.session_name)
                .await
                .map_err(launch_error)?;

            let disposition = if exists {
                match state {
                    JobState::Running | JobState::Pending | JobState::Staged => {
                        info!(state = %state, "session exists; resuming monitoring only");
                        LaunchDisposition::Resumed
                    }
                    JobState::Failed | JobState::Unknown | JobState::Finished => {
                        // Only `Failed` gets here: `Finished` and `Unknown`
                        // returned above.
                        let line = self.shell_line(job);
                        self.backend
                            .send_command(&handle.session_name, &line)
                            .await
                            .map_err(launch_error)?;
                        info!(state = %state, "previous attempt ended; command re-sent to session");
                        LaunchDisposition::Injected
                    }
                }
            } else {
                let line = self.shell_line(job);
                self.backend
                    .create(&handle.session_name, &line)
                    .await
                    .map_err(launch_error)?;
                info!(log_path = %handle.log_path.display(), "job launched in new session");
                LaunchDisposition::Created
            };

            Ok(Launch {
                handle,
                disposition,
            })
        }
        .instrument(span)
        .await
    }
}
