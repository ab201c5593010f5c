//! Sequential execution of dependent jobs.
//!
//! Each job is staged, launched, and waited on before the next one is
//! touched. The first job ending `Failed` or `Unknown` stops the chain;
//! nothing after it is staged or launched. A chain may be gated on an
//! upstream job owned by another chain, which is only ever checked.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::errors::ChainError;
use crate::journal::{JournalEntry, JournalEventType, JournalSink, NoopJournal};
use crate::models::chain::{ChainReport, ChainSpec, JobOutcome};
use crate::models::job::{JobHandle, JobSpec, JobState, LaunchDisposition};
use crate::orchestrator::lease::JobLease;
use crate::orchestrator::monitor::{log_excerpt, CompletionMonitor, WaitPolicy};
use crate::orchestrator::runner::SessionRunner;
use crate::staging::DataStager;
use crate::{AppError, Result};

/// Lines of log included in a [`ChainError`].
const EXCERPT_LINES: usize = 20;

/// Drives a [`ChainSpec`] through staging, launch, and monitoring.
#[derive(Clone)]
pub struct DependencyChain {
    stager: DataStager,
    runner: SessionRunner,
    monitor: CompletionMonitor,
    policy: WaitPolicy,
    lease_dir: Option<PathBuf>,
    journal: Arc<dyn JournalSink>,
}

impl DependencyChain {
    /// Chain driver without leases or a journal.
    #[must_use]
    pub fn new(runner: SessionRunner, monitor: CompletionMonitor, policy: WaitPolicy) -> Self {
        Self {
            stager: DataStager::new(),
            runner,
            monitor,
            policy,
            lease_dir: None,
            journal: Arc::new(NoopJournal),
        }
    }

    /// Take a per-job lease under `lease_dir` before touching each job.
    #[must_use]
    pub fn with_leases(mut self, lease_dir: PathBuf) -> Self {
        self.lease_dir = Some(lease_dir);
        self
    }

    /// Record chain events to `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<dyn JournalSink>) -> Self {
        self.journal = journal;
        self
    }

    /// The runner used for launches.
    #[must_use]
    pub fn runner(&self) -> &SessionRunner {
        &self.runner
    }

    /// Run every job of `chain` in order.
    ///
    /// # Errors
    ///
    /// - `AppError::Chain` identifying the first job (or the upstream) that
    ///   ended `Failed` or `Unknown`.
    /// - `AppError::Staging`, `AppError::Launch`, `AppError::Lease` from the
    ///   job being started; the chain stops there.
    /// - `AppError::NotStarted` when the upstream job was never launched.
    /// - `AppError::MonitorTimeout` or `AppError::Cancelled` from waiting;
    ///   the job itself keeps running.
    pub async fn run(&self, chain: &ChainSpec, cancel: &CancellationToken) -> Result<ChainReport> {
        let span = info_span!("chain", chain = chain.name, jobs = chain.jobs.len());
        async move {
            let started_at = Utc::now();
            self.note(JournalEntry::new(&chain.name, JournalEventType::ChainStarted));
            info!("chain started");

            let mut outcomes = Vec::with_capacity(chain.jobs.len() + 1);

            if let Some(upstream) = &chain.upstream {
                match self.check_upstream(&chain.name, upstream, cancel).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) => return Err(self.abort(&chain.name, err)),
                }
            }

            for job in &chain.jobs {
                match self.run_job(&chain.name, job, cancel).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(err) => return Err(self.abort(&chain.name, err)),
                }
            }

            self.note(JournalEntry::new(&chain.name, JournalEventType::ChainFinished));
            info!("chain finished");
            Ok(ChainReport {
                chain: chain.name.clone(),
                started_at,
                finished_at: Utc::now(),
                outcomes,
            })
        }
        .instrument(span)
        .await
    }

    /// Wait for a job owned by another chain without launching it.
    async fn check_upstream(
        &self,
        chain: &str,
        upstream: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let started = Instant::now();
        if self.monitor.poll(upstream) == JobState::Pending
            && !self.runner.session_exists(upstream).await?
        {
            warn!(
                upstream = upstream.job_id,
                session = upstream.session_name,
                "upstream job has no output and no session"
            );
            return Err(AppError::NotStarted {
                job_id: upstream.job_id.clone(),
                log_path: upstream.log_path.clone(),
            });
        }
        info!(upstream = upstream.job_id, "waiting for upstream job");
        let state = self.wait(chain, upstream, cancel).await?;
        self.settle(chain, upstream, state)?;
        Ok(JobOutcome {
            job_id: upstream.job_id.clone(),
            state,
            disposition: None,
            files_staged: 0,
            duration: started.elapsed(),
            log_path: upstream.log_path.clone(),
        })
    }

    async fn run_job(
        &self,
        chain: &str,
        job: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let started = Instant::now();
        let _lease = match &self.lease_dir {
            Some(dir) => Some(
                JobLease::acquire(dir, &job.job_id)
                    .map_err(|err| err.for_job(&job.job_id, &job.log_path))?,
            ),
            None => None,
        };

        let stager = self.stager;
        let sessions = job.input_sessions.clone();
        let staged = tokio::task::spawn_blocking(move || stager.stage(&sessions))
            .await
            .map_err(|err| AppError::Io(format!("staging task panicked: {err}")))?
            .map_err(|err| err.for_job(&job.job_id, &job.log_path))?;
        self.note(
            JournalEntry::new(chain, JournalEventType::JobStaged)
                .job(&job.job_id)
                .state(JobState::Staged)
                .detail(format!(
                    "{} files, {} bytes copied",
                    staged.files_copied, staged.bytes_copied
                )),
        );

        let launch = self.runner.launch(job).await?;
        self.note(
            JournalEntry::new(chain, JournalEventType::JobLaunched)
                .job(&job.job_id)
                .disposition(launch.disposition)
                .log_path(&launch.handle.log_path),
        );

        let state = match launch.disposition {
            LaunchDisposition::AlreadyFinished => JobState::Finished,
            LaunchDisposition::Resumed | LaunchDisposition::LeftForOperator => {
                self.wait(chain, &launch.handle, cancel).await?
            }
            LaunchDisposition::Created | LaunchDisposition::Injected => {
                self.monitor
                    .await_restart(&launch.handle, self.policy, cancel)
                    .await?;
                self.wait(chain, &launch.handle, cancel).await?
            }
        };
        self.settle(chain, &launch.handle, state)?;

        Ok(JobOutcome {
            job_id: job.job_id.clone(),
            state,
            disposition: Some(launch.disposition),
            files_staged: staged.files_copied,
            duration: started.elapsed(),
            log_path: launch.handle.log_path.clone(),
        })
    }

    /// Wait for `handle`, journaling each observed state change.
    async fn wait(
        &self,
        chain: &str,
        handle: &JobHandle,
        cancel: &CancellationToken,
    ) -> Result<JobState> {
        let journal = Arc::clone(&self.journal);
        let mut previous = JobState::Staged;
        let chain_name = chain.to_owned();
        let job_id = handle.job_id.clone();

        self.monitor
            .wait_with(handle, self.policy, cancel, move |state| {
                if !previous.can_transition_to(state) {
                    warn!(job_id, from = %previous, to = %state, "unexpected job state transition");
                }
                previous = state;
                let entry = JournalEntry::new(&chain_name, JournalEventType::JobState)
                    .job(&job_id)
                    .state(state);
                if let Err(err) = journal.record(entry) {
                    warn!(%err, "failed to journal job state");
                }
            })
            .await
    }

    /// Turn a terminal state into success or a [`ChainError`].
    fn settle(&self, chain: &str, handle: &JobHandle, state: JobState) -> Result<()> {
        if state == JobState::Finished {
            self.note(
                JournalEntry::new(chain, JournalEventType::JobFinished)
                    .job(&handle.job_id)
                    .state(state)
                    .log_path(&handle.log_path),
            );
            info!(job_id = handle.job_id, "job finished");
            return Ok(());
        }

        let state = if state == JobState::Failed {
            JobState::Failed
        } else {
            JobState::Unknown
        };
        self.note(
            JournalEntry::new(chain, JournalEventType::JobFailed)
                .job(&handle.job_id)
                .state(state)
                .log_path(&handle.log_path),
        );
        error!(
            job_id = handle.job_id,
            state = %state,
            log_path = %handle.log_path.display(),
            "job did not finish"
        );
        Err(ChainError {
            job_id: handle.job_id.clone(),
            state,
            log_path: handle.log_path.clone(),
            log_excerpt: log_excerpt(&handle.log_path, EXCERPT_LINES),
        }
        .into())
    }

    fn abort(&self, chain: &str, err: AppError) -> AppError {
        let mut entry =
            JournalEntry::new(chain, JournalEventType::ChainAborted).detail(err.to_string());
        if let Some(job_id) = err.job_id() {
            entry = entry.job(job_id);
        }
        self.note(entry);
        warn!(%err, "chain aborted");
        err
    }

    fn note(&self, entry: JournalEntry) {
        if let Err(err) = self.journal.record(entry) {
            warn!(%err, "failed to write journal entry");
        }
    }
}
