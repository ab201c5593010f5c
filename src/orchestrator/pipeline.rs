//! Base-then-longitudinal planning and fan-out execution.
//!
//! A subject's pipeline is one base chain followed by one chain per
//! session. Each longitudinal chain is gated on the base job, which it
//! checks but never launches. Siblings run one after another; a failed
//! sibling does not stop the ones after it.

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::chain::{ChainReport, ChainSpec};
use crate::models::job::{session_name, JobHandle, JobKind, JobSpec};
use crate::models::session::SessionDescriptor;
use crate::orchestrator::chain::DependencyChain;
use crate::orchestrator::command::{validate_identifier, EngineCommand};
use crate::{AppError, Result};

/// Builds job specifications from configuration.
#[derive(Debug, Clone, Copy)]
pub struct JobPlanner<'a> {
    config: &'a GlobalConfig,
}

impl<'a> JobPlanner<'a> {
    /// Planner for `config`.
    #[must_use]
    pub fn new(config: &'a GlobalConfig) -> Self {
        Self { config }
    }

    /// Base build fusing `sessions`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidIdentifier` for unusable names or an empty
    /// session list.
    pub fn base_job(&self, sessions: &[SessionDescriptor]) -> Result<JobSpec> {
        let ids: Vec<String> = sessions.iter().map(|s| s.session_id.clone()).collect();
        let command = EngineCommand::base(&self.config.base_name, &ids)?;
        Ok(self.spec(JobKind::Base, command, sessions.to_vec()))
    }

    /// Longitudinal run of `session` against the configured base.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidIdentifier` for unusable names.
    pub fn longitudinal_job(&self, session: &SessionDescriptor) -> Result<JobSpec> {
        let command = EngineCommand::longitudinal(&session.session_id, &self.config.base_name)?;
        Ok(self.spec(JobKind::Longitudinal, command, vec![session.clone()]))
    }

    /// Handle for an already planned job, reconstructed from its id alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidIdentifier` if `job_id` is unusable.
    pub fn handle_for_id(&self, job_id: &str) -> Result<JobHandle> {
        validate_identifier(job_id)?;
        let work_dir = self.config.work_root.join(job_id);
        Ok(JobHandle {
            job_id: job_id.to_owned(),
            session_name: session_name(&self.config.session.name_prefix, job_id),
            log_path: work_dir.join("scripts").join(&self.config.engine.log_name),
            work_dir,
        })
    }

    fn spec(
        &self,
        kind: JobKind,
        command: EngineCommand,
        input_sessions: Vec<SessionDescriptor>,
    ) -> JobSpec {
        let job_id = command.job_id();
        let work_dir: PathBuf = self.config.work_root.join(&job_id);
        let log_path = work_dir.join("scripts").join(&self.config.engine.log_name);
        JobSpec {
            job_id,
            kind,
            command,
            input_sessions,
            work_dir,
            log_path,
        }
    }
}

/// Chains making up one subject's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    /// Chain holding the base job.
    pub base: ChainSpec,
    /// One chain per session, each gated on the base job.
    pub longitudinal: Vec<ChainSpec>,
}

/// Plan the base job over `sessions` and a gated longitudinal chain for
/// each of them.
///
/// # Errors
///
/// Returns `AppError::InvalidIdentifier` for unusable names or an empty
/// session list.
pub fn plan_pipeline(config: &GlobalConfig, sessions: &[SessionDescriptor]) -> Result<PipelinePlan> {
    let planner = JobPlanner::new(config);
    let base_job = planner.base_job(sessions)?;
    let base_handle = base_job.handle(&config.session.name_prefix);

    let longitudinal = sessions
        .iter()
        .map(|session| {
            let job = planner.longitudinal_job(session)?;
            Ok(ChainSpec::new(job.job_id.clone(), vec![job]).after(base_handle.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(PipelinePlan {
        base: ChainSpec::new(base_job.job_id.clone(), vec![base_job]),
        longitudinal,
    })
}

/// Result of one longitudinal chain.
#[derive(Debug)]
pub struct SiblingResult {
    /// Chain label.
    pub chain: String,
    /// Report, or the error that stopped the chain.
    pub outcome: Result<ChainReport>,
}

/// Results of a whole pipeline run.
#[derive(Debug)]
pub struct PipelineReport {
    /// Base chain report.
    pub base: ChainReport,
    /// Longitudinal chain results, in plan order.
    pub siblings: Vec<SiblingResult>,
}

impl PipelineReport {
    /// The first sibling error, if any sibling failed.
    #[must_use]
    pub fn first_failure(&self) -> Option<&AppError> {
        self.siblings.iter().find_map(|s| s.outcome.as_ref().err())
    }

    /// Whether every chain finished.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.first_failure().is_none()
    }
}

/// Run the base chain, then each longitudinal chain in turn.
///
/// # Errors
///
/// Returns the base chain's error if it does not finish, or
/// `AppError::Cancelled` as soon as a wait is cancelled. Other sibling
/// errors are collected in the report.
pub async fn run_pipeline(
    driver: &DependencyChain,
    plan: &PipelinePlan,
    cancel: &CancellationToken,
) -> Result<PipelineReport> {
    let span = info_span!("pipeline", base = plan.base.name, siblings = plan.longitudinal.len());
    async move {
        let base = driver.run(&plan.base, cancel).await?;

        let mut siblings = Vec::with_capacity(plan.longitudinal.len());
        for chain in &plan.longitudinal {
            let outcome = match driver.run(chain, cancel).await {
                Err(AppError::Cancelled(msg)) => return Err(AppError::Cancelled(msg)),
                Err(err) => {
                    warn!(chain = chain.name, %err, "longitudinal chain did not finish");
                    Err(err)
                }
                Ok(report) => {
                    info!(chain = chain.name, "longitudinal chain finished");
                    Ok(report)
                }
            };
            siblings.push(SiblingResult {
                chain: chain.name.clone(),
                outcome,
            });
        }

        Ok(PipelineReport { base, siblings })
    }
    .instrument(span)
    .await
}
