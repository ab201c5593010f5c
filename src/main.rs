#![forbid(unsafe_code)]

//! `recon-supervisor` — stages sessions, launches reconstruction jobs in
//! detached sessions, and follows them to completion.
//!
//! Interrupting this process stops supervision only; launched jobs keep
//! running and can be picked up again with `wait` or by re-running the
//! same command.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use recon_supervisor::config::{split_session_list, GlobalConfig};
use recon_supervisor::journal::{JournalSink, JsonlJournalWriter, NoopJournal};
use recon_supervisor::models::chain::{ChainReport, ChainSpec};
use recon_supervisor::models::job::JobState;
use recon_supervisor::orchestrator::chain::DependencyChain;
use recon_supervisor::orchestrator::monitor::{log_excerpt, CompletionMonitor};
use recon_supervisor::orchestrator::pipeline::{plan_pipeline, run_pipeline, JobPlanner};
use recon_supervisor::orchestrator::runner::SessionRunner;
use recon_supervisor::orchestrator::session::ScreenBackend;
use recon_supervisor::staging::DataStager;
use recon_supervisor::{AppError, ChainError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "recon-supervisor",
    about = "Supervise long-running longitudinal reconstruction jobs",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Working-tree root (overrides config and `RECON_WORK_ROOT`).
    #[arg(long)]
    work_root: Option<PathBuf>,

    /// Source-data root (overrides config and `RECON_SOURCE_ROOT`).
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Base job name (overrides config and `RECON_BASE_NAME`).
    #[arg(long)]
    base: Option<String>,

    /// Comma-separated sessions; omit to discover them.
    #[arg(long)]
    sessions: Option<String>,

    /// Skip the per-job advisory lease.
    #[arg(long)]
    no_lease: bool,

    /// Skip the JSONL run journal.
    #[arg(long)]
    no_journal: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Copy session inputs into the working tree.
    Stage,
    /// Stage all sessions and build the base.
    Base,
    /// Run one longitudinal job per session against a finished base.
    Long,
    /// Build the base, then every longitudinal job.
    Pipeline,
    /// Print a job's current state.
    Status {
        /// Job identifier, e.g. `base` or `ses-01.long.base`.
        job_id: String,
    },
    /// Block until a job reaches a terminal state.
    Wait {
        /// Job identifier.
        job_id: String,
        /// Stop waiting after this many seconds.
        #[arg(long)]
        timeout_seconds: Option<u64>,
    },
}

fn main() -> ExitCode {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to build tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_failure(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<()> {
    let config = resolve_config(&args)?;
    let monitor = CompletionMonitor::from_markers(&config.markers);
    let driver = build_driver(&config, &monitor, &args)?;

    // ── Cancellation: stop supervising, never the jobs ──
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown signal received; launched jobs keep running");
        signal_cancel.cancel();
    });

    let planner = JobPlanner::new(&config);
    match args.command {
        Command::Stage => {
            let sessions = config.session_descriptors()?;
            let count = tokio::task::spawn_blocking(move || DataStager::new().stage(&sessions))
                .await
                .map_err(|err| AppError::Io(format!("staging task panicked: {err}")))??;
            println!(
                "staged {} session(s): {} file(s), {} byte(s) copied, {} already present",
                count.sessions, count.files_copied, count.bytes_copied, count.files_skipped
            );
        }
        Command::Base => {
            let sessions = config.session_descriptors()?;
            let job = planner.base_job(&sessions)?;
            let chain = ChainSpec::new(job.job_id.clone(), vec![job]);
            let report = driver.run(&chain, &cancel).await?;
            print_report(&report);
        }
        Command::Long => {
            let sessions = config.session_descriptors()?;
            let plan = plan_pipeline(&config, &sessions)?;
            let mut failures = Vec::new();
            for chain in &plan.longitudinal {
                match driver.run(chain, &cancel).await {
                    Ok(report) => print_report(&report),
                    Err(AppError::Cancelled(msg)) => return Err(AppError::Cancelled(msg)),
                    Err(err) => failures.push(err),
                }
            }
            first_failure(failures)?;
        }
        Command::Pipeline => {
            let sessions = config.session_descriptors()?;
            let plan = plan_pipeline(&config, &sessions)?;
            let mut report = run_pipeline(&driver, &plan, &cancel).await?;
            print_report(&report.base);
            let mut failures = Vec::new();
            for sibling in report.siblings.drain(..) {
                match sibling.outcome {
                    Ok(chain_report) => print_report(&chain_report),
                    Err(err) => failures.push(err),
                }
            }
            first_failure(failures)?;
        }
        Command::Status { job_id } => {
            let handle = planner.handle_for_id(&job_id)?;
            let state = monitor.poll(&handle);
            println!(
                "{}\t{}\tsession={}\tlog={}",
                handle.job_id,
                state,
                handle.session_name,
                handle.log_path.display()
            );
        }
        Command::Wait {
            job_id,
            timeout_seconds,
        } => {
            let handle = planner.handle_for_id(&job_id)?;
            let policy = config
                .monitor
                .wait_policy()
                .with_timeout(timeout_seconds.map(Duration::from_secs));
            let state = monitor.wait(&handle, policy, &cancel).await?;
            println!("{}\t{}\tlog={}", handle.job_id, state, handle.log_path.display());
            if state != JobState::Finished {
                return Err(AppError::Chain(ChainError {
                    job_id: handle.job_id.clone(),
                    state,
                    log_excerpt: log_excerpt(&handle.log_path, 20),
                    log_path: handle.log_path,
                }));
            }
        }
    }

    Ok(())
}

fn print_report(report: &ChainReport) {
    println!(
        "chain {} completed in {}s",
        report.chain,
        report.total_duration().as_secs()
    );
    for outcome in &report.outcomes {
        let how = outcome
            .disposition
            .map_or_else(|| "upstream".to_owned(), |d| d.to_string());
        println!(
            "  {}\t{}\t{}\t{}s\t{} file(s) staged",
            outcome.job_id,
            outcome.state,
            how,
            outcome.duration.as_secs(),
            outcome.files_staged
        );
    }
}

/// Layer CLI flags over the file and environment, then validate.
fn resolve_config(args: &Cli) -> Result<GlobalConfig> {
    let mut config = GlobalConfig::load_layered(args.config.as_deref())?;
    if let Some(root) = &args.work_root {
        config.work_root.clone_from(root);
    }
    if let Some(root) = &args.source_root {
        config.source_root.clone_from(root);
    }
    if let Some(base) = &args.base {
        config.base_name.clone_from(base);
    }
    if let Some(list) = args.sessions.as_deref() {
        config.sessions = split_session_list(list);
    }
    config.validate()?;
    info!(
        work_root = %config.work_root.display(),
        source_root = %config.source_root.display(),
        base = config.base_name,
        "configuration loaded"
    );
    Ok(config)
}

fn build_driver(
    config: &GlobalConfig,
    monitor: &CompletionMonitor,
    args: &Cli,
) -> Result<DependencyChain> {
    let backend = Arc::new(ScreenBackend::new(config.session.program.clone()));
    let runner = SessionRunner::new(backend, monitor.clone(), config);
    let journal: Arc<dyn JournalSink> = if args.no_journal {
        Arc::new(NoopJournal)
    } else {
        Arc::new(JsonlJournalWriter::new(config.journal_dir())?)
    };
    let driver = DependencyChain::new(runner, monitor.clone(), config.monitor.wait_policy())
        .with_journal(journal);
    Ok(if args.no_lease {
        driver
    } else {
        driver.with_leases(config.lease_dir())
    })
}

/// Report all but the first failure here; the first is returned so the
/// caller reports it and exits non-zero.
fn first_failure(failures: Vec<AppError>) -> Result<()> {
    let mut failures = failures.into_iter();
    match failures.next() {
        Some(first) => {
            for other in failures {
                report_failure(&other);
            }
            Err(first)
        }
        None => Ok(()),
    }
}

/// Print the failing job, its log, and an excerpt to stderr.
fn report_failure(err: &AppError) {
    error!(%err, job_id = err.job_id(), "supervision failed");
    eprint!("{}", err.operator_report());
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
