//! `DependencyChain` ordering, short-circuiting, and upstream gating.

use std::time::Duration;

use recon_supervisor::journal::JournalEventType;
use recon_supervisor::models::chain::ChainSpec;
use recon_supervisor::models::job::{JobState, LaunchDisposition};
use recon_supervisor::models::session::SessionDescriptor;
use recon_supervisor::orchestrator::lease::JobLease;
use recon_supervisor::orchestrator::pipeline::JobPlanner;
use recon_supervisor::AppError;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    driver, run_engine, workspace, Call, FakeBackend, Outcome, RecordingJournal,
};

#[tokio::test(start_paused = true)]
async fn single_job_chain_runs_to_finished() {
    let ws = workspace(&["ses-01", "ses-02"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let sessions = ws.config.session_descriptors().unwrap();
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();
    backend.plan(&job.handle("recon"), Outcome::Succeed);

    let chain = ChainSpec::new("base", vec![job]);
    let report = driver(&ws.config, &backend, &journal)
        .run(&chain, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.state, JobState::Finished);
    assert_eq!(outcome.disposition, Some(LaunchDisposition::Created));
    assert_eq!(outcome.files_staged, 4);
    assert!(ws.work.path().join("ses-02/anat/T1w.nii.gz").is_file());

    assert_eq!(
        journal.states_for("base", "base"),
        vec![JobState::Pending, JobState::Running, JobState::Finished]
    );
    assert_eq!(
        journal.events_for("base"),
        vec![
            JournalEventType::JobStaged,
            JournalEventType::JobLaunched,
            JournalEventType::JobState,
            JournalEventType::JobState,
            JournalEventType::JobState,
            JournalEventType::JobFinished,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_job_stops_the_chain() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let planner = JobPlanner::new(&ws.config);
    let sessions = ws.config.session_descriptors().unwrap();
    let first = planner.base_job(&sessions).unwrap();
    let second = planner.longitudinal_job(&sessions[0]).unwrap();
    backend.plan(&first.handle("recon"), Outcome::Fail);
    backend.plan(&second.handle("recon"), Outcome::Succeed);

    let chain = ChainSpec::new("subject", vec![first, second]);
    let err = driver(&ws.config, &backend, &journal)
        .run(&chain, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        AppError::Chain(failure) => {
            assert_eq!(failure.job_id, "base");
            assert_eq!(failure.state, JobState::Failed);
            assert_eq!(
                failure.log_path,
                ws.work.path().join("base/scripts/recon-all.log")
            );
            assert!(failure.log_excerpt.contains("exited with ERRORS"));
        }
        other => panic!("expected chain error, got {other:?}"),
    }

    assert!(journal.events_for("ses-01.long.base").is_empty());
    assert_eq!(backend.starts().len(), 1);
    assert!(!ws.work.path().join("ses-01.long.base").exists());
    let last = journal.entries().pop().unwrap();
    assert_eq!(last.event_type, JournalEventType::ChainAborted);
    assert_eq!(last.job_id.as_deref(), Some("base"));
}

#[tokio::test(start_paused = true)]
async fn job_that_vanishes_is_unknown_not_finished() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let sessions = ws.config.session_descriptors().unwrap();
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();
    backend.plan(&job.handle("recon"), Outcome::Vanish);

    let err = driver(&ws.config, &backend, &journal)
        .run(&ChainSpec::new("base", vec![job]), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        AppError::Chain(failure) => {
            assert_eq!(failure.state, JobState::Unknown);
            assert!(!failure.is_explicit_failure());
        }
        other => panic!("expected chain error, got {other:?}"),
    }
}

#[tokio::test]
async fn staging_error_prevents_launch() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let mut sessions = ws.config.session_descriptors().unwrap();
    sessions.push(SessionDescriptor::under_roots(
        "base",
        "ses-09",
        ws.source.path(),
        ws.work.path(),
    ));
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();

    let err = driver(&ws.config, &backend, &journal)
        .run(&ChainSpec::new("base", vec![job]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Staging { .. }));
    assert!(backend.calls().is_empty());
    assert!(!ws.work.path().join("ses-01").exists());
}

#[tokio::test]
async fn staging_failure_names_job_and_log() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let mut sessions = ws.config.session_descriptors().unwrap();
    sessions.push(SessionDescriptor::under_roots(
        "base",
        "ses-09",
        ws.source.path(),
        ws.work.path(),
    ));
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();
    let log = ws.work.path().join("base/scripts/recon-all.log");

    let err = driver(&ws.config, &backend, &journal)
        .run(&ChainSpec::new("base", vec![job]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.job_id(), Some("base"));
    assert_eq!(err.log_path(), Some(log.as_path()));
    let report = err.operator_report();
    assert!(report.contains("  job: base\n"));
    assert!(report.contains(&format!("  log: {}\n", log.display())));
    assert!(report.contains("ses-09"));
}

#[tokio::test(start_paused = true)]
async fn failed_upstream_blocks_the_chain() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let planner = JobPlanner::new(&ws.config);
    let sessions = ws.config.session_descriptors().unwrap();
    let base = planner.base_job(&sessions).unwrap().handle("recon");
    super::test_helpers::finished_job(&base, Outcome::Fail);
    let long = planner.longitudinal_job(&sessions[0]).unwrap();

    let chain = ChainSpec::new("ses-01.long.base", vec![long]).after(base);
    let err = driver(&ws.config, &backend, &journal)
        .run(&chain, &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.job_id(), Some("base"));
    assert!(backend.calls().is_empty());
    assert!(journal.events_for("ses-01.long.base").is_empty());
}

#[tokio::test(start_paused = true)]
async fn chain_waits_for_running_upstream_without_launching_it() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let planner = JobPlanner::new(&ws.config);
    let sessions = ws.config.session_descriptors().unwrap();
    let base = planner.base_job(&sessions).unwrap().handle("recon");
    let long = planner.longitudinal_job(&sessions[0]).unwrap();
    backend.plan(&long.handle("recon"), Outcome::Succeed);

    backend.with_session(&base.session_name);
    let upstream = base.clone();
    tokio::spawn(async move { run_engine(&upstream, Outcome::Succeed).await });

    let chain = ChainSpec::new("ses-01.long.base", vec![long]).after(base);
    let report = driver(&ws.config, &backend, &journal)
        .run(&chain, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[0].job_id, "base");
    assert_eq!(report.outcomes[0].disposition, None);
    assert_eq!(report.outcomes[1].job_id, "ses-01.long.base");
    assert_eq!(report.outcomes[1].state, JobState::Finished);

    let starts = backend.starts();
    assert_eq!(starts.len(), 1);
    assert!(
        matches!(&starts[0], Call::Create { name, .. } if name == "recon-ses-01.long.base")
    );
}

#[tokio::test]
async fn upstream_that_never_started_fails_fast() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let planner = JobPlanner::new(&ws.config);
    let sessions = ws.config.session_descriptors().unwrap();
    let base = planner.base_job(&sessions).unwrap().handle("recon");
    let long = planner.longitudinal_job(&sessions[0]).unwrap();

    let chain = ChainSpec::new("ses-01.long.base", vec![long]).after(base.clone());
    let err = driver(&ws.config, &backend, &journal)
        .run(&chain, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        AppError::NotStarted { job_id, log_path } => {
            assert_eq!(job_id, "base");
            assert_eq!(log_path, &base.log_path);
        }
        other => panic!("expected not started, got {other:?}"),
    }
    assert_eq!(err.log_path(), Some(base.log_path.as_path()));
    assert!(backend.starts().is_empty());
    assert!(!ws.work.path().join("ses-01").exists());
}

#[tokio::test(start_paused = true)]
async fn unknown_job_with_live_session_stops_without_relaunch() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let sessions = ws.config.session_descriptors().unwrap();
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();
    let handle = job.handle("recon");
    backend.with_session(&handle.session_name);
    super::test_helpers::finished_job(&handle, Outcome::Vanish);

    let err = driver(&ws.config, &backend, &journal)
        .run(&ChainSpec::new("base", vec![job]), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        AppError::Chain(failure) => {
            assert_eq!(failure.job_id, "base");
            assert_eq!(failure.state, JobState::Unknown);
        }
        other => panic!("expected chain error, got {other:?}"),
    }
    assert!(backend.starts().is_empty());
}

#[tokio::test]
async fn held_lease_stops_the_job_before_staging() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let lease_dir = ws.config.lease_dir();
    let _other = JobLease::acquire(&lease_dir, "base").unwrap();
    let sessions = ws.config.session_descriptors().unwrap();
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();

    let err = driver(&ws.config, &backend, &journal)
        .with_leases(lease_dir)
        .run(&ChainSpec::new("base", vec![job]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Lease { .. }));
    assert_eq!(
        err.log_path(),
        Some(ws.work.path().join("base/scripts/recon-all.log").as_path())
    );
    assert!(backend.calls().is_empty());
    assert!(!ws.work.path().join("ses-01").exists());
}

#[tokio::test(start_paused = true)]
async fn lease_is_released_after_the_job() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let lease_dir = ws.config.lease_dir();
    let sessions = ws.config.session_descriptors().unwrap();
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();
    backend.plan(&job.handle("recon"), Outcome::Succeed);

    driver(&ws.config, &backend, &journal)
        .with_leases(lease_dir.clone())
        .run(&ChainSpec::new("base", vec![job]), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!lease_dir.join("base.lock").exists());
}

#[tokio::test(start_paused = true)]
async fn cancelling_stops_supervision_but_not_the_job() {
    let ws = workspace(&["ses-01"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let sessions = ws.config.session_descriptors().unwrap();
    let job = JobPlanner::new(&ws.config).base_job(&sessions).unwrap();
    let handle = job.handle("recon");
    backend.plan(&handle, Outcome::Succeed);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let err = driver(&ws.config, &backend, &journal)
        .run(&ChainSpec::new("base", vec![job]), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Cancelled(_)));
    assert!(backend.is_live(&handle.session_name));
    assert!(handle.scripts_dir().join("IsRunning.lh+rh").exists());
}
