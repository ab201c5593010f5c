//! Base-then-longitudinal planning and fan-out.

use recon_supervisor::models::job::{JobKind, JobState, LaunchDisposition};
use recon_supervisor::orchestrator::pipeline::{plan_pipeline, run_pipeline, JobPlanner};
use recon_supervisor::AppError;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{driver, workspace, FakeBackend, Outcome, RecordingJournal};

#[test]
fn plan_gates_every_session_on_the_base() {
    let ws = workspace(&["ses-01", "ses-02", "ses-03"]);
    let sessions = ws.config.session_descriptors().unwrap();
    let plan = plan_pipeline(&ws.config, &sessions).unwrap();

    assert_eq!(plan.base.name, "base");
    assert!(plan.base.upstream.is_none());
    assert_eq!(plan.base.jobs.len(), 1);
    assert_eq!(plan.base.jobs[0].kind, JobKind::Base);
    assert_eq!(plan.base.jobs[0].input_sessions.len(), 3);

    let names: Vec<&str> = plan.longitudinal.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["ses-01.long.base", "ses-02.long.base", "ses-03.long.base"]
    );
    for chain in &plan.longitudinal {
        let upstream = chain.upstream.as_ref().unwrap();
        assert_eq!(upstream.job_id, "base");
        assert_eq!(upstream.session_name, "recon-base");
        assert_eq!(chain.jobs[0].kind, JobKind::Longitudinal);
        assert_eq!(chain.jobs[0].input_sessions.len(), 1);
    }
}

#[test]
fn handle_for_id_matches_planned_handle() {
    let ws = workspace(&["ses-01"]);
    let planner = JobPlanner::new(&ws.config);
    let sessions = ws.config.session_descriptors().unwrap();
    let planned = planner.longitudinal_job(&sessions[0]).unwrap().handle("recon");

    assert_eq!(planner.handle_for_id("ses-01.long.base").unwrap(), planned);
    assert!(matches!(
        planner.handle_for_id("../etc").unwrap_err(),
        AppError::InvalidIdentifier(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn three_sessions_run_base_then_each_longitudinal_job() {
    let ws = workspace(&["ses-01", "ses-02", "ses-03"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let sessions = ws.config.session_descriptors().unwrap();
    let plan = plan_pipeline(&ws.config, &sessions).unwrap();
    backend.plan(&plan.base.jobs[0].handle("recon"), Outcome::Succeed);
    for chain in &plan.longitudinal {
        backend.plan(&chain.jobs[0].handle("recon"), Outcome::Succeed);
    }

    let report = run_pipeline(
        &driver(&ws.config, &backend, &journal),
        &plan,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(report.is_success());
    assert_eq!(report.siblings.len(), 3);
    assert_eq!(
        journal.states_for("base", "base"),
        vec![JobState::Pending, JobState::Running, JobState::Finished]
    );
    for session in ["ses-01", "ses-02", "ses-03"] {
        let job_id = format!("{session}.long.base");
        assert_eq!(
            journal.states_for(&job_id, &job_id),
            vec![JobState::Pending, JobState::Running, JobState::Finished],
            "{job_id}"
        );
        // The base is only checked by each sibling, already finished.
        assert_eq!(journal.states_for(&job_id, "base"), vec![JobState::Finished]);
    }

    let created: Vec<String> = backend
        .starts()
        .into_iter()
        .map(|call| match call {
            super::test_helpers::Call::Create { name, .. } => name,
            other => panic!("unexpected call {other:?}"),
        })
        .collect();
    assert_eq!(
        created,
        vec![
            "recon-base",
            "recon-ses-01.long.base",
            "recon-ses-02.long.base",
            "recon-ses-03.long.base",
        ]
    );
    for sibling in &report.siblings {
        let chain = sibling.outcome.as_ref().unwrap();
        assert_eq!(chain.outcomes[1].disposition, Some(LaunchDisposition::Created));
    }
}

#[tokio::test(start_paused = true)]
async fn failed_sibling_does_not_stop_the_others() {
    let ws = workspace(&["ses-01", "ses-02", "ses-03"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let sessions = ws.config.session_descriptors().unwrap();
    let plan = plan_pipeline(&ws.config, &sessions).unwrap();
    backend.plan(&plan.base.jobs[0].handle("recon"), Outcome::Succeed);
    for (i, chain) in plan.longitudinal.iter().enumerate() {
        let outcome = if i == 0 { Outcome::Fail } else { Outcome::Succeed };
        backend.plan(&chain.jobs[0].handle("recon"), outcome);
    }

    let report = run_pipeline(
        &driver(&ws.config, &backend, &journal),
        &plan,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(!report.is_success());
    assert_eq!(
        report.first_failure().and_then(AppError::job_id),
        Some("ses-01.long.base")
    );
    assert!(report.siblings[1].outcome.is_ok());
    assert!(report.siblings[2].outcome.is_ok());
}

#[tokio::test(start_paused = true)]
async fn failed_base_launches_no_longitudinal_job() {
    let ws = workspace(&["ses-01", "ses-02"]);
    let backend = FakeBackend::new();
    let journal = RecordingJournal::new();
    let sessions = ws.config.session_descriptors().unwrap();
    let plan = plan_pipeline(&ws.config, &sessions).unwrap();
    backend.plan(&plan.base.jobs[0].handle("recon"), Outcome::Fail);

    let err = run_pipeline(
        &driver(&ws.config, &backend, &journal),
        &plan,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.job_id(), Some("base"));
    assert_eq!(backend.starts().len(), 1);
}
