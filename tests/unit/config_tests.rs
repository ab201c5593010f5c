//! Unit tests for configuration parsing, environment overlay, and
//! validation.

use std::path::PathBuf;
use std::time::Duration;

use recon_supervisor::config::{split_session_list, GlobalConfig, ENV_SESSIONS, ENV_WORK_ROOT};
use recon_supervisor::AppError;
use serial_test::serial;

fn sample_toml(work: &str, source: &str) -> String {
    format!(
        r#"
work_root = '{work}'
source_root = '{source}'
base_name = "sub-01_base"
sessions = ["ses-01", "ses-02", "ses-03"]
session_pattern = "ses-*"

[engine]
program = "recon-all"
extra_args = ["-all", "-parallel"]
log_name = "recon-all.log"

[session]
program = "screen"
name_prefix = "fs"

[monitor]
pending_interval_seconds = 20
running_interval_seconds = 600
timeout_seconds = 86400

[markers]
running_prefix = "IsRunning"
success_line = "finished without error"
failure_line = "exited with ERRORS"
"#
    )
}

#[test]
fn parses_valid_config() {
    let config = GlobalConfig::from_toml_str(&sample_toml("/data/work", "/data/raw"))
        .expect("config parses");

    assert_eq!(config.work_root, PathBuf::from("/data/work"));
    assert_eq!(config.base_name, "sub-01_base");
    assert_eq!(config.sessions.len(), 3);
    assert_eq!(config.engine.extra_args, vec!["-all", "-parallel"]);
    assert_eq!(config.session.name_prefix, "fs");

    let policy = config.monitor.wait_policy();
    assert_eq!(policy.pending_interval, Duration::from_secs(20));
    assert_eq!(policy.running_interval, Duration::from_secs(600));
    assert_eq!(policy.timeout, Some(Duration::from_secs(86400)));
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str(
        r#"
work_root = '/data/work'
source_root = '/data/raw'
"#,
    )
    .expect("config parses");

    assert_eq!(config.base_name, "base");
    assert!(config.sessions.is_empty());
    assert_eq!(config.session_pattern, "ses-*");
    assert_eq!(config.engine.program, "recon-all");
    assert_eq!(config.engine.log_name, "recon-all.log");
    assert_eq!(config.session.program, "screen");
    assert_eq!(config.markers.running_prefix, "IsRunning");
    assert_eq!(config.monitor.wait_policy().timeout, None);
}

#[test]
fn missing_work_root_is_rejected() {
    let err = GlobalConfig::from_toml_str("source_root = '/data/raw'\n").unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("work_root")));
}

#[test]
fn zero_interval_is_rejected() {
    let raw = r#"
work_root = '/data/work'
source_root = '/data/raw'

[monitor]
pending_interval_seconds = 0
"#;
    let err = GlobalConfig::from_toml_str(raw).unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn unsafe_base_name_is_rejected() {
    let raw = r#"
work_root = '/data/work'
source_root = '/data/raw'
base_name = "base; rm -rf /"
"#;
    let err = GlobalConfig::from_toml_str(raw).unwrap_err();
    assert!(matches!(err, AppError::Config(ref msg) if msg.contains("base_name")));
}

#[test]
fn invalid_toml_maps_to_config_error() {
    let err = GlobalConfig::from_toml_str("work_root = [").unwrap_err();
    assert!(err.to_string().starts_with("config: invalid config"));
}

#[test]
fn env_overrides_replace_file_values() {
    let mut config = GlobalConfig::from_toml_str(&sample_toml("/data/work", "/data/raw"))
        .expect("config parses");

    config.apply_env_overrides(vec![
        (ENV_WORK_ROOT.to_owned(), "/scratch/work".to_owned()),
        (ENV_SESSIONS.to_owned(), "ses-a, ses-b,,".to_owned()),
        ("UNRELATED".to_owned(), "x".to_owned()),
    ]);

    assert_eq!(config.work_root, PathBuf::from("/scratch/work"));
    assert_eq!(config.sessions, vec!["ses-a", "ses-b"]);
    assert_eq!(config.source_root, PathBuf::from("/data/raw"));
}

#[test]
#[serial]
fn layered_load_reads_process_environment() {
    std::env::set_var("RECON_WORK_ROOT", "/env/work");
    std::env::set_var("RECON_SOURCE_ROOT", "/env/raw");
    std::env::set_var("RECON_BASE_NAME", "envbase");

    let config = GlobalConfig::load_layered(None).expect("layered load");

    std::env::remove_var("RECON_WORK_ROOT");
    std::env::remove_var("RECON_SOURCE_ROOT");
    std::env::remove_var("RECON_BASE_NAME");

    assert_eq!(config.work_root, PathBuf::from("/env/work"));
    assert_eq!(config.source_root, PathBuf::from("/env/raw"));
    assert_eq!(config.base_name, "envbase");
    config.validate().expect("valid after overlay");
}

#[test]
#[serial]
fn layered_load_without_roots_fails_validation() {
    std::env::remove_var("RECON_WORK_ROOT");
    std::env::remove_var("RECON_SOURCE_ROOT");

    let config = GlobalConfig::load_layered(None).expect("layered load");
    assert!(config.validate().is_err());
}

#[test]
fn explicit_sessions_produce_descriptors_under_roots() {
    let config = GlobalConfig::from_toml_str(&sample_toml("/data/work", "/data/raw"))
        .expect("config parses");

    let descriptors = config.session_descriptors().expect("descriptors");
    assert_eq!(descriptors.len(), 3);
    assert_eq!(descriptors[0].subject_id, "sub-01_base");
    assert_eq!(descriptors[0].source_path, PathBuf::from("/data/raw/ses-01"));
    assert_eq!(descriptors[2].dest_path, PathBuf::from("/data/work/ses-03"));
}

#[test]
fn sessions_are_discovered_when_not_listed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let raw = temp.path().join("raw");
    for name in ["ses-02", "ses-01", "anat"] {
        std::fs::create_dir_all(raw.join(name)).expect("mkdir");
    }
    let toml = format!(
        "work_root = '{}'\nsource_root = '{}'\n",
        temp.path().join("work").display(),
        raw.display()
    );
    let config = GlobalConfig::from_toml_str(&toml).expect("config parses");

    let ids = config.session_ids().expect("discovery");
    assert_eq!(ids, vec!["ses-01", "ses-02"]);
}

#[test]
fn state_dirs_live_under_work_root() {
    let config = GlobalConfig::from_toml_str(&sample_toml("/data/work", "/data/raw"))
        .expect("config parses");
    assert!(config.journal_dir().starts_with("/data/work"));
    assert!(config.lease_dir().starts_with("/data/work"));
    assert_ne!(config.journal_dir(), config.lease_dir());
}

#[test]
fn session_list_splitting_trims_and_drops_blanks() {
    assert_eq!(split_session_list(" ses-01 ,ses-02,"), vec!["ses-01", "ses-02"]);
    assert!(split_session_list("").is_empty());
}
