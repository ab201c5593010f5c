//! Global configuration parsing, environment overlay, and validation.
//!
//! Values are layered: TOML file, then `RECON_*` environment variables,
//! then command-line flags applied by the binary. Every component receives
//! the resolved value at construction; nothing reads process state later.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::models::session::{discover_sessions, SessionDescriptor};
use crate::orchestrator::command::validate_identifier;
use crate::orchestrator::monitor::WaitPolicy;
use crate::{AppError, Result};

/// Environment variable naming the working-tree root.
pub const ENV_WORK_ROOT: &str = "RECON_WORK_ROOT";
/// Environment variable naming the source-data root.
pub const ENV_SOURCE_ROOT: &str = "RECON_SOURCE_ROOT";
/// Environment variable naming the base job.
pub const ENV_BASE_NAME: &str = "RECON_BASE_NAME";
/// Environment variable holding a comma-separated session list.
pub const ENV_SESSIONS: &str = "RECON_SESSIONS";

/// External reconstruction engine invocation settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct EngineConfig {
    /// Engine executable.
    pub program: String,
    /// Arguments appended after the job-specific ones.
    pub extra_args: Vec<String>,
    /// Log file name under `<work_dir>/scripts`.
    pub log_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "recon-all".into(),
            extra_args: vec!["-all".into()],
            log_name: "recon-all.log".into(),
        }
    }
}

/// Persistent session mechanism settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    /// Session manager executable (GNU screen).
    pub program: String,
    /// Prefix for session names; the job id is appended.
    pub name_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: "screen".into(),
            name_prefix: "recon".into(),
        }
    }
}

/// Polling intervals (seconds) for the completion monitor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct MonitorConfig {
    /// Interval while the job has not yet created its structure.
    pub pending_interval_seconds: u64,
    /// Interval while a running marker is present.
    pub running_interval_seconds: u64,
    /// Give up waiting after this long; 0 means wait indefinitely.
    pub timeout_seconds: u64,
    /// How long a relaunched job may show its previous outcome.
    pub restart_grace_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pending_interval_seconds: 30,
            running_interval_seconds: 300,
            timeout_seconds: 0,
            restart_grace_seconds: 120,
        }
    }
}

impl MonitorConfig {
    /// Backoff policy derived from these settings.
    #[must_use]
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            pending_interval: Duration::from_secs(self.pending_interval_seconds),
            running_interval: Duration::from_secs(self.running_interval_seconds),
            timeout: (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds)),
            restart_grace: Duration::from_secs(self.restart_grace_seconds),
        }
    }
}

/// Side-channel artifacts the engine leaves behind.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct MarkerConfig {
    /// File-name prefix of running markers under `<work_dir>/scripts`.
    pub running_prefix: String,
    /// Literal text of the success terminal line.
    pub success_line: String,
    /// Literal text of the failure terminal line.
    pub failure_line: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            running_prefix: "IsRunning".into(),
            success_line: "finished without error".into(),
            failure_line: "exited with ERRORS".into(),
        }
    }
}

fn default_base_name() -> String {
    "base".into()
}

fn default_session_pattern() -> String {
    "ses-*".into()
}

/// Global configuration parsed from `recon.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Working tree: staged sessions and engine output live here.
    #[serde(default)]
    pub work_root: PathBuf,
    /// Source tree holding one directory per session.
    #[serde(default)]
    pub source_root: PathBuf,
    /// Base job name; also the subject identifier for staged sessions.
    #[serde(default = "default_base_name")]
    pub base_name: String,
    /// Explicit session list; empty means discover from `source_root`.
    #[serde(default)]
    pub sessions: Vec<String>,
    /// Glob used for session discovery.
    #[serde(default = "default_session_pattern")]
    pub session_pattern: String,
    /// Engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Session mechanism settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Monitor polling settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Completion artifacts.
    #[serde(default)]
    pub markers: MarkerConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::new(),
            source_root: PathBuf::new(),
            base_name: default_base_name(),
            sessions: Vec::new(),
            session_pattern: default_session_pattern(),
            engine: EngineConfig::default(),
            session: SessionConfig::default(),
            monitor: MonitorConfig::default(),
            markers: MarkerConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build an unvalidated configuration from an optional file overlaid
    /// with the process environment. Call [`validate`](Self::validate)
    /// after applying any further overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or parsed.
    pub fn load_layered(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(env::vars());
        Ok(config)
    }

    /// Overlay recognized `RECON_*` variables from `vars`.
    pub fn apply_env_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_WORK_ROOT => self.work_root = PathBuf::from(value),
                ENV_SOURCE_ROOT => self.source_root = PathBuf::from(value),
                ENV_BASE_NAME => self.base_name = value,
                ENV_SESSIONS => self.sessions = split_session_list(&value),
                _ => continue,
            }
            debug!(key, "configuration overridden from environment");
        }
    }

    /// Check required values and identifier safety.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.work_root.as_os_str().is_empty() {
            return Err(AppError::Config(format!(
                "work_root must be set (or {ENV_WORK_ROOT})"
            )));
        }
        if self.source_root.as_os_str().is_empty() {
            return Err(AppError::Config(format!(
                "source_root must be set (or {ENV_SOURCE_ROOT})"
            )));
        }
        if self.work_root == self.source_root {
            return Err(AppError::Config(
                "work_root and source_root must differ".into(),
            ));
        }

        validate_identifier(&self.base_name)
            .map_err(|err| AppError::Config(format!("base_name: {err}")))?;
        for session in &self.sessions {
            validate_identifier(session)
                .map_err(|err| AppError::Config(format!("sessions: {err}")))?;
        }

        if self.engine.program.trim().is_empty() {
            return Err(AppError::Config("engine.program must not be empty".into()));
        }
        if self.engine.log_name.trim().is_empty() || self.engine.log_name.contains('/') {
            return Err(AppError::Config(
                "engine.log_name must be a plain file name".into(),
            ));
        }
        if self.session.program.trim().is_empty() {
            return Err(AppError::Config("session.program must not be empty".into()));
        }
        validate_identifier(&self.session.name_prefix)
            .map_err(|err| AppError::Config(format!("session.name_prefix: {err}")))?;

        if self.monitor.pending_interval_seconds == 0 || self.monitor.running_interval_seconds == 0
        {
            return Err(AppError::Config(
                "monitor intervals must be greater than zero".into(),
            ));
        }

        let markers = &self.markers;
        if markers.running_prefix.is_empty()
            || markers.success_line.is_empty()
            || markers.failure_line.is_empty()
        {
            return Err(AppError::Config("marker strings must not be empty".into()));
        }

        Ok(())
    }

    /// Directory for the JSONL run journal.
    #[must_use]
    pub fn journal_dir(&self) -> PathBuf {
        self.state_dir().join("journal")
    }

    /// Directory for per-job advisory lease files.
    #[must_use]
    pub fn lease_dir(&self) -> PathBuf {
        self.state_dir().join("leases")
    }

    fn state_dir(&self) -> PathBuf {
        self.work_root.join(".recon-supervisor")
    }

    /// Session identifiers: the explicit list, or those discovered under
    /// `source_root`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if discovery finds nothing.
    pub fn session_ids(&self) -> Result<Vec<String>> {
        if self.sessions.is_empty() {
            let found = discover_sessions(&self.source_root, &self.session_pattern)?;
            for session in &found {
                validate_identifier(session)?;
            }
            Ok(found)
        } else {
            Ok(self.sessions.clone())
        }
    }

    /// Descriptors for every configured session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if discovery finds nothing, or
    /// `AppError::InvalidIdentifier` for an unusable discovered name.
    pub fn session_descriptors(&self) -> Result<Vec<SessionDescriptor>> {
        Ok(self
            .session_ids()?
            .iter()
            .map(|id| {
                SessionDescriptor::under_roots(
                    &self.base_name,
                    id,
                    &self.source_root,
                    &self.work_root,
                )
            })
            .collect())
    }
}

/// Split a comma-separated session list, dropping blanks.
#[must_use]
pub fn split_session_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
