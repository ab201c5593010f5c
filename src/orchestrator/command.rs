//! Structured construction of engine command lines.
//!
//! Identifiers are validated before they reach a command line, and every
//! token is shell-quoted when the line is rendered for the session
//! mechanism, so a malformed subject or session name can never change the
//! shape of the command.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::{AppError, Result};

/// Accepted shape for base, session, and session-prefix identifiers.
pub const IDENTIFIER_PATTERN: &str = r"^[A-Za-z0-9][A-Za-z0-9._-]*$";

const MAX_IDENTIFIER_LEN: usize = 128;

fn identifier_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(IDENTIFIER_PATTERN).ok()).as_ref()
}

/// Validate an identifier destined for a command line or path component.
///
/// # Errors
///
/// Returns `AppError::InvalidIdentifier` when `id` is empty, too long,
/// contains characters outside [`IDENTIFIER_PATTERN`], or is a `.`/`..`
/// path component.
pub fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(AppError::InvalidIdentifier("identifier is empty".into()));
    }
    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(AppError::InvalidIdentifier(format!(
            "identifier longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    let pattern = identifier_regex()
        .ok_or_else(|| AppError::InvalidIdentifier("identifier pattern unavailable".into()))?;
    if !pattern.is_match(id) || id.contains("..") {
        return Err(AppError::InvalidIdentifier(format!("{id:?}")));
    }
    Ok(())
}

/// One validated engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Build base `base_id` from `sessions`.
    Base {
        /// Base identifier.
        base_id: String,
        /// Time points fused into the base, in order.
        sessions: Vec<String>,
    },
    /// Run session `session` against base `base_id`.
    Longitudinal {
        /// Time point processed.
        session: String,
        /// Base the time point is registered against.
        base_id: String,
    },
}

impl EngineCommand {
    /// Validated base build.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidIdentifier` for any bad identifier or an
    /// empty session list.
    pub fn base(base_id: &str, sessions: &[String]) -> Result<Self> {
        validate_identifier(base_id)?;
        if sessions.is_empty() {
            return Err(AppError::InvalidIdentifier(format!(
                "base {base_id} needs at least one session"
            )));
        }
        for session in sessions {
            validate_identifier(session)?;
        }
        Ok(Self::Base {
            base_id: base_id.to_owned(),
            sessions: sessions.to_vec(),
        })
    }

    /// Validated longitudinal run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidIdentifier` for any bad identifier.
    pub fn longitudinal(session: &str, base_id: &str) -> Result<Self> {
        validate_identifier(session)?;
        validate_identifier(base_id)?;
        Ok(Self::Longitudinal {
            session: session.to_owned(),
            base_id: base_id.to_owned(),
        })
    }

    /// Output directory name the engine uses for this invocation.
    #[must_use]
    pub fn job_id(&self) -> String {
        match self {
            Self::Base { base_id, .. } => base_id.clone(),
            Self::Longitudinal { session, base_id } => format!("{session}.long.{base_id}"),
        }
    }

    /// Engine arguments, followed by `extra`.
    #[must_use]
    pub fn args(&self, extra: &[String]) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Self::Base { base_id, sessions } => {
                args.push("-base".to_owned());
                args.push(base_id.clone());
                for session in sessions {
                    args.push("-tp".to_owned());
                    args.push(session.clone());
                }
            }
            Self::Longitudinal { session, base_id } => {
                args.push("-long".to_owned());
                args.push(session.clone());
                args.push(base_id.clone());
            }
        }
        args.extend(extra.iter().cloned());
        args
    }

    /// Complete command line for `program`, run with the engine's subject
    /// directory set to `work_root`.
    #[must_use]
    pub fn command_line(&self, program: &str, extra: &[String], work_root: &Path) -> CommandLine {
        CommandLine {
            program: program.to_owned(),
            args: self.args(extra),
            env: vec![(
                "SUBJECTS_DIR".to_owned(),
                work_root.to_string_lossy().into_owned(),
            )],
        }
    }
}

/// A program, its arguments, and environment assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Variables set for the invocation only.
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    /// Render as a single shell line with every token quoted.
    #[must_use]
    pub fn to_shell(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + self.env.len() + 2);
        if !self.env.is_empty() {
            parts.push("env".to_owned());
            for (key, value) in &self.env {
                parts.push(format!("{key}={}", shell_quote(value)));
            }
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

/// Quote `token` for a POSIX shell; tokens made only of safe characters
/// are returned unchanged.
#[must_use]
pub fn shell_quote(token: &str) -> String {
    let safe = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.,/:=+@%".contains(c));
    if safe {
        token.to_owned()
    } else {
        format!("'{}'", token.replace('\'', r"'\''"))
    }
}
