//! Persistent session mechanism.
//!
//! Jobs run inside named, detached sessions that outlive the control
//! process. [`SessionBackend`] is the seam; [`ScreenBackend`] drives GNU
//! `screen`. Child processes spawned here are the short-lived `screen`
//! client invocations, never the job itself, so nothing is killed when the
//! control process exits.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::{AppError, Result};

/// Boxed future returned by [`SessionBackend`] methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Detachable execution contexts addressed by name.
pub trait SessionBackend: Send + Sync {
    /// Whether a session called `name` currently exists.
    fn exists<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool>;

    /// Create a detached session called `name` running the shell line
    /// `command`.
    fn create<'a>(&'a self, name: &'a str, command: &'a str) -> BackendFuture<'a, ()>;

    /// Type the shell line `command` into the existing session `name`.
    fn send_command<'a>(&'a self, name: &'a str, command: &'a str) -> BackendFuture<'a, ()>;
}

/// GNU `screen` backend.
#[derive(Debug, Clone)]
pub struct ScreenBackend {
    program: String,
    shell: String,
}

impl ScreenBackend {
    /// Backend invoking `program` (normally `screen`), with jobs run under
    /// `bash -lc`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            shell: "bash".into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(program = self.program, ?args, "invoking session manager");
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| AppError::Io(format!("failed to run {}: {err}", self.program)))
    }

    fn check(output: &std::process::Output, action: &str) -> Result<()> {
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AppError::Io(format!(
                "{action} exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

impl SessionBackend for ScreenBackend {
    fn exists<'a>(&'a self, name: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            // `screen -ls` exits non-zero in several versions even when
            // sessions are listed; only the listing is trusted.
            let output = self.run(&["-ls", name]).await?;
            let listing = String::from_utf8_lossy(&output.stdout);
            Ok(listing_contains(&listing, name))
        })
    }

    fn create<'a>(&'a self, name: &'a str, command: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let output = self
                .run(&["-dmS", name, &self.shell, "-lc", command])
                .await?;
            Self::check(&output, "screen -dmS")?;
            info!(session = name, "detached session created");
            Ok(())
        })
    }

    fn send_command<'a>(&'a self, name: &'a str, command: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let line = format!("{command}\n");
            let output = self.run(&["-S", name, "-X", "stuff", &line]).await?;
            Self::check(&output, "screen -X stuff")?;
            info!(session = name, "command sent to existing session");
            Ok(())
        })
    }
}

/// Whether a `screen -ls` listing contains a session named exactly `name`.
///
/// Listing lines look like `\t12345.name\t(Detached)`.
#[must_use]
pub fn listing_contains(listing: &str, name: &str) -> bool {
    listing.lines().any(|line| {
        line.split_whitespace()
            .next()
            .and_then(|token| token.split_once('.'))
            .is_some_and(|(pid, session)| {
                !pid.is_empty() && pid.chars().all(|c| c.is_ascii_digit()) && session == name
            })
    })
}
