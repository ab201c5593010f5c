//! Per-job advisory lease.
//!
//! Independently started control processes share only the working tree.
//! Before launching a job, a control process takes `<lease_dir>/<job_id>.lock`
//! with an exclusive create. A lease whose owning process is gone is stale
//! and may be taken over; a live one is reported to the caller.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{AppError, Result};

/// Age after which an unreadable lease file is treated as abandoned.
const UNREADABLE_GRACE: Duration = Duration::from_secs(60);

/// Contents of a lease file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LeaseRecord {
    /// Random token identifying this acquisition.
    pub token: String,
    /// Job the lease covers.
    pub job_id: String,
    /// Process id of the holder.
    pub pid: u32,
    /// When the lease was taken.
    pub acquired_at: DateTime<Utc>,
}

/// A held lease; released when dropped.
#[derive(Debug)]
pub struct JobLease {
    path: PathBuf,
    record: LeaseRecord,
    released: bool,
}

impl JobLease {
    /// Take the lease for `job_id` under `lease_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Lease` if a live process holds it, or
    /// `AppError::Io` if the lease file cannot be written.
    pub fn acquire(lease_dir: &Path, job_id: &str) -> Result<Self> {
        fs::create_dir_all(lease_dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create lease directory {}: {err}",
                lease_dir.display()
            ))
        })?;
        let path = lease_dir.join(format!("{job_id}.lock"));

        // One retry: the second attempt follows removal of a stale lease.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let record = LeaseRecord {
                        token: Uuid::new_v4().to_string(),
                        job_id: job_id.to_owned(),
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let body = serde_json::to_string(&record)
                        .map_err(|err| AppError::Io(format!("failed to encode lease: {err}")))?;
                    file.write_all(body.as_bytes())
                        .and_then(|()| file.sync_all())
                        .map_err(|err| {
                            AppError::Io(format!("failed to write lease {}: {err}", path.display()))
                        })?;
                    info!(job_id, token = record.token, "job lease acquired");
                    return Ok(Self {
                        path,
                        record,
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    match inspect_existing(&path) {
                        Holder::Live(holder) => {
                            return Err(AppError::Lease {
                                job_id: job_id.to_owned(),
                                holder,
                                log_path: None,
                            });
                        }
                        Holder::Stale(reason) => {
                            warn!(job_id, reason, "taking over stale job lease");
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                                Err(err) => {
                                    return Err(AppError::Io(format!(
                                        "failed to remove stale lease {}: {err}",
                                        path.display()
                                    )));
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    return Err(AppError::Io(format!(
                        "failed to create lease {}: {err}",
                        path.display()
                    )));
                }
            }
        }

        Err(AppError::Lease {
            job_id: job_id.to_owned(),
            holder: "a process that raced for the lease".into(),
            log_path: None,
        })
    }

    /// The record written for this lease.
    #[must_use]
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    /// Path of the lease file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly; equivalent to dropping.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // Only remove the file if it is still ours.
        let still_ours = fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str::<LeaseRecord>(&raw).ok())
            .is_some_and(|rec| rec.token == self.record.token);
        if !still_ours {
            warn!(job_id = self.record.job_id, "lease was replaced; leaving it alone");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(job_id = self.record.job_id, "job lease released"),
            Err(err) => warn!(job_id = self.record.job_id, %err, "failed to release job lease"),
        }
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

enum Holder {
    Live(String),
    Stale(String),
}

fn inspect_existing(path: &Path) -> Holder {
    let parsed = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<LeaseRecord>(&raw).ok());

    match parsed {
        Some(record) if process_alive(record.pid) => Holder::Live(format!(
            "pid {} since {}",
            record.pid,
            record.acquired_at.to_rfc3339()
        )),
        Some(record) => Holder::Stale(format!("holder pid {} is gone", record.pid)),
        None => {
            let age = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            match age {
                Some(age) if age >= UNREADABLE_GRACE => {
                    Holder::Stale("unreadable lease file".into())
                }
                _ => Holder::Live("a process still writing its lease".into()),
            }
        }
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether a process with `pid` exists. Without a portable probe, every
/// recorded holder is assumed alive.
#[cfg(not(unix))]
#[must_use]
pub fn process_alive(_pid: u32) -> bool {
    true
}
