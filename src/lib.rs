#![forbid(unsafe_code)]

//! Supervision of long-running reconstruction jobs.
//!
//! Inputs are staged idempotently, each job runs in a detached session
//! that outlives this process, completion is read from marker files and
//! log text, and dependent jobs are sequenced so a failure stops
//! everything downstream of it.

pub mod config;
pub mod errors;
pub mod journal;
pub mod models;
pub mod orchestrator;
pub mod staging;

pub use config::GlobalConfig;
pub use errors::{AppError, ChainError, Result};
