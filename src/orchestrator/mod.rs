//! Job orchestration modules.
//!
//! Covers command construction, persistent session launch, completion
//! monitoring, advisory job leases, and dependency chaining.

pub mod chain;
pub mod command;
pub mod lease;
pub mod monitor;
pub mod pipeline;
pub mod runner;
pub mod session;
