//! Domain model module declarations.

pub mod chain;
pub mod job;
pub mod session;
