//! Application-level orchestration utilities.
//!
//! This module owns run lifecycle control (start/stop/restart) and post-run processing
//! such as the JSON export. CLI and HTTP layers call into this module to keep
//! responsibilities separated.

mod controller;
mod post_process;

pub use controller::{AuditController, RunHandle};
