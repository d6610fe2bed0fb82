//! The orchestration engine driving jobs from preparation to cleanup.

pub mod config;
mod process;
mod timer;

use std::time::Duration;

pub use process::OrchestrationEngine;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Return right after the initial submission, leaving the jobs to a later `recover`.
    pub disconnect: bool,
    /// Lower bound of the sleep between two iterations of the monitor loop.
    pub min_tick: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            disconnect: false,
            min_tick: config::get_min_tick(),
        }
    }
}

/// Final counts of an engine run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub complete: usize,
    pub submit_error: usize,
    /// Jobs left active because the run was cancelled or disconnected.
    pub incomplete: usize,
}
