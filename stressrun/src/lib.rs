//! Multi-process stress test coordination
//!
//! This crate forks stressor instances, releases them together through a
//! start barrier, supervises them until their quota, deadline or a stop
//! signal ends them, and turns what they left in shared memory into
//! validated per-stressor summaries.

pub mod background;
pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod exit;
pub mod jobs;
pub mod launcher;
pub mod metrics;
pub mod oom;
pub mod output;
pub mod reaper;
pub mod registry;
pub mod runs;
pub mod scheduler;
pub mod shared;
pub mod signals;
pub mod stressor;

pub use crate::{
    config::{Config, RunMode},
    coordinator::{Coordinator, CoordinatorError, RunReport},
    exit::{ExitCode, Verdict},
    registry::Registry,
    runs::{RunList, RunRequest, StressorRun},
    shared::MeanKind,
    stressor::{Args, Stressor, StressorClass, StressorOption},
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in nanoseconds since the UNIX epoch
pub(crate) fn unix_time_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}
