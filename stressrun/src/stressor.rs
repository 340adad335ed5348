//! Contract between the coordinator and stressor workloads
//!
//! A stressor is a stateless description of a workload. The coordinator
//! calls `init()` once before forking the instances of a run, `run()` once
//! inside each forked instance, and `deinit()` once after every instance of
//! the run has been reaped.

use crate::{
    barrier,
    exit::ExitCode,
    shared::{HeapError, InstanceStats, MeanKind, SharedRegion, MAX_METRICS},
    signals,
};
use bitflags::bitflags;
use std::{
    fmt::{self, Display, Formatter},
    sync::atomic::Ordering,
    time::{Duration, Instant},
};
use thiserror::Error;

bitflags! {
    /// Broad categories of system facilities that a stressor exercises
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct StressorClass: u32 {
        /// Compute units
        const CPU = 1 << 0;

        /// CPU caches
        const CPU_CACHE = 1 << 1;

        /// Memory bandwidth and allocation
        const MEMORY = 1 << 2;

        /// Virtual memory subsystem
        const VM = 1 << 3;

        /// Generic OS facilities (syscalls)
        const OS = 1 << 4;

        /// Process scheduler
        const SCHEDULER = 1 << 5;

        /// Signal delivery
        const SIGNAL = 1 << 6;

        /// Interrupt handling
        const INTERRUPT = 1 << 7;

        /// May render the host unusable for a while
        const PATHOLOGICAL = 1 << 8;
    }
}
//
impl Display for StressorClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{}", name.to_lowercase().replace('_', "-"))?;
            first = false;
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Stressor-specific tuning knob, listed by `--list`
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StressorOption {
    /// Option name
    pub name: &'static str,

    /// One-line description
    pub help: &'static str,
}

/// Workload that the coordinator can run in forked instances
pub trait Stressor: Sync {
    /// Unique name, used on the command line and in reports
    fn name(&self) -> &'static str;

    /// Categories of facilities that this stressor exercises
    fn classes(&self) -> StressorClass;

    /// Tuning knobs
    fn options(&self) -> &'static [StressorOption] {
        &[]
    }

    /// Check, before forking, whether this stressor can run on this host
    ///
    /// On failure, the error explains why, and the stressor's runs are
    /// skipped.
    fn supported(&self) -> Result<(), String> {
        Ok(())
    }

    /// Set up state shared by every instance, called in the coordinator
    fn init(&self, _instances: u32) {}

    /// Tear down what `init()` set up, called in the coordinator
    fn deinit(&self) {}

    /// Run the workload, called inside a forked instance
    fn run(&self, args: &mut Args<'_>) -> ExitCode;
}

/// Everything a stressor instance can see and do
pub struct Args<'region> {
    /// Stressor name
    name: &'static str,

    /// Index of this instance among those of the same run
    instance: u32,

    /// Number of instances in this run
    instances: u32,

    /// Bogo-op quota of this instance (0 means unbounded)
    max_ops: u64,

    /// End of the run
    deadline: Instant,

    /// Whether results should be verified
    verify: bool,

    /// Shared memory region
    region: &'region SharedRegion,

    /// Statistics slot of this instance
    slot: usize,

    /// Start barrier generation of this run
    generation: u32,

    /// Barrier outcome, once it was passed
    synced: Option<bool>,

    /// Start of the timed window, if it started
    started: Option<Instant>,
}
//
impl<'region> Args<'region> {
    /// Set up the arguments of an instance
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: &'static str,
        instance: u32,
        instances: u32,
        max_ops: u64,
        deadline: Instant,
        verify: bool,
        region: &'region SharedRegion,
        slot: usize,
        generation: u32,
    ) -> Self {
        Self {
            name,
            instance,
            instances,
            max_ops,
            deadline,
            verify,
            region,
            slot,
            generation,
            synced: None,
            started: None,
        }
    }

    /// Stressor name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Index of this instance among those of the same run
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Number of instances in this run
    pub fn instances(&self) -> u32 {
        self.instances
    }

    /// Bogo-op quota (0 means unbounded)
    pub fn max_ops(&self) -> u64 {
        self.max_ops
    }

    /// End of the run
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the end of the run
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Truth that results should be verified
    pub fn verify(&self) -> bool {
        self.verify
    }

    /// Shared memory region, for warn-once flags, port reservations and
    /// probe pages
    pub fn region(&self) -> &'region SharedRegion {
        self.region
    }

    /// Wait for every sibling instance to be ready, then start timing
    ///
    /// Setup work that should not be measured must happen before this is
    /// called. Returns false if the run was cancelled while waiting, in which
    /// case the workload should return without doing any timed work. Calling
    /// this again after the first time just returns the first outcome.
    ///
    pub fn sync_start(&mut self) -> bool {
        if let Some(synced) = self.synced {
            return synced;
        }
        let released = barrier::wait_for_release(self.region, self.slot, self.generation);
        if released {
            let now = Instant::now();
            self.started = Some(now);
            self.stats()
                .start_time_ns
                .store(crate::unix_time_ns(), Ordering::Relaxed);
        }
        self.synced = Some(released);
        released
    }

    /// Truth that the workload should go on
    ///
    /// The first call passes the start barrier if `sync_start()` was not
    /// called yet. After that, this checks the stop flag, the abort flag, the
    /// bogo-op quota and the deadline.
    ///
    pub fn keep_running(&mut self) -> bool {
        if !self.sync_start() {
            return false;
        }
        signals::keep_running()
            && !self.region.abort_requested()
            && (self.max_ops == 0 || self.bogo_counter() < self.max_ops)
            && Instant::now() < self.deadline
    }

    /// Count one bogo-op
    pub fn bogo_inc(&self) {
        self.bogo_add(1)
    }

    /// Count several bogo-ops
    pub fn bogo_add(&self, ops: u64) {
        self.stats().counter.fetch_add(ops, Ordering::Relaxed);
    }

    /// Bogo-ops counted so far
    pub fn bogo_counter(&self) -> u64 {
        self.stats().counter.load(Ordering::Relaxed)
    }

    /// Record a named metric in slot `index`
    ///
    /// The description is interned in the shared heap so that the
    /// coordinator can read it back after this instance has exited.
    ///
    pub fn metric(
        &self,
        index: usize,
        description: &str,
        value: f64,
        kind: MeanKind,
    ) -> Result<(), MetricError> {
        if index >= MAX_METRICS {
            return Err(MetricError::BadIndex(index));
        }
        let description = self.region.heap().intern(description)?;
        self.stats().metrics[index].set(description.offset(), value, kind);
        Ok(())
    }

    /// Truth that the start barrier was passed
    #[cfg(test)]
    pub(crate) fn synced(&self) -> Option<bool> {
        self.synced
    }

    /// Start of the timed window, if it started
    pub(crate) fn started(&self) -> Option<Instant> {
        self.started
    }

    /// Statistics slot of this instance
    fn stats(&self) -> &'region InstanceStats {
        self.region.stats(self.slot)
    }
}

/// Failure to record a metric
#[derive(Debug, Error)]
pub enum MetricError {
    /// Metric slot index is out of range
    #[error("metric slot {0} is out of range (max {MAX_METRICS})")]
    BadIndex(usize),

    /// Description could not be stored
    #[error("failed to store metric description ({0})")]
    Heap(#[from] HeapError),
}
