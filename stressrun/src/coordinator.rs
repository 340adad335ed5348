//! Top-level orchestration of an invocation
//!
//! The coordinator owns everything that lives for the whole invocation: the
//! signal handlers, the shared region, background processes and process
//! accounting. It executes the groups planned by the scheduler one after the
//! other, each group going through init, launch, barrier, reaping, deinit
//! and summary.

use crate::{
    background::{BackgroundProcess, BackgroundTask},
    barrier::{BarrierOutcome, SyncPidList},
    config::{Config, RunMode},
    launcher::{LaunchError, Launcher},
    metrics::{self, InstanceRecord, StressorSummary},
    reaper::{InstanceCounts, Reaper},
    runs::RunList,
    scheduler::{self, Group},
    shared::{RegionError, RegionOptions, SharedRegion},
    signals::{self, Deadline, SignalError},
};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Orchestrates runs according to a configuration
pub struct Coordinator<'cfg> {
    /// Configuration
    config: &'cfg Config,

    /// Helpers to be run in the background
    background: Vec<BackgroundTask>,
}

/// Execution record of one group of runs
#[derive(Clone, Debug, PartialEq)]
pub struct GroupRecord {
    /// Indices of the runs in the run list
    pub members: Group,

    /// When the group started
    pub started: Instant,

    /// When every instance of the group had been reaped
    pub finished: Instant,

    /// How the start barrier went
    pub barrier: BarrierOutcome,
}

/// Result of an invocation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    /// Truth that no run failed or produced untrustworthy numbers
    pub success: bool,

    /// Truth that the invocation ended early (user interrupt or abort)
    pub interrupted: bool,

    /// One summary per stressor and group, in execution order
    pub summaries: Vec<StressorSummary>,

    /// One record per instance, in reaping order within each group
    pub instances: Vec<InstanceRecord>,

    /// Executed groups, in execution order
    pub groups: Vec<GroupRecord>,

    /// Process accounting
    pub counts: InstanceCounts,
}

impl<'cfg> Coordinator<'cfg> {
    /// Set up a coordinator
    pub fn new(config: &'cfg Config) -> Self {
        Self {
            config,
            background: Vec::new(),
        }
    }

    /// Run a helper in the background during the invocation
    pub fn with_background(mut self, task: BackgroundTask) -> Self {
        self.background.push(task);
        self
    }

    /// Execute every active run of the list
    pub fn run(&self, runs: &mut RunList) -> Result<RunReport, CoordinatorError> {
        runs.exclude(&self.config.exclude);
        runs.check_support();
        let groups = scheduler::plan(runs, self.config.mode, self.config.permute_cap);
        if groups.is_empty() {
            log::warn!("No stressor left to run");
            return Ok(RunReport {
                success: true,
                ..Default::default()
            });
        }
        let slots = groups
            .iter()
            .map(|group| {
                group
                    .iter()
                    .filter_map(|&index| runs.get(index))
                    .map(|run| run.instances() as usize)
                    .sum::<usize>()
            })
            .max()
            .unwrap_or(0);

        signals::reset();
        let handlers = signals::install_coordinator_handlers()?;
        let result = self.run_groups(runs, &groups, slots);
        Deadline::cancel();
        handlers.restore();
        result
    }

    /// Execute planned groups with shared infrastructure set up
    fn run_groups(
        &self,
        runs: &mut RunList,
        groups: &[Group],
        slots: usize,
    ) -> Result<RunReport, CoordinatorError> {
        let config = self.config;
        let region = SharedRegion::with_options(
            slots,
            RegionOptions {
                heap_size: config.heap_size,
                ..Default::default()
            },
        )?;
        let mut background = Vec::new();
        for task in &self.background {
            match BackgroundProcess::spawn(task) {
                Ok(process) => background.push(process),
                Err(e) => log::warn!("Failed to start background {} ({e})", task.name),
            }
        }

        let mut report = RunReport::default();
        let mut reaper = Reaper::new(&region, config);
        let timeout = config.run_timeout();
        for (index, group) in groups.iter().enumerate() {
            if signals::counts().force_requests > 0 || region.abort_requested() {
                log::info!(
                    "Stopping early, {} run(s) will not be executed",
                    groups.len() - index
                );
                report.interrupted = true;
                break;
            }
            signals::rearm();
            if config.mode == RunMode::Sequential && groups.len() > 1 {
                let left = eta(timeout, groups.len() - index);
                let name = group
                    .first()
                    .and_then(|&i| runs.get(i))
                    .map_or("?", |run| run.name());
                log::info!(
                    "Running {name} ({}/{}), at most {left:?} left",
                    index + 1,
                    groups.len()
                );
            }

            let saved = (config.mode == RunMode::Permute).then(|| runs.isolate(group));
            self.run_group(&region, &mut reaper, runs, index, group, timeout, &mut report);
            if let Some(saved) = saved {
                runs.restore(saved);
            }
        }
        if signals::counts().force_requests > 0 {
            report.interrupted = true;
        }

        for mut process in background {
            process.stop(crate::background::DEFAULT_GRACE);
        }
        if region.heap().out_of_memory() {
            log::warn!(
                "The shared heap ran out of memory, some metric descriptions were lost"
            );
        }
        report.counts = reaper.counts();
        report.success = !report.summaries.iter().any(StressorSummary::spoils_run);
        log::info!(
            "{} run: {} instance(s) started, {} reaped, {} failed",
            if report.success { "Successful" } else { "Unsuccessful" },
            report.counts.started,
            report.counts.reaped,
            report.counts.failed
        );
        Ok(report)
    }

    /// Execute one group of runs
    #[allow(clippy::too_many_arguments)]
    fn run_group(
        &self,
        region: &SharedRegion,
        reaper: &mut Reaper<'_>,
        runs: &RunList,
        group_index: usize,
        group: &Group,
        timeout: Duration,
        report: &mut RunReport,
    ) {
        let config = self.config;
        let members = group
            .iter()
            .filter_map(|&index| runs.get(index).map(|run| (index, *run)))
            .collect::<Vec<_>>();
        debug_assert!(members.iter().all(|(_, run)| run.is_active()));

        let started = Instant::now();
        for (_, run) in &members {
            run.stressor().init(run.instances());
        }

        // Launch every instance of the group
        reaper.start_group();
        Deadline::arm(timeout);
        let launcher = Launcher::new(region, config, started + timeout);
        let mut sync = SyncPidList::new(region);
        let mut launch_failures = Vec::new();
        let mut slot = 0;
        for (index, run) in &members {
            match launcher.launch_run(*index, run, slot, &mut sync, reaper.counts_mut()) {
                Ok(()) => {}
                Err(LaunchError::Stopped) => {
                    log::info!("Stop requested while launching {}", run.name());
                    break;
                }
                Err(e) => {
                    log::error!("{e}, giving up on the remaining instances of {}", run.name());
                    launch_failures.push(*index);
                }
            }
            slot += run.instances() as usize;
        }

        // Release the barrier and wait for everyone
        let barrier = if sync.is_empty() {
            BarrierOutcome::Released
        } else {
            sync.release(region, config.barrier_timeout)
        };
        let outcomes = reaper.wait_all(&sync);
        Deadline::cancel();
        let finished = Instant::now();
        for (_, run) in &members {
            run.stressor().deinit();
        }

        // Summarize
        let elapsed = finished - started;
        for (index, run) in &members {
            let run_outcomes = outcomes
                .iter()
                .filter(|outcome| outcome.instance.run == *index)
                .copied()
                .collect::<Vec<_>>();
            let (mut summary, records) =
                metrics::summarize(region, run.name(), group_index, &run_outcomes, elapsed);
            if launch_failures.contains(index) {
                summary.failed += 1;
            }
            log::info!(
                "{}: {} passed, {} failed, {} skipped, {} bad metrics, {} bogo-ops in {:?}",
                summary.stressor,
                summary.passed,
                summary.failed,
                summary.skipped,
                summary.bad_metrics,
                summary.bogo_ops,
                summary.real_time
            );
            report.summaries.push(summary);
            report.instances.extend(records);
        }
        report.groups.push(GroupRecord {
            members: group.clone(),
            started,
            finished,
            barrier,
        });
    }
}

/// Upper bound on the time needed to run some groups
fn eta(timeout: Duration, groups: usize) -> Duration {
    timeout.saturating_mul(u32::try_from(groups).unwrap_or(u32::MAX))
}

/// Failure of the whole invocation
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The shared region could not be set up
    #[error("failed to set up shared accounting ({0})")]
    Region(#[from] RegionError),

    /// Signal handlers could not be installed
    #[error("failed to set up signal handling ({0})")]
    Signal(#[from] SignalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_saturates() {
        assert_eq!(eta(Duration::from_secs(60), 3), Duration::from_secs(180));
        assert_eq!(eta(Duration::from_secs(60), 0), Duration::ZERO);
        assert_eq!(eta(Duration::MAX, 2), Duration::MAX);
        assert_eq!(eta(Duration::from_secs(u64::MAX / 2), usize::MAX), Duration::MAX);
    }
}
