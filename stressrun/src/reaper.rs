//! Coordinator wait loop
//!
//! The reaper polls every tracked instance with `waitpid(WNOHANG)`, turns
//! each termination into a verdict, and reacts to stop requests (deadline,
//! user interrupts, abort-on-failure) by broadcasting a stop signal to the
//! instances that are still running. Once a group was asked to stop, a
//! reminder alarm rings every second until its instances are gone, and
//! instances that keep ignoring it are eventually SIGKILLed.

use crate::{
    barrier::{SyncPid, SyncPidList},
    config::Config,
    exit::{ExitCode, Verdict},
    oom,
    runs,
    shared::SharedRegion,
    signals::{self, Deadline, Escalation, SignalCounts, REMINDER_INTERVAL},
};
use nix::{
    errno::Errno,
    sched::{sched_setaffinity, CpuSet},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

/// Process accounting of the coordinator
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InstanceCounts {
    /// Instances forked
    pub started: u64,

    /// Instances known to be gone
    pub exited: u64,

    /// Instances whose slot was reaped
    pub reaped: u64,

    /// Instances that failed
    pub failed: u64,

    /// Instances that were sent a stop signal
    pub alarmed: u64,
}
//
impl InstanceCounts {
    /// Instances that are still running
    pub fn running(&self) -> u64 {
        self.started - self.exited
    }
}

/// How an instance terminated
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// Normal exit with some exit code
    Exited(i32),

    /// Killed by a signal
    Signaled {
        /// Signal that killed the instance
        signal: Signal,

        /// Whether the coordinator had sent a stop signal to the instance
        stopped_by_us: bool,
    },

    /// Killed by the OOM killer, according to heuristics
    OutOfMemory,

    /// The process vanished without its termination being observed
    Lost,
}

/// Final state of one instance
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InstanceOutcome {
    /// Tracking data of the instance
    pub instance: SyncPid,

    /// How it terminated
    pub termination: Termination,

    /// What that means for the run summary
    pub verdict: Verdict,
}

/// Turn a termination into a verdict
pub fn verdict(termination: Termination, stop_signal: Signal, oom_avoid: bool) -> Verdict {
    match termination {
        Termination::Exited(code) => Verdict::from_exit(code),
        Termination::Signaled { signal, .. } if signal == Signal::SIGALRM => Verdict::Passed,
        Termination::Signaled {
            signal,
            stopped_by_us: true,
        } if signal == stop_signal || signal == Signal::SIGKILL => Verdict::Passed,
        Termination::Signaled { .. } => Verdict::Failed,
        Termination::OutOfMemory if oom_avoid => Verdict::Failed,
        Termination::OutOfMemory => Verdict::Skipped,
        Termination::Lost => Verdict::Failed,
    }
}

/// Coordinator-side wait loop and stop broadcaster
pub struct Reaper<'a> {
    /// Shared memory region
    region: &'a SharedRegion,

    /// Coordinator configuration
    config: &'a Config,

    /// Choice of the stop signal
    escalation: Escalation,

    /// Signals already acted upon
    handled: SignalCounts,

    /// Truth that the current group was asked to stop
    stopping: bool,

    /// Time of the last broadcast message
    last_message: Option<Instant>,

    /// Process accounting
    counts: InstanceCounts,

    /// Random number generator for aggressive mode
    rng: fastrand::Rng,

    /// Number of online CPUs, for aggressive mode
    cpus: usize,
}
//
impl<'a> Reaper<'a> {
    /// Set up a reaper
    pub fn new(region: &'a SharedRegion, config: &'a Config) -> Self {
        Self {
            region,
            config,
            escalation: Escalation::new(config.stop_signal),
            handled: signals::counts(),
            stopping: false,
            last_message: None,
            counts: InstanceCounts::default(),
            rng: fastrand::Rng::new(),
            cpus: runs::online_cpus().get(),
        }
    }

    /// Process accounting so far
    pub fn counts(&self) -> InstanceCounts {
        self.counts
    }

    /// Mutable access to process accounting, for the launcher
    pub fn counts_mut(&mut self) -> &mut InstanceCounts {
        &mut self.counts
    }

    /// Prepare for a new group of instances
    ///
    /// Signals received before this point, such as a late alarm from the
    /// previous group, are not acted upon.
    ///
    pub fn start_group(&mut self) {
        self.handled = signals::counts();
        self.escalation.new_group();
        self.stopping = false;
    }

    /// Wait for every instance of a list to terminate
    pub fn wait_all(&mut self, instances: &SyncPidList) -> Vec<InstanceOutcome> {
        let mut outcomes = Vec::with_capacity(instances.len());
        loop {
            self.handle_stop_requests(instances);

            let mut running = Vec::new();
            for entry in instances.iter() {
                if self.is_reaped(entry) {
                    continue;
                }
                match waitpid(entry.pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => running.push(entry.pid),
                    Ok(status) => {
                        if let Some(outcome) = self.reap(entry, Some(status)) {
                            self.after_reap(&outcome, instances);
                            outcomes.push(outcome);
                        } else {
                            running.push(entry.pid);
                        }
                    }
                    Err(e) => {
                        if !matches!(e, Errno::ECHILD | Errno::ESRCH) {
                            log::error!(
                                "Failed to wait for {} (pid {}): {e}",
                                entry.name,
                                entry.pid
                            );
                        }
                        if let Some(outcome) = self.reap(entry, None) {
                            self.after_reap(&outcome, instances);
                            outcomes.push(outcome);
                        }
                    }
                }
            }
            if running.is_empty() {
                return outcomes;
            }
            if self.config.aggressive {
                self.shuffle_affinity(&running);
            }
            std::thread::sleep(POLLING_INTERVAL);
        }
    }

    /// Record the termination of an instance
    ///
    /// `status` is `None` if the process vanished without its exit status
    /// being observed. Reaping an instance that was already reaped does
    /// nothing and returns `None`.
    ///
    pub fn reap(&mut self, entry: &SyncPid, status: Option<WaitStatus>) -> Option<InstanceOutcome> {
        if self.is_reaped(entry) {
            return None;
        }
        let stats = self.region.stats(entry.slot);
        let stopped_by_us = stats.signalled.load(Ordering::Relaxed);
        let termination = match status {
            Some(WaitStatus::Exited(_, code)) => Termination::Exited(code),
            Some(WaitStatus::Signaled(pid, Signal::SIGKILL, _))
                if !stopped_by_us && oom::killed_by_oom(pid) =>
            {
                Termination::OutOfMemory
            }
            Some(WaitStatus::Signaled(_, signal, _)) => Termination::Signaled {
                signal,
                stopped_by_us,
            },
            // Stopped/continued notifications are not requested
            Some(other) => {
                log::debug!("Ignoring wait status {other:?} of {}", entry.name);
                return None;
            }
            None => Termination::Lost,
        };
        let verdict = verdict(termination, self.config.stop_signal, self.config.oom_avoid);

        // Clear the slot first, so the instance is never waited for twice
        stats.pid.store(0, Ordering::Relaxed);
        stats.reaped.store(true, Ordering::Release);
        self.counts.exited += 1;
        self.counts.reaped += 1;
        if verdict == Verdict::Failed {
            self.counts.failed += 1;
        }
        let outcome = InstanceOutcome {
            instance: *entry,
            termination,
            verdict,
        };
        log_outcome(&outcome);
        Some(outcome)
    }

    /// Truth that an instance was already reaped
    fn is_reaped(&self, entry: &SyncPid) -> bool {
        let stats = self.region.stats(entry.slot);
        stats.reaped.load(Ordering::Acquire) || stats.pid.load(Ordering::Relaxed) == 0
    }

    /// React to a newly reaped instance
    fn after_reap(&mut self, outcome: &InstanceOutcome, instances: &SyncPidList) {
        if outcome.verdict == Verdict::Failed
            && self.config.abort_on_failure
            && !self.region.abort_requested()
        {
            log::warn!(
                "{} instance {} failed, aborting every other instance",
                outcome.instance.name,
                outcome.instance.instance
            );
            self.region.request_abort();
            signals::request_stop();
            let signal = self.escalation.next_signal(false);
            self.stop(instances, signal);
        }
    }

    /// Act upon deadline and interrupt signals received since last time
    fn handle_stop_requests(&mut self, instances: &SyncPidList) {
        self.act_on_signals(signals::counts(), instances);
    }

    /// Act upon the difference between some signal counts and those that
    /// were already handled
    fn act_on_signals(&mut self, current: SignalCounts, instances: &SyncPidList) {
        let new_forced = current.force_requests - self.handled.force_requests;
        let new_alarms = current.alarms - self.handled.alarms;
        self.handled = current;
        for _ in 0..new_forced {
            let signal = self.escalation.next_signal(true);
            self.stop(instances, signal);
        }
        if new_alarms > 0 {
            // The first alarm of a group is its deadline, later ones are reminders
            let signal = if self.stopping {
                self.escalation.reminder()
            } else {
                self.escalation.next_signal(false)
            };
            self.stop(instances, signal);
        } else if !signals::keep_running() && !self.stopping {
            let signal = self.escalation.next_signal(false);
            self.stop(instances, signal);
        }
    }

    /// Ask running instances to stop, and make sure we get to check on them
    /// again soon
    fn stop(&mut self, instances: &SyncPidList, signal: Signal) {
        let running = self.broadcast(instances, signal);
        self.stopping = true;
        if running > 0 {
            Deadline::arm(REMINDER_INTERVAL);
        }
    }

    /// Send a stop signal to running instances
    ///
    /// The regular stop signal is only sent once to each instance, SIGKILL is
    /// sent to every instance that is still running. Returns the number of
    /// instances that were not reaped yet.
    ///
    fn broadcast(&mut self, instances: &SyncPidList, signal: Signal) -> usize {
        let mut sent = 0;
        let mut running = 0;
        for entry in instances.iter() {
            if self.is_reaped(entry) {
                continue;
            }
            running += 1;
            let stats = self.region.stats(entry.slot);
            let already_signalled = stats.signalled.swap(true, Ordering::Relaxed);
            if already_signalled && signal != Signal::SIGKILL {
                continue;
            }
            match kill(entry.pid, signal) {
                Ok(()) => {
                    sent += 1;
                    if !already_signalled {
                        self.counts.alarmed += 1;
                    }
                }
                Err(Errno::ESRCH) => {}
                Err(e) => log::error!(
                    "Failed to send {signal} to {} (pid {}): {e}",
                    entry.name,
                    entry.pid
                ),
            }
        }
        if sent > 0 {
            let now = Instant::now();
            let due = self
                .last_message
                .map_or(true, |last| now.duration_since(last) >= MESSAGE_INTERVAL);
            if due {
                log::info!("Sending {signal} to {sent} stressor instance(s)");
                self.last_message = Some(now);
            }
        }
        running
    }

    /// Move running instances to random CPUs
    fn shuffle_affinity(&mut self, running: &[Pid]) {
        for &pid in running {
            let mut cpus = CpuSet::new();
            let cpu = self.rng.usize(..self.cpus);
            let result = cpus.set(cpu).and_then(|()| sched_setaffinity(pid, &cpus));
            match result {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => log::debug!("Failed to move pid {pid} to CPU {cpu}: {e}"),
            }
        }
    }
}

/// Log the termination of an instance
fn log_outcome(outcome: &InstanceOutcome) {
    let SyncPid {
        name, pid, instance, ..
    } = outcome.instance;
    match (outcome.termination, outcome.verdict) {
        (Termination::Exited(code), Verdict::Passed) => {
            log::debug!("{name} instance {instance} (pid {pid}) exited with code {code}")
        }
        (Termination::Exited(code), verdict) => {
            let description = ExitCode::from_code(code)
                .map_or_else(|| format!("unknown exit code {code}"), |c| c.to_string());
            match verdict {
                Verdict::Skipped => {
                    log::info!("{name} instance {instance} (pid {pid}) skipped: {description}")
                }
                _ => log::error!(
                    "{name} instance {instance} (pid {pid}) terminated unsuccessfully: {description}"
                ),
            }
        }
        (Termination::Signaled { signal, .. }, Verdict::Passed) => {
            log::debug!("{name} instance {instance} (pid {pid}) stopped by {signal}")
        }
        (Termination::Signaled { signal, .. }, _) => {
            log::error!("{name} instance {instance} (pid {pid}) killed by {signal}")
        }
        (Termination::OutOfMemory, _) => {
            log::warn!("{name} instance {instance} (pid {pid}) killed by the OOM killer")
        }
        (Termination::Lost, _) => log::error!(
            "{name} instance {instance} (pid {pid}) vanished without reporting an exit status ({})",
            Errno::ECHILD
        ),
    }
}

/// Polling interval of the wait loop
const POLLING_INTERVAL: Duration = Duration::from_millis(10);

/// Minimal interval between two broadcast messages
const MESSAGE_INTERVAL: Duration = Duration::from_secs(1);
