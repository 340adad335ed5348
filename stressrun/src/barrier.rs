//! Start barrier
//!
//! Every instance of a run reports itself ready in its statistics slot once
//! its setup is done, then polls the region's barrier generation. The
//! coordinator waits until it has seen every instance of the run ready (or
//! gone), and only then publishes the run's generation, releasing everyone
//! at once. Waiting instances keep checking the stop flag, so a deadline that
//! fires before the barrier is released lets them exit without doing any
//! timed work.

use crate::{shared::SharedRegion, signals};
use nix::unistd::Pid;
use std::{
    sync::atomic::Ordering,
    time::{Duration, Instant},
};

/// Instance was launched but did not reach the barrier yet
pub const SYNC_LAUNCHED: u32 = 0;

/// Instance is waiting at the barrier
pub const SYNC_READY: u32 = 1;

/// Instance is past the point where it could wait at the barrier
pub const SYNC_DONE: u32 = 2;

/// Instance-side barrier wait, returns false if the run was cancelled
pub(crate) fn wait_for_release(region: &SharedRegion, slot: usize, generation: u32) -> bool {
    let stats = region.stats(slot);
    stats.sync_state.store(SYNC_READY, Ordering::Release);
    let mut backoff = MIN_BACKOFF;
    loop {
        if region.barrier_generation() >= generation {
            return true;
        }
        if !signals::keep_running() || region.abort_requested() {
            stats.sync_state.store(SYNC_DONE, Ordering::Release);
            return false;
        }
        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Forked instance, as tracked by the coordinator
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyncPid {
    /// Process ID
    pub pid: Pid,

    /// Statistics slot in the shared region
    pub slot: usize,

    /// Index of the run in the run list
    pub run: usize,

    /// Index of the instance within its run
    pub instance: u32,

    /// Stressor name
    pub name: &'static str,
}

/// Instances launched for one barrier generation
#[derive(Debug, Default)]
pub struct SyncPidList {
    /// Barrier generation that these instances wait for
    generation: u32,

    /// Instances in launch order
    entries: Vec<SyncPid>,
}

/// Outcome of the coordinator-side barrier wait
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BarrierOutcome {
    /// Every instance was ready, the barrier was released
    Released,

    /// Some instances were still not ready at the timeout, the barrier was
    /// released anyway
    TimedOut {
        /// Number of instances that were not ready
        stragglers: usize,
    },

    /// A stop was requested while waiting, the barrier was not released
    Cancelled,
}

impl SyncPidList {
    /// Prepare a list for the next barrier generation of a region
    pub fn new(region: &SharedRegion) -> Self {
        Self {
            generation: region.barrier_generation().wrapping_add(1),
            entries: Vec::new(),
        }
    }

    /// Barrier generation that these instances wait for
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Track a newly launched instance
    pub fn push(&mut self, entry: SyncPid) {
        self.entries.push(entry);
    }

    /// Tracked instances in launch order
    pub fn iter(&self) -> impl Iterator<Item = &SyncPid> + '_ {
        self.entries.iter()
    }

    /// Number of tracked instances
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Truth that no instance is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for every tracked instance to be ready, then release them
    ///
    /// Instances that already finished or died count as ready. If `timeout`
    /// elapses first, the barrier is released anyway so that a broken
    /// instance cannot hold its siblings back forever.
    ///
    pub fn release(&self, region: &SharedRegion, timeout: Duration) -> BarrierOutcome {
        let start = Instant::now();
        loop {
            if !signals::keep_running() {
                log::debug!("Start barrier cancelled by a stop request");
                return BarrierOutcome::Cancelled;
            }
            let stragglers = self
                .entries
                .iter()
                .filter(|entry| !Self::is_ready(region, entry))
                .count();
            if stragglers == 0 {
                region.release_barrier(self.generation);
                log::debug!(
                    "Released {} instance(s) after {:?}",
                    self.entries.len(),
                    start.elapsed()
                );
                return BarrierOutcome::Released;
            }
            if start.elapsed() >= timeout {
                log::warn!(
                    "{stragglers} instance(s) did not reach the start barrier within {timeout:?}, starting anyway"
                );
                region.release_barrier(self.generation);
                return BarrierOutcome::TimedOut { stragglers };
            }
            std::thread::sleep(POLLING_INTERVAL);
        }
    }

    /// Truth that an instance does not need to be waited for anymore
    fn is_ready(region: &SharedRegion, entry: &SyncPid) -> bool {
        region.stats(entry.slot).sync_state.load(Ordering::Acquire) != SYNC_LAUNCHED
            || has_terminated(entry.pid)
    }
}

/// Truth that a child process terminated, without reaping it
fn has_terminated(pid: Pid) -> bool {
    // SAFETY: siginfo_t is plain data, all-zeroes is a valid value
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    // SAFETY: Valid siginfo_t pointer, WNOWAIT leaves the child reapable
    let ret = unsafe {
        libc::waitid(
            libc::P_PID,
            pid.as_raw() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    // An error means there is no such child anymore, which is as good as dead
    // SAFETY: waitid filled in the siginfo_t, si_pid is valid for SIGCHLD info
    ret != 0 || unsafe { info.si_pid() } != 0
}

/// Initial instance-side polling interval
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Maximal instance-side polling interval
const MAX_BACKOFF: Duration = Duration::from_millis(10);

/// Coordinator-side polling interval
const POLLING_INTERVAL: Duration = Duration::from_millis(1);
