//! Forking of stressor instances
//!
//! Each instance is a forked child that sets itself up, runs its stressor,
//! stores its final numbers in its own statistics and checksum slots, and
//! leaves through `_exit()` with a code from the exit taxonomy. Nothing that
//! happens inside the stressor (panics, stray `exit()` calls) may escape this
//! protocol.

use crate::{
    barrier::{SyncPid, SyncPidList, SYNC_DONE},
    config::Config,
    exit::ExitCode,
    oom,
    reaper::InstanceCounts,
    runs::{self, StressorRun},
    shared::{ChecksumData, InstanceStats, SharedRegion, WarnOnce},
    signals::{self, Deadline},
    stressor::Args,
};
use nix::{
    errno::Errno,
    sched::{sched_setaffinity, CpuSet},
    sys::{
        resource::{getrusage, UsageWho},
        time::TimeVal,
    },
    unistd::{fork, getpid, ForkResult, Pid},
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::atomic::Ordering,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Instance factory for one group of runs
pub struct Launcher<'a> {
    /// Shared memory region
    region: &'a SharedRegion,

    /// Coordinator configuration
    config: &'a Config,

    /// End of the current runs
    deadline: Instant,

    /// Number of online CPUs
    cpus: usize,
}
//
impl<'a> Launcher<'a> {
    /// Prepare to launch instances that should stop at `deadline`
    pub fn new(region: &'a SharedRegion, config: &'a Config, deadline: Instant) -> Self {
        Self {
            region,
            config,
            deadline,
            cpus: runs::online_cpus().get(),
        }
    }

    /// Fork every instance of a run, using slots starting at `first_slot`
    ///
    /// Instances that were successfully launched are tracked in `sync` even
    /// if a later fork fails, so that they are still waited for.
    ///
    pub fn launch_run(
        &self,
        index: usize,
        run: &StressorRun,
        first_slot: usize,
        sync: &mut SyncPidList,
        counts: &mut InstanceCounts,
    ) -> Result<(), LaunchError> {
        log::debug!(
            "Launching {} instance(s) of {} in slots {first_slot}..{}",
            run.instances(),
            run.name(),
            first_slot + run.instances() as usize
        );
        for instance in 0..run.instances() {
            let slot = first_slot + instance as usize;
            let pid = self.fork_instance(run, instance, slot, sync.generation())?;
            counts.started += 1;
            sync.push(SyncPid {
                pid,
                slot,
                run: index,
                instance,
                name: run.name(),
            });
        }
        Ok(())
    }

    /// Fork one instance, retrying on transient resource exhaustion
    fn fork_instance(
        &self,
        run: &StressorRun,
        instance: u32,
        slot: usize,
        generation: u32,
    ) -> Result<Pid, LaunchError> {
        let stats = self.region.stats(slot);
        stats.reset(0);
        self.region.checksum(slot).clear();
        let mut retries = 0;
        loop {
            if !signals::keep_running() {
                return Err(LaunchError::Stopped);
            }
            // SAFETY: The coordinator is single-threaded, and the child never
            //         returns from instance_main.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    stats.pid.store(child.as_raw(), Ordering::Release);
                    return Ok(child);
                }
                Ok(ForkResult::Child) => self.instance_main(run, instance, slot, generation),
                Err(Errno::EAGAIN) if retries < MAX_FORK_RETRIES => {
                    retries += 1;
                    log::debug!(
                        "Fork of {} instance {instance} hit EAGAIN, retrying",
                        run.name()
                    );
                    std::thread::sleep(FORK_RETRY_DELAY);
                }
                Err(e) => return Err(LaunchError::Fork(run.name(), e)),
            }
        }
    }

    /// Body of a forked instance
    fn instance_main(&self, run: &StressorRun, instance: u32, slot: usize, generation: u32) -> ! {
        let region = self.region;
        let stats = region.stats(slot);
        stats.pid.store(getpid().as_raw(), Ordering::Relaxed);
        stats.reaped.store(false, Ordering::Relaxed);
        stats.counter.store(0, Ordering::Relaxed);
        signals::set_current_stressor(run.name());
        // SAFETY: The handler only calls _exit
        unsafe { libc::atexit(on_unexpected_exit) };

        let mut args = Args::new(
            run.name(),
            instance,
            run.instances(),
            run.instance_quota(instance),
            self.deadline,
            self.config.verify,
            region,
            slot,
            generation,
        );
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Err(e) = signals::install_instance_handlers() {
                log::error!("{} instance {instance}: {e}", run.name());
                return ExitCode::Failure;
            }
            match self.deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => Deadline::arm(remaining),
                _ => signals::request_stop(),
            }
            self.apply_policy(instance);
            run.stressor().run(&mut args)
        }));
        let code = outcome.unwrap_or_else(|_| {
            log::error!("{} instance {instance} panicked", run.name());
            ExitCode::Failure
        });
        Deadline::cancel();

        // Publish final numbers, the completion flag goes last
        stats.sync_state.store(SYNC_DONE, Ordering::Release);
        let duration = args.started().map_or(Duration::ZERO, |start| start.elapsed());
        stats
            .duration_ns
            .store(duration.as_nanos() as u64, Ordering::Relaxed);
        record_usage(stats);
        let run_ok = code == ExitCode::Success;
        stats.run_ok.store(run_ok, Ordering::Relaxed);
        region.checksum(slot).seal(ChecksumData {
            counter: stats.counter.load(Ordering::Relaxed),
            run_ok,
        });
        stats.completed.store(true, Ordering::Release);
        // SAFETY: Leaving without running atexit handlers or destructors is
        //         the point, the parent owns every resource we share.
        unsafe { libc::_exit(code.code()) }
    }

    /// Apply OOM adjustment, CPU pinning, niceness and capability dropping to
    /// the current instance
    fn apply_policy(&self, instance: u32) {
        let region = self.region;
        let adjustment = oom::instance_oom_adjustment(self.config.oom_avoid);
        if let Err(e) = oom::set_oom_score_adj(adjustment) {
            if region.warn_once(WarnOnce::OOM_ADJUST) {
                log::warn!("Failed to set OOM score adjustment to {adjustment} ({e})");
            }
        }

        if self.config.pin_cpus {
            let cpu = instance as usize % self.cpus;
            let mut cpus = CpuSet::new();
            let result = cpus
                .set(cpu)
                .and_then(|()| sched_setaffinity(Pid::from_raw(0), &cpus));
            if let Err(e) = result {
                if region.warn_once(WarnOnce::SCHEDULING) {
                    log::warn!("Failed to pin instance to CPU {cpu} ({e})");
                }
            }
        }

        if let Some(nice) = self.config.nice {
            // SAFETY: setpriority has no memory safety preconditions
            if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0
                && region.warn_once(WarnOnce::SCHEDULING)
            {
                log::warn!(
                    "Failed to set nice level {nice} ({})",
                    Errno::last()
                );
            }
        }

        // Last, since the above may need privileges
        if self.config.drop_capabilities {
            if let Err(e) = drop_capabilities() {
                if region.warn_once(WarnOnce::CAPABILITIES) {
                    log::warn!("Failed to drop capabilities ({e})");
                }
            }
        }
    }
}

/// Header of the capget/capset system calls
#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

/// One 32-bit word of capability sets
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// _LINUX_CAPABILITY_VERSION_3, which uses two CapData words
const CAPABILITY_VERSION_3: u32 = 0x2008_0522;

/// Clear every capability set of the current process and forbid regaining
/// privileges through execve()
fn drop_capabilities() -> Result<(), Errno> {
    let mut header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [CapData::default(); 2];
    // SAFETY: header and data have the layout the kernel expects for
    //         version 3, and outlive the call
    let result = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &mut header as *mut CapHeader,
            data.as_ptr(),
        )
    };
    Errno::result(result)?;
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS) has no memory safety preconditions
    let result = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    Errno::result(result).map(drop)
}

/// Store the resource usage of the current process in its statistics slot
fn record_usage(stats: &InstanceStats) {
    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            stats
                .user_time_ns
                .store(timeval_ns(usage.user_time()), Ordering::Relaxed);
            stats
                .sys_time_ns
                .store(timeval_ns(usage.system_time()), Ordering::Relaxed);
            stats
                .max_rss_kib
                .store(usage.max_rss().max(0) as u64, Ordering::Relaxed);
        }
        Err(e) => log::warn!("Failed to query resource usage ({e})"),
    }
}

/// Convert a TimeVal to nanoseconds
fn timeval_ns(tv: TimeVal) -> u64 {
    (tv.tv_sec().max(0) as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(tv.tv_usec().max(0) as u64 * 1000)
}

/// atexit handler of instances, only reached if something called exit()
extern "C" fn on_unexpected_exit() {
    // SAFETY: _exit is always safe to call
    unsafe { libc::_exit(ExitCode::BySysExit.code()) }
}

/// Failure to launch instances
#[derive(Debug, Error)]
pub enum LaunchError {
    /// fork() failed
    #[error("failed to fork an instance of {0} ({1})")]
    Fork(&'static str, Errno),

    /// A stop was requested before every instance could be launched
    #[error("launch interrupted by a stop request")]
    Stopped,
}

/// Delay between fork attempts after EAGAIN
const FORK_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Maximal number of fork attempts after EAGAIN
const MAX_FORK_RETRIES: u32 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_are_dropped_in_child() {
        // SAFETY: The child only makes system calls before _exit
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = match drop_capabilities() {
                    Ok(()) => 0,
                    Err(_) => 1,
                };
                // SAFETY: Leaving the forked test process
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                let status = nix::sys::wait::waitpid(child, None).unwrap();
                assert_eq!(status, nix::sys::wait::WaitStatus::Exited(child, 0));
            }
        }
    }

    #[test]
    fn timeval_conversion() {
        assert_eq!(timeval_ns(TimeVal::new(2, 500)), 2_000_500_000);
        assert_eq!(timeval_ns(TimeVal::new(0, 0)), 0);
    }
}
