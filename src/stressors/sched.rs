//! Cheap system calls

use nix::{sched::sched_yield, unistd::getpid};
use stressrun::{Args, ExitCode, Stressor, StressorClass, StressorOption};

/// Gives up the CPU over and over
pub struct Yield;
//
impl Stressor for Yield {
    fn name(&self) -> &'static str {
        "yield"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::SCHEDULER | StressorClass::OS
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        while args.keep_running() {
            if let Err(e) = sched_yield() {
                log::error!(
                    "{} instance {}: sched_yield failed: {e}",
                    args.name(),
                    args.instance()
                );
                return ExitCode::Failure;
            }
            args.bogo_inc();
        }
        ExitCode::Success
    }
}

/// Queries its own PID over and over
pub struct Getpid;
//
impl Stressor for Getpid {
    fn name(&self) -> &'static str {
        "getpid"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::OS
    }

    fn options(&self) -> &'static [StressorOption] {
        &[StressorOption {
            name: "verify",
            help: "check that the PID never changes",
        }]
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        let pid = getpid();
        while args.keep_running() {
            // Bypass glibc's PID cache, if any
            // SAFETY: getpid has no preconditions
            let current = unsafe { libc::syscall(libc::SYS_getpid) };
            if args.verify() && current != libc::c_long::from(pid.as_raw()) {
                log::error!(
                    "{} instance {}: getpid returned {current} instead of {pid}",
                    args.name(),
                    args.instance()
                );
                return ExitCode::Failure;
            }
            args.bogo_inc();
        }
        ExitCode::Success
    }
}
