//! Background auxiliary processes
//!
//! Helpers such as a memory-thrashing daemon run in their own forked process
//! around the main runs. They speak the same signal vocabulary as stressor
//! instances (SIGALRM means stop) but stay out of the accounting path.

use crate::{
    exit::ExitCode,
    launcher::LaunchError,
    signals,
};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use std::{
    panic::{self, AssertUnwindSafe},
    time::{Duration, Instant},
};

/// Description of a background helper
#[derive(Clone, Copy, Debug)]
pub struct BackgroundTask {
    /// Name used in logs
    pub name: &'static str,

    /// Body, should return once `signals::keep_running()` becomes false
    pub body: fn() -> ExitCode,
}

/// Running background helper, stopped on drop
#[derive(Debug)]
pub struct BackgroundProcess {
    /// Name used in logs
    name: &'static str,

    /// Process ID, None once the process was waited for
    pid: Option<Pid>,
}
//
impl BackgroundProcess {
    /// Fork a process running a background task
    pub fn spawn(task: &BackgroundTask) -> Result<Self, LaunchError> {
        // SAFETY: The coordinator is single-threaded and the child _exits
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                log::info!("Started background {} (pid {child})", task.name);
                Ok(Self {
                    name: task.name,
                    pid: Some(child),
                })
            }
            Ok(ForkResult::Child) => {
                signals::set_current_stressor(task.name);
                let code = panic::catch_unwind(AssertUnwindSafe(|| {
                    match signals::install_instance_handlers() {
                        Ok(()) => (task.body)(),
                        Err(e) => {
                            log::error!("Background {}: {e}", task.name);
                            ExitCode::Failure
                        }
                    }
                }))
                .unwrap_or(ExitCode::Failure);
                // SAFETY: The parent owns every shared resource
                unsafe { libc::_exit(code.code()) }
            }
            Err(e) => Err(LaunchError::Fork(task.name, e)),
        }
    }

    /// Process ID, if still running
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Ask the process to stop, escalating to SIGKILL after `grace`
    pub fn stop(&mut self, grace: Duration) -> Option<WaitStatus> {
        let pid = self.pid?;
        if let Err(e) = kill(pid, Signal::SIGALRM) {
            log::debug!("Failed to send SIGALRM to background {}: {e}", self.name);
        }
        let start = Instant::now();
        let mut killed = false;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => {}
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    log::info!("Background {} stopped ({status:?})", self.name);
                    self.pid = None;
                    return Some(status);
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("Lost track of background {} ({e})", self.name);
                    self.pid = None;
                    return None;
                }
            }
            if !killed && start.elapsed() >= grace {
                log::warn!(
                    "Background {} did not stop within {grace:?}, killing it",
                    self.name
                );
                if let Err(e) = kill(pid, Signal::SIGKILL) {
                    log::debug!("Failed to kill background {}: {e}", self.name);
                }
                killed = true;
            }
            std::thread::sleep(POLLING_INTERVAL);
        }
    }
}
//
impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        self.stop(DEFAULT_GRACE);
    }
}

/// Time given to a background process to stop before it is killed
pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Polling interval while waiting for a background process
const POLLING_INTERVAL: Duration = Duration::from_millis(10);

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    /// Time given to the child to install its signal handlers
    const HANDLER_SETUP_DELAY: Duration = Duration::from_millis(200);

    fn until_stopped() -> ExitCode {
        while signals::keep_running() {
            std::thread::sleep(Duration::from_millis(1));
        }
        ExitCode::Success
    }

    fn stubborn() -> ExitCode {
        loop {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn stops_on_sigalrm() {
        let mut process = BackgroundProcess::spawn(&BackgroundTask {
            name: "sleeper",
            body: until_stopped,
        })
        .unwrap();
        assert!(process.pid().is_some());
        std::thread::sleep(HANDLER_SETUP_DELAY);
        assert_matches!(
            process.stop(Duration::from_secs(30)),
            Some(WaitStatus::Exited(_, 0))
        );
        assert_eq!(process.pid(), None);
        assert_eq!(process.stop(Duration::ZERO), None);
    }

    #[test]
    fn escalates_to_sigkill() {
        let mut process = BackgroundProcess::spawn(&BackgroundTask {
            name: "stubborn",
            body: stubborn,
        })
        .unwrap();
        std::thread::sleep(HANDLER_SETUP_DELAY);
        assert_matches!(
            process.stop(Duration::from_millis(50)),
            Some(WaitStatus::Signaled(_, Signal::SIGKILL, _))
        );
    }
}
