//! Deadline and signal handling
//!
//! Signal handlers only ever touch atomics. Everything that needs to do real
//! work in reaction to a signal (broadcasting stop requests to instances,
//! escalating to SIGKILL, logging) runs in ordinary control flow, which
//! polls the counters maintained here.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::{
    io,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
    time::Duration,
};
use thiserror::Error;

/// Truth that the current process should keep running its workload
pub fn keep_running() -> bool {
    !STOP.load(Ordering::Relaxed)
}

/// Ask the current process to stop, as SIGALRM would
pub fn request_stop() {
    STOP.store(true, Ordering::Relaxed);
}

/// Bring the signal state back to its initial value
///
/// The coordinator does this once when it starts, not between runs, so that
/// a stop request is never forgotten.
///
pub fn reset() {
    STOP.store(false, Ordering::Relaxed);
    ALARMS.store(0, Ordering::Relaxed);
    FORCE_REQUESTS.store(0, Ordering::Relaxed);
}

/// Clear the stop flag before the next run, keeping signal counts
///
/// Used between sequential or permuted runs, after a run's deadline fired.
/// Callers must check `counts()` first: a user interrupt ends the whole
/// invocation, not just the current run.
///
pub fn rearm() {
    STOP.store(false, Ordering::Relaxed);
}

/// Snapshot of the signals received so far
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SignalCounts {
    /// Number of SIGALRM received
    pub alarms: u32,

    /// Number of SIGINT/SIGHUP received
    pub force_requests: u32,
}
//
/// Signals received so far
pub fn counts() -> SignalCounts {
    SignalCounts {
        alarms: ALARMS.load(Ordering::Relaxed),
        force_requests: FORCE_REQUESTS.load(Ordering::Relaxed),
    }
}

/// Record which stressor the current process is running, for diagnostics
pub fn set_current_stressor(name: &'static str) {
    CURRENT_LEN.store(0, Ordering::Relaxed);
    CURRENT_NAME.store(name.as_ptr() as *mut u8, Ordering::Relaxed);
    CURRENT_LEN.store(name.len(), Ordering::Release);
}

/// Handlers that were replaced, to be restored later
#[must_use]
pub struct SavedHandlers(Vec<(Signal, SigAction)>);
//
impl SavedHandlers {
    /// Put back the handlers that were active before installation
    pub fn restore(self) {
        for (signal, action) in self.0.into_iter().rev() {
            // SAFETY: These handlers were active before, restoring them is fine
            if let Err(e) = unsafe { sigaction(signal, &action) } {
                log::warn!("Failed to restore {signal} handler: {e}");
            }
        }
    }
}

/// Install the coordinator's handlers
///
/// SIGALRM marks the global deadline as reached, SIGINT and SIGHUP are user
/// abort requests. None of them restarts interrupted syscalls, so a blocked
/// wait returns EINTR and the reaper gets to act on them immediately.
///
pub fn install_coordinator_handlers() -> Result<SavedHandlers, SignalError> {
    let mut saved = SavedHandlers(Vec::new());
    let result = (|| {
        for (signal, handler) in [
            (Signal::SIGALRM, on_alarm as extern "C" fn(libc::c_int)),
            (Signal::SIGINT, on_interrupt),
            (Signal::SIGHUP, on_interrupt),
        ] {
            let old = install(signal, SigHandler::Handler(handler), SaFlags::empty())?;
            saved.0.push((signal, old));
        }
        Ok(())
    })();
    match result {
        Ok(()) => Ok(saved),
        Err(e) => {
            saved.restore();
            Err(e)
        }
    }
}

/// Install the handlers of a forked stressor instance
pub fn install_instance_handlers() -> Result<(), SignalError> {
    for signal in [Signal::SIGALRM, Signal::SIGINT, Signal::SIGHUP] {
        install(signal, SigHandler::Handler(on_instance_stop), SaFlags::empty())?;
    }
    for signal in FATAL_SIGNALS {
        install(signal, SigHandler::Handler(on_fatal), SaFlags::SA_RESETHAND)?;
    }
    Ok(())
}

/// Install one handler, returning the previous one
fn install(signal: Signal, handler: SigHandler, flags: SaFlags) -> Result<SigAction, SignalError> {
    let action = SigAction::new(handler, flags, SigSet::empty());
    // SAFETY: Our handlers only use async-signal-safe operations
    unsafe { sigaction(signal, &action) }.map_err(|e| SignalError(signal, e.into()))
}

/// Failure to install a signal handler
#[derive(Debug, Error)]
#[error("failed to install {0} handler ({1})")]
pub struct SignalError(Signal, io::Error);

/// Signals that terminate an instance after a diagnostic
pub const FATAL_SIGNALS: [Signal; 5] = [
    Signal::SIGSEGV,
    Signal::SIGILL,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGABRT,
];

/// Global deadline, delivered as SIGALRM
pub struct Deadline;
//
impl Deadline {
    /// Arm the process timer, replacing any previous one
    pub fn arm(timeout: Duration) {
        // A zero timer would disarm instead, round up to one microsecond
        let timeout = timeout.max(Duration::from_micros(1));
        Self::set(libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        })
    }

    /// Disarm the process timer
    pub fn cancel() {
        Self::set(libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        })
    }

    /// Configure the one-shot real-time timer
    fn set(value: libc::timeval) {
        let timer = libc::itimerval {
            it_interval: libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
            it_value: value,
        };
        // SAFETY: Valid pointer to an itimerval, null old value is allowed
        if unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) } != 0 {
            log::error!(
                "Failed to configure the deadline timer: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Choice of the signal used to stop instances
///
/// Repeated forced stop requests (the user hitting Ctrl-C again and again)
/// eventually escalate to SIGKILL. So do the reminder alarms that keep
/// ringing while a group's instances ignore their stop signal, but those only
/// count within one group.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Escalation {
    /// Signal used until escalation
    default: Signal,

    /// Number of forced stop requests so far
    forced: u32,

    /// Number of reminder alarms in the current group
    reminders: u32,
}
//
impl Escalation {
    /// Start with a given default stop signal
    pub fn new(default: Signal) -> Self {
        Self {
            default,
            forced: 0,
            reminders: 0,
        }
    }

    /// Signal to be sent for the next stop request
    pub fn next_signal(&mut self, force: bool) -> Signal {
        if force {
            self.forced = self.forced.saturating_add(1);
        }
        self.current()
    }

    /// Signal to be sent when instances are still running one reminder
    /// interval after they were asked to stop
    pub fn reminder(&mut self) -> Signal {
        self.reminders = self.reminders.saturating_add(1);
        self.current()
    }

    /// Forget the reminders of the previous group
    pub fn new_group(&mut self) {
        self.reminders = 0;
    }

    /// Truth that SIGKILL is now being used
    pub fn escalated(&self) -> bool {
        self.forced > FORCE_KILL_THRESHOLD || self.reminders > FORCE_KILL_THRESHOLD
    }

    /// Signal matching the current escalation level
    fn current(&self) -> Signal {
        if self.escalated() {
            Signal::SIGKILL
        } else {
            self.default
        }
    }
}

/// Number of forced stop requests (or reminders) that still use the default
/// signal
pub const FORCE_KILL_THRESHOLD: u32 = 5;

/// Delay between two reminder alarms once instances were asked to stop
pub const REMINDER_INTERVAL: Duration = Duration::from_secs(1);

/// Coordinator SIGALRM handler
extern "C" fn on_alarm(_signal: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
    ALARMS.fetch_add(1, Ordering::Relaxed);
}

/// Coordinator SIGINT/SIGHUP handler
extern "C" fn on_interrupt(_signal: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
    FORCE_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

/// Instance stop handler
extern "C" fn on_instance_stop(signal: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
    if signal == libc::SIGALRM {
        ALARMS.fetch_add(1, Ordering::Relaxed);
    } else {
        FORCE_REQUESTS.fetch_add(1, Ordering::Relaxed);
    }
}

/// Instance fatal signal handler: emit a diagnostic, then die by the signal
extern "C" fn on_fatal(signal: libc::c_int) {
    let mut buf = [0u8; 160];
    let mut len = 0;
    let mut push = |bytes: &[u8]| {
        let n = bytes.len().min(buf.len() - len);
        buf[len..len + n].copy_from_slice(&bytes[..n]);
        len += n;
    };
    push(b"stressor ");
    let name_len = CURRENT_LEN.load(Ordering::Acquire);
    let name_ptr = CURRENT_NAME.load(Ordering::Relaxed);
    if !name_ptr.is_null() && name_len > 0 {
        // SAFETY: set_current_stressor only stores 'static strings
        push(unsafe { std::slice::from_raw_parts(name_ptr, name_len) });
    } else {
        push(b"<unknown>");
    }
    push(b": caught fatal signal ");
    let mut digits = [0u8; 10];
    let mut value = signal.unsigned_abs();
    let mut start = digits.len();
    loop {
        start -= 1;
        digits[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    push(&digits[start..]);
    push(b"\n");
    // SAFETY: write, signal and raise are async-signal-safe
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr().cast(), len);
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

/// Stop flag of the current process
static STOP: AtomicBool = AtomicBool::new(false);

/// Number of SIGALRM received
static ALARMS: AtomicU32 = AtomicU32::new(0);

/// Number of SIGINT/SIGHUP received
static FORCE_REQUESTS: AtomicU32 = AtomicU32::new(0);

/// Name of the stressor run by this process, for fatal diagnostics
static CURRENT_NAME: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());
static CURRENT_LEN: AtomicUsize = AtomicUsize::new(0);
