//! Out-of-memory killer heuristics
//!
//! There is no portable way to learn that a process was killed by the OOM
//! killer. A SIGKILL that the coordinator did not send is attributed to it
//! when the kernel log mentions the victim, or when the host is nearly out of
//! memory.

use nix::unistd::Pid;
use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::OpenOptionsExt,
};
use sysinfo::System;

/// OOM score adjustment applied inside instances
pub fn instance_oom_adjustment(oom_avoid: bool) -> i32 {
    if oom_avoid {
        OOM_SCORE_ADJ_MIN
    } else {
        OOM_SCORE_ADJ_MAX
    }
}

/// Adjust the OOM score of the current process
pub fn set_oom_score_adj(value: i32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open("/proc/self/oom_score_adj")?;
    write!(file, "{value}")
}

/// Truth that a process killed by SIGKILL was probably an OOM killer victim
pub fn killed_by_oom(pid: Pid) -> bool {
    match kernel_log_mentions(pid) {
        Ok(true) => {
            log::debug!("Kernel log reports that the OOM killer took process {pid}");
            return true;
        }
        Ok(false) => {}
        Err(e) => log::debug!("Cannot scan the kernel log for OOM kills ({e})"),
    }
    memory_nearly_exhausted()
}

/// Truth that available memory is below the low-memory threshold
pub fn memory_nearly_exhausted() -> bool {
    let mut system = System::new();
    system.refresh_memory();
    let (available, total) = (system.available_memory(), system.total_memory());
    total > 0 && available.saturating_mul(100) < total.saturating_mul(LOW_MEMORY_PERCENT)
}

/// Scan the kernel log for an OOM killer record about a process
fn kernel_log_mentions(pid: Pid) -> io::Result<bool> {
    let mut kmsg = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open("/dev/kmsg")?;
    scan_records(&mut kmsg, pid)
}

/// Read /dev/kmsg records until there are no more
fn scan_records(kmsg: &mut File, pid: Pid) -> io::Result<bool> {
    // Each read returns exactly one record
    let mut buf = vec![0u8; 8192];
    loop {
        match kmsg.read(&mut buf) {
            Ok(0) => return Ok(false),
            Ok(len) => {
                if record_mentions(&String::from_utf8_lossy(&buf[..len]), pid) {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // EPIPE means that records were overwritten while reading
            Err(e) if e.raw_os_error() == Some(libc::EPIPE) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Truth that a kernel log record reports an OOM kill of a process
fn record_mentions(record: &str, pid: Pid) -> bool {
    let needle = format!("Killed process {pid}");
    record.match_indices(&needle).any(|(start, _)| {
        // Do not mistake pid 12 for pid 123
        !record[start + needle.len()..]
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_digit())
    })
}

/// OOM score adjustment making a process the OOM killer's favorite target
const OOM_SCORE_ADJ_MAX: i32 = 1000;

/// OOM score adjustment shielding a process from the OOM killer
const OOM_SCORE_ADJ_MIN: i32 = -1000;

/// Percentage of total memory under which the host is considered exhausted
const LOW_MEMORY_PERCENT: u64 = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustment() {
        assert_eq!(instance_oom_adjustment(false), 1000);
        assert_eq!(instance_oom_adjustment(true), -1000);
    }

    #[test]
    fn kernel_records() {
        let pid = Pid::from_raw(123);
        assert!(record_mentions(
            "6,1234,5678,-;Out of memory: Killed process 123 (bogostress) total-vm:1kB",
            pid
        ));
        assert!(record_mentions(
            "3,99,100,-;Memory cgroup out of memory: Killed process 123(bogostress)",
            pid
        ));
        assert!(!record_mentions(
            "6,1234,5678,-;Out of memory: Killed process 1234 (bogostress)",
            pid
        ));
        assert!(!record_mentions("6,1,2,-;usb 1-1: new device", pid));
    }
}
