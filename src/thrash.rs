//! Background memory thrasher
//!
//! Touches random pages of a large anonymous mapping, then hands them back to
//! the kernel, over and over, so that stressors run under memory pressure.

use std::{io, ptr::NonNull, time::Duration};
use stressrun::{background::BackgroundTask, shared::page_size, signals, ExitCode};
use sysinfo::System;

/// Background task running the thrasher
pub const TASK: BackgroundTask = BackgroundTask {
    name: "memory thrasher",
    body: thrash,
};

/// Thrasher main loop, runs until SIGALRM
fn thrash() -> ExitCode {
    let mut system = System::new();
    system.refresh_memory();
    let page = page_size();
    let size = buffer_size(system.available_memory(), page);
    let mapping = match Mapping::new(size) {
        Ok(mapping) => mapping,
        Err(e) => {
            log::warn!("Failed to map {size} bytes of memory to be thrashed ({e})");
            return ExitCode::NoResource;
        }
    };
    log::debug!("Thrashing {size} bytes of memory");

    let mut rng = fastrand::Rng::new();
    let pages = size / page;
    while signals::keep_running() {
        for _ in 0..TOUCHES_PER_ROUND {
            let offset = rng.usize(..pages) * page;
            // SAFETY: offset is within the mapping, which is writable
            unsafe { mapping.base.as_ptr().add(offset).write_volatile(rng.u8(..)) };
        }
        if let Err(e) = mapping.discard() {
            log::warn!("Failed to release thrashed memory ({e})");
            return ExitCode::Failure;
        }
        std::thread::sleep(ROUND_PAUSE);
    }
    ExitCode::Success
}

/// Size of the thrashed buffer for a given amount of available memory
fn buffer_size(available: u64, page: usize) -> usize {
    let target = (available / 4).clamp(MIN_BYTES, MAX_BYTES) as usize;
    (target / page).max(1) * page
}

/// Private anonymous memory mapping
struct Mapping {
    /// Start of the mapping
    base: NonNull<u8>,

    /// Length of the mapping
    len: usize,
}
//
impl Mapping {
    /// Map some memory
    fn new(len: usize) -> io::Result<Self> {
        // SAFETY: Anonymous mapping at a kernel-chosen address
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(base.cast())
            .map(|base| Self { base, len })
            .ok_or_else(|| io::Error::from(io::ErrorKind::Other))
    }

    /// Give the backing pages back to the kernel, keeping the mapping
    fn discard(&self) -> io::Result<()> {
        let base = self.base.as_ptr().cast();
        // SAFETY: Whole mapping, nobody holds references into it
        if unsafe { libc::madvise(base, self.len, libc::MADV_DONTNEED) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
//
impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: Mapping created by mmap with this length
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}

/// Random page writes between two releases
const TOUCHES_PER_ROUND: usize = 4096;

/// Pause between two rounds
const ROUND_PAUSE: Duration = Duration::from_millis(10);

/// Smallest thrashed buffer
const MIN_BYTES: u64 = 16 * 1024 * 1024;

/// Largest thrashed buffer
const MAX_BYTES: u64 = 1024 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing() {
        assert_eq!(buffer_size(0, 4096), MIN_BYTES as usize);
        assert_eq!(buffer_size(u64::MAX, 4096), MAX_BYTES as usize);
        assert_eq!(buffer_size(400 * 1024 * 1024 + 3, 4096), 100 * 1024 * 1024);
    }

    #[test]
    fn mapping() {
        let mapping = Mapping::new(4 * page_size()).unwrap();
        // SAFETY: First byte of a fresh writable mapping
        unsafe { mapping.base.as_ptr().write(42) };
        mapping.discard().unwrap();
        // SAFETY: Discarded private anonymous pages read back as zero
        assert_eq!(unsafe { mapping.base.as_ptr().read() }, 0);
    }
}
