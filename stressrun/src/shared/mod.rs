//! Memory shared between the coordinator and every stressor instance
//!
//! The region is mapped once, before any fork, and inherited by every child.
//! It contains a header (barrier flag, abort flag, shared heap bookkeeping,
//! named locks), one statistics slot and one checksum slot per instance, the
//! shared heap's bytes, and a trailing inaccessible guard page. Three extra
//! single-page "probe" mappings with no-access, read-only and write-only
//! protections are provided for workloads that deliberately trigger faults.

mod heap;
mod lock;
mod stats;

pub use self::{
    heap::{HeapError, HeapStr, SharedHeap},
    lock::{LockError, LockGuard, SharedLock},
    stats::{ChecksumData, ChecksumSlot, InstanceStats, MeanKind, MetricSlot, MAX_METRICS},
};

use self::heap::HeapHeader;
use crossbeam_utils::CachePadded;
use std::{
    io,
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use thiserror::Error;

/// Region configuration
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegionOptions {
    /// Size of the shared heap in bytes
    pub heap_size: usize,

    /// Whether a trailing guard page should be made inaccessible
    pub guard_page: bool,

    /// Whether probe pages should be mapped
    pub probe_pages: bool,
}
//
impl Default for RegionOptions {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            guard_page: true,
            probe_pages: true,
        }
    }
}

/// Default size of the shared heap
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024;

/// Protection of a probe page
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProbeKind {
    /// Any access faults
    NoAccess,

    /// Writes fault
    ReadOnly,

    /// Reads may fault, on platforms that support it
    WriteOnly,
}
//
impl ProbeKind {
    /// All probe page kinds
    pub const ALL: [Self; 3] = [Self::NoAccess, Self::ReadOnly, Self::WriteOnly];

    /// Matching mmap protection flags
    fn protection(self) -> libc::c_int {
        match self {
            Self::NoAccess => libc::PROT_NONE,
            Self::ReadOnly => libc::PROT_READ,
            Self::WriteOnly => libc::PROT_WRITE,
        }
    }
}

/// Key of a process-wide "warn once" flag
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WarnOnce(u32);
//
impl WarnOnce {
    /// Every instance of a run reported zero bogo-ops
    pub const ZERO_BOGO_OPS: Self = Self(0);

    /// OOM score adjustment was refused by the kernel
    pub const OOM_ADJUST: Self = Self(1);

    /// Scheduling policy could not be applied
    pub const SCHEDULING: Self = Self(2);

    /// Capabilities could not be dropped
    pub const CAPABILITIES: Self = Self(3);

    /// Stressor-defined flag, `index` must be below 56
    pub const fn custom(index: u32) -> Self {
        assert!(index < 56);
        Self(8 + index)
    }
}

/// Header at the start of the region
#[repr(C)]
struct Header {
    /// Last released start barrier generation
    go: AtomicU32,

    /// Set when every instance should stop as soon as possible
    abort: AtomicBool,

    /// Shared heap bookkeeping
    heap: HeapHeader,

    /// Protects `warned`
    warn_lock: SharedLock,

    /// Bitmap of raised "warn once" flags
    warned: AtomicU64,

    /// Protects `ports`
    port_lock: SharedLock,

    /// Bitmap of reserved network ports
    ports: [AtomicU64; 65536 / 64],
}

/// Offsets of the region's sub-areas
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Layout {
    instances: usize,
    stats_offset: usize,
    checksums_offset: usize,
    heap_offset: usize,
    heap_size: usize,
    guard_offset: usize,
    total: usize,
}
//
impl Layout {
    /// Compute the layout of a region
    fn new(instances: usize, heap_size: usize, page_size: usize) -> Self {
        let align = |offset: usize, to: usize| (offset + to - 1) / to * to;
        let stats_offset = align(size_of::<Header>(), STATS_STRIDE);
        let checksums_offset = stats_offset + instances * STATS_STRIDE;
        let heap_offset = align(
            checksums_offset + instances * size_of::<ChecksumSlot>(),
            64,
        );
        let guard_offset = align(heap_offset + heap_size, page_size);
        Self {
            instances,
            stats_offset,
            checksums_offset,
            heap_offset,
            heap_size,
            guard_offset,
            total: guard_offset + page_size,
        }
    }
}

/// Distance between two statistics slots
const STATS_STRIDE: usize = size_of::<CachePadded<InstanceStats>>();

/// Anonymous shared memory mapping, unmapped on drop
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}
//
impl Mapping {
    /// Map zero-filled shared memory
    fn new(len: usize, protection: libc::c_int) -> Result<Self, RegionError> {
        // SAFETY: Anonymous mappings do not alias any existing Rust object
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                protection,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(RegionError::Map(len, io::Error::last_os_error()));
        }
        let base = NonNull::new(ret as *mut u8).ok_or(RegionError::Map(
            len,
            io::Error::from(io::ErrorKind::AddrNotAvailable),
        ))?;
        Ok(Self { base, len })
    }
}
//
impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: The mapping was created by Mapping::new and is not used anymore
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) } != 0 {
            log::error!(
                "Failed to unmap {} bytes of shared memory: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

/// Memory shared between the coordinator and all stressor instances
pub struct SharedRegion {
    /// Main mapping (header, slots, heap, guard page)
    main: Mapping,

    /// Layout of the main mapping
    layout: Layout,

    /// Probe pages
    probes: Vec<(ProbeKind, Mapping)>,

    /// Number of header locks that were successfully initialized
    initialized_locks: usize,
}
//
impl SharedRegion {
    /// Map a region sized for `instances` stressor instances
    pub fn create(instances: usize) -> Result<Self, RegionError> {
        Self::with_options(instances, RegionOptions::default())
    }

    /// Map a region with custom options
    pub fn with_options(instances: usize, options: RegionOptions) -> Result<Self, RegionError> {
        if options.heap_size > u32::MAX as usize {
            return Err(RegionError::HeapTooLarge(options.heap_size));
        }
        let page_size = page_size();
        let layout = Layout::new(instances, options.heap_size, page_size);
        log::debug!(
            "Mapping {} bytes of shared memory for {instances} instance(s)",
            layout.total
        );
        let main = Mapping::new(layout.total, libc::PROT_READ | libc::PROT_WRITE)?;
        // SAFETY: The mapping was just created with this length
        unsafe { ptr::write_bytes(main.base.as_ptr(), 0, layout.guard_offset) };
        let mut region = Self {
            main,
            layout,
            probes: Vec::new(),
            initialized_locks: 0,
        };

        // Protect the trailing guard page, this is only best effort
        if options.guard_page {
            // SAFETY: The guard page is inside the mapping and never handed out
            let ret = unsafe {
                libc::mprotect(
                    region.main.base.as_ptr().add(layout.guard_offset).cast(),
                    page_size,
                    libc::PROT_NONE,
                )
            };
            if ret != 0 {
                log::warn!(
                    "Could not protect shared memory guard page: {}",
                    io::Error::last_os_error()
                );
            }
        }

        // Initialize the named locks, the region's Drop will clean up the
        // already initialized ones if one fails
        let header = region.header_ptr();
        // SAFETY: The header is zeroed, suitably aligned and not shared yet
        unsafe {
            for lock in [
                ptr::addr_of_mut!((*header).heap.lock),
                ptr::addr_of_mut!((*header).warn_lock),
                ptr::addr_of_mut!((*header).port_lock),
            ] {
                SharedLock::init(lock)?;
                region.initialized_locks += 1;
            }
        }

        // Map probe pages
        if options.probe_pages {
            for kind in ProbeKind::ALL {
                let mapping = Mapping::new(page_size, kind.protection())?;
                region.probes.push((kind, mapping));
            }
        }
        Ok(region)
    }

    /// Number of instance slots
    pub fn instances(&self) -> usize {
        self.layout.instances
    }

    /// Statistics slot of an instance
    pub fn stats(&self, slot: usize) -> &InstanceStats {
        assert!(slot < self.layout.instances, "Invalid instance slot {slot}");
        // SAFETY: In bounds per the assertion above, zeroed atomics are valid
        unsafe {
            &*(self
                .main
                .base
                .as_ptr()
                .add(self.layout.stats_offset + slot * STATS_STRIDE)
                as *const CachePadded<InstanceStats>)
        }
    }

    /// Checksum slot of an instance
    pub fn checksum(&self, slot: usize) -> &ChecksumSlot {
        assert!(slot < self.layout.instances, "Invalid instance slot {slot}");
        // SAFETY: In bounds per the assertion above, zeroed atomics are valid
        unsafe {
            &*(self
                .main
                .base
                .as_ptr()
                .add(self.layout.checksums_offset + slot * size_of::<ChecksumSlot>())
                as *const ChecksumSlot)
        }
    }

    /// Shared heap
    pub fn heap(&self) -> SharedHeap<'_> {
        // SAFETY: The heap area is inside the mapping and only used via SharedHeap
        unsafe {
            SharedHeap::new(
                &self.header().heap,
                self.main.base.as_ptr().add(self.layout.heap_offset),
                self.layout.heap_size as u32,
            )
        }
    }

    /// Raise a process-wide flag, telling whether this caller was the first
    pub fn warn_once(&self, key: WarnOnce) -> bool {
        let header = self.header();
        let mask = 1u64 << key.0;
        match header.warn_lock.acquire() {
            Ok(guard) => {
                let first = header.warned.load(Ordering::Relaxed) & mask == 0;
                header.warned.fetch_or(mask, Ordering::Relaxed);
                if let Err(e) = guard.release() {
                    log::error!("{e}");
                }
                first
            }
            Err(e) => {
                log::error!("{e}");
                header.warned.fetch_or(mask, Ordering::Relaxed) & mask == 0
            }
        }
    }

    /// Reserve the first free network port at or after `start`
    pub fn reserve_port(&self, start: u16) -> Result<Option<u16>, LockError> {
        let header = self.header();
        let guard = header.port_lock.acquire()?;
        let mut result = None;
        for port in start..=u16::MAX {
            let (word, mask) = port_word_and_mask(port);
            let value = header.ports[word].load(Ordering::Relaxed);
            if value & mask == 0 {
                header.ports[word].store(value | mask, Ordering::Relaxed);
                result = Some(port);
                break;
            }
        }
        guard.release()?;
        Ok(result)
    }

    /// Give back a previously reserved port
    pub fn release_port(&self, port: u16) -> Result<(), LockError> {
        let header = self.header();
        let guard = header.port_lock.acquire()?;
        let (word, mask) = port_word_and_mask(port);
        header.ports[word].fetch_and(!mask, Ordering::Relaxed);
        guard.release()
    }

    /// Address of a probe page, if probe pages were mapped
    pub fn probe_page(&self, kind: ProbeKind) -> Option<NonNull<u8>> {
        self.probes
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, mapping)| mapping.base)
    }

    /// Ask every instance to stop as soon as possible
    pub fn request_abort(&self) {
        self.header().abort.store(true, Ordering::Release);
    }

    /// Truth that an abort was requested
    pub fn abort_requested(&self) -> bool {
        self.header().abort.load(Ordering::Acquire)
    }

    /// Latest released start barrier generation
    pub(crate) fn barrier_generation(&self) -> u32 {
        self.header().go.load(Ordering::Acquire)
    }

    /// Release the start barrier of a given generation
    pub(crate) fn release_barrier(&self, generation: u32) {
        self.header().go.store(generation, Ordering::Release);
    }

    /// Lock protecting the warn-once flags
    #[cfg(test)]
    pub(crate) fn warn_lock(&self) -> &SharedLock {
        &self.header().warn_lock
    }

    /// Typed access to the header
    fn header(&self) -> &Header {
        // SAFETY: The header is at the start of the mapping and initialized
        unsafe { &*self.header_ptr() }
    }

    /// Raw pointer to the header
    fn header_ptr(&self) -> *mut Header {
        self.main.base.as_ptr() as *mut Header
    }
}
//
impl Drop for SharedRegion {
    fn drop(&mut self) {
        let header = self.header();
        let locks = [&header.heap.lock, &header.warn_lock, &header.port_lock];
        for lock in locks.into_iter().take(self.initialized_locks) {
            // SAFETY: The region is going away, nobody can use the lock anymore
            unsafe { lock.destroy() };
        }
        // Mappings are unmapped by their own Drop
    }
}

/// Failure to set up the shared region
#[derive(Debug, Error)]
pub enum RegionError {
    /// mmap() failed
    #[error("failed to map {0} bytes of shared memory ({1})")]
    Map(usize, io::Error),

    /// A named lock could not be set up
    #[error("failed to initialize a shared lock ({0})")]
    Lock(#[from] LockError),

    /// Requested heap cannot be addressed with 32-bit offsets
    #[error("shared heap size {0} is too large")]
    HeapTooLarge(usize),
}

/// System page size
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
}

/// Bitmap coordinates of a port
fn port_word_and_mask(port: u16) -> (usize, u64) {
    (usize::from(port) / 64, 1 << (port % 64))
}
