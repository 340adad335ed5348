//! Bump allocator living in the shared region
//!
//! The heap only ever grows: individual allocations are never freed, the
//! whole heap goes away with the region. Its main client is string interning,
//! which lets instances publish metric descriptions that the coordinator can
//! read back after they have exited.

use super::lock::{LockError, SharedLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

/// Bookkeeping of the shared heap, stored in the region header
#[repr(C)]
pub(crate) struct HeapHeader {
    /// Serializes allocations and list updates
    pub lock: SharedLock,

    /// Number of bytes handed out so far
    offset: AtomicU32,

    /// Offset + 1 of the most recently interned string, 0 if there is none
    head: AtomicU32,

    /// Set when an allocation could not be satisfied
    out_of_memory: AtomicBool,
}

/// Handle to an interned string
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HeapStr(u32);
//
impl HeapStr {
    /// Offset of the string node within the heap
    pub fn offset(self) -> u32 {
        self.0
    }

    /// Rebuild a handle from an offset that was previously produced by `offset()`
    pub fn from_offset(offset: u32) -> Self {
        Self(offset)
    }
}

/// Process-shared bump allocator
#[derive(Clone, Copy)]
pub struct SharedHeap<'region> {
    header: &'region HeapHeader,
    base: *mut u8,
    size: u32,
}
//
impl<'region> SharedHeap<'region> {
    /// Set up an interface to a heap
    ///
    /// # Safety
    ///
    /// `base` must point to `size` bytes of shared memory that outlive
    /// `'region` and are only ever accessed through `SharedHeap`.
    pub(crate) unsafe fn new(header: &'region HeapHeader, base: *mut u8, size: u32) -> Self {
        Self { header, base, size }
    }

    /// Number of bytes handed out so far
    pub fn used(&self) -> usize {
        self.header.offset.load(Ordering::Acquire) as usize
    }

    /// Capacity of the heap in bytes
    pub fn capacity(&self) -> usize {
        self.size as usize
    }

    /// Truth that an allocation failed at some point
    pub fn out_of_memory(&self) -> bool {
        self.header.out_of_memory.load(Ordering::Relaxed)
    }

    /// Allocate `size` bytes with a given power-of-two alignment
    ///
    /// Returns the offset of the allocation within the heap.
    ///
    pub fn alloc(&self, size: usize, align: usize) -> Result<u32, HeapError> {
        let guard = self.header.lock.acquire()?;
        let result = self.alloc_locked(size, align);
        guard.release()?;
        result
    }

    /// Intern a string, returning the existing copy if there is one
    pub fn intern(&self, s: &str) -> Result<HeapStr, HeapError> {
        let len = u32::try_from(s.len()).map_err(|_| HeapError::TooLarge(s.len()))?;
        let guard = self.header.lock.acquire()?;

        // Look for an identical string among those already interned
        let mut next = self.header.head.load(Ordering::Relaxed);
        while next != 0 {
            let node = next - 1;
            if self.node_str(node) == Some(s) {
                guard.release()?;
                return Ok(HeapStr(node));
            }
            next = self.read_u32(node);
        }

        // Not found, allocate a new node and push it at the head of the list
        let result = self
            .alloc_locked(NODE_HEADER + s.len(), NODE_ALIGN)
            .map(|node| {
                // SAFETY: alloc_locked checked that the node fits in the heap,
                //         nobody else can see it until it is linked below.
                unsafe {
                    let ptr = self.base.add(node as usize);
                    (ptr as *mut u32).write(self.header.head.load(Ordering::Relaxed));
                    (ptr.add(4) as *mut u32).write(len);
                    std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.add(NODE_HEADER), s.len());
                }
                self.header.head.store(node + 1, Ordering::Release);
                HeapStr(node)
            });
        guard.release()?;
        result
    }

    /// Read back an interned string
    pub fn get(&self, handle: HeapStr) -> Option<&'region str> {
        self.node_str(handle.0)
    }

    /// Allocation logic, must be called with the heap lock held
    fn alloc_locked(&self, size: usize, align: usize) -> Result<u32, HeapError> {
        debug_assert!(align.is_power_of_two());
        let offset = self.header.offset.load(Ordering::Relaxed) as usize;
        let start = (offset + align - 1) & !(align - 1);
        let end = start.checked_add(size).ok_or(HeapError::TooLarge(size))?;
        if end > self.size as usize {
            if !self.header.out_of_memory.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "Shared heap exhausted ({} of {} bytes used, {size} more requested)",
                    offset,
                    self.size
                );
            }
            return Err(HeapError::OutOfMemory(size));
        }
        self.header.offset.store(end as u32, Ordering::Release);
        Ok(start as u32)
    }

    /// Decode a string node, checking that it fits in the allocated area
    fn node_str(&self, node: u32) -> Option<&'region str> {
        let used = self.used();
        let start = node as usize + NODE_HEADER;
        if start > used || node as usize % NODE_ALIGN != 0 {
            return None;
        }
        let len = self.read_u32(node + 4) as usize;
        if start + len > used {
            return None;
        }
        // SAFETY: Bounds were checked above, allocated nodes are immutable
        let bytes = unsafe { std::slice::from_raw_parts(self.base.add(start), len) };
        std::str::from_utf8(bytes).ok()
    }

    /// Read a 4-byte integer at a 4-aligned offset
    fn read_u32(&self, offset: u32) -> u32 {
        debug_assert!(offset as usize + 4 <= self.size as usize);
        // SAFETY: Callers only pass offsets of allocated node headers
        unsafe { (self.base.add(offset as usize) as *const u32).read() }
    }
}

/// Error while allocating from the shared heap
#[derive(Debug, Error)]
pub enum HeapError {
    /// The heap lock is broken
    #[error("failed to lock the shared heap ({0})")]
    Lock(#[from] LockError),

    /// Not enough room left
    #[error("shared heap is out of memory ({0} bytes requested)")]
    OutOfMemory(usize),

    /// Allocation too large to be represented
    #[error("allocation of {0} bytes is too large for the shared heap")]
    TooLarge(usize),
}

/// Size of a string node header (next link + length)
const NODE_HEADER: usize = 8;

/// Alignment of string nodes
const NODE_ALIGN: usize = 8;
