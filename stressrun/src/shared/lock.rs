//! Process-shared mutual exclusion
//!
//! Locks live inside the shared region and are contended by the coordinator
//! and every forked instance. They wrap a `pthread_mutex_t` configured with
//! `PTHREAD_PROCESS_SHARED` and `PTHREAD_MUTEX_ROBUST`, provide no reentrancy
//! and no fairness beyond what the OS offers, and must never be held across a
//! blocking syscall.
//!
//! Instances may be killed at any time (SIGKILL escalation, OOM killer). When
//! one dies while holding a lock, the next process to acquire it marks it
//! consistent again and carries on.

use std::{cell::UnsafeCell, io, mem::MaybeUninit};
use thiserror::Error;

/// Mutex that can be shared across `fork()`
#[repr(C)]
pub struct SharedLock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
}
//
// SAFETY: The pthread mutex is designed for concurrent access, and once
//         initialized as process-shared it may be used from any process
//         that inherited the mapping.
unsafe impl Sync for SharedLock {}
unsafe impl Send for SharedLock {}
//
impl SharedLock {
    /// Initialize a lock in place
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory that lives in a shared mapping,
    /// is suitably aligned, and is not used by anyone else until this
    /// function returns.
    pub(crate) unsafe fn init(this: *mut Self) -> Result<(), LockError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
        let result = check(libc::pthread_mutexattr_setpshared(
            attr.as_mut_ptr(),
            libc::PTHREAD_PROCESS_SHARED,
        ))
        .and_then(|()| {
            check(libc::pthread_mutexattr_setrobust(
                attr.as_mut_ptr(),
                libc::PTHREAD_MUTEX_ROBUST,
            ))
        })
        .and_then(|()| check(libc::pthread_mutex_init((*this).mutex.get(), attr.as_ptr())));
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        result
    }

    /// Release OS resources associated with the lock
    ///
    /// # Safety
    ///
    /// Nobody may use the lock after this is called.
    pub(crate) unsafe fn destroy(&self) {
        libc::pthread_mutex_destroy(self.mutex.get());
    }

    /// Acquire the lock
    pub fn acquire(&self) -> Result<LockGuard<'_>, LockError> {
        // SAFETY: The mutex was initialized by `init()` before the region was
        //         handed out.
        let ret = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        if ret == libc::EOWNERDEAD {
            log::warn!("A process died while holding a shared lock, recovering it");
            // SAFETY: EOWNERDEAD means we now hold the mutex
            check(unsafe { libc::pthread_mutex_consistent(self.mutex.get()) })?;
        } else {
            check(ret)?;
        }
        Ok(LockGuard {
            lock: self,
            released: false,
        })
    }

    /// Release the lock, reporting OS errors
    fn release(&self) -> Result<(), LockError> {
        // SAFETY: Only called by a LockGuard, which proves we hold the mutex
        check(unsafe { libc::pthread_mutex_unlock(self.mutex.get()) })
    }
}

/// Proof that a `SharedLock` is held, releases it on drop
#[must_use]
pub struct LockGuard<'lock> {
    lock: &'lock SharedLock,
    released: bool,
}
//
impl LockGuard<'_> {
    /// Release the lock explicitly, reporting OS errors
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release()
    }
}
//
impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release() {
                log::error!("Failed to release shared lock: {e}");
            }
        }
    }
}

/// Failure of the underlying OS locking primitive
#[derive(Debug, Error)]
#[error("shared lock operation failed ({0})")]
pub struct LockError(#[from] io::Error);

/// Translate a pthread return code into a Result
fn check(ret: libc::c_int) -> Result<(), LockError> {
    if ret == 0 {
        Ok(())
    } else {
        Err(LockError(io::Error::from_raw_os_error(ret)))
    }
}
