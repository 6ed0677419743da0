//! Kernel mutexes behind arena handles.
//!
//! ```text
//! Osal::mutexes()
//!       │ create()
//!       ▼
//! MutexHandle ── lock(ms) / try_lock() / unlock() / delete()
//!       │
//!       │ guard(ms)
//!       ▼
//! MutexGuard (unlocks on drop)
//! ```
//!
//! Mutexes are not recursive. Locking a mutex the caller already holds is
//! reported as [`Misuse::RecursiveLock`] instead of deadlocking.

use core::marker::PhantomData;

use crate::arena::{Arena, RawHandle};
use crate::config::MAX_MUTEXES;
use crate::error::{misuse, KernelError, Misuse, OsalError, OsalResult};
use crate::port::Kernel;
use crate::sync::thread_context;
use crate::time::{self, Wait};

pub type MutexArena<K> = Arena<<K as Kernel>::Mutex, MAX_MUTEXES>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MutexHandle(RawHandle);

pub struct Mutexes<'a, K: Kernel> {
    kernel: &'a K,
    arena: &'a MutexArena<K>,
}

impl<K: Kernel> Clone for Mutexes<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kernel> Copy for Mutexes<'_, K> {}

impl<'a, K: Kernel> Mutexes<'a, K> {
    pub(crate) fn new(kernel: &'a K, arena: &'a MutexArena<K>) -> Self {
        Mutexes { kernel, arena }
    }

    pub fn create(&self) -> OsalResult<MutexHandle> {
        thread_context(self.kernel)?;
        let Some((raw, object)) = self.arena.claim() else {
            os_log!(warn, "mutex arena exhausted");
            return Err(OsalError::OutOfResources);
        };
        match self.kernel.mutex_create(object) {
            Ok(()) => {
                self.arena.publish(raw);
                os_log!(debug, "mutex {} created", raw.index());
                Ok(MutexHandle(raw))
            }
            Err(e) => {
                self.arena.abandon(raw);
                os_log!(error, "mutex create failed: {}", e);
                Err(OsalError::OutOfResources)
            }
        }
    }

    /// Lock, waiting up to `millis` (0 waits forever).
    pub fn lock(&self, handle: MutexHandle, millis: u32) -> OsalResult<()> {
        self.lock_with(handle, time::translate(millis))
    }

    /// Lock only if the mutex is free right now.
    pub fn try_lock(&self, handle: MutexHandle) -> OsalResult<()> {
        self.lock_with(handle, Wait::NoWait)
    }

    fn lock_with(&self, handle: MutexHandle, wait: Wait) -> OsalResult<()> {
        thread_context(self.kernel)?;
        let object = self.arena.get(handle.0)?;
        if self.kernel.mutex_owner(object) == Some(self.kernel.task_current()) {
            return Err(misuse(Misuse::RecursiveLock));
        }
        self.kernel.mutex_pend(object, wait).map_err(|e| match e {
            KernelError::WouldBlock => OsalError::Timeout,
            e => e.into(),
        })
    }

    /// Lock and return a guard that unlocks on drop.
    pub fn guard(&self, handle: MutexHandle, millis: u32) -> OsalResult<MutexGuard<'a, K>> {
        self.lock(handle, millis)?;
        Ok(MutexGuard {
            mutexes: *self,
            handle,
            _not_send: PhantomData,
        })
    }

    /// Unlock. Fails with `NotOwner` if the caller does not hold the mutex,
    /// which includes unlocking twice.
    pub fn unlock(&self, handle: MutexHandle) -> OsalResult<()> {
        thread_context(self.kernel)?;
        let object = self.arena.get(handle.0)?;
        self.kernel.mutex_post(object).map_err(|e| {
            os_log!(error, "mutex {} unlock failed: {}", handle.0.index(), e);
            OsalError::from(e)
        })
    }

    /// Delete and invalidate the handle.
    ///
    /// Waiters are woken with `Deleted`. Deleting a mutex someone is waiting
    /// for still happens, but is reported as
    /// [`Misuse::WaitersOnDelete`].
    pub fn delete(&self, handle: MutexHandle) -> OsalResult<()> {
        thread_context(self.kernel)?;
        let object = self.arena.close(handle.0)?;
        let waiters = self.kernel.mutex_waiters(object);
        if let Err(e) = self.kernel.mutex_delete(object) {
            self.arena.reopen(handle.0);
            return Err(e.into());
        }
        self.arena.retire(handle.0);
        os_log!(debug, "mutex {} deleted", handle.0.index());
        if waiters > 0 {
            return Err(misuse(Misuse::WaitersOnDelete(waiters)));
        }
        Ok(())
    }

    pub fn is_valid(&self, handle: MutexHandle) -> bool {
        self.arena.is_live(handle.0)
    }
}

/// Held mutex; unlocks when dropped.
///
/// `!Send`: a kernel mutex is owned by the task that locked it.
#[must_use = "if unused, the mutex will immediately unlock"]
pub struct MutexGuard<'a, K: Kernel> {
    mutexes: Mutexes<'a, K>,
    handle: MutexHandle,
    _not_send: PhantomData<*const ()>,
}

impl<K: Kernel> MutexGuard<'_, K> {
    pub fn handle(&self) -> MutexHandle {
        self.handle
    }
}

impl<K: Kernel> Drop for MutexGuard<'_, K> {
    fn drop(&mut self) {
        let _ = self.mutexes.unlock(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::host::HostKernel;
    use crate::test_util::wait_for;
    use crate::Osal;
    use core::pin::pin;
    use std::time::{Duration, Instant};

    // The kernel ties mutex ownership to the locking task.
    assert_not_send!(MutexGuard<'static, HostKernel>);

    #[test]
    fn lock_unlock() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let mutexes = osal.as_ref().mutexes();

        let m = mutexes.create().unwrap();
        mutexes.lock(m, 0).unwrap();
        mutexes.unlock(m).unwrap();
        mutexes.try_lock(m).unwrap();
        mutexes.unlock(m).unwrap();
        mutexes.delete(m).unwrap();
    }

    #[test]
    fn unlock_without_holding_fails() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let mutexes = osal.as_ref().mutexes();
        let m = mutexes.create().unwrap();

        assert_eq!(mutexes.unlock(m), Err(OsalError::NotOwner));
        mutexes.lock(m, 0).unwrap();
        mutexes.unlock(m).unwrap();
        assert_eq!(mutexes.unlock(m), Err(OsalError::NotOwner));
    }

    #[test]
    fn recursive_lock_is_misuse() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let mutexes = osal.as_ref().mutexes();
        let m = mutexes.create().unwrap();

        mutexes.lock(m, 0).unwrap();
        assert_eq!(
            mutexes.lock(m, 10),
            Err(OsalError::Misuse(Misuse::RecursiveLock))
        );
        mutexes.unlock(m).unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let mutexes = osal.as_ref().mutexes();
        let m = mutexes.create().unwrap();
        mutexes.lock(m, 0).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(mutexes.try_lock(m), Err(OsalError::Timeout));
                let start = Instant::now();
                assert_eq!(mutexes.lock(m, 15), Err(OsalError::Timeout));
                assert!(start.elapsed() >= Duration::from_millis(15));
            });
        });
        mutexes.unlock(m).unwrap();
    }

    #[test]
    fn guard_releases_for_the_next_waiter() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let mutexes = osal.as_ref().mutexes();
        let m = mutexes.create().unwrap();

        let guard = mutexes.guard(m, 0).unwrap();
        std::thread::scope(|s| {
            let waiter = s.spawn(|| {
                let g = mutexes.guard(m, 0).unwrap();
                g.handle()
            });
            wait_for(|| kernel.mutex_waiters(osal.mutexes.get(m.0).unwrap()) == 1);
            drop(guard);
            assert_eq!(waiter.join().unwrap(), m);
        });
        mutexes.try_lock(m).unwrap();
        mutexes.unlock(m).unwrap();
    }

    #[test]
    fn delete_with_waiter_wakes_it_and_reports() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let mutexes = osal.mutexes();
        let m = mutexes.create().unwrap();
        mutexes.lock(m, 0).unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| mutexes.lock(m, 0));
            wait_for(|| kernel.mutex_waiters(osal.mutexes.get(m.0).unwrap()) == 1);
            assert_eq!(
                mutexes.delete(m),
                Err(OsalError::Misuse(Misuse::WaitersOnDelete(1)))
            );
            assert_eq!(waiter.join().unwrap(), Err(OsalError::Deleted));
        });
        assert!(!mutexes.is_valid(m));
        assert_eq!(mutexes.lock(m, 0), Err(OsalError::InvalidHandle));
        assert_eq!(mutexes.delete(m), Err(OsalError::InvalidHandle));
    }

    #[test]
    fn interrupt_context_is_refused() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let mutexes = osal.as_ref().mutexes();
        let m = mutexes.create().unwrap();

        let misuse = Err(OsalError::Misuse(Misuse::InterruptContext));
        assert_eq!(kernel.interrupt(|| mutexes.lock(m, 0)), misuse);
        assert_eq!(kernel.interrupt(|| mutexes.try_lock(m)), misuse);
        assert_eq!(kernel.interrupt(|| mutexes.create()).map(|_| ()), misuse);
    }

    #[test]
    fn arena_exhaustion_is_out_of_resources() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let mutexes = osal.as_ref().mutexes();
        let handles: std::vec::Vec<_> = (0..MAX_MUTEXES).map(|_| mutexes.create().unwrap()).collect();
        assert_eq!(mutexes.create(), Err(OsalError::OutOfResources));
        mutexes.delete(handles[3]).unwrap();
        let again = mutexes.create().unwrap();
        assert_ne!(again, handles[3]);
    }
}
