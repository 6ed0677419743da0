//! Counting semaphores.

use crate::arena::{Arena, RawHandle};
use crate::config::MAX_SEMAPHORES;
use crate::error::{KernelError, OsalError, OsalResult};
use crate::port::Kernel;
use crate::sync::thread_context;
use crate::time::{self, Wait, WaitMode};

pub type SemaphoreArena<K> = Arena<<K as Kernel>::Semaphore, MAX_SEMAPHORES>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SemaphoreHandle(RawHandle);

pub struct Semaphores<'a, K: Kernel> {
    kernel: &'a K,
    arena: &'a SemaphoreArena<K>,
}

impl<K: Kernel> Clone for Semaphores<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kernel> Copy for Semaphores<'_, K> {}

impl<'a, K: Kernel> Semaphores<'a, K> {
    pub(crate) fn new(kernel: &'a K, arena: &'a SemaphoreArena<K>) -> Self {
        Semaphores { kernel, arena }
    }

    pub fn create(&self, initial: u32) -> OsalResult<SemaphoreHandle> {
        thread_context(self.kernel)?;
        let Some((raw, object)) = self.arena.claim() else {
            os_log!(warn, "semaphore arena exhausted");
            return Err(OsalError::OutOfResources);
        };
        match self.kernel.sem_create(object, initial) {
            Ok(()) => {
                self.arena.publish(raw);
                os_log!(debug, "semaphore {} created, count {}", raw.index(), initial);
                Ok(SemaphoreHandle(raw))
            }
            Err(e) => {
                self.arena.abandon(raw);
                os_log!(error, "semaphore create failed: {}", e);
                Err(OsalError::OutOfResources)
            }
        }
    }

    /// Take one unit, waiting up to `millis` (0 waits forever). Returns the
    /// count left.
    pub fn wait(&self, handle: SemaphoreHandle, millis: u32) -> OsalResult<u32> {
        self.wait_with(handle, time::translate(millis))
    }

    /// Take one unit only if available now. Usable from interrupt context.
    pub fn try_wait(&self, handle: SemaphoreHandle) -> OsalResult<u32> {
        self.wait_with(handle, Wait::NoWait)
    }

    fn wait_with(&self, handle: SemaphoreHandle, wait: Wait) -> OsalResult<u32> {
        if wait.mode() == WaitMode::Blocking {
            thread_context(self.kernel)?;
        }
        let object = self.arena.get(handle.0)?;
        self.kernel.sem_pend(object, wait).map_err(|e| match e {
            KernelError::WouldBlock => OsalError::Timeout,
            e => e.into(),
        })
    }

    /// Give one unit, waking the most urgent waiter if any.
    pub fn signal(&self, handle: SemaphoreHandle) -> OsalResult<()> {
        let object = self.arena.get(handle.0)?;
        self.kernel.sem_post(object).map_err(|e| {
            os_log!(error, "semaphore {} signal failed: {}", handle.0.index(), e);
            OsalError::from(e)
        })
    }

    /// Delete and invalidate the handle. Blocked waiters are woken with
    /// `Deleted`.
    pub fn delete(&self, handle: SemaphoreHandle) -> OsalResult<()> {
        thread_context(self.kernel)?;
        let object = self.arena.close(handle.0)?;
        let waiters = self.kernel.sem_waiters(object);
        if let Err(e) = self.kernel.sem_delete(object) {
            self.arena.reopen(handle.0);
            return Err(e.into());
        }
        self.arena.retire(handle.0);
        if waiters > 0 {
            os_log!(warn, "semaphore {} deleted with {} waiters", handle.0.index(), waiters);
        }
        Ok(())
    }

    pub fn is_valid(&self, handle: SemaphoreHandle) -> bool {
        self.arena.is_live(handle.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Misuse;
    use crate::port::host::HostKernel;
    use crate::test_util::wait_for;
    use crate::Osal;
    use core::pin::pin;

    #[test]
    fn wait_returns_remaining_count() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let sems = osal.as_ref().semaphores();
        let s = sems.create(3).unwrap();

        assert_eq!(sems.wait(s, 0), Ok(2));
        assert_eq!(sems.wait(s, 10), Ok(1));
        assert_eq!(sems.try_wait(s), Ok(0));
        assert_eq!(sems.try_wait(s), Err(OsalError::Timeout));
        assert_eq!(sems.wait(s, 5), Err(OsalError::Timeout));
        sems.signal(s).unwrap();
        assert_eq!(sems.wait(s, 5), Ok(0));
    }

    #[test]
    fn signal_releases_one_waiter() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let sems = osal.semaphores();
        let s = sems.create(0).unwrap();

        std::thread::scope(|scope| {
            let a = scope.spawn(|| sems.wait(s, 0));
            let b = scope.spawn(|| sems.wait(s, 2000));
            wait_for(|| kernel.sem_waiters(osal.semaphores.get(s.0).unwrap()) == 2);
            sems.signal(s).unwrap();
            wait_for(|| kernel.sem_waiters(osal.semaphores.get(s.0).unwrap()) == 1);
            sems.signal(s).unwrap();
            assert_eq!(a.join().unwrap(), Ok(0));
            assert_eq!(b.join().unwrap(), Ok(0));
        });
    }

    #[test]
    fn signal_from_interrupt() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let sems = osal.as_ref().semaphores();
        let s = sems.create(0).unwrap();

        kernel.interrupt(|| sems.signal(s)).unwrap();
        assert_eq!(kernel.interrupt(|| sems.try_wait(s)), Ok(0));
        assert_eq!(
            kernel.interrupt(|| sems.wait(s, 0)),
            Err(OsalError::Misuse(Misuse::InterruptContext))
        );
    }

    #[test]
    fn delete_wakes_waiters_with_error() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let sems = osal.semaphores();
        let s = sems.create(0).unwrap();

        std::thread::scope(|scope| {
            let waiters: std::vec::Vec<_> = (0..2).map(|_| scope.spawn(|| sems.wait(s, 0))).collect();
            wait_for(|| kernel.sem_waiters(osal.semaphores.get(s.0).unwrap()) == 2);
            sems.delete(s).unwrap();
            for w in waiters {
                assert_eq!(w.join().unwrap(), Err(OsalError::Deleted));
            }
        });
        assert!(!sems.is_valid(s));
        assert_eq!(sems.signal(s), Err(OsalError::InvalidHandle));
    }
}
