//! Concurrency adapter between a priority-preemptive RTOS and lwIP.
//!
//! [`Osal`] owns every piece of memory the adapter hands to the kernel:
//! thread control blocks and stacks, the mutex, semaphore and mailbox
//! arenas, the critical-section counter and the health monitor. It borrows
//! the kernel through the [`Kernel`] port trait and must be pinned, usually
//! in a `StaticCell`, because the kernel keeps pointers into it.
//!
//! ```text
//! Osal (pinned)
//!   ├── critical()    CriticalSection, nestable
//!   ├── threads()     Threads over ThreadTable pools
//!   ├── mutexes()     ┐
//!   ├── semaphores()  ├ views over arenas, Copy handles
//!   ├── mailboxes()   ┘
//!   ├── health()      HealthMonitor, driven by on_tick / on_stat
//!   └── sys_arch()    lwIP sys_arch contract
//! ```
//!
//! # Example
//!
//! ```ignore
//! use core::pin::Pin;
//! use osal_sysarch::{Osal, port::host::HostKernel};
//! use static_cell::StaticCell;
//!
//! static KERNEL: StaticCell<HostKernel> = StaticCell::new();
//! static OSAL: StaticCell<Osal<'static, HostKernel>> = StaticCell::new();
//!
//! let kernel: &'static HostKernel = KERNEL.init(HostKernel::new());
//! let osal = Pin::static_ref(&*OSAL.init(Osal::new(kernel)));
//!
//! let sem = osal.semaphores().create(0)?;
//! osal.semaphores().signal(sem)?;
//! ```

#![cfg_attr(not(any(test, feature = "host")), no_std)]

#[macro_use]
mod log;

/// Compile-time check that a type is `!Send`. If it were `Send`, both
/// impls would apply and the call below would be ambiguous.
#[cfg(test)]
macro_rules! assert_not_send {
    ($ty:ty) => {
        const _: fn() = || {
            trait AmbiguousIfSend<A> {
                fn check() {}
            }
            impl<T: ?Sized> AmbiguousIfSend<()> for T {}
            #[allow(dead_code)]
            struct IsSend;
            impl<T: ?Sized + Send> AmbiguousIfSend<IsSend> for T {}
            let _ = <$ty as AmbiguousIfSend<_>>::check;
        };
    };
}

pub mod arena;
pub mod config;
pub mod critical;
pub mod error;
pub mod health;
pub mod pool;
pub mod port;
pub mod sync;
pub mod sys_arch;
pub mod thread;
pub mod time;

use core::marker::PhantomPinned;
use core::pin::Pin;

pub use critical::{CriticalGuard, CriticalSection};
pub use error::{KernelError, Misuse, OsalError, OsalResult};
pub use health::{HealthMonitor, HealthSnapshot, LoadAverage};
pub use port::{Kernel, Msg, Priority, TaskId, TaskState};
pub use sync::mailbox::{MailboxHandle, Mailboxes};
pub use sync::mutex::{MutexGuard, MutexHandle, Mutexes};
pub use sync::semaphore::{SemaphoreHandle, Semaphores};
pub use sys_arch::SysArch;
pub use thread::{ThreadHandle, ThreadRef, ThreadTable, Threads};

use config::{LOAD_WINDOW_TICKS, MAX_THREADS};
use sync::mailbox::MailboxArena;
use sync::mutex::MutexArena;
use sync::semaphore::SemaphoreArena;

pub struct Osal<'k, K: Kernel> {
    kernel: &'k K,
    critical: CriticalSection<'k, K>,
    threads: ThreadTable<K, MAX_THREADS>,
    mutexes: MutexArena<K>,
    semaphores: SemaphoreArena<K>,
    mailboxes: MailboxArena<K>,
    health: HealthMonitor,
    _pin: PhantomPinned,
}

impl<'k, K: Kernel> Osal<'k, K> {
    pub fn new(kernel: &'k K) -> Self {
        Osal {
            kernel,
            critical: CriticalSection::new(kernel),
            threads: ThreadTable::new(),
            mutexes: MutexArena::<K>::new(),
            semaphores: SemaphoreArena::<K>::new(),
            mailboxes: MailboxArena::<K>::new(),
            health: HealthMonitor::new(LOAD_WINDOW_TICKS),
            _pin: PhantomPinned,
        }
    }

    pub fn kernel(&self) -> &'k K {
        self.kernel
    }

    pub fn critical<'a>(self: Pin<&'a Self>) -> &'a CriticalSection<'k, K> {
        &self.get_ref().critical
    }

    pub fn threads<'a>(self: Pin<&'a Self>) -> Threads<'a, K> {
        let this = self.get_ref();
        // SAFETY: the table is structurally pinned; `Osal` never moves it out.
        let table = unsafe { self.map_unchecked(|osal| &osal.threads) };
        Threads::new(this.kernel, table)
    }

    pub fn mutexes<'a>(self: Pin<&'a Self>) -> Mutexes<'a, K> {
        let this = self.get_ref();
        Mutexes::new(this.kernel, &this.mutexes)
    }

    pub fn semaphores<'a>(self: Pin<&'a Self>) -> Semaphores<'a, K> {
        let this = self.get_ref();
        Semaphores::new(this.kernel, &this.semaphores)
    }

    pub fn mailboxes<'a>(self: Pin<&'a Self>) -> Mailboxes<'a, K> {
        let this = self.get_ref();
        Mailboxes::new(this.kernel, &this.mailboxes, &this.critical)
    }

    pub fn health<'a>(self: Pin<&'a Self>) -> &'a HealthMonitor {
        &self.get_ref().health
    }

    pub fn sys_arch<'a>(self: Pin<&'a Self>) -> SysArch<'a, 'k, K> {
        SysArch::new(self)
    }

    /// Kernel tick count; wraps.
    pub fn tick_count(&self) -> u32 {
        self.kernel.time_get()
    }

    /// Milliseconds since the kernel started; wraps.
    pub fn now_ms(&self) -> u32 {
        time::ticks_to_millis(self.kernel.time_get())
    }

    /// Sleep the calling task for at least `millis` (rounded down to ticks,
    /// one tick minimum). A zero delay returns at once. Thread context only.
    pub fn delay(&self, millis: u32) -> OsalResult<()> {
        sync::thread_context(self.kernel)?;
        if millis != 0 {
            self.kernel.time_delay(time::translate(millis).ticks());
        }
        Ok(())
    }

    /// Call from the kernel tick hook.
    pub fn on_tick(&self) {
        self.health.on_tick(self.kernel);
    }

    /// Call from the kernel statistics task hook. Returns `true` when a
    /// report was written to `sink`.
    pub fn on_stat(&self, sink: &mut impl core::fmt::Write) -> bool {
        self.health.on_stat(self.kernel, sink)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::time::{Duration, Instant};

    /// Poll `cond` until it holds; panics after five seconds.
    pub fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::host::HostKernel;
    use core::pin::pin;

    #[test]
    fn views_share_storage() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();

        let m = osal.mutexes().create().unwrap();
        assert!(osal.mutexes().is_valid(m));
        assert_eq!(osal.mutexes.live(), 1);
        let s = osal.semaphores().create(1).unwrap();
        assert_eq!(osal.semaphores().try_wait(s), Ok(0));
        let mb = osal.mailboxes().create(4).unwrap();
        assert_eq!(osal.mailboxes().len(mb), Ok(0));
    }

    #[test]
    fn delay_and_clock() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();

        let start = osal.now_ms();
        osal.delay(0).unwrap();
        osal.delay(15).unwrap();
        assert!(osal.now_ms().wrapping_sub(start) >= 15);
        assert!(osal.tick_count() >= 15);
    }

    #[test]
    fn delay_from_interrupt_is_refused() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();

        let start = std::time::Instant::now();
        assert_eq!(
            kernel.interrupt(|| osal.delay(50)),
            Err(OsalError::Misuse(Misuse::InterruptContext))
        );
        assert_eq!(kernel.interrupt(|| osal.delay(0)), Err(OsalError::Misuse(Misuse::InterruptContext)));
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[test]
    fn hooks_reach_the_health_monitor() {
        let kernel = HostKernel::new();
        kernel.add_task(3, TaskState::Ready);
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();

        for _ in 0..LOAD_WINDOW_TICKS {
            osal.on_tick();
        }
        assert_eq!(osal.health().sampler().read(), Some(LoadAverage(100)));

        let mut out = std::string::String::new();
        let reports = (0..config::REPORT_DECIMATION)
            .filter(|_| osal.on_stat(&mut out))
            .count();
        assert_eq!(reports, 1);
        assert!(out.starts_with("Tasks: 1 total, 1 Ready 0 sleeping 0 Suspended\r\n"));
        assert!(out.contains("Load Average:1.00(10ms)"));
    }
}
