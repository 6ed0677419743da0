//! lwIP `sys_arch` port.
//!
//! Maps the OS-porting contract of lwIP onto the adapter. Handle holders
//! play the role of `sys_mutex_t`, `sys_sem_t` and `sys_mbox_t`: they start
//! out invalid, become valid on a successful `*_new`, and are invalidated by
//! `*_free`. Calls that return nothing in the C contract report failures
//! through [`lwip_assert!`], which logs and trips in debug builds.
//!
//! | lwIP | here |
//! |------|------|
//! | `sys_now` | [`SysArch::sys_now`] |
//! | `sys_arch_protect` / `unprotect` | critical section, nestable |
//! | `sys_thread_new` | thread manager, stack size in bytes |
//! | `sys_arch_sem_wait` | elapsed ms or [`SYS_ARCH_TIMEOUT`] |
//! | `sys_arch_mbox_fetch` | elapsed ms or [`SYS_ARCH_TIMEOUT`] |
//! | `sys_arch_mbox_tryfetch` | 0 or [`SYS_MBOX_EMPTY`] |

use core::pin::Pin;

use crate::config::LWIP_DEFAULT_PRIORITY;
use crate::error::OsalError;
use crate::port::{Kernel, Msg, ThreadEntry};
use crate::sync::mailbox::MailboxHandle;
use crate::sync::mutex::MutexHandle;
use crate::sync::semaphore::SemaphoreHandle;
use crate::thread::ThreadHandle;
use crate::Osal;

/// lwIP `err_t`.
pub type ErrT = i8;
/// lwIP `sys_prot_t`: critical section depth before `sys_arch_protect`.
pub type SysProt = u32;

pub const ERR_OK: ErrT = 0;
pub const ERR_MEM: ErrT = -1;
pub const ERR_TIMEOUT: ErrT = -3;
pub const ERR_VAL: ErrT = -6;
pub const ERR_ARG: ErrT = -16;

pub const SYS_ARCH_TIMEOUT: u32 = 0xFFFF_FFFF;
pub const SYS_MBOX_EMPTY: u32 = SYS_ARCH_TIMEOUT;

macro_rules! holder {
    ($(#[$meta:meta])* $name:ident, $handle:ty) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name(Option<$handle>);

        impl $name {
            pub fn is_valid(&self) -> bool {
                self.0.is_some()
            }

            pub fn set_invalid(&mut self) {
                self.0 = None;
            }

            pub fn handle(&self) -> Option<$handle> {
                self.0
            }
        }
    };
}

holder!(
    /// `sys_mutex_t`
    SysMutex,
    MutexHandle
);
holder!(
    /// `sys_sem_t`
    SysSem,
    SemaphoreHandle
);
holder!(
    /// `sys_mbox_t`
    SysMbox,
    MailboxHandle
);
holder!(
    /// `sys_thread_t`; invalid if creation failed.
    SysThread,
    ThreadHandle
);

pub struct SysArch<'a, 'k, K: Kernel> {
    osal: Pin<&'a Osal<'k, K>>,
}

impl<K: Kernel> Clone for SysArch<'_, '_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kernel> Copy for SysArch<'_, '_, K> {}

impl<'a, 'k, K: Kernel> SysArch<'a, 'k, K> {
    pub(crate) fn new(osal: Pin<&'a Osal<'k, K>>) -> Self {
        SysArch { osal }
    }

    pub fn sys_init(&self) {
        os_log!(info, "sys_arch up, tick {}", self.osal.tick_count());
    }

    /// Milliseconds since boot; wraps.
    pub fn sys_now(&self) -> u32 {
        self.osal.now_ms()
    }

    pub fn sys_msleep(&self, ms: u32) {
        let slept = self.osal.delay(ms);
        lwip_assert!(slept.is_ok(), "sys_msleep({}) from interrupt context", ms);
    }

    pub fn sys_arch_protect(&self) -> SysProt {
        self.osal.critical().enter()
    }

    pub fn sys_arch_unprotect(&self, pval: SysProt) {
        let critical = self.osal.critical();
        lwip_assert!(
            critical.depth() == pval + 1,
            "sys_arch_unprotect({}) at depth {}",
            pval,
            critical.depth()
        );
        let exited = critical.exit();
        lwip_assert!(exited.is_ok(), "sys_arch_unprotect without protect");
    }

    /// Start an lwIP thread. `stacksize` is in bytes (0 or negative selects
    /// the default stack); a negative `prio` selects
    /// [`LWIP_DEFAULT_PRIORITY`].
    pub fn sys_thread_new(
        &self,
        name: &str,
        thread: ThreadEntry,
        arg: usize,
        stacksize: i32,
        prio: i32,
    ) -> SysThread {
        let stack_words = usize::try_from(stacksize).map_or(0, |bytes| bytes.div_ceil(4));
        let priority = match u8::try_from(prio) {
            Ok(p) => p,
            Err(_) if prio < 0 => LWIP_DEFAULT_PRIORITY,
            Err(_) => u8::MAX,
        };
        let created = self.osal.threads().create(thread, arg, priority, stack_words);
        lwip_assert!(created.is_ok(), "sys_thread_new({}) failed", name);
        if created.is_ok() {
            os_log!(debug, "lwIP thread {} started at priority {}", name, priority);
        }
        SysThread(created.ok())
    }

    pub fn sys_mutex_new(&self, mutex: &mut SysMutex) -> ErrT {
        match self.osal.mutexes().create() {
            Ok(handle) => {
                mutex.0 = Some(handle);
                ERR_OK
            }
            Err(e) => err_code(e),
        }
    }

    pub fn sys_mutex_lock(&self, mutex: &SysMutex) {
        lwip_assert!(mutex.is_valid(), "sys_mutex_lock on invalid mutex");
        if let Some(handle) = mutex.0 {
            let locked = self.osal.mutexes().lock(handle, 0);
            lwip_assert!(locked.is_ok(), "sys_mutex_lock failed");
        }
    }

    pub fn sys_mutex_unlock(&self, mutex: &SysMutex) {
        lwip_assert!(mutex.is_valid(), "sys_mutex_unlock on invalid mutex");
        if let Some(handle) = mutex.0 {
            let unlocked = self.osal.mutexes().unlock(handle);
            lwip_assert!(unlocked.is_ok(), "sys_mutex_unlock failed");
        }
    }

    pub fn sys_mutex_free(&self, mutex: &mut SysMutex) {
        lwip_assert!(mutex.is_valid(), "sys_mutex_free on invalid mutex");
        if let Some(handle) = mutex.0.take() {
            let deleted = self.osal.mutexes().delete(handle);
            lwip_assert!(deleted.is_ok(), "sys_mutex_free failed");
        }
    }

    pub fn sys_sem_new(&self, sem: &mut SysSem, count: u8) -> ErrT {
        match self.osal.semaphores().create(u32::from(count)) {
            Ok(handle) => {
                sem.0 = Some(handle);
                ERR_OK
            }
            Err(e) => err_code(e),
        }
    }

    pub fn sys_sem_signal(&self, sem: &SysSem) {
        lwip_assert!(sem.is_valid(), "sys_sem_signal on invalid semaphore");
        if let Some(handle) = sem.0 {
            let signalled = self.osal.semaphores().signal(handle);
            lwip_assert!(signalled.is_ok(), "sys_sem_signal failed");
        }
    }

    pub fn sys_sem_free(&self, sem: &mut SysSem) {
        lwip_assert!(sem.is_valid(), "sys_sem_free on invalid semaphore");
        if let Some(handle) = sem.0.take() {
            let deleted = self.osal.semaphores().delete(handle);
            lwip_assert!(deleted.is_ok(), "sys_sem_free failed");
        }
    }

    /// Wait up to `timeout` ms (0 waits forever). Returns the milliseconds
    /// spent waiting, or [`SYS_ARCH_TIMEOUT`].
    pub fn sys_arch_sem_wait(&self, sem: &SysSem, timeout: u32) -> u32 {
        let Some(handle) = sem.0 else {
            lwip_assert!(false, "sys_arch_sem_wait on invalid semaphore");
            return SYS_ARCH_TIMEOUT;
        };
        let start = self.sys_now();
        match self.osal.semaphores().wait(handle, timeout) {
            Ok(_) => self.elapsed_since(start),
            Err(OsalError::Timeout) => SYS_ARCH_TIMEOUT,
            Err(e) => {
                lwip_assert!(false, "sys_arch_sem_wait failed: {}", e);
                SYS_ARCH_TIMEOUT
            }
        }
    }

    pub fn sys_mbox_new(&self, mbox: &mut SysMbox, size: i32) -> ErrT {
        let Ok(capacity) = usize::try_from(size) else {
            lwip_assert!(false, "sys_mbox_new with size {}", size);
            return ERR_VAL;
        };
        match self.osal.mailboxes().create(capacity) {
            Ok(handle) => {
                mbox.0 = Some(handle);
                ERR_OK
            }
            Err(e) => err_code(e),
        }
    }

    /// Post, blocking while full. Thread context only.
    pub fn sys_mbox_post(&self, mbox: &SysMbox, msg: Msg) {
        lwip_assert!(mbox.is_valid(), "sys_mbox_post on invalid mailbox");
        if let Some(handle) = mbox.0 {
            let posted = self.osal.mailboxes().post(handle, msg);
            lwip_assert!(posted.is_ok(), "sys_mbox_post failed");
        }
    }

    /// `ERR_MEM` when full.
    pub fn sys_mbox_trypost(&self, mbox: &SysMbox, msg: Msg) -> ErrT {
        match mbox.0 {
            Some(handle) => result_code(self.osal.mailboxes().try_post(handle, msg)),
            None => ERR_ARG,
        }
    }

    /// `ERR_MEM` when full. Never blocks.
    pub fn sys_mbox_trypost_fromisr(&self, mbox: &SysMbox, msg: Msg) -> ErrT {
        match mbox.0 {
            Some(handle) => result_code(self.osal.mailboxes().post_from_interrupt(handle, msg)),
            None => ERR_ARG,
        }
    }

    /// Fetch, waiting up to `timeout` ms (0 waits forever). The message goes
    /// to `msg` if given, and is dropped otherwise. On timeout `msg` is set
    /// to NULL and [`SYS_ARCH_TIMEOUT`] is returned; on success the
    /// milliseconds spent waiting.
    pub fn sys_arch_mbox_fetch(&self, mbox: &SysMbox, msg: Option<&mut Msg>, timeout: u32) -> u32 {
        let Some(handle) = mbox.0 else {
            lwip_assert!(false, "sys_arch_mbox_fetch on invalid mailbox");
            return SYS_ARCH_TIMEOUT;
        };
        let start = self.sys_now();
        let fetched = self.osal.mailboxes().fetch(handle, timeout);
        if let Err(e) = fetched {
            lwip_assert!(e == OsalError::Timeout, "sys_arch_mbox_fetch failed: {}", e);
        }
        store(msg, fetched.unwrap_or(Msg::NULL));
        match fetched {
            Ok(_) => self.elapsed_since(start),
            Err(_) => SYS_ARCH_TIMEOUT,
        }
    }

    /// 0 if a message was taken, [`SYS_MBOX_EMPTY`] otherwise.
    pub fn sys_arch_mbox_tryfetch(&self, mbox: &SysMbox, msg: Option<&mut Msg>) -> u32 {
        let fetched = match mbox.0 {
            Some(handle) => self.osal.mailboxes().try_fetch(handle),
            None => Err(OsalError::InvalidHandle),
        };
        store(msg, fetched.unwrap_or(Msg::NULL));
        match fetched {
            Ok(_) => 0,
            Err(_) => SYS_MBOX_EMPTY,
        }
    }

    /// Delete the mailbox. Messages still queued are a bug in the caller and
    /// trip the assertion after the mailbox is gone.
    pub fn sys_mbox_free(&self, mbox: &mut SysMbox) {
        lwip_assert!(mbox.is_valid(), "sys_mbox_free on invalid mailbox");
        if let Some(handle) = mbox.0.take() {
            let deleted = self.osal.mailboxes().delete(handle);
            lwip_assert!(deleted.is_ok(), "sys_mbox_free failed");
        }
    }

    fn elapsed_since(&self, start: u32) -> u32 {
        self.sys_now().wrapping_sub(start).min(SYS_ARCH_TIMEOUT - 1)
    }
}

fn store(slot: Option<&mut Msg>, msg: Msg) {
    if let Some(slot) = slot {
        *slot = msg;
    }
}

fn err_code(err: OsalError) -> ErrT {
    match err {
        OsalError::OutOfResources | OsalError::Full => ERR_MEM,
        OsalError::Timeout => ERR_TIMEOUT,
        OsalError::InvalidHandle | OsalError::Misuse(_) => ERR_ARG,
        _ => ERR_VAL,
    }
}

fn result_code(result: Result<(), OsalError>) -> ErrT {
    result.map_or_else(err_code, |()| ERR_OK)
}
