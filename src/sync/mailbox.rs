//! Bounded mailboxes of opaque message pointers.
//!
//! A mailbox carries [`Msg`] values in FIFO order. The adapter never looks
//! behind the pointer and a NULL message is an ordinary value. Interrupt
//! handlers may post and fetch without blocking; everything that can block
//! belongs to threads.

use crate::arena::{Arena, RawHandle};
use crate::config::{MAX_MAILBOXES, MBOX_CAPACITY_MAX};
use crate::critical::CriticalSection;
use crate::error::{misuse, KernelError, Misuse, OsalError, OsalResult};
use crate::port::{Kernel, Msg};
use crate::sync::thread_context;
use crate::time::{self, Wait, WaitMode};

pub type MailboxArena<K> = Arena<<K as Kernel>::Queue, MAX_MAILBOXES>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MailboxHandle(RawHandle);

pub struct Mailboxes<'a, K: Kernel> {
    kernel: &'a K,
    arena: &'a MailboxArena<K>,
    critical: &'a CriticalSection<'a, K>,
}

impl<K: Kernel> Clone for Mailboxes<'_, K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kernel> Copy for Mailboxes<'_, K> {}

impl<'a, K: Kernel> Mailboxes<'a, K> {
    pub(crate) fn new(
        kernel: &'a K,
        arena: &'a MailboxArena<K>,
        critical: &'a CriticalSection<'a, K>,
    ) -> Self {
        Mailboxes {
            kernel,
            arena,
            critical,
        }
    }

    /// Create a mailbox holding up to `capacity` messages
    /// (`1..=MBOX_CAPACITY_MAX`).
    pub fn create(&self, capacity: usize) -> OsalResult<MailboxHandle> {
        thread_context(self.kernel)?;
        if capacity == 0 || capacity > MBOX_CAPACITY_MAX {
            os_log!(warn, "mailbox capacity {} out of range", capacity);
            return Err(OsalError::OutOfResources);
        }
        let Some((raw, object)) = self.arena.claim() else {
            os_log!(warn, "mailbox arena exhausted");
            return Err(OsalError::OutOfResources);
        };
        match self.kernel.queue_create(object, capacity) {
            Ok(()) => {
                self.arena.publish(raw);
                os_log!(debug, "mailbox {} created, capacity {}", raw.index(), capacity);
                Ok(MailboxHandle(raw))
            }
            Err(e) => {
                self.arena.abandon(raw);
                os_log!(error, "mailbox create failed: {}", e);
                Err(OsalError::OutOfResources)
            }
        }
    }

    /// Post, blocking while the mailbox is full.
    pub fn post(&self, handle: MailboxHandle, msg: Msg) -> OsalResult<()> {
        thread_context(self.kernel)?;
        let object = self.arena.get(handle.0)?;
        self.kernel.queue_post(object, msg, Wait::Forever).map_err(|e| {
            os_log!(error, "mailbox {} post failed: {}", handle.0.index(), e);
            OsalError::from(e)
        })
    }

    /// Post only if there is room now.
    pub fn try_post(&self, handle: MailboxHandle, msg: Msg) -> OsalResult<()> {
        let object = self.arena.get(handle.0)?;
        self.kernel
            .queue_post(object, msg, Wait::NoWait)
            .map_err(|e| match e {
                KernelError::WouldBlock | KernelError::Overflow => OsalError::Full,
                e => e.into(),
            })
    }

    /// Post from an interrupt handler; never blocks. A full mailbox reads as
    /// `Full`, a mailbox deleted underneath the caller as `InvalidHandle`.
    pub fn post_from_interrupt(&self, handle: MailboxHandle, msg: Msg) -> OsalResult<()> {
        let object = self.arena.get(handle.0)?;
        self.kernel
            .queue_post(object, msg, Wait::NoWait)
            .map_err(|e| match e {
                KernelError::WouldBlock | KernelError::Overflow => OsalError::Full,
                e => e.into(),
            })
    }

    /// Fetch the oldest message, waiting up to `millis` (0 waits forever).
    pub fn fetch(&self, handle: MailboxHandle, millis: u32) -> OsalResult<Msg> {
        self.fetch_with(handle, time::translate(millis))
    }

    /// Fetch only if a message is already queued.
    pub fn try_fetch(&self, handle: MailboxHandle) -> OsalResult<Msg> {
        self.fetch_with(handle, Wait::NoWait).map_err(|e| match e {
            OsalError::Timeout => OsalError::Empty,
            e => e,
        })
    }

    fn fetch_with(&self, handle: MailboxHandle, wait: Wait) -> OsalResult<Msg> {
        if wait.mode() == WaitMode::Blocking {
            thread_context(self.kernel)?;
        }
        let object = self.arena.get(handle.0)?;
        self.kernel.queue_pend(object, wait).map_err(|e| match e {
            KernelError::WouldBlock => OsalError::Timeout,
            e => e.into(),
        })
    }

    /// Messages currently queued.
    pub fn len(&self, handle: MailboxHandle) -> OsalResult<usize> {
        let object = self.arena.get(handle.0)?;
        Ok(self.kernel.queue_len(object))
    }

    /// Delete and invalidate the handle.
    ///
    /// Blocked posters and fetchers are woken with `Deleted`. Messages still
    /// queued are dropped, which is reported as [`Misuse::MessagesOnDelete`]
    /// after the deletion has happened.
    pub fn delete(&self, handle: MailboxHandle) -> OsalResult<()> {
        thread_context(self.kernel)?;
        let pending = self.critical.with(|| -> OsalResult<usize> {
            let object = self.arena.close(handle.0)?;
            let pending = self.kernel.queue_len(object);
            if let Err(e) = self.kernel.queue_delete(object) {
                self.arena.reopen(handle.0);
                return Err(e.into());
            }
            self.arena.retire(handle.0);
            Ok(pending)
        })?;
        os_log!(debug, "mailbox {} deleted", handle.0.index());
        if pending > 0 {
            return Err(misuse(Misuse::MessagesOnDelete(pending as u32)));
        }
        Ok(())
    }

    pub fn is_valid(&self, handle: MailboxHandle) -> bool {
        self.arena.is_live(handle.0)
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

    fn msg(n: usize) -> Msg {
        Msg::from_addr(n)
    }

    #[test]
    fn fifo_order() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let boxes = osal.as_ref().mailboxes();
        let mb = boxes.create(4).unwrap();

        for n in 1..=3 {
            boxes.post(mb, msg(n)).unwrap();
        }
        assert_eq!(boxes.len(mb), Ok(3));
        for n in 1..=3 {
            assert_eq!(boxes.fetch(mb, 0), Ok(msg(n)));
        }
        assert_eq!(boxes.try_fetch(mb), Err(OsalError::Empty));
    }

    #[test]
    fn capacity_is_exact() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let boxes = osal.as_ref().mailboxes();
        let mb = boxes.create(3).unwrap();

        for n in 0..3 {
            boxes.try_post(mb, msg(n)).unwrap();
        }
        assert_eq!(boxes.try_post(mb, msg(9)), Err(OsalError::Full));
        assert_eq!(
            kernel.interrupt(|| boxes.post_from_interrupt(mb, msg(9))),
            Err(OsalError::Full)
        );
        assert_eq!(boxes.len(mb), Ok(3));
    }

    #[test]
    fn interrupt_side_operations() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let boxes = osal.as_ref().mailboxes();
        let mb = boxes.create(2).unwrap();

        kernel.interrupt(|| boxes.post_from_interrupt(mb, msg(7))).unwrap();
        assert_eq!(kernel.interrupt(|| boxes.try_fetch(mb)), Ok(msg(7)));
        assert_eq!(kernel.interrupt(|| boxes.try_fetch(mb)), Err(OsalError::Empty));
        let misuse = Err(OsalError::Misuse(Misuse::InterruptContext));
        assert_eq!(kernel.interrupt(|| boxes.post(mb, msg(1))), misuse);
        assert_eq!(kernel.interrupt(|| boxes.fetch(mb, 0)), misuse.map(|()| Msg::NULL));
    }

    #[test]
    fn interrupt_post_to_vanished_queue_is_not_full() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let boxes = osal.mailboxes();
        let mb = boxes.create(2).unwrap();

        // kernel object gone while the handle still resolves
        kernel.queue_delete(osal.mailboxes.get(mb.0).unwrap()).unwrap();
        assert_eq!(
            kernel.interrupt(|| boxes.post_from_interrupt(mb, msg(1))),
            Err(OsalError::InvalidHandle)
        );
    }

    #[test]
    fn fetch_times_out() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let boxes = osal.as_ref().mailboxes();
        let mb = boxes.create(1).unwrap();

        let start = Instant::now();
        assert_eq!(boxes.fetch(mb, 20), Err(OsalError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn null_message_round_trips() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let boxes = osal.as_ref().mailboxes();
        let mb = boxes.create(1).unwrap();

        boxes.post(mb, Msg::NULL).unwrap();
        let got = boxes.fetch(mb, 10).unwrap();
        assert!(got.is_null());
    }

    #[test]
    fn blocked_post_completes_after_fetch() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let boxes = osal.mailboxes();
        let mb = boxes.create(1).unwrap();
        boxes.post(mb, msg(1)).unwrap();

        std::thread::scope(|s| {
            let poster = s.spawn(|| boxes.post(mb, msg(2)));
            wait_for(|| kernel.queue_waiters(osal.mailboxes.get(mb.0).unwrap()) == 1);
            assert_eq!(boxes.fetch(mb, 0), Ok(msg(1)));
            assert_eq!(poster.join().unwrap(), Ok(()));
        });
        assert_eq!(boxes.fetch(mb, 0), Ok(msg(2)));
    }

    #[test]
    fn delete_with_pending_messages_is_reported() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let boxes = osal.mailboxes();
        let mb = boxes.create(4).unwrap();
        boxes.post(mb, msg(1)).unwrap();
        boxes.post(mb, msg(2)).unwrap();

        assert_eq!(
            boxes.delete(mb),
            Err(OsalError::Misuse(Misuse::MessagesOnDelete(2)))
        );
        assert!(!boxes.is_valid(mb));
        assert_eq!(osal.critical().depth(), 0);
        assert_eq!(boxes.try_post(mb, msg(3)), Err(OsalError::InvalidHandle));
    }

    #[test]
    fn delete_wakes_blocked_fetcher() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let boxes = osal.mailboxes();
        let mb = boxes.create(2).unwrap();

        std::thread::scope(|s| {
            let fetcher = s.spawn(|| boxes.fetch(mb, 0));
            wait_for(|| kernel.queue_waiters(osal.mailboxes.get(mb.0).unwrap()) == 1);
            boxes.delete(mb).unwrap();
            assert_eq!(fetcher.join().unwrap(), Err(OsalError::Deleted));
        });
        assert_eq!(boxes.delete(mb), Err(OsalError::InvalidHandle));
    }

    #[test]
    fn capacity_out_of_range() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let boxes = osal.as_ref().mailboxes();

        assert_eq!(boxes.create(0), Err(OsalError::OutOfResources));
        assert_eq!(
            boxes.create(MBOX_CAPACITY_MAX + 1),
            Err(OsalError::OutOfResources)
        );
        let mb = boxes.create(MBOX_CAPACITY_MAX).unwrap();
        for n in 0..MBOX_CAPACITY_MAX {
            boxes.try_post(mb, msg(n)).unwrap();
        }
        assert_eq!(boxes.try_post(mb, msg(0)), Err(OsalError::Full));
    }
}
