//! Thread creation, termination and identification.
//!
//! A thread owns one control block and one stack block, both taken from the
//! [`ThreadTable`] pools. The control block index doubles as the thread slot
//! index, and the control block address is the kernel task identity, so a
//! running task can find its own slot without any lookup table.
//!
//! Slot states:
//!
//! ```text
//! VACANT ──create──► STARTING ──► RUNNING ──terminate(other)──► DYING
//!                        │            │                           │
//!                        └──terminate(self)──► ZOMBIE ◄───────────┤
//!                                                │                │
//!                                      reap ─► REAPING ──► VACANT ◄┘
//! ```
//!
//! Blocks go back to the pools only once the kernel reports the task can no
//! longer run. A task that deletes itself cannot release its own stack, so
//! it is left as a zombie for [`Threads::reap`], which every `create` runs
//! first.

use core::marker::PhantomPinned;
use core::pin::Pin;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::config::{MAX_THREADS, STACK_LIMIT_DIVISOR, STACK_WORDS};
use crate::error::{misuse, KernelError, OsalError, OsalResult};
use crate::pool::{Block, ResourcePool};
use crate::port::{Kernel, Priority, Stack, TaskId, TaskParams, ThreadEntry};
use crate::sync::thread_context;

const VACANT: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const DYING: u8 = 3;
const ZOMBIE: u8 = 4;
const REAPING: u8 = 5;

struct ThreadSlot {
    state: AtomicU8,
    generation: AtomicU8,
    /// Index of the stack block owned by this thread
    stack: AtomicU8,
}

impl ThreadSlot {
    const fn new() -> Self {
        ThreadSlot {
            state: AtomicU8::new(VACANT),
            generation: AtomicU8::new(0),
            stack: AtomicU8::new(0),
        }
    }
}

/// Control block and stack storage for up to `N` threads.
///
/// Must stay pinned: the kernel keeps pointers into both pools.
pub struct ThreadTable<K: Kernel, const N: usize = MAX_THREADS> {
    tcbs: ResourcePool<K::Task, N>,
    stacks: ResourcePool<Stack, N>,
    slots: [ThreadSlot; N],
    _pin: PhantomPinned,
}

impl<K: Kernel, const N: usize> ThreadTable<K, N> {
    pub fn new() -> Self {
        ThreadTable {
            tcbs: ResourcePool::new(),
            stacks: ResourcePool::new(),
            slots: core::array::from_fn(|_| ThreadSlot::new()),
            _pin: PhantomPinned,
        }
    }
}

impl<K: Kernel, const N: usize> Default for ThreadTable<K, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread created through [`Threads::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ThreadHandle {
    index: u8,
    generation: u8,
}

impl ThreadHandle {
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// Target of [`Threads::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThreadRef {
    Handle(ThreadHandle),
    /// The calling thread
    Current,
}

pub struct Threads<'a, K: Kernel, const N: usize = MAX_THREADS> {
    kernel: &'a K,
    table: Pin<&'a ThreadTable<K, N>>,
}

impl<K: Kernel, const N: usize> Clone for Threads<'_, K, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kernel, const N: usize> Copy for Threads<'_, K, N> {}

impl<'a, K: Kernel, const N: usize> Threads<'a, K, N> {
    pub fn new(kernel: &'a K, table: Pin<&'a ThreadTable<K, N>>) -> Self {
        Threads { kernel, table }
    }

    fn table(&self) -> &'a ThreadTable<K, N> {
        self.table.get_ref()
    }

    /// Create and start a thread running `entry(arg)` at `priority`.
    ///
    /// `stack_words` of 0 selects the default stack. Fails with
    /// `OutOfResources` when either pool is empty, the stack request is
    /// larger than a stack block, or the kernel refuses the task; nothing
    /// stays allocated in that case.
    pub fn create(
        &self,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        stack_words: usize,
    ) -> OsalResult<ThreadHandle> {
        thread_context(self.kernel)?;
        self.reap();

        let stack_words = if stack_words == 0 { STACK_WORDS } else { stack_words };
        if stack_words > STACK_WORDS {
            os_log!(warn, "stack request of {} words exceeds {}", stack_words, STACK_WORDS);
            return Err(OsalError::OutOfResources);
        }

        let table = self.table();
        let tcb = table.tcbs.acquire().map_err(|_| {
            os_log!(warn, "thread control block pool exhausted");
            OsalError::OutOfResources
        })?;
        let stack = match table.stacks.acquire() {
            Ok(stack) => stack,
            Err(_) => {
                os_log!(warn, "stack pool exhausted");
                let _ = table.tcbs.release(tcb);
                return Err(OsalError::OutOfResources);
            }
        };

        let slot = &table.slots[tcb.index()];
        slot.stack.store(stack.index() as u8, Ordering::Relaxed);
        slot.state.store(STARTING, Ordering::Release);
        let generation = slot.generation.load(Ordering::Relaxed);

        let params = TaskParams {
            entry,
            arg,
            priority,
            stack_words,
            stack_limit: stack_words / STACK_LIMIT_DIVISOR,
        };
        // SAFETY: both blocks are held by this call and stay allocated until
        // the kernel reports the task reclaimed.
        let created = unsafe {
            self.kernel
                .task_create(table.tcbs.as_ptr(&tcb), table.stacks.as_ptr(&stack), &params)
        };
        if let Err(e) = created {
            os_log!(error, "task create at priority {} failed: {}", priority, e);
            slot.state.store(VACANT, Ordering::Release);
            let _ = table.stacks.release(stack);
            let _ = table.tcbs.release(tcb);
            return Err(OsalError::OutOfResources);
        }

        // The task may already have terminated itself.
        let _ = slot
            .state
            .compare_exchange(STARTING, RUNNING, Ordering::AcqRel, Ordering::Relaxed);
        let _ = stack.into_index();
        let index = tcb.into_index();
        os_log!(debug, "thread {} created at priority {}", index, priority);
        Ok(ThreadHandle {
            index: index as u8,
            generation,
        })
    }

    /// Remove a thread from scheduling and free its blocks.
    ///
    /// A thread terminating itself is parked as a zombie and freed by a later
    /// [`reap`](Self::reap); on a real kernel the call does not return.
    pub fn terminate(&self, target: ThreadRef) -> OsalResult<()> {
        thread_context(self.kernel)?;
        let handle = match target {
            ThreadRef::Current => return self.terminate_current(),
            ThreadRef::Handle(handle) => handle,
        };
        let index = self.resolve(handle)?;
        let id = self.task_id_at(index);
        if id == self.kernel.task_current() {
            return self.terminate_current();
        }

        let slot = &self.table().slots[index];
        if slot
            .state
            .compare_exchange(RUNNING, DYING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(OsalError::InvalidHandle);
        }
        if let Err(e) = self.kernel.task_delete(id) {
            slot.state.store(RUNNING, Ordering::Release);
            os_log!(error, "task delete of thread {} failed: {}", index, e);
            return Err(e.into());
        }
        match self.kernel.task_reclaim(id) {
            Ok(()) => self.release(index),
            Err(_) => slot.state.store(ZOMBIE, Ordering::Release),
        }
        os_log!(debug, "thread {} terminated", index);
        Ok(())
    }

    fn terminate_current(&self) -> OsalResult<()> {
        let id = self.kernel.task_current();
        if let Some(index) = self.index_of(id) {
            self.table().slots[index].state.store(ZOMBIE, Ordering::Release);
            os_log!(debug, "thread {} terminating itself", index);
        }
        self.kernel.task_delete(id).map_err(|e| {
            os_log!(error, "self delete failed: {}", e);
            OsalError::from(e)
        })
    }

    /// Free the blocks of every terminated thread the kernel has retired.
    /// Returns the number of threads reclaimed.
    pub fn reap(&self) -> usize {
        let table = self.table();
        let mut reaped = 0;
        for (index, slot) in table.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(ZOMBIE, REAPING, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            match self.kernel.task_reclaim(self.task_id_at(index)) {
                Ok(()) | Err(KernelError::NotCreated) => {
                    self.release(index);
                    reaped += 1;
                }
                Err(_) => slot.state.store(ZOMBIE, Ordering::Release),
            }
        }
        reaped
    }

    fn release(&self, index: usize) {
        let table = self.table();
        let slot = &table.slots[index];
        slot.generation.fetch_add(1, Ordering::Relaxed);
        let stack = slot.stack.load(Ordering::Relaxed) as usize;
        slot.state.store(VACANT, Ordering::Release);
        // SAFETY: the slot owned both indices and has just given them up.
        let released = unsafe {
            table
                .stacks
                .release(Block::from_index(stack))
                .and(table.tcbs.release(Block::from_index(index)))
        };
        if let Err(kind) = released {
            let _ = misuse(kind);
        }
        os_log!(trace, "thread {} blocks released", index);
    }

    /// Kernel identity of the calling task. Works for any task, including
    /// ones the adapter did not create.
    pub fn current_id(&self) -> TaskId {
        self.kernel.task_current()
    }

    /// Handle of the calling thread if it was created through this table.
    pub fn current(&self) -> Option<ThreadHandle> {
        let index = self.index_of(self.kernel.task_current())?;
        let slot = &self.table().slots[index];
        matches!(slot.state.load(Ordering::Acquire), STARTING | RUNNING).then(|| ThreadHandle {
            index: index as u8,
            generation: slot.generation.load(Ordering::Relaxed),
        })
    }

    /// Kernel identity of a live thread.
    pub fn task_id(&self, handle: ThreadHandle) -> OsalResult<TaskId> {
        self.resolve(handle).map(|index| self.task_id_at(index))
    }

    pub fn is_alive(&self, handle: ThreadHandle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Threads holding blocks, terminated ones not yet reaped included.
    pub fn live(&self) -> usize {
        self.table().tcbs.occupancy()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn resolve(&self, handle: ThreadHandle) -> OsalResult<usize> {
        let index = handle.index();
        let slot = self
            .table()
            .slots
            .get(index)
            .ok_or(OsalError::InvalidHandle)?;
        let state = slot.state.load(Ordering::Acquire);
        if slot.generation.load(Ordering::Relaxed) != handle.generation
            || !matches!(state, STARTING | RUNNING)
        {
            os_log!(warn, "stale thread handle {}:{}", handle.index, handle.generation);
            return Err(OsalError::InvalidHandle);
        }
        Ok(index)
    }

    fn task_id_at(&self, index: usize) -> TaskId {
        TaskId::of(self.table().tcbs.slot_ptr(index))
    }

    fn index_of(&self, id: TaskId) -> Option<usize> {
        self.table().tcbs.index_of(id.0 as *const K::Task)
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
    use std::sync::atomic::AtomicUsize;

    fn idle(_: usize) {}

    struct Probe<'a> {
        threads: Threads<'a, HostKernel>,
        seen: AtomicUsize,
    }

    fn records_itself_then_exits(arg: usize) {
        // SAFETY: the test keeps the probe alive until the thread is reaped.
        let probe = unsafe { &*(arg as *const Probe<'static>) };
        let me = probe.threads.current();
        probe.seen.store(me.map_or(usize::MAX, |h| h.index()), Ordering::SeqCst);
        probe.threads.terminate(ThreadRef::Current).unwrap();
    }

    fn settle<K: Kernel, const N: usize>(threads: Threads<'_, K, N>, live: usize) {
        wait_for(|| {
            threads.reap();
            threads.live() == live
        });
    }

    #[test]
    fn terminate_returns_both_blocks() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let threads = osal.threads();

        let h = threads.create(idle, 0, 10, 0).unwrap();
        assert_eq!(threads.live(), 1);
        assert!(threads.is_alive(h));
        threads.terminate(ThreadRef::Handle(h)).unwrap();
        assert!(!threads.is_alive(h));
        settle(threads, 0);
        assert_eq!(osal.threads.stacks.occupancy(), 0);
        assert_eq!(threads.terminate(ThreadRef::Handle(h)), Err(OsalError::InvalidHandle));
    }

    #[test]
    fn exhaustion_is_clean() {
        let kernel = HostKernel::new();
        let table = pin!(ThreadTable::<HostKernel, 2>::new());
        let threads = Threads::new(&kernel, table.as_ref());

        let a = threads.create(idle, 0, 10, 0).unwrap();
        let b = threads.create(idle, 0, 10, 0).unwrap();
        assert_eq!(threads.create(idle, 0, 10, 0), Err(OsalError::OutOfResources));
        assert_eq!(threads.live(), 2);
        assert_eq!(table.stacks.occupancy(), 2);

        threads.terminate(ThreadRef::Handle(a)).unwrap();
        threads.terminate(ThreadRef::Handle(b)).unwrap();
        settle(threads, 0);
        let c = threads.create(idle, 0, 10, 0).unwrap();
        assert_ne!(c, a);
        threads.terminate(ThreadRef::Handle(c)).unwrap();
        settle(threads, 0);
    }

    #[test]
    fn rejected_requests_hold_nothing() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let threads = osal.threads();

        assert_eq!(
            threads.create(idle, 0, 10, STACK_WORDS + 1),
            Err(OsalError::OutOfResources)
        );
        // Priority outside the kernel's range.
        assert_eq!(threads.create(idle, 0, 200, 0), Err(OsalError::OutOfResources));
        assert_eq!(threads.live(), 0);
        assert_eq!(osal.threads.stacks.occupancy(), 0);
    }

    #[test]
    fn self_termination_is_reaped() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let osal = osal.as_ref();
        let probe = Probe {
            threads: osal.threads(),
            seen: AtomicUsize::new(usize::MAX - 1),
        };
        let threads = probe.threads;

        let h = threads
            .create(records_itself_then_exits, &probe as *const Probe<'_> as usize, 10, 0)
            .unwrap();
        settle(threads, 0);
        assert_eq!(probe.seen.load(Ordering::SeqCst), h.index());
        assert!(!threads.is_alive(h));
        assert_eq!(threads.task_id(h), Err(OsalError::InvalidHandle));
    }

    #[test]
    fn identity_of_foreign_and_adapter_threads() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let threads = osal.as_ref().threads();

        assert_eq!(threads.current(), None);
        assert_eq!(threads.current_id(), threads.current_id());
        assert_eq!(threads.current_id(), kernel.task_current());

        let h = threads.create(idle, 0, 10, 0).unwrap();
        let id = threads.task_id(h).unwrap();
        assert_ne!(id, threads.current_id());
        assert_eq!(id.0 % 2, 0);
        threads.terminate(ThreadRef::Handle(h)).unwrap();
        settle(threads, 0);
    }

    #[test]
    fn terminate_from_interrupt_is_misuse() {
        let kernel = HostKernel::new();
        let osal = pin!(Osal::new(&kernel));
        let threads = osal.as_ref().threads();
        let h = threads.create(idle, 0, 10, 0).unwrap();

        assert_eq!(
            kernel.interrupt(|| threads.terminate(ThreadRef::Handle(h))),
            Err(OsalError::Misuse(Misuse::InterruptContext))
        );
        threads.terminate(ThreadRef::Handle(h)).unwrap();
        settle(threads, 0);
    }
}
