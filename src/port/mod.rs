//! The kernel seam.
//!
//! The adapter never schedules anything itself. Every suspension happens
//! inside a [`Kernel`] call, and every control block the kernel touches is
//! storage owned by the adapter (a pool block or an arena slot) that stays
//! put for as long as the kernel may reference it.
//!
//! A board crate implements [`Kernel`] over its RTOS (µC/OS-III, ThreadX,
//! ...). The `host` feature provides [`host::HostKernel`], a simulated
//! priority kernel built on std threads.
//!
//! ```text
//! application / lwIP
//!        │
//!        ▼
//!  Osal (pools, arenas, guards) ──► Kernel port ──► RTOS
//!        ▲                                           │
//!        └──────── on_tick / on_stat hooks ◄─────────┘
//! ```

#[cfg(any(test, feature = "host"))]
pub mod host;

use core::ffi::c_void;
use core::fmt;

use crate::config::STACK_WORDS;
use crate::error::KernelResult;
use crate::time::Wait;

/// Task priority; lower values are more urgent.
pub type Priority = u8;

/// Opaque interrupt mask state returned by [`Kernel::interrupt_disable`].
pub type IrqState = u32;

/// Thread entry point. The argument is passed through untouched.
pub type ThreadEntry = fn(usize);

/// Kernel identity of a task.
///
/// For tasks created through the adapter this is the address of their
/// control block, so the identity is known before the task first runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId(pub usize);

impl TaskId {
    pub fn of<T>(tcb: *const T) -> Self {
        TaskId(tcb as usize)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task@{:#x}", self.0)
    }
}

/// Scheduling state of a task as reported by the kernel's task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskState {
    Ready,
    Delayed,
    Pending,
    PendingTimeout,
    Suspended,
    DelayedSuspended,
    PendingSuspended,
    PendingTimeoutSuspended,
    Deleted,
}

impl TaskState {
    /// Decode µC/OS-III `OS_TASK_STATE_*` values.
    pub const fn from_ucos(raw: u8) -> Self {
        match raw {
            0 => TaskState::Ready,
            1 => TaskState::Delayed,
            2 => TaskState::Pending,
            3 => TaskState::PendingTimeout,
            4 => TaskState::Suspended,
            5 => TaskState::DelayedSuspended,
            6 => TaskState::PendingSuspended,
            7 => TaskState::PendingTimeoutSuspended,
            _ => TaskState::Deleted,
        }
    }

    pub const fn is_suspended(self) -> bool {
        matches!(
            self,
            TaskState::Suspended
                | TaskState::DelayedSuspended
                | TaskState::PendingSuspended
                | TaskState::PendingTimeoutSuspended
        )
    }
}

/// CPU utilization from the kernel's statistics task, in hundredths of a
/// percent (`1234` is `12.34%`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CpuUsage {
    pub current: u16,
    pub peak: u16,
}

/// Opaque message carried by mailboxes. Null is a legal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Msg(*mut c_void);

// SAFETY: the adapter only moves the pointer value between tasks; ownership
// of whatever it points to is the application's contract.
unsafe impl Send for Msg {}
unsafe impl Sync for Msg {}

impl Msg {
    pub const NULL: Msg = Msg(core::ptr::null_mut());

    pub const fn from_ptr(ptr: *mut c_void) -> Self {
        Msg(ptr)
    }

    /// Build a message from an integer token.
    pub fn from_addr(addr: usize) -> Self {
        Msg(addr as *mut c_void)
    }

    pub const fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for Msg {
    fn default() -> Self {
        Msg::NULL
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Msg {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Msg({=usize:#x})", self.0 as usize)
    }
}

/// One stack block.
#[derive(Clone)]
#[repr(C, align(8))]
pub struct Stack(pub [u32; STACK_WORDS]);

impl Default for Stack {
    fn default() -> Self {
        Stack([0; STACK_WORDS])
    }
}

/// Parameters for [`Kernel::task_create`].
#[derive(Debug, Clone, Copy)]
pub struct TaskParams {
    pub entry: ThreadEntry,
    pub arg: usize,
    pub priority: Priority,
    /// Usable stack size in words
    pub stack_words: usize,
    /// Watermark for the kernel's stack overflow check, in words
    pub stack_limit: usize,
}

/// Services the adapter consumes from the RTOS.
///
/// Wait semantics follow [`Wait`]: `NoWait` returns
/// [`KernelError::WouldBlock`](crate::error::KernelError::WouldBlock) when the
/// object is unavailable, an expired `Ticks` wait returns `Timeout`, and
/// deleting an object wakes all of its waiters with `Deleted`. Blocking waits
/// requested from interrupt context fail with `InterruptContext`. Waiters are
/// released in the kernel's own order (priority order on a priority kernel).
pub trait Kernel: Sync {
    /// Task control block storage.
    type Task: Default + Send;
    type Mutex: Default + Sync;
    type Semaphore: Default + Sync;
    type Queue: Default + Sync;

    /// Current tick count; wraps.
    fn time_get(&self) -> u32;

    /// Suspend the caller for `ticks` ticks.
    fn time_delay(&self, ticks: u32);

    fn in_interrupt(&self) -> bool;

    /// Mask interrupts and return the previous mask state.
    fn interrupt_disable(&self) -> IrqState;

    fn interrupt_restore(&self, state: IrqState);

    /// Register a task and make it ready at `params.priority`.
    ///
    /// # Safety
    ///
    /// `tcb` and `stack` must be valid, exclusively owned by the new task and
    /// must not move or be reused until [`Kernel::task_reclaim`] succeeds for
    /// the task's [`TaskId`] (the address of `tcb`).
    unsafe fn task_create(
        &self,
        tcb: *mut Self::Task,
        stack: *mut Stack,
        params: &TaskParams,
    ) -> KernelResult<()>;

    /// Remove a task from scheduling. Does not return when `task` is the
    /// caller on a real kernel.
    fn task_delete(&self, task: TaskId) -> KernelResult<()>;

    /// Finalize a deleted task. Fails with `NotDone` while the kernel may
    /// still run it or reference its control block.
    fn task_reclaim(&self, task: TaskId) -> KernelResult<()>;

    fn task_current(&self) -> TaskId;

    /// Walk the kernel's task list.
    fn for_each_task(&self, f: &mut dyn FnMut(TaskId, TaskState));

    /// Number of tasks in the ready list, the running one included, over
    /// every priority level except the lowest. That level belongs to the
    /// idle task, which is always ready and must not count as load.
    fn ready_count(&self) -> u32;

    /// Latest figures from the statistics task.
    fn cpu_usage(&self) -> CpuUsage;

    fn mutex_create(&self, mutex: &Self::Mutex) -> KernelResult<()>;
    fn mutex_pend(&self, mutex: &Self::Mutex, wait: Wait) -> KernelResult<()>;
    fn mutex_post(&self, mutex: &Self::Mutex) -> KernelResult<()>;
    fn mutex_delete(&self, mutex: &Self::Mutex) -> KernelResult<()>;
    fn mutex_owner(&self, mutex: &Self::Mutex) -> Option<TaskId>;
    fn mutex_waiters(&self, mutex: &Self::Mutex) -> u32;

    fn sem_create(&self, sem: &Self::Semaphore, initial: u32) -> KernelResult<()>;
    /// Take one unit; returns the count left after taking it.
    fn sem_pend(&self, sem: &Self::Semaphore, wait: Wait) -> KernelResult<u32>;
    fn sem_post(&self, sem: &Self::Semaphore) -> KernelResult<()>;
    fn sem_delete(&self, sem: &Self::Semaphore) -> KernelResult<()>;
    fn sem_waiters(&self, sem: &Self::Semaphore) -> u32;

    fn queue_create(&self, queue: &Self::Queue, capacity: usize) -> KernelResult<()>;
    fn queue_post(&self, queue: &Self::Queue, msg: Msg, wait: Wait) -> KernelResult<()>;
    fn queue_pend(&self, queue: &Self::Queue, wait: Wait) -> KernelResult<Msg>;
    fn queue_delete(&self, queue: &Self::Queue) -> KernelResult<()>;
    /// Messages currently enqueued.
    fn queue_len(&self, queue: &Self::Queue) -> usize;
    /// Tasks blocked on the queue, senders and receivers.
    fn queue_waiters(&self, queue: &Self::Queue) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ucos_states_decode() {
        assert_eq!(TaskState::from_ucos(0), TaskState::Ready);
        assert_eq!(TaskState::from_ucos(1), TaskState::Delayed);
        assert_eq!(TaskState::from_ucos(3), TaskState::PendingTimeout);
        assert_eq!(TaskState::from_ucos(7), TaskState::PendingTimeoutSuspended);
        assert_eq!(TaskState::from_ucos(255), TaskState::Deleted);
    }

    #[test]
    fn suspended_family() {
        assert!(TaskState::Suspended.is_suspended());
        assert!(TaskState::DelayedSuspended.is_suspended());
        assert!(TaskState::PendingTimeoutSuspended.is_suspended());
        assert!(!TaskState::Pending.is_suspended());
        assert!(!TaskState::Ready.is_suspended());
    }

    #[test]
    fn null_message_is_a_value() {
        assert!(Msg::NULL.is_null());
        assert_eq!(Msg::default(), Msg::NULL);
        assert_eq!(Msg::from_addr(0x40).addr(), 0x40);
    }
}
