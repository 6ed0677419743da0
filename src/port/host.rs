//! Simulated priority kernel on top of std threads.
//!
//! Good enough to run the adapter and its tests on a workstation:
//!
//! - tasks are std threads, identified through a thread-local;
//! - every blocking object is a std mutex plus condvar guarding an explicit
//!   wait list ordered by (priority, arrival), and a post hands its item
//!   straight to the first waiter in that order;
//! - interrupt context is a per-thread flag set by [`HostKernel::interrupt`];
//! - interrupt masking is one process-wide re-entrant lock, so a masked
//!   section excludes every other task and every simulated interrupt, as it
//!   would on a single core.
//!
//! Threads the adapter did not create still get a task identity (an odd
//! number, which no aligned control block address can be) and run at
//! [`PRIORITY_LOWEST`].

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard as StdGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use std::vec::Vec;

use super::{CpuUsage, IrqState, Kernel, Msg, Priority, Stack, TaskId, TaskParams, TaskState};
use crate::config::{MBOX_CAPACITY_MAX, PRIORITY_LEVELS, PRIORITY_LOWEST, TICK_RATE_HZ};
use crate::error::{KernelError, KernelResult};
use crate::time::{ticks_to_millis, Wait};

thread_local! {
    static CURRENT: Cell<Option<TaskId>> = const { Cell::new(None) };
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

static NEXT_FOREIGN: AtomicUsize = AtomicUsize::new(0);

fn lock<T>(m: &StdMutex<T>) -> StdGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn tick_duration(ticks: u32) -> Duration {
    Duration::from_millis(u64::from(ticks_to_millis(ticks).max(1)))
}

/// Control block storage for a host task.
#[derive(Default)]
#[repr(align(8))]
pub struct HostTask {
    priority: AtomicU8,
}

impl HostTask {
    /// Priority the task was created with.
    pub fn priority(&self) -> Priority {
        self.priority.load(Ordering::Relaxed)
    }
}

struct TaskRecord {
    id: TaskId,
    priority: Priority,
    state: TaskState,
    deleted: bool,
    thread: Option<JoinHandle<()>>,
}

enum Outcome {
    Granted(Msg),
    Deleted,
}

struct Waiter {
    ticket: u64,
    priority: Priority,
    task: TaskId,
    /// Message a blocked sender wants to enqueue
    payload: Msg,
    outcome: Option<Outcome>,
}

#[derive(Default)]
struct WaitList {
    entries: Vec<Waiter>,
    next_ticket: u64,
}

impl WaitList {
    fn enqueue(&mut self, priority: Priority, task: TaskId, payload: Msg) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.entries.push(Waiter {
            ticket,
            priority,
            task,
            payload,
            outcome: None,
        });
        ticket
    }

    fn pending(&self) -> u32 {
        self.entries.iter().filter(|w| w.outcome.is_none()).count() as u32
    }

    /// Wake the most urgent waiter with `msg`; returns its task and payload.
    fn grant_next(&mut self, msg: Msg) -> Option<(TaskId, Msg)> {
        let waiter = self
            .entries
            .iter_mut()
            .filter(|w| w.outcome.is_none())
            .min_by_key(|w| (w.priority, w.ticket))?;
        waiter.outcome = Some(Outcome::Granted(msg));
        Some((waiter.task, waiter.payload))
    }

    fn abort_all(&mut self) {
        for w in self.entries.iter_mut().filter(|w| w.outcome.is_none()) {
            w.outcome = Some(Outcome::Deleted);
        }
    }

    fn take(&mut self, ticket: u64) -> Option<Outcome> {
        let pos = self
            .entries
            .iter()
            .position(|w| w.ticket == ticket && w.outcome.is_some())?;
        self.entries.remove(pos).outcome
    }

    fn cancel(&mut self, ticket: u64) {
        self.entries.retain(|w| w.ticket != ticket);
    }
}

#[derive(Clone, Copy)]
enum Side {
    Receive,
    Send,
}

struct Inner<S> {
    state: Option<S>,
    receivers: WaitList,
    senders: WaitList,
}

impl<S> Inner<S> {
    fn list(&mut self, side: Side) -> &mut WaitList {
        match side {
            Side::Receive => &mut self.receivers,
            Side::Send => &mut self.senders,
        }
    }

    fn state_mut(&mut self) -> KernelResult<&mut S> {
        self.state.as_mut().ok_or(KernelError::NotCreated)
    }

    fn create(&mut self, state: S) -> KernelResult<()> {
        if self.state.is_some() {
            return Err(KernelError::AlreadyCreated);
        }
        self.state = Some(state);
        Ok(())
    }

    fn delete(&mut self) -> KernelResult<()> {
        self.state.take().ok_or(KernelError::NotCreated)?;
        self.receivers.abort_all();
        self.senders.abort_all();
        Ok(())
    }
}

/// Kernel object storage shared by mutexes, semaphores and queues.
pub struct HostObject<S> {
    inner: StdMutex<Inner<S>>,
    wake: Condvar,
}

impl<S> Default for HostObject<S> {
    fn default() -> Self {
        HostObject {
            inner: StdMutex::new(Inner {
                state: None,
                receivers: WaitList::default(),
                senders: WaitList::default(),
            }),
            wake: Condvar::new(),
        }
    }
}

pub struct MutexState {
    owner: Option<TaskId>,
}

pub struct SemaphoreState {
    count: u32,
}

pub struct QueueState {
    buf: VecDeque<Msg>,
    capacity: usize,
}

pub type HostMutex = HostObject<MutexState>;
pub type HostSemaphore = HostObject<SemaphoreState>;
pub type HostQueue = HostObject<QueueState>;

/// Owner of the interrupt mask and its nesting depth.
#[derive(Default)]
struct Mask {
    owner: Option<ThreadId>,
    depth: u32,
}

pub struct HostKernel {
    epoch: Instant,
    tasks: StdMutex<Vec<TaskRecord>>,
    mask: StdMutex<Mask>,
    unmasked: Condvar,
    cpu_current: AtomicU16,
    cpu_peak: AtomicU16,
}

impl Default for HostKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl HostKernel {
    pub fn new() -> Self {
        HostKernel {
            epoch: Instant::now(),
            tasks: StdMutex::new(Vec::new()),
            mask: StdMutex::new(Mask::default()),
            unmasked: Condvar::new(),
            cpu_current: AtomicU16::new(0),
            cpu_peak: AtomicU16::new(0),
        }
    }

    /// Run `f` as if it were an interrupt handler on this thread. The
    /// handler waits while another thread has interrupts masked, and holds
    /// the mask while it runs.
    pub fn interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        let state = self.interrupt_disable();
        let prev = IN_ISR.with(|c| c.replace(true));
        let result = f();
        IN_ISR.with(|c| c.set(prev));
        self.interrupt_restore(state);
        result
    }

    /// Whether any thread currently has interrupts masked.
    pub fn interrupts_masked(&self) -> bool {
        lock(&self.mask).owner.is_some()
    }

    /// Make the calling thread a kernel task at `priority`.
    pub fn register_current(&self, priority: Priority) -> TaskId {
        let id = self.task_current();
        let mut tasks = lock(&self.tasks);
        match tasks.iter_mut().find(|t| t.id == id) {
            Some(t) => t.priority = priority,
            None => tasks.push(TaskRecord {
                id,
                priority,
                state: TaskState::Ready,
                deleted: false,
                thread: None,
            }),
        }
        id
    }

    /// Add a task record with no thread behind it.
    pub fn add_task(&self, priority: Priority, state: TaskState) -> TaskId {
        let id = foreign_id();
        lock(&self.tasks).push(TaskRecord {
            id,
            priority,
            state,
            deleted: false,
            thread: None,
        });
        id
    }

    pub fn set_task_state(&self, id: TaskId, state: TaskState) {
        if let Some(t) = lock(&self.tasks).iter_mut().find(|t| t.id == id) {
            t.state = state;
        }
    }

    pub fn set_cpu_usage(&self, current: u16, peak: u16) {
        self.cpu_current.store(current, Ordering::Relaxed);
        self.cpu_peak.store(peak, Ordering::Relaxed);
    }

    fn priority_of(&self, id: TaskId) -> Priority {
        lock(&self.tasks)
            .iter()
            .find(|t| t.id == id)
            .map_or(PRIORITY_LOWEST, |t| t.priority)
    }

    /// Park the caller on one of the object's wait lists until it is granted
    /// an item, the object is deleted, or the wait expires.
    fn block_on<'a, S>(
        &self,
        object: &'a HostObject<S>,
        mut inner: StdGuard<'a, Inner<S>>,
        side: Side,
        payload: Msg,
        wait: Wait,
    ) -> (StdGuard<'a, Inner<S>>, KernelResult<Msg>) {
        let deadline = match wait {
            Wait::NoWait => return (inner, Err(KernelError::WouldBlock)),
            Wait::Forever => None,
            Wait::Ticks(t) => Some(Instant::now() + tick_duration(t.get())),
        };
        if self.in_interrupt() {
            return (inner, Err(KernelError::InterruptContext));
        }
        let task = self.task_current();
        let ticket = inner.list(side).enqueue(self.priority_of(task), task, payload);
        self.set_task_state(
            task,
            if deadline.is_some() {
                TaskState::PendingTimeout
            } else {
                TaskState::Pending
            },
        );

        let result = loop {
            if let Some(outcome) = inner.list(side).take(ticket) {
                break match outcome {
                    Outcome::Granted(msg) => Ok(msg),
                    Outcome::Deleted => Err(KernelError::Deleted),
                };
            }
            match deadline {
                None => {
                    inner = object
                        .wake
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        inner.list(side).cancel(ticket);
                        break Err(KernelError::Timeout);
                    }
                    inner = match object.wake.wait_timeout(inner, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        };

        self.set_task_state(task, TaskState::Ready);
        (inner, result)
    }
}

fn foreign_id() -> TaskId {
    TaskId((NEXT_FOREIGN.fetch_add(1, Ordering::Relaxed) << 1) | 1)
}

impl Kernel for HostKernel {
    type Task = HostTask;
    type Mutex = HostMutex;
    type Semaphore = HostSemaphore;
    type Queue = HostQueue;

    fn time_get(&self) -> u32 {
        let ms = self.epoch.elapsed().as_millis() as u64;
        (ms * u64::from(TICK_RATE_HZ) / 1000) as u32
    }

    fn time_delay(&self, ticks: u32) {
        let task = self.task_current();
        self.set_task_state(task, TaskState::Delayed);
        thread::sleep(tick_duration(ticks));
        self.set_task_state(task, TaskState::Ready);
    }

    fn in_interrupt(&self) -> bool {
        IN_ISR.with(Cell::get)
    }

    /// Returns the caller's mask depth before this call.
    fn interrupt_disable(&self) -> IrqState {
        let me = thread::current().id();
        let mut mask = lock(&self.mask);
        while mask.owner.is_some_and(|owner| owner != me) {
            mask = self
                .unmasked
                .wait(mask)
                .unwrap_or_else(PoisonError::into_inner);
        }
        mask.owner = Some(me);
        let prev = mask.depth;
        mask.depth += 1;
        prev
    }

    /// Put the caller's mask depth back to `state`; depth 0 unmasks. A
    /// thread that does not hold the mask changes nothing.
    fn interrupt_restore(&self, state: IrqState) {
        let me = thread::current().id();
        let mut mask = lock(&self.mask);
        if mask.owner != Some(me) {
            return;
        }
        mask.depth = state;
        if state == 0 {
            mask.owner = None;
            drop(mask);
            self.unmasked.notify_all();
        }
    }

    unsafe fn task_create(
        &self,
        tcb: *mut HostTask,
        _stack: *mut Stack,
        params: &TaskParams,
    ) -> KernelResult<()> {
        if params.priority >= PRIORITY_LEVELS {
            return Err(KernelError::InvalidPriority);
        }
        let id = TaskId::of(tcb);
        // SAFETY: the caller hands over exclusive use of `tcb`.
        unsafe { (*tcb).priority.store(params.priority, Ordering::Relaxed) };

        {
            let mut tasks = lock(&self.tasks);
            if tasks.iter().any(|t| t.id == id) {
                return Err(KernelError::AlreadyCreated);
            }
            tasks.push(TaskRecord {
                id,
                priority: params.priority,
                state: TaskState::Ready,
                deleted: false,
                thread: None,
            });
        }

        let (entry, arg) = (params.entry, params.arg);
        let spawned = thread::Builder::new()
            .name(std::format!("task-{:#x}", id.0))
            .spawn(move || {
                CURRENT.with(|c| c.set(Some(id)));
                entry(arg);
            });

        let mut tasks = lock(&self.tasks);
        match spawned {
            Ok(handle) => {
                if let Some(t) = tasks.iter_mut().find(|t| t.id == id) {
                    t.thread = Some(handle);
                }
                Ok(())
            }
            Err(_) => {
                tasks.retain(|t| t.id != id);
                Err(KernelError::NoMemory)
            }
        }
    }

    fn task_delete(&self, task: TaskId) -> KernelResult<()> {
        let mut tasks = lock(&self.tasks);
        let record = tasks
            .iter_mut()
            .find(|t| t.id == task && !t.deleted)
            .ok_or(KernelError::NotCreated)?;
        record.deleted = true;
        record.state = TaskState::Deleted;
        Ok(())
    }

    fn task_reclaim(&self, task: TaskId) -> KernelResult<()> {
        let mut tasks = lock(&self.tasks);
        let pos = tasks
            .iter()
            .position(|t| t.id == task)
            .ok_or(KernelError::NotCreated)?;
        let record = &tasks[pos];
        let finished = record.thread.as_ref().map_or(true, JoinHandle::is_finished);
        if !record.deleted || !finished {
            return Err(KernelError::NotDone);
        }
        let record = tasks.remove(pos);
        drop(tasks);
        if let Some(handle) = record.thread {
            let _ = handle.join();
        }
        Ok(())
    }

    fn task_current(&self) -> TaskId {
        CURRENT.with(|c| match c.get() {
            Some(id) => id,
            None => {
                let id = foreign_id();
                c.set(Some(id));
                id
            }
        })
    }

    fn for_each_task(&self, f: &mut dyn FnMut(TaskId, TaskState)) {
        for t in lock(&self.tasks).iter().filter(|t| !t.deleted) {
            f(t.id, t.state);
        }
    }

    fn ready_count(&self) -> u32 {
        lock(&self.tasks)
            .iter()
            .filter(|t| !t.deleted && t.state == TaskState::Ready && t.priority < PRIORITY_LOWEST)
            .count() as u32
    }

    fn cpu_usage(&self) -> CpuUsage {
        CpuUsage {
            current: self.cpu_current.load(Ordering::Relaxed),
            peak: self.cpu_peak.load(Ordering::Relaxed),
        }
    }

    fn mutex_create(&self, mutex: &HostMutex) -> KernelResult<()> {
        lock(&mutex.inner).create(MutexState { owner: None })
    }

    fn mutex_pend(&self, mutex: &HostMutex, wait: Wait) -> KernelResult<()> {
        let me = self.task_current();
        let mut inner = lock(&mutex.inner);
        let owner = inner.state_mut()?.owner;
        match owner {
            None => {
                inner.state_mut()?.owner = Some(me);
                Ok(())
            }
            Some(owner) if owner == me => Err(KernelError::Nested),
            Some(_) => {
                let (_inner, result) = self.block_on(mutex, inner, Side::Receive, Msg::NULL, wait);
                result.map(|_| ())
            }
        }
    }

    fn mutex_post(&self, mutex: &HostMutex) -> KernelResult<()> {
        let me = self.task_current();
        let mut guard = lock(&mutex.inner);
        let Inner {
            state, receivers, ..
        } = &mut *guard;
        let state = state.as_mut().ok_or(KernelError::NotCreated)?;
        if state.owner != Some(me) {
            return Err(KernelError::NotOwner);
        }
        state.owner = receivers.grant_next(Msg::NULL).map(|(task, _)| task);
        if state.owner.is_some() {
            mutex.wake.notify_all();
        }
        Ok(())
    }

    fn mutex_delete(&self, mutex: &HostMutex) -> KernelResult<()> {
        lock(&mutex.inner).delete()?;
        mutex.wake.notify_all();
        Ok(())
    }

    fn mutex_owner(&self, mutex: &HostMutex) -> Option<TaskId> {
        lock(&mutex.inner).state.as_ref().and_then(|s| s.owner)
    }

    fn mutex_waiters(&self, mutex: &HostMutex) -> u32 {
        lock(&mutex.inner).receivers.pending()
    }

    fn sem_create(&self, sem: &HostSemaphore, initial: u32) -> KernelResult<()> {
        lock(&sem.inner).create(SemaphoreState { count: initial })
    }

    fn sem_pend(&self, sem: &HostSemaphore, wait: Wait) -> KernelResult<u32> {
        let mut inner = lock(&sem.inner);
        let state = inner.state_mut()?;
        if state.count > 0 {
            state.count -= 1;
            return Ok(state.count);
        }
        let (inner, result) = self.block_on(sem, inner, Side::Receive, Msg::NULL, wait);
        result.map(|_| inner.state.as_ref().map_or(0, |s| s.count))
    }

    fn sem_post(&self, sem: &HostSemaphore) -> KernelResult<()> {
        let mut guard = lock(&sem.inner);
        let Inner {
            state, receivers, ..
        } = &mut *guard;
        let state = state.as_mut().ok_or(KernelError::NotCreated)?;
        if receivers.grant_next(Msg::NULL).is_some() {
            sem.wake.notify_all();
            return Ok(());
        }
        state.count = state.count.checked_add(1).ok_or(KernelError::Overflow)?;
        Ok(())
    }

    fn sem_delete(&self, sem: &HostSemaphore) -> KernelResult<()> {
        lock(&sem.inner).delete()?;
        sem.wake.notify_all();
        Ok(())
    }

    fn sem_waiters(&self, sem: &HostSemaphore) -> u32 {
        lock(&sem.inner).receivers.pending()
    }

    fn queue_create(&self, queue: &HostQueue, capacity: usize) -> KernelResult<()> {
        if capacity == 0 {
            return Err(KernelError::InvalidSize);
        }
        if capacity > MBOX_CAPACITY_MAX {
            return Err(KernelError::NoMemory);
        }
        lock(&queue.inner).create(QueueState {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    fn queue_post(&self, queue: &HostQueue, msg: Msg, wait: Wait) -> KernelResult<()> {
        let mut guard = lock(&queue.inner);
        let Inner {
            state, receivers, ..
        } = &mut *guard;
        let state = state.as_mut().ok_or(KernelError::NotCreated)?;
        if receivers.grant_next(msg).is_some() {
            queue.wake.notify_all();
            return Ok(());
        }
        if state.buf.len() < state.capacity {
            state.buf.push_back(msg);
            return Ok(());
        }
        let (_guard, result) = self.block_on(queue, guard, Side::Send, msg, wait);
        result.map(|_| ())
    }

    fn queue_pend(&self, queue: &HostQueue, wait: Wait) -> KernelResult<Msg> {
        let mut guard = lock(&queue.inner);
        let Inner { state, senders, .. } = &mut *guard;
        let state = state.as_mut().ok_or(KernelError::NotCreated)?;
        if let Some(msg) = state.buf.pop_front() {
            if let Some((_, payload)) = senders.grant_next(Msg::NULL) {
                state.buf.push_back(payload);
                queue.wake.notify_all();
            }
            return Ok(msg);
        }
        let (_guard, result) = self.block_on(queue, guard, Side::Receive, Msg::NULL, wait);
        result
    }

    fn queue_delete(&self, queue: &HostQueue) -> KernelResult<()> {
        lock(&queue.inner).delete()?;
        queue.wake.notify_all();
        Ok(())
    }

    fn queue_len(&self, queue: &HostQueue) -> usize {
        lock(&queue.inner).state.as_ref().map_or(0, |s| s.buf.len())
    }

    fn queue_waiters(&self, queue: &HostQueue) -> u32 {
        let inner = lock(&queue.inner);
        inner.receivers.pending() + inner.senders.pending()
    }
}
