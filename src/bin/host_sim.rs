//! Host simulation of the adapter.
//!
//! Runs the adapter on the simulated kernel, drives lwIP-style threads
//! through the `sys_arch` layer and prints one marker per scenario. A
//! simulated timer thread feeds the tick and statistics hooks, so the
//! health report shows up on stdout as well.

use core::fmt;
use core::pin::Pin;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use osal_sysarch::config::STAT_TASK_RATE_HZ;
use osal_sysarch::port::host::HostKernel;
use osal_sysarch::sys_arch::{SysMbox, SysMutex, SysSem, ERR_OK, SYS_ARCH_TIMEOUT};
use osal_sysarch::{Kernel, Msg, Osal, ThreadRef};
use static_cell::StaticCell;

type HostOsal = Osal<'static, HostKernel>;

const PIPE_LEN: usize = 16;
const MTX_WORKERS: u32 = 2;
const MTX_ROUNDS: u32 = 25;
const WAIT_MS: u32 = 5000;

static KERNEL: StaticCell<HostKernel> = StaticCell::new();
static OSAL: StaticCell<HostOsal> = StaticCell::new();
static ADAPTER: OnceLock<Pin<&'static HostOsal>> = OnceLock::new();

static PIPE: OnceLock<SysMbox> = OnceLock::new();
static SHARED: OnceLock<(SysMutex, SysSem)> = OnceLock::new();
static COUNTER: AtomicU32 = AtomicU32::new(0);
static REPORTED: AtomicBool = AtomicBool::new(false);
static STOP: AtomicBool = AtomicBool::new(false);

/// Line-buffered stdout as a `fmt::Write` sink.
struct Console;

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut out = std::io::stdout().lock();
        out.write_all(s.as_bytes()).map_err(|_| fmt::Error)?;
        out.flush().map_err(|_| fmt::Error)
    }
}

fn adapter() -> Pin<&'static HostOsal> {
    match ADAPTER.get() {
        Some(osal) => *osal,
        None => fail("Failed to find the adapter"),
    }
}

fn fail(what: &str) -> ! {
    println!("{}", what);
    std::process::exit(1);
}

fn producer(_: usize) {
    let osal = adapter();
    let sys = osal.sys_arch();
    if let Some(mbox) = PIPE.get() {
        for n in 1..=PIPE_LEN {
            sys.sys_mbox_post(mbox, Msg::from_addr(n));
        }
    }
    let _ = osal.threads().terminate(ThreadRef::Current);
}

fn contender(id: usize) {
    let osal = adapter();
    let sys = osal.sys_arch();
    if let Some((mutex, done)) = SHARED.get() {
        for round in 0..MTX_ROUNDS {
            sys.sys_mutex_lock(mutex);
            let seen = COUNTER.load(Ordering::Relaxed);
            if round % 5 == id as u32 {
                sys.sys_msleep(1);
            }
            COUNTER.store(seen + 1, Ordering::Relaxed);
            sys.sys_mutex_unlock(mutex);
        }
        sys.sys_sem_signal(done);
    }
    let _ = osal.threads().terminate(ThreadRef::Current);
}

/// Simulated timer interrupt plus statistics task.
fn ticker(kernel: &'static HostKernel, osal: Pin<&'static HostOsal>) {
    let stat_every = 1000 / STAT_TASK_RATE_HZ;
    let mut ticks = 0u32;
    while !STOP.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(1));
        kernel.interrupt(|| osal.on_tick());
        ticks = ticks.wrapping_add(1);
        if ticks % stat_every == 0 {
            let busy = (kernel.ready_count() * 250).min(10_000) as u16;
            kernel.set_cpu_usage(busy, busy.max(1200));
            if osal.on_stat(&mut Console) {
                REPORTED.store(true, Ordering::Relaxed);
            }
        }
    }
}

fn primitives(osal: Pin<&'static HostOsal>) {
    let sys = osal.sys_arch();
    sys.sys_init();

    let mut mbox = SysMbox::default();
    let mut mutex = SysMutex::default();
    let mut done = SysSem::default();
    if sys.sys_mbox_new(&mut mbox, 4) != ERR_OK
        || sys.sys_mutex_new(&mut mutex) != ERR_OK
        || sys.sys_sem_new(&mut done, 0) != ERR_OK
    {
        fail("Failed to create primitives");
    }
    let _ = PIPE.set(mbox);
    let _ = SHARED.set((mutex, done));
    println!("PRIMITIVES_OK");
}

fn pipeline(osal: Pin<&'static HostOsal>) {
    let sys = osal.sys_arch();
    let Some(mbox) = PIPE.get() else {
        fail("Failed to find the pipeline mailbox");
    };
    let producer = sys.sys_thread_new("producer", producer, 0, 1024, 12);
    if !producer.is_valid() {
        fail("Failed to start producer");
    }
    for expected in 1..=PIPE_LEN {
        let mut msg = Msg::NULL;
        if sys.sys_arch_mbox_fetch(mbox, Some(&mut msg), WAIT_MS) == SYS_ARCH_TIMEOUT {
            fail("Failed to receive from producer");
        }
        if msg.addr() != expected {
            println!("Failed to keep order: got {} expected {}", msg.addr(), expected);
            std::process::exit(1);
        }
    }
    println!("PIPE_OK ({} messages in order)", PIPE_LEN);
}

fn mutual_exclusion(osal: Pin<&'static HostOsal>) {
    let sys = osal.sys_arch();
    let Some((_, done)) = SHARED.get() else {
        fail("Failed to find the shared mutex");
    };
    for id in 0..MTX_WORKERS as usize {
        if !sys.sys_thread_new("contender", contender, id, 0, 14).is_valid() {
            fail("Failed to start contender");
        }
    }
    for _ in 0..MTX_WORKERS {
        if sys.sys_arch_sem_wait(done, WAIT_MS) == SYS_ARCH_TIMEOUT {
            fail("Failed to finish contention in time");
        }
    }
    let total = COUNTER.load(Ordering::Relaxed);
    if total != MTX_WORKERS * MTX_ROUNDS {
        println!("Failed to exclude: counter {} after {} increments", total, MTX_WORKERS * MTX_ROUNDS);
        std::process::exit(1);
    }
    println!("MTX_OK (counter {})", total);
}

fn interrupt_side(kernel: &'static HostKernel, osal: Pin<&'static HostOsal>) {
    let sys = osal.sys_arch();
    let mut sem = SysSem::default();
    let mut mbox = SysMbox::default();
    if sys.sys_sem_new(&mut sem, 0) != ERR_OK || sys.sys_mbox_new(&mut mbox, 1) != ERR_OK {
        fail("Failed to create interrupt-side objects");
    }

    if sys.sys_arch_sem_wait(&sem, 10) != SYS_ARCH_TIMEOUT {
        fail("Failed to time out on an empty semaphore");
    }
    kernel.interrupt(|| {
        sys.sys_sem_signal(&sem);
        sys.sys_mbox_trypost_fromisr(&mbox, Msg::from_addr(0x5a))
    });
    let full = kernel.interrupt(|| sys.sys_mbox_trypost_fromisr(&mbox, Msg::NULL));
    if sys.sys_arch_sem_wait(&sem, WAIT_MS) == SYS_ARCH_TIMEOUT || full == ERR_OK {
        fail("Failed to hand over from interrupt context");
    }
    let mut msg = Msg::NULL;
    if sys.sys_arch_mbox_tryfetch(&mbox, Some(&mut msg)) != 0 || msg.addr() != 0x5a {
        fail("Failed to fetch the interrupt message");
    }
    sys.sys_sem_free(&mut sem);
    sys.sys_mbox_free(&mut mbox);
    println!("SEM_OK");
}

fn main() {
    let kernel: &'static HostKernel = KERNEL.init(HostKernel::new());
    let osal: &'static HostOsal = OSAL.init(Osal::new(kernel));
    let osal = Pin::static_ref(osal);
    let _ = ADAPTER.set(osal);

    kernel.register_current(10);
    println!("Running host kernel");

    let timer = std::thread::spawn(move || ticker(kernel, osal));

    primitives(osal);
    pipeline(osal);
    mutual_exclusion(osal);
    interrupt_side(kernel, osal);

    let deadline = std::time::Instant::now() + Duration::from_millis(u64::from(WAIT_MS));
    while !REPORTED.load(Ordering::Relaxed) {
        if std::time::Instant::now() > deadline {
            fail("Failed to emit a health report");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    STOP.store(true, Ordering::Relaxed);
    let _ = timer.join();

    let threads = osal.threads();
    while threads.live() > 0 && std::time::Instant::now() < deadline {
        threads.reap();
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("HEALTH_OK (threads left {})", threads.live());
}
