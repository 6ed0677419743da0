//! Build-time sizing and timing constants.
//!
//! Everything the adapter allocates is sized here; nothing is allocated at
//! runtime.
//!
//! | Constant | Value | Used by |
//! |----------|-------|---------|
//! | `TICK_RATE_HZ` | 1000 | timeout translation, `sys_now` |
//! | `MAX_THREADS` | 8 | control-block and stack pools |
//! | `STACK_WORDS` | 256 | stack block size |
//! | `MAX_MUTEXES` | 16 | mutex arena |
//! | `MAX_SEMAPHORES` | 16 | semaphore arena |
//! | `MAX_MAILBOXES` | 8 | mailbox arena |
//! | `MBOX_CAPACITY_MAX` | 32 | largest mailbox |
//! | `LOAD_WINDOW_TICKS` | 10 | load-average window |
//! | `STAT_TASK_RATE_HZ` | 10 | kernel statistics task rate |

/// Kernel tick frequency.
pub const TICK_RATE_HZ: u32 = 1000;

/// Maximum number of threads created through the adapter.
pub const MAX_THREADS: usize = 8;

/// Size of one stack block in 32-bit words.
pub const STACK_WORDS: usize = 256;

/// Stack watermark handed to the kernel is `STACK_WORDS / STACK_LIMIT_DIVISOR`.
pub const STACK_LIMIT_DIVISOR: usize = 10;

pub const MAX_MUTEXES: usize = 16;
pub const MAX_SEMAPHORES: usize = 16;
pub const MAX_MAILBOXES: usize = 8;

/// Largest mailbox the kernel queue storage can back.
pub const MBOX_CAPACITY_MAX: usize = 32;

/// Number of priority levels; 0 is the most urgent.
pub const PRIORITY_LEVELS: u8 = 64;

/// Least urgent priority; also used for threads unknown to the kernel port.
pub const PRIORITY_LOWEST: u8 = PRIORITY_LEVELS - 1;

/// Priority given to lwIP threads that ask for a negative priority.
pub const LWIP_DEFAULT_PRIORITY: u8 = 32;

/// Load sampler cycle; the averaging window is `LOAD_CYCLE * 10` ticks.
pub const LOAD_CYCLE: u32 = 1;

pub const LOAD_WINDOW_TICKS: u32 = LOAD_CYCLE * 10;

/// Rate at which the kernel statistics task refreshes CPU usage.
pub const STAT_TASK_RATE_HZ: u32 = 10;

/// Only every n-th statistics callback emits a health report.
pub const REPORT_DECIMATION: u8 = 8;

/// Bytes reserved for one formatted health report.
pub const REPORT_CAPACITY: usize = 256;
