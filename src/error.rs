//! Kernel status mapping and the adapter's error taxonomy.
//!
//! Two layers of errors exist:
//!
//! - [`KernelError`] is what a [`Kernel`](crate::port::Kernel) port reports.
//!   Ports wrapping a C kernel convert their native status codes with
//!   [`KernelError::from_code`] or [`KernelError::check`].
//! - [`OsalError`] is what the adapter hands to its callers. Expected
//!   conditions (`Timeout`, `Full`, `Empty`) are kept apart from programmer
//!   errors ([`Misuse`], `InvalidHandle`), which are logged at the point of
//!   detection before being returned.
//!
//! # Kernel Status Codes
//!
//! | Code | Variant | Description |
//! |------|---------|-------------|
//! | 0x00 | (success) | Operation completed |
//! | 0x01 | WouldBlock | Resource unavailable and no wait requested |
//! | 0x02 | Timeout | Wait expired |
//! | 0x03 | Deleted | Object deleted while waiting |
//! | 0x04 | NotOwner | Mutex not owned by caller |
//! | 0x05 | Nested | Mutex already owned by caller |
//! | 0x06 | InterruptContext | Blocking call from an ISR |
//! | 0x07 | NotCreated | Object not created |
//! | 0x08 | AlreadyCreated | Object already created |
//! | 0x09 | NoMemory | Insufficient kernel memory |
//! | 0x0A | InvalidSize | Invalid size parameter |
//! | 0x0B | InvalidPriority | Invalid priority value |
//! | 0x0C | Overflow | Counter overflow |
//! | 0x0D | NotDone | Task still runnable |

use core::fmt;

/// Status reported by a kernel port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum KernelError {
    /// Resource unavailable and the caller asked not to wait
    WouldBlock = 0x01,
    /// Wait expired
    Timeout = 0x02,
    /// Object deleted while the caller was waiting on it
    Deleted = 0x03,
    /// Mutex release by a task that does not own it
    NotOwner = 0x04,
    /// Mutex acquire by its current owner
    Nested = 0x05,
    /// Blocking service requested from interrupt context
    InterruptContext = 0x06,
    /// Object was never created or is already deleted
    NotCreated = 0x07,
    /// Object storage already holds a live object
    AlreadyCreated = 0x08,
    /// Kernel could not provide storage
    NoMemory = 0x09,
    /// Size parameter out of range
    InvalidSize = 0x0A,
    /// Priority outside the kernel's range
    InvalidPriority = 0x0B,
    /// Counter would overflow
    Overflow = 0x0C,
    /// Task still schedulable; its control block cannot be reused yet
    NotDone = 0x0D,
    /// Unknown status code
    Unknown = 0xFFFF_FFFF,
}

impl KernelError {
    /// Convert a raw non-zero status code.
    pub const fn from_code(code: u32) -> Self {
        match code {
            0x01 => KernelError::WouldBlock,
            0x02 => KernelError::Timeout,
            0x03 => KernelError::Deleted,
            0x04 => KernelError::NotOwner,
            0x05 => KernelError::Nested,
            0x06 => KernelError::InterruptContext,
            0x07 => KernelError::NotCreated,
            0x08 => KernelError::AlreadyCreated,
            0x09 => KernelError::NoMemory,
            0x0A => KernelError::InvalidSize,
            0x0B => KernelError::InvalidPriority,
            0x0C => KernelError::Overflow,
            0x0D => KernelError::NotDone,
            _ => KernelError::Unknown,
        }
    }

    /// Map a raw status code where zero means success.
    #[inline]
    pub const fn check(code: u32) -> KernelResult<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(KernelError::from_code(code))
        }
    }

    /// Get the raw numeric code.
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn description(self) -> &'static str {
        match self {
            KernelError::WouldBlock => "resource not available",
            KernelError::Timeout => "wait timed out",
            KernelError::Deleted => "object deleted during wait",
            KernelError::NotOwner => "mutex not owned by caller",
            KernelError::Nested => "mutex already owned by caller",
            KernelError::InterruptContext => "blocking call from interrupt context",
            KernelError::NotCreated => "object not created",
            KernelError::AlreadyCreated => "object already created",
            KernelError::NoMemory => "insufficient kernel memory",
            KernelError::InvalidSize => "invalid size parameter",
            KernelError::InvalidPriority => "invalid priority value",
            KernelError::Overflow => "counter overflow",
            KernelError::NotDone => "task still runnable",
            KernelError::Unknown => "unknown status code",
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Result type for kernel port calls.
pub type KernelResult<T> = Result<T, KernelError>;

/// Programmer errors detected at runtime.
///
/// Never expected in a correct program. Each one is logged at error level
/// where it is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Misuse {
    /// Blocking or thread-only service called from an ISR
    InterruptContext,
    /// Mutex locked again by its owner
    RecursiveLock,
    /// Critical section exit without a matching enter
    UnbalancedExit,
    /// Pool block released while not held
    NotHeld,
    /// Pool block index outside the pool
    ForeignBlock,
    /// Object deleted while tasks were blocked on it
    WaitersOnDelete(u32),
    /// Mailbox deleted with unconsumed messages
    MessagesOnDelete(u32),
}

impl fmt::Display for Misuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Misuse::InterruptContext => f.write_str("thread-only call from interrupt context"),
            Misuse::RecursiveLock => f.write_str("recursive mutex lock"),
            Misuse::UnbalancedExit => f.write_str("critical section exit without enter"),
            Misuse::NotHeld => f.write_str("release of a block that is not held"),
            Misuse::ForeignBlock => f.write_str("release of a block from another pool"),
            Misuse::WaitersOnDelete(n) => write!(f, "deleted with {} waiters", n),
            Misuse::MessagesOnDelete(n) => write!(f, "deleted with {} pending messages", n),
        }
    }
}

/// Errors returned by the adapter API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OsalError {
    /// Pool or arena exhausted, or the kernel refused to create the object
    OutOfResources,
    /// Blocking wait expired
    Timeout,
    /// Mailbox at capacity
    Full,
    /// Mailbox has no message
    Empty,
    /// Object deleted while the caller was blocked on it
    Deleted,
    /// Mutex unlocked by a task that does not hold it
    NotOwner,
    /// Handle does not refer to a live object
    InvalidHandle,
    /// Programmer error
    Misuse(Misuse),
    /// Unexpected kernel status
    Kernel(KernelError),
}

impl From<KernelError> for OsalError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Timeout => OsalError::Timeout,
            KernelError::Deleted => OsalError::Deleted,
            KernelError::NotOwner => OsalError::NotOwner,
            KernelError::NoMemory => OsalError::OutOfResources,
            KernelError::Nested => misuse(Misuse::RecursiveLock),
            KernelError::InterruptContext => misuse(Misuse::InterruptContext),
            KernelError::NotCreated => OsalError::InvalidHandle,
            other => OsalError::Kernel(other),
        }
    }
}

impl fmt::Display for OsalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsalError::OutOfResources => f.write_str("out of resources"),
            OsalError::Timeout => f.write_str("timed out"),
            OsalError::Full => f.write_str("mailbox full"),
            OsalError::Empty => f.write_str("mailbox empty"),
            OsalError::Deleted => f.write_str("object deleted while waiting"),
            OsalError::NotOwner => f.write_str("mutex not held by caller"),
            OsalError::InvalidHandle => f.write_str("invalid handle"),
            OsalError::Misuse(m) => write!(f, "misuse: {}", m),
            OsalError::Kernel(e) => write!(f, "kernel: {}", e),
        }
    }
}

pub type OsalResult<T> = Result<T, OsalError>;

/// Log a programmer error and wrap it.
#[cold]
pub(crate) fn misuse(kind: Misuse) -> OsalError {
    os_log!(error, "misuse detected: {}", kind);
    OsalError::Misuse(kind)
}
