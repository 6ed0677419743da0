//! Mutexes, counting semaphores and mailboxes.
//!
//! Each primitive is a view over an [`Arena`](crate::arena::Arena) of kernel
//! objects owned by [`Osal`](crate::Osal). Handles are small `Copy` values;
//! every call resolves the handle first, so a deleted or never-created
//! object yields `InvalidHandle` instead of touching kernel memory.
//!
//! | Operation | ISR-safe |
//! |-----------|----------|
//! | mutex lock / unlock / create / delete | no |
//! | semaphore wait (blocking) | no |
//! | semaphore try_wait, signal | yes |
//! | mailbox post, fetch (blocking) | no |
//! | mailbox try_post, post_from_interrupt, try_fetch | yes |

pub mod mailbox;
pub mod mutex;
pub mod semaphore;

use crate::error::{misuse, Misuse, OsalResult};
use crate::port::Kernel;

/// Refuse thread-only services from interrupt context.
#[inline]
pub(crate) fn thread_context<K: Kernel>(kernel: &K) -> OsalResult<()> {
    if kernel.in_interrupt() {
        Err(misuse(Misuse::InterruptContext))
    } else {
        Ok(())
    }
}
