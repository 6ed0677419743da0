//! Nestable critical sections.
//!
//! Every `enter` masks interrupts through the kernel, but only the outermost
//! one records the mask state it found, and only the matching outermost
//! `exit` restores it. The counter is touched only with interrupts masked,
//! which on a single core also keeps every other task out.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{misuse, Misuse, OsalResult};
use crate::port::{IrqState, Kernel};

pub struct CriticalSection<'k, K: Kernel> {
    kernel: &'k K,
    nesting: AtomicU32,
    saved: AtomicU32,
}

impl<'k, K: Kernel> CriticalSection<'k, K> {
    pub fn new(kernel: &'k K) -> Self {
        CriticalSection {
            kernel,
            nesting: AtomicU32::new(0),
            saved: AtomicU32::new(0),
        }
    }

    /// Enter and return the nesting depth before this call.
    pub fn enter(&self) -> u32 {
        let state: IrqState = self.kernel.interrupt_disable();
        let depth = self.nesting.load(Ordering::Relaxed);
        if depth == 0 {
            self.saved.store(state, Ordering::Relaxed);
        }
        self.nesting.store(depth + 1, Ordering::Relaxed);
        depth
    }

    /// Leave one level. Exiting more often than entering is reported and
    /// leaves the mask state alone.
    pub fn exit(&self) -> OsalResult<()> {
        let depth = self.nesting.load(Ordering::Relaxed);
        if depth == 0 {
            return Err(misuse(Misuse::UnbalancedExit));
        }
        self.nesting.store(depth - 1, Ordering::Relaxed);
        if depth == 1 {
            self.kernel
                .interrupt_restore(self.saved.load(Ordering::Relaxed));
        }
        Ok(())
    }

    /// Current nesting depth.
    pub fn depth(&self) -> u32 {
        self.nesting.load(Ordering::Relaxed)
    }

    /// Enter and get a guard that exits on drop.
    pub fn lock(&self) -> CriticalGuard<'_, 'k, K> {
        self.enter();
        CriticalGuard {
            section: self,
            _not_send: PhantomData,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock();
        f()
    }
}

/// Held critical section. `!Send`: it must be released by the context that
/// entered it.
#[must_use = "the critical section ends when the guard is dropped"]
pub struct CriticalGuard<'a, 'k, K: Kernel> {
    section: &'a CriticalSection<'k, K>,
    _not_send: PhantomData<*const ()>,
}

impl<K: Kernel> Drop for CriticalGuard<'_, '_, K> {
    fn drop(&mut self) {
        let _ = self.section.exit();
    }
}
