//! Slot arenas holding kernel object storage.
//!
//! Kernel objects are referenced by address, so their storage lives in
//! fixed arrays inside the adapter and callers hold small `(index,
//! generation)` handles instead of pointers. Each slot carries a validity
//! tag:
//!
//! ```text
//! Free ──claim──► Claimed ──publish──► Live ──close──► Closing ──retire──► Free
//!                    │                  ▲                 │
//!                    └──abandon─► Free  └─────reopen──────┘
//! ```
//!
//! `retire` bumps the slot generation, so a handle kept past `delete` no
//! longer matches even after the slot is reused.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{OsalError, OsalResult};

const FREE: u8 = 0;
const CLAIMED: u8 = 1;
const LIVE: u8 = 2;
const CLOSING: u8 = 3;

/// Untyped slot handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RawHandle {
    index: u8,
    generation: u8,
}

impl RawHandle {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u8 {
        self.generation
    }
}

struct Slot<T> {
    tag: AtomicU8,
    generation: AtomicU8,
    object: T,
}

pub struct Arena<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T: Default, const N: usize> Arena<T, N> {
    const CAPACITY_OK: () = assert!(N > 0 && N <= 256, "arena capacity must be 1..=256");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        Arena {
            slots: core::array::from_fn(|_| Slot {
                tag: AtomicU8::new(FREE),
                generation: AtomicU8::new(0),
                object: T::default(),
            }),
        }
    }
}

impl<T: Default, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> Arena<T, N> {
    /// Reserve a free slot for creation.
    pub(crate) fn claim(&self) -> Option<(RawHandle, &T)> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.tag
                .compare_exchange(FREE, CLAIMED, Ordering::AcqRel, Ordering::Relaxed)
                .ok()
                .map(|_| {
                    let handle = RawHandle {
                        index: index as u8,
                        generation: slot.generation.load(Ordering::Relaxed),
                    };
                    (handle, &slot.object)
                })
        })
    }

    /// Mark a claimed slot live once the kernel object exists.
    pub(crate) fn publish(&self, handle: RawHandle) {
        self.slots[handle.index()].tag.store(LIVE, Ordering::Release);
    }

    /// Give back a claimed slot whose creation failed.
    pub(crate) fn abandon(&self, handle: RawHandle) {
        self.slots[handle.index()].tag.store(FREE, Ordering::Release);
    }

    /// Resolve a handle to a live object.
    pub(crate) fn get(&self, handle: RawHandle) -> OsalResult<&T> {
        let slot = self.slot(handle)?;
        if slot.tag.load(Ordering::Acquire) == LIVE {
            Ok(&slot.object)
        } else {
            Err(invalid(handle))
        }
    }

    /// Start deleting: the handle stops resolving.
    pub(crate) fn close(&self, handle: RawHandle) -> OsalResult<&T> {
        let slot = self.slot(handle)?;
        slot.tag
            .compare_exchange(LIVE, CLOSING, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| &slot.object)
            .map_err(|_| invalid(handle))
    }

    /// Undo `close` after a failed kernel delete.
    pub(crate) fn reopen(&self, handle: RawHandle) {
        self.slots[handle.index()].tag.store(LIVE, Ordering::Release);
    }

    /// Finish deleting and free the slot.
    pub(crate) fn retire(&self, handle: RawHandle) {
        let slot = &self.slots[handle.index()];
        slot.generation.fetch_add(1, Ordering::Relaxed);
        slot.tag.store(FREE, Ordering::Release);
    }

    pub fn is_live(&self, handle: RawHandle) -> bool {
        self.get(handle).is_ok()
    }

    /// Number of live objects.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.tag.load(Ordering::Acquire) == LIVE)
            .count()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn slot(&self, handle: RawHandle) -> OsalResult<&Slot<T>> {
        let slot = self.slots.get(handle.index()).ok_or_else(|| invalid(handle))?;
        if slot.generation.load(Ordering::Relaxed) != handle.generation {
            return Err(invalid(handle));
        }
        Ok(slot)
    }
}

#[cold]
fn invalid(handle: RawHandle) -> OsalError {
    os_log!(
        error,
        "stale or invalid handle {}:{}",
        handle.index,
        handle.generation
    );
    OsalError::InvalidHandle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let arena: Arena<u32, 2> = Arena::new();
        let (h, _) = arena.claim().unwrap();
        assert_eq!(arena.get(h), Err(OsalError::InvalidHandle));
        arena.publish(h);
        assert!(arena.is_live(h));
        assert_eq!(arena.live(), 1);

        arena.close(h).unwrap();
        assert!(!arena.is_live(h));
        arena.reopen(h);
        assert!(arena.is_live(h));

        arena.close(h).unwrap();
        arena.retire(h);
        assert_eq!(arena.live(), 0);
        assert_eq!(arena.get(h), Err(OsalError::InvalidHandle));
    }

    #[test]
    fn stale_handle_after_reuse() {
        let arena: Arena<u32, 1> = Arena::new();
        let (old, _) = arena.claim().unwrap();
        arena.publish(old);
        arena.close(old).unwrap();
        arena.retire(old);

        let (new, _) = arena.claim().unwrap();
        arena.publish(new);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert!(arena.get(old).is_err());
        assert!(arena.close(old).is_err());
        assert!(arena.is_live(new));
    }

    #[test]
    fn claim_exhausts() {
        let arena: Arena<u32, 2> = Arena::new();
        let (a, _) = arena.claim().unwrap();
        let _b = arena.claim().unwrap();
        assert!(arena.claim().is_none());
        arena.abandon(a);
        assert!(arena.claim().is_some());
    }
}
