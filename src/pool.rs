//! Fixed-block pools for task control blocks and stacks.
//!
//! A pool is an array of `N` blocks plus an occupancy bitmap. Acquire and
//! release are single compare-and-swap updates of the bitmap, so they are
//! safe from any thread and need no lock. A block is either in the bitmap
//! as free or held by exactly one [`Block`] token, never both.

use core::cell::UnsafeCell;
use core::marker::PhantomPinned;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::Misuse;

/// Pool has no free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Exhausted;

/// Ownership token for one allocated block.
///
/// Not `Clone`: releasing consumes it. Code that parks the index elsewhere
/// (the thread registry) rebuilds it with [`Block::from_index`].
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Block {
    index: u8,
}

impl Block {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Give up the token, keeping only its index.
    pub fn into_index(self) -> usize {
        self.index as usize
    }

    /// Rebuild a token from a parked index.
    ///
    /// # Safety
    ///
    /// The caller must own the block at `index`; any other token for it must
    /// have been consumed by [`Block::into_index`].
    pub unsafe fn from_index(index: usize) -> Self {
        Block { index: index as u8 }
    }
}

pub struct ResourcePool<T, const N: usize> {
    blocks: [UnsafeCell<T>; N],
    used: AtomicU32,
    _pin: PhantomPinned,
}

// SAFETY: a block is reachable only through the unique token that owns it.
unsafe impl<T: Send, const N: usize> Sync for ResourcePool<T, N> {}

impl<T: Default, const N: usize> ResourcePool<T, N> {
    const CAPACITY_OK: () = assert!(N > 0 && N <= 32, "pool capacity must be 1..=32");

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;
        ResourcePool {
            blocks: core::array::from_fn(|_| UnsafeCell::new(T::default())),
            used: AtomicU32::new(0),
            _pin: PhantomPinned,
        }
    }
}

impl<T: Default, const N: usize> Default for ResourcePool<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> ResourcePool<T, N> {
    const ALL: u32 = if N == 32 { u32::MAX } else { (1u32 << N) - 1 };

    /// Take a free block. Leaves the pool untouched on failure.
    pub fn acquire(&self) -> Result<Block, Exhausted> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let free = !used & Self::ALL;
            if free == 0 {
                return Err(Exhausted);
            }
            let index = free.trailing_zeros();
            match self.used.compare_exchange_weak(
                used,
                used | (1 << index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(Block { index: index as u8 }),
                Err(actual) => used = actual,
            }
        }
    }

    /// Return a block. Releasing a block that is not held is reported and
    /// changes nothing.
    pub fn release(&self, block: Block) -> Result<(), Misuse> {
        let index = block.index();
        if index >= N {
            os_log!(error, "pool release of foreign block {}", index);
            return Err(Misuse::ForeignBlock);
        }
        let bit = 1u32 << index;
        let prev = self.used.fetch_and(!bit, Ordering::AcqRel);
        if prev & bit == 0 {
            os_log!(error, "pool release of free block {}", index);
            return Err(Misuse::NotHeld);
        }
        Ok(())
    }

    /// Raw pointer to a held block's storage.
    pub fn as_ptr(&self, block: &Block) -> *mut T {
        self.blocks[block.index()].get()
    }

    pub(crate) fn slot_ptr(&self, index: usize) -> *mut T {
        self.blocks[index].get()
    }

    /// Index of the block containing `ptr`, if it points into this pool.
    pub fn index_of(&self, ptr: *const T) -> Option<usize> {
        let base = self.blocks.as_ptr() as usize;
        let size = core::mem::size_of::<UnsafeCell<T>>();
        let addr = ptr as usize;
        if size == 0 || addr < base {
            return None;
        }
        let offset = addr - base;
        let index = offset / size;
        (offset % size == 0 && index < N).then_some(index)
    }

    pub fn is_held(&self, index: usize) -> bool {
        index < N && self.used.load(Ordering::Acquire) & (1 << index) != 0
    }

    /// Number of blocks currently held.
    pub fn occupancy(&self) -> usize {
        self.used.load(Ordering::Acquire).count_ones() as usize
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_returns_disjoint_blocks() {
        let pool: ResourcePool<u64, 4> = ResourcePool::new();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert_ne!(b.index(), c.index());
        assert_ne!(a.index(), c.index());
        assert_ne!(pool.as_ptr(&a), pool.as_ptr(&b));
        assert_eq!(pool.occupancy(), 3);

        pool.release(b).unwrap();
        let d = pool.acquire().unwrap();
        assert_ne!(d.index(), a.index());
        assert_ne!(d.index(), c.index());
    }

    #[test]
    fn exhaustion_leaves_state_unchanged() {
        let pool: ResourcePool<u32, 2> = ResourcePool::new();
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.acquire(), Err(Exhausted));
        assert_eq!(pool.acquire(), Err(Exhausted));
        assert_eq!(pool.occupancy(), 2);
    }

    #[test]
    fn double_release_is_detected() {
        let pool: ResourcePool<u32, 2> = ResourcePool::new();
        let a = pool.acquire().unwrap();
        let index = a.index();
        pool.release(a).unwrap();
        let again = unsafe { Block::from_index(index) };
        assert_eq!(pool.release(again), Err(Misuse::NotHeld));
        assert_eq!(pool.occupancy(), 0);
    }

    #[test]
    fn foreign_block_is_detected() {
        let pool: ResourcePool<u32, 2> = ResourcePool::new();
        let bogus = unsafe { Block::from_index(7) };
        assert_eq!(pool.release(bogus), Err(Misuse::ForeignBlock));
    }

    #[test]
    fn full_width_pool() {
        let pool: ResourcePool<u8, 32> = ResourcePool::new();
        let held: std::vec::Vec<Block> = (0..32).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.occupancy(), 32);
        assert!(pool.acquire().is_err());
        for b in held {
            pool.release(b).unwrap();
        }
        assert_eq!(pool.occupancy(), 0);
    }

    #[test]
    fn index_of_maps_back() {
        let pool: ResourcePool<[u32; 3], 4> = ResourcePool::new();
        let _a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.index_of(pool.as_ptr(&b)), Some(b.index()));
        let inside = (pool.as_ptr(&b) as usize + 4) as *const [u32; 3];
        assert_eq!(pool.index_of(inside), None);
        let x = [0u32; 3];
        assert_eq!(pool.index_of(&x), None);
    }

    #[test]
    fn concurrent_acquire_never_hands_out_a_block_twice() {
        let pool: ResourcePool<u32, 16> = ResourcePool::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        if let Ok(block) = pool.acquire() {
                            let ptr = pool.as_ptr(&block);
                            unsafe {
                                assert_eq!(*ptr, 0);
                                *ptr = 1;
                                *ptr = 0;
                            }
                            pool.release(block).unwrap();
                        }
                    }
                });
            }
        });
        assert_eq!(pool.occupancy(), 0);
    }
}
