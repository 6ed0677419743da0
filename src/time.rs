//! Millisecond timeouts to kernel ticks.
//!
//! Callers speak milliseconds with `0` meaning "wait forever" (the lwIP
//! convention). The kernel speaks ticks. Conversion rounds down, except
//! that a positive timeout never collapses to zero ticks: it waits at least
//! one tick so it cannot turn into either "forever" or "don't wait".

use core::num::NonZeroU32;

use crate::config::TICK_RATE_HZ;

/// Whether a request may suspend the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitMode {
    Blocking,
    NonBlocking,
}

/// A translated wait request handed to the kernel port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wait {
    /// Block until the object becomes available
    Forever,
    /// Block for at most this many ticks
    Ticks(NonZeroU32),
    /// Return immediately; used by the try-style operations
    NoWait,
}

impl Wait {
    pub const fn mode(self) -> WaitMode {
        match self {
            Wait::NoWait => WaitMode::NonBlocking,
            Wait::Forever | Wait::Ticks(_) => WaitMode::Blocking,
        }
    }

    /// Tick count in the µC/OS convention, where `0` with a blocking mode
    /// means forever.
    pub const fn ticks(self) -> u32 {
        match self {
            Wait::Ticks(t) => t.get(),
            Wait::Forever | Wait::NoWait => 0,
        }
    }

    /// `(ticks, mode)` pair for ports that take the two separately.
    pub const fn parts(self) -> (u32, WaitMode) {
        (self.ticks(), self.mode())
    }
}

/// Translate a caller timeout at the configured tick rate.
#[inline]
pub const fn translate(millis: u32) -> Wait {
    translate_at(millis, TICK_RATE_HZ)
}

/// Translate a caller timeout at an explicit tick rate.
pub const fn translate_at(millis: u32, tick_hz: u32) -> Wait {
    if millis == 0 {
        return Wait::Forever;
    }
    match NonZeroU32::new(millis_to_ticks_at(millis, tick_hz)) {
        Some(t) => Wait::Ticks(t),
        None => Wait::Forever,
    }
}

/// Milliseconds to ticks, rounding down with a floor of one tick for any
/// positive duration. Saturates at `u32::MAX`.
pub const fn millis_to_ticks_at(millis: u32, tick_hz: u32) -> u32 {
    if millis == 0 {
        return 0;
    }
    let ticks = millis as u64 * tick_hz as u64 / 1000;
    if ticks == 0 {
        1
    } else if ticks > u32::MAX as u64 {
        u32::MAX
    } else {
        ticks as u32
    }
}

/// Ticks to milliseconds at the configured tick rate, rounding down and
/// wrapping like the tick counter.
#[inline]
pub const fn ticks_to_millis(ticks: u32) -> u32 {
    ticks_to_millis_at(ticks, TICK_RATE_HZ)
}

pub const fn ticks_to_millis_at(ticks: u32, tick_hz: u32) -> u32 {
    (ticks as u64 * 1000 / tick_hz as u64) as u32
}
