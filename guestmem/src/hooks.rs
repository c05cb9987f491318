//! Seams into the emulator: where time and the current pc come from, and who
//! gets to break on memory accesses.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::{sync::Arc, time::Instant};

use crate::GuestAddr;

/// Supplies timestamps and the current program counter for notifications.
pub trait GuestClock: Send + Sync {
    /// Emulated time, monotonic.
    fn ticks(&self) -> u64;

    /// The pc of the instruction currently executing, used when the caller passes none.
    fn pc(&self) -> GuestAddr;
}

/// Memory breakpoints and watchpoints.
///
/// Checks run on the producer thread at notify time, never during a flush.
pub trait MemCheckHook: Send + Sync {
    /// Returns `true` if any memcheck is installed.
    ///
    /// While this holds, copy events resolve their tag eagerly so checks see the real source.
    fn has_mem_checks(&self) -> bool;

    /// Run the checks overlapping `[addr, addr + size)`.
    fn exec_mem_check(&self, addr: GuestAddr, is_write: bool, size: u32, pc: GuestAddr, tag: &str);
}

impl<T> GuestClock for Arc<T>
where
    T: GuestClock + ?Sized,
{
    fn ticks(&self) -> u64 {
        (**self).ticks()
    }

    fn pc(&self) -> GuestAddr {
        (**self).pc()
    }
}

impl<T> MemCheckHook for Arc<T>
where
    T: MemCheckHook + ?Sized,
{
    fn has_mem_checks(&self) -> bool {
        (**self).has_mem_checks()
    }

    fn exec_mem_check(&self, addr: GuestAddr, is_write: bool, size: u32, pc: GuestAddr, tag: &str) {
        (**self).exec_mem_check(addr, is_write, size, pc, tag);
    }
}

/// A clock counting host nanoseconds since it was created. It never knows a pc.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Create a new [`SystemClock`], starting at `0`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestClock for SystemClock {
    fn ticks(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn pc(&self) -> GuestAddr {
        0
    }
}

/// A clock the embedder advances by hand, e.g. from the CPU loop.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
    pc: AtomicU32,
}

impl ManualClock {
    /// Create a new [`ManualClock`] at the given time and pc.
    #[must_use]
    pub fn new(ticks: u64, pc: GuestAddr) -> Self {
        Self {
            ticks: AtomicU64::new(ticks),
            pc: AtomicU32::new(pc),
        }
    }

    /// Set the current time.
    pub fn set_ticks(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }

    /// Advance the time by `delta`, returning the new value.
    pub fn advance(&self, delta: u64) -> u64 {
        self.ticks.fetch_add(delta, Ordering::Relaxed) + delta
    }

    /// Set the current pc.
    pub fn set_pc(&self, pc: GuestAddr) {
        self.pc.store(pc, Ordering::Relaxed);
    }
}

impl GuestClock for ManualClock {
    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn pc(&self) -> GuestAddr {
        self.pc.load(Ordering::Relaxed)
    }
}

/// No memchecks installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopMemCheck;

impl MemCheckHook for NopMemCheck {
    fn has_mem_checks(&self) -> bool {
        false
    }

    fn exec_mem_check(
        &self,
        _addr: GuestAddr,
        _is_write: bool,
        _size: u32,
        _pc: GuestAddr,
        _tag: &str,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::{GuestClock, ManualClock};

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10, 0x0880_0000);
        assert_eq!(clock.advance(5), 15);
        assert_eq!(clock.ticks(), 15);
        clock.set_pc(0x0880_0004);
        assert_eq!(clock.pc(), 0x0880_0004);
    }
}
