//! Events waiting to be applied to the indices.
//!
//! Producers append to a [`PendingQueue`] under a short lock; a flush swaps the
//! whole buffer out at once. [`PendingWindows`] remember which addresses the
//! queued events touch, so readers only pay for a flush when it matters.

use core::sync::atomic::{AtomicU32, Ordering};
use std::mem;

use crate::{slab::SlabTag, GuestAddr, MemBlockFlags, WINDOW_SPLIT};

/// Number of most recent events a new event may be folded into.
const MERGE_WINDOW: usize = 4;

/// One queued notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNotify {
    /// What happened
    pub flags: MemBlockFlags,
    /// Normalized start address
    pub start: GuestAddr,
    /// Length in bytes
    pub size: u32,
    /// For copies, where the contents came from. The tag then holds the prefix only.
    pub copy_src: Option<GuestAddr>,
    /// When it happened
    pub ticks: u64,
    /// Who did it
    pub pc: GuestAddr,
    /// Tag to apply
    pub tag: SlabTag,
}

impl PendingNotify {
    /// A plain event.
    #[must_use]
    pub fn new(
        flags: MemBlockFlags,
        start: GuestAddr,
        size: u32,
        ticks: u64,
        pc: GuestAddr,
        tag: &str,
    ) -> Self {
        Self {
            flags,
            start,
            size,
            copy_src: None,
            ticks,
            pc,
            tag: SlabTag::new(tag),
        }
    }

    /// A write whose tag is derived from `src` when it is applied.
    #[must_use]
    pub fn copy(
        dest: GuestAddr,
        src: GuestAddr,
        size: u32,
        ticks: u64,
        pc: GuestAddr,
        prefix: &str,
    ) -> Self {
        Self {
            copy_src: Some(src),
            ..Self::new(MemBlockFlags::WRITE, dest, size, ticks, pc, prefix)
        }
    }

    fn overlaps(&self, other: &Self) -> bool {
        u64::from(self.start) < u64::from(other.start) + u64::from(other.size)
            && u64::from(other.start) < u64::from(self.start) + u64::from(self.size)
    }
}

/// The producer side buffer.
#[derive(Debug)]
pub struct PendingQueue {
    events: Vec<PendingNotify>,
    capacity: usize,
}

impl PendingQueue {
    /// Create an empty queue, reserving `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue `event`, folding it into a recent one if possible. Returns the new length.
    pub fn push(&mut self, event: PendingNotify) -> usize {
        if event.copy_src.is_some() || !self.merge_recent(&event) {
            self.events.push(event);
        }
        self.events.len()
    }

    /// Try to fold `event` into one of the last few queued events.
    ///
    /// Repeated writes to one buffer are common, e.g. a guest filling memory in a
    /// loop. An earlier event of the same kind starting at the same address and no
    /// larger than `event` is superseded, so it takes over the new size and provenance.
    /// Disjoint events in between are skipped. Any copy, or any other overlapping
    /// event, stops the search: folding past it would reorder the two.
    pub fn merge_recent(&mut self, event: &PendingNotify) -> bool {
        if self.events.len() < MERGE_WINDOW {
            return false;
        }
        for prev in self.events.iter_mut().rev().take(MERGE_WINDOW) {
            if prev.copy_src.is_some() {
                return false;
            }
            if !prev.overlaps(event) {
                continue;
            }
            if prev.flags != event.flags || prev.start != event.start || prev.size > event.size {
                return false;
            }
            prev.tag = event.tag;
            prev.size = event.size;
            prev.ticks = event.ticks;
            prev.pc = event.pc;
            return true;
        }
        false
    }

    /// Swap out all queued events, leaving a fresh buffer behind.
    pub fn take(&mut self) -> Vec<PendingNotify> {
        mem::replace(&mut self.events, Vec::with_capacity(self.capacity))
    }

    /// Drop all queued events.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Number of queued events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The queued events, oldest first.
    #[must_use]
    pub fn events(&self) -> &[PendingNotify] {
        &self.events
    }
}

/// A running `[min, max)` accumulator.
#[derive(Debug)]
struct Window {
    min: AtomicU32,
    max: AtomicU32,
}

impl Window {
    const fn new() -> Self {
        Self {
            min: AtomicU32::new(u32::MAX),
            max: AtomicU32::new(0),
        }
    }

    fn widen(&self, start: GuestAddr, end: GuestAddr) {
        self.min.fetch_min(start, Ordering::Release);
        self.max.fetch_max(end, Ordering::Release);
    }

    fn overlaps(&self, start: GuestAddr, end: GuestAddr) -> bool {
        self.min.load(Ordering::Acquire) < end && self.max.load(Ordering::Acquire) >= start
    }

    fn reset(&self) {
        self.min.store(u32::MAX, Ordering::Release);
        self.max.store(0, Ordering::Release);
    }
}

/// Address bounds of the queued events, split in a low and a high window.
///
/// Updated under the producer lock, but readable without it.
#[derive(Debug)]
pub struct PendingWindows {
    low: Window,
    high: Window,
}

impl Default for PendingWindows {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingWindows {
    /// Both windows empty.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            low: Window::new(),
            high: Window::new(),
        }
    }

    /// Account for a queued event at `[start, start + size)`.
    pub fn widen(&self, start: GuestAddr, size: u32) {
        let end = start.saturating_add(size);
        if start < WINDOW_SPLIT {
            self.low.widen(start, end);
        } else {
            self.high.widen(start, end);
        }
    }

    /// Returns `true` if a queued event may touch `[start, start + size)`.
    #[must_use]
    pub fn overlaps(&self, start: GuestAddr, size: u32) -> bool {
        let end = start.saturating_add(size);
        self.low.overlaps(start, end) || self.high.overlaps(start, end)
    }

    /// Forget all bounds, after the queue was drained.
    pub fn reset(&self) {
        self.low.reset();
        self.high.reset();
    }
}
