/*!
Guest memory provenance tracking.

Every allocation, free, write and texture upload an emulator performs can be
reported to a [`MemInfo`] context. Events are queued cheaply on the producer
side and applied in batches to four [`SlabMap`] indices, one per kind of
event, by a background worker or on demand before any query. Debugger tooling
can then ask who allocated, wrote, or uploaded any guest address, and when.
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::too_many_arguments
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

pub mod config;
pub mod flags;
pub mod hooks;
pub mod meminfo;
pub mod pending;
pub mod slab;

use std::{rc::Rc, sync::Arc};

pub use config::MemInfoConfig;
pub use flags::{MemBlockFlags, MemBlockInfo};
pub use guestmem_bolts::{BoundedTag, Error};
pub use hooks::{GuestClock, ManualClock, MemCheckHook, NopMemCheck, SystemClock};
pub use meminfo::MemInfo;
pub use slab::{Slab, SlabMap, SlabTag, MAX_SIZE};

/// A 32-bit guest address.
pub type GuestAddr = u32;

/// Addresses below this go to the low pending window, the rest to the high one.
pub const WINDOW_SPLIT: GuestAddr = 0x0800_0000;

const VRAM_SELECT_MASK: GuestAddr = 0x3F00_0000;
const VRAM_BASE: GuestAddr = 0x0400_0000;
const VRAM_MIRROR_MASK: GuestAddr = 0x041F_FFFF;
const SEGMENT_MASK: GuestAddr = 0x3FFF_FFFF;

/// Fold mirrored guest addresses onto one canonical address.
///
/// The VRAM mirrors collapse onto its 2 MiB base range, every other address
/// loses its cache and kernel selector bits.
#[must_use]
pub const fn normalize_address(addr: GuestAddr) -> GuestAddr {
    if addr & VRAM_SELECT_MASK == VRAM_BASE {
        addr & VRAM_MIRROR_MASK
    } else {
        addr & SEGMENT_MASK
    }
}

/// Something that wants to hear about allocations and frees.
///
/// Allocators report through this trait so they stay independent of how, or
/// whether, provenance is recorded.
pub trait MemNotify {
    /// Report that `[start, start + size)` was touched as described by `flags`.
    fn notify(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, tag: &str);
}

impl<T> MemNotify for &T
where
    T: MemNotify + ?Sized,
{
    fn notify(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, tag: &str) {
        (**self).notify(flags, start, size, tag);
    }
}

impl<T> MemNotify for Arc<T>
where
    T: MemNotify + ?Sized,
{
    fn notify(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, tag: &str) {
        (**self).notify(flags, start, size, tag);
    }
}

impl<T> MemNotify for Rc<T>
where
    T: MemNotify + ?Sized,
{
    fn notify(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, tag: &str) {
        (**self).notify(flags, start, size, tag);
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopNotify;

impl MemNotify for NopNotify {
    fn notify(&self, _flags: MemBlockFlags, _start: GuestAddr, _size: u32, _tag: &str) {}
}

#[cfg(test)]
mod tests {
    use super::normalize_address;

    #[test]
    fn test_normalize_address() {
        // Cached and uncached views of main RAM are the same memory.
        assert_eq!(normalize_address(0x0880_0000), 0x0880_0000);
        assert_eq!(normalize_address(0x4880_0000), 0x0880_0000);
        assert_eq!(normalize_address(0x8880_0000), 0x0880_0000);
        // VRAM mirrors collapse onto the base window.
        assert_eq!(normalize_address(0x0400_1000), 0x0400_1000);
        assert_eq!(normalize_address(0x0460_1000), 0x0400_1000);
        assert_eq!(normalize_address(0x4420_1000), 0x0400_1000);
    }
}
