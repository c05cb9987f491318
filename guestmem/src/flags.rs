//! Event flags and the provenance descriptor handed out by queries.

use bitflags::bitflags;

use crate::GuestAddr;

bitflags! {
    /// What happened to a guest memory range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemBlockFlags: u32 {
        /// Allocated by a top-level allocator (kernel partitions, modules)
        const ALLOC = 0x0001;
        /// Allocated inside an existing allocation (heaps, pools)
        const SUB_ALLOC = 0x0002;
        /// Written by the guest or by emulated hardware
        const WRITE = 0x0004;
        /// Uploaded as a texture
        const TEXTURE = 0x0008;
        /// Released by a top-level allocator
        const FREE = 0x0010;
        /// Released inside an existing allocation
        const SUB_FREE = 0x0020;
        /// Read. Never persisted, only drives memchecks.
        const READ = 0x0800;
        /// Do not run memchecks for this event
        const SKIP_MEMCHECK = 0x0001_0000;
    }
}

/// One provenance record returned by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemBlockInfo {
    /// Which index this record came from
    pub flags: MemBlockFlags,
    /// First byte of the range
    pub start: GuestAddr,
    /// Length of the range in bytes
    pub size: u32,
    /// Emulated time of the latest event that touched the range
    pub ticks: u64,
    /// Program counter of that event
    pub pc: GuestAddr,
    /// Who produced the contents
    pub tag: String,
    /// Whether the range is currently allocated
    pub allocated: bool,
}

impl MemBlockInfo {
    /// One past the last byte of the range.
    #[must_use]
    pub fn end(&self) -> GuestAddr {
        self.start + self.size
    }
}
