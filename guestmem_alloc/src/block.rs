//! The unit of allocation.

use guestmem::{BoundedTag, GuestAddr};

/// Storage size of a block tag, terminator included.
pub const BLOCK_TAG_SIZE: usize = 32;
/// The tag stored with every block.
pub type BlockTag = BoundedTag<BLOCK_TAG_SIZE>;

/// Tag of blocks that were never allocated.
pub const UNTITLED_TAG: &str = "(untitled)";
/// Tag of blocks allocated without one.
pub const NO_TAG: &str = "---";

pub(crate) type BlockId = u32;

/// A contiguous part of the managed range, taken or free.
#[derive(Debug, Clone)]
pub struct Block {
    pub(crate) start: GuestAddr,
    pub(crate) size: u32,
    pub(crate) taken: bool,
    pub(crate) tag: BlockTag,
    pub(crate) prev: Option<BlockId>,
    pub(crate) next: Option<BlockId>,
}

impl Block {
    pub(crate) fn untitled(start: GuestAddr, size: u32) -> Self {
        Self {
            start,
            size,
            taken: false,
            tag: BlockTag::new(UNTITLED_TAG),
            prev: None,
            next: None,
        }
    }

    /// First byte of the block.
    #[must_use]
    pub fn start(&self) -> GuestAddr {
        self.start
    }

    /// Length in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// One past the last byte.
    #[must_use]
    pub fn end(&self) -> GuestAddr {
        self.start + self.size
    }

    /// Whether the block is allocated.
    #[must_use]
    pub fn taken(&self) -> bool {
        self.taken
    }

    /// The tag of the latest allocation. Frees keep it.
    #[must_use]
    pub fn tag(&self) -> &str {
        self.tag.as_str()
    }

    pub(crate) fn contains(&self, addr: GuestAddr) -> bool {
        self.start <= addr && u64::from(addr) < u64::from(self.start) + u64::from(self.size)
    }
}
