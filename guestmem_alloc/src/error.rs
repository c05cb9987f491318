//! Allocation failures.

use guestmem::GuestAddr;
use thiserror::Error;

/// Why a [`crate::BlockAllocator`] request failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free block can hold the request
    #[error("Out of memory: no free block fits 0x{size:x} bytes")]
    OutOfMemory {
        /// The size after rounding to the grain
        size: u32,
    },
    /// The requested position lies in a taken block, or the free block there is too small
    #[error("Overlap: 0x{position:08x} (0x{size:x} bytes) collides with a live block")]
    Overlap {
        /// The requested position
        position: GuestAddr,
        /// The requested size
        size: u32,
    },
    /// Zero size, a size larger than the range, or a position outside it
    #[error("Invalid range: 0x{position:08x} (0x{size:x} bytes)")]
    InvalidRange {
        /// The requested position, or the range start for positionless requests
        position: GuestAddr,
        /// The requested size
        size: u32,
    },
}
