//! # allocator
//! A first-fit allocator over one guest address range, keeping an address
//! ordered list of taken and free blocks. Allocations split a free block into
//! up to three parts, frees coalesce the block with its free neighbours, so
//! two free blocks are never adjacent.
//!
//! There is no locking: an allocator belongs to the thread emulating the
//! kernel. Blocks live in an arena and link to each other by index.

use guestmem::{GuestAddr, MemBlockFlags, MemNotify};
use guestmem_bolts::{Error, StateReader, StateWriter};
use log::{debug, error, warn};

use crate::{
    block::{Block, BlockId, BlockTag, BLOCK_TAG_SIZE, NO_TAG},
    AllocError,
};

/// Blocks above this are certainly bogus.
const BOGUS_BLOCK_START: GuestAddr = 0xC000_0000;

#[inline]
fn align_up(value: u64, grain: u32) -> u64 {
    let grain = u64::from(grain);
    (value + grain - 1) & !(grain - 1)
}

/// A splitting and coalescing block allocator, see the module docs.
///
/// Taking and freeing blocks is reported to `N`.
#[derive(Debug)]
pub struct BlockAllocator<N: MemNotify> {
    blocks: Vec<Block>,
    free_slots: Vec<BlockId>,
    bottom: Option<BlockId>,
    top: Option<BlockId>,
    range_start: GuestAddr,
    range_size: u32,
    grain: u32,
    suballoc: bool,
    notify: N,
}

impl<N: MemNotify> BlockAllocator<N> {
    /// Kernel partitions are managed in 256 byte units.
    pub const DEFAULT_GRAIN: u32 = 0x100;

    /// Create an allocator managing nothing yet, see [`BlockAllocator::init`].
    ///
    /// `grain` is the minimum alignment and size unit. It should be a power of two,
    /// anything else is rounded up to the next one.
    pub fn new(grain: u32, notify: N) -> Self {
        let grain = if grain.is_power_of_two() {
            grain
        } else {
            let rounded = grain.checked_next_power_of_two().unwrap_or(1 << 31);
            error!("Bogus grain {grain:08x}, using {rounded:08x}");
            rounded
        };
        Self {
            blocks: Vec::new(),
            free_slots: Vec::new(),
            bottom: None,
            top: None,
            range_start: 0,
            range_size: 0,
            grain,
            suballoc: false,
            notify,
        }
    }

    /// Manage `[start, start + size)`, dropping all previous blocks.
    ///
    /// With `suballoc`, allocations are reported as sub-allocations, for heaps living
    /// inside memory another allocator handed out.
    ///
    /// A range running past the end of the address space is cut short. An empty
    /// range leaves the allocator without blocks.
    pub fn init(&mut self, start: GuestAddr, size: u32, suballoc: bool) {
        self.shutdown();
        let max_size = GuestAddr::MAX - start;
        let size = if size > max_size {
            error!("Range {start:08x} + {size:08x} overflows, truncating to {max_size:08x} bytes");
            max_size
        } else {
            size
        };
        self.range_start = start;
        self.range_size = size;
        self.suballoc = suballoc;
        if size == 0 {
            error!("Block allocator at {start:08x} initialized with an empty range");
            return;
        }
        let id = self.alloc_slot(Block::untitled(start, size));
        self.bottom = Some(id);
        self.top = Some(id);
    }

    /// Drop every block. Nothing is reported.
    pub fn shutdown(&mut self) {
        self.blocks.clear();
        self.free_slots.clear();
        self.bottom = None;
        self.top = None;
    }

    /// First byte of the managed range.
    #[must_use]
    pub fn range_start(&self) -> GuestAddr {
        self.range_start
    }

    /// Size of the managed range.
    #[must_use]
    pub fn range_size(&self) -> u32 {
        self.range_size
    }

    /// The minimum alignment and size unit.
    #[must_use]
    pub fn grain(&self) -> u32 {
        self.grain
    }

    /// Where notifications go.
    #[must_use]
    pub fn notifier(&self) -> &N {
        &self.notify
    }

    /// Number of blocks, taken or free.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len() - self.free_slots.len()
    }

    /// Returns `true` before [`BlockAllocator::init`] or after [`BlockAllocator::shutdown`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bottom.is_none()
    }

    /// All blocks in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Block> + '_ {
        let mut cursor = self.bottom;
        core::iter::from_fn(move || {
            let block = self.at(cursor?);
            cursor = block.next;
            Some(block)
        })
    }

    #[inline]
    fn at(&self, id: BlockId) -> &Block {
        &self.blocks[id as usize]
    }

    #[inline]
    fn at_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id as usize]
    }

    fn alloc_slot(&mut self, block: Block) -> BlockId {
        if let Some(id) = self.free_slots.pop() {
            *self.at_mut(id) = block;
            id
        } else {
            self.blocks.push(block);
            (self.blocks.len() - 1) as BlockId
        }
    }

    fn release(&mut self, id: BlockId) {
        let block = self.at_mut(id);
        block.prev = None;
        block.next = None;
        self.free_slots.push(id);
    }

    /// Allocate `size` bytes, rounded up to the grain.
    ///
    /// `from_top` places the block as high as possible, which keeps long lived
    /// allocations away from the general purpose low end. The rounded size is
    /// available through [`BlockAllocator::get_block_size_from_address`].
    pub fn alloc(&mut self, size: u32, from_top: bool, tag: Option<&str>) -> Result<GuestAddr, AllocError> {
        // Keep the grain alignment even if alloc_at was used.
        self.alloc_aligned(size, self.grain, self.grain, from_top, tag)
    }

    /// Allocate `size` bytes rounded up to `size_grain`, starting on a multiple of `grain`.
    ///
    /// Neither granularity can be smaller than the allocator's own.
    pub fn alloc_aligned(
        &mut self,
        size: u32,
        size_grain: u32,
        grain: u32,
        from_top: bool,
        tag: Option<&str>,
    ) -> Result<GuestAddr, AllocError> {
        if size == 0 || size > self.range_size {
            error!("Clearly bogus size: {size:08x} - failing allocation");
            return Err(AllocError::InvalidRange {
                position: self.range_start,
                size,
            });
        }
        let grain = grain.max(self.grain);
        let size_grain = size_grain.max(self.grain);
        let Ok(aligned_size) = u32::try_from(align_up(u64::from(size), size_grain)) else {
            error!("Size {size:08x} overflows when aligned to {size_grain:08x}");
            return Err(AllocError::InvalidRange {
                position: self.range_start,
                size,
            });
        };

        let found = if from_top {
            self.place_from_top(aligned_size, grain, tag)
        } else {
            self.place_from_bottom(aligned_size, grain, tag)
        };
        match found {
            Some(start) => Ok(start),
            None => {
                self.list_blocks();
                error!("Block Allocator ({:08x}-{:08x}) failed to allocate {aligned_size} ({aligned_size:08x}) bytes of contiguous memory",
                    self.range_start,
                    u64::from(self.range_start) + u64::from(self.range_size));
                Err(AllocError::OutOfMemory { size: aligned_size })
            }
        }
    }

    fn place_from_bottom(&mut self, size: u32, grain: u32, tag: Option<&str>) -> Option<GuestAddr> {
        let mut cursor = self.bottom;
        while let Some(id) = cursor {
            let Block {
                start,
                size: block_size,
                taken,
                next,
                ..
            } = *self.at(id);
            let offset = (grain - start % grain) % grain;
            let needed = u64::from(offset) + u64::from(size);
            if !taken && u64::from(block_size) >= needed {
                let needed = needed as u32;
                if block_size != needed {
                    self.insert_free_after(id, block_size - needed);
                }
                if offset >= self.grain {
                    self.insert_free_before(id, offset);
                }
                self.set_allocated(id, tag);
                return Some(self.at(id).start);
            }
            cursor = next;
        }
        None
    }

    fn place_from_top(&mut self, size: u32, grain: u32, tag: Option<&str>) -> Option<GuestAddr> {
        let mut cursor = self.top;
        while let Some(id) = cursor {
            let Block {
                start,
                size: block_size,
                taken,
                prev,
                ..
            } = *self.at(id);
            // The slack for aligning the start ends up above the block.
            let offset = start.wrapping_add(block_size).wrapping_sub(size) % grain;
            let needed = u64::from(offset) + u64::from(size);
            if !taken && u64::from(block_size) >= needed {
                let needed = needed as u32;
                if block_size != needed {
                    self.insert_free_before(id, block_size - needed);
                }
                if offset >= self.grain {
                    self.insert_free_after(id, offset);
                }
                self.set_allocated(id, tag);
                return Some(self.at(id).start);
            }
            cursor = prev;
        }
        None
    }

    /// Allocate `size` bytes at exactly `position`.
    ///
    /// The reserved span is widened to whole grains, so it may start below `position`;
    /// the returned address is always `position` itself.
    pub fn alloc_at(&mut self, position: GuestAddr, size: u32, tag: Option<&str>) -> Result<GuestAddr, AllocError> {
        self.check_blocks();
        if size == 0 || size > self.range_size {
            error!("Clearly bogus size: {size:08x} - failing allocation");
            return Err(AllocError::InvalidRange { position, size });
        }

        // Downalign the position so we're allocating full blocks.
        let aligned_position = position & !(self.grain - 1);
        if aligned_position != position {
            debug!("Position {position:08x} does not align to grain.");
        }
        let aligned_size = align_up(u64::from(size) + u64::from(position - aligned_position), self.grain);

        let Some(id) = self.block_at(aligned_position) else {
            error!("Block allocator AllocAt failed :( {position:08x}, {size}");
            self.list_blocks();
            return Err(AllocError::InvalidRange { position, size });
        };
        let Block {
            start,
            size: block_size,
            taken,
            ..
        } = *self.at(id);

        if taken {
            error!("Block allocator AllocAt failed, block taken! {position:08x}, {size}");
            return Err(AllocError::Overlap { position, size });
        }
        if u64::from(start) + u64::from(block_size) < u64::from(aligned_position) + aligned_size {
            error!("Block allocator AllocAt failed, not enough contiguous space {position:08x}, {size}");
            return Err(AllocError::Overlap { position, size });
        }

        // The checks above guarantee the span fits the block.
        let aligned_size = aligned_size as u32;
        if start != aligned_position {
            self.insert_free_before(id, aligned_position - start);
        }
        let block_size = self.at(id).size;
        if block_size > aligned_size {
            self.insert_free_after(id, block_size - aligned_size);
        }
        self.set_allocated(id, tag);
        Ok(position)
    }

    /// Free the block containing `position`.
    ///
    /// Returns `false`, changing nothing, if no taken block contains it.
    pub fn free(&mut self, position: GuestAddr) -> bool {
        match self.block_at(position) {
            Some(id) if self.at(id).taken => {
                self.release_block(id);
                true
            }
            _ => {
                error!("BlockAllocator : invalid free {position:08x}");
                false
            }
        }
    }

    /// Free the block starting exactly at `position`.
    ///
    /// Returns `false`, changing nothing, if no taken block starts there.
    pub fn free_exact(&mut self, position: GuestAddr) -> bool {
        match self.block_at(position) {
            Some(id) if self.at(id).taken && self.at(id).start == position => {
                self.release_block(id);
                true
            }
            _ => {
                error!("BlockAllocator : invalid free {position:08x}");
                false
            }
        }
    }

    fn release_block(&mut self, id: BlockId) {
        let flags = if self.suballoc {
            MemBlockFlags::SUB_FREE
        } else {
            MemBlockFlags::FREE
        };
        let block = self.at_mut(id);
        // The tag stays, to tell who used the memory last.
        block.taken = false;
        let (start, size) = (block.start, block.size);
        self.notify.notify(flags, start, size, "");
        self.merge_free_blocks(id);
    }

    fn set_allocated(&mut self, id: BlockId, tag: Option<&str>) {
        let flags = if self.suballoc {
            MemBlockFlags::SUB_ALLOC
        } else {
            MemBlockFlags::ALLOC
        };
        let block = self.at_mut(id);
        block.taken = true;
        block.tag = BlockTag::new(tag.unwrap_or(NO_TAG));
        let (start, size) = (block.start, block.size);
        self.notify.notify(flags, start, size, tag.unwrap_or_default());
    }

    /// Carve `size` bytes off the front of `id` into a new free block.
    fn insert_free_before(&mut self, id: BlockId, size: u32) -> BlockId {
        let block = self.at(id);
        let inserted = Block {
            prev: block.prev,
            next: Some(id),
            ..Block::untitled(block.start, size)
        };
        let prev = inserted.prev;
        let inserted_id = self.alloc_slot(inserted);
        match prev {
            Some(prev) => self.at_mut(prev).next = Some(inserted_id),
            None => self.bottom = Some(inserted_id),
        }
        let block = self.at_mut(id);
        block.prev = Some(inserted_id);
        block.start += size;
        block.size -= size;
        inserted_id
    }

    /// Carve `size` bytes off the end of `id` into a new free block.
    fn insert_free_after(&mut self, id: BlockId, size: u32) -> BlockId {
        let block = self.at(id);
        let inserted = Block {
            prev: Some(id),
            next: block.next,
            ..Block::untitled(block.start + block.size - size, size)
        };
        let next = inserted.next;
        let inserted_id = self.alloc_slot(inserted);
        match next {
            Some(next) => self.at_mut(next).prev = Some(inserted_id),
            None => self.top = Some(inserted_id),
        }
        let block = self.at_mut(id);
        block.next = Some(inserted_id);
        block.size -= size;
        inserted_id
    }

    /// Coalesce the free block `id` with all free neighbours.
    fn merge_free_blocks(&mut self, mut id: BlockId) {
        debug!("Merging Blocks");
        while let Some(prev) = self.at(id).prev {
            if self.at(prev).taken {
                break;
            }
            debug!("Block Alloc found adjacent free blocks - merging");
            let Block { size, next, .. } = *self.at(id);
            let block = self.at_mut(prev);
            block.size += size;
            block.next = next;
            match next {
                Some(next) => self.at_mut(next).prev = Some(prev),
                None => self.top = Some(prev),
            }
            self.release(id);
            id = prev;
        }
        if self.at(id).prev.is_none() {
            self.bottom = Some(id);
        }

        while let Some(next) = self.at(id).next {
            if self.at(next).taken {
                break;
            }
            debug!("Block Alloc found adjacent free blocks - merging");
            let Block {
                size,
                next: after,
                ..
            } = *self.at(next);
            let block = self.at_mut(id);
            block.size += size;
            block.next = after;
            match after {
                Some(after) => self.at_mut(after).prev = Some(id),
                None => self.top = Some(id),
            }
            self.release(next);
        }
    }

    fn block_at(&self, addr: GuestAddr) -> Option<BlockId> {
        let mut cursor = self.bottom;
        while let Some(id) = cursor {
            let block = self.at(id);
            if block.contains(addr) {
                return Some(id);
            }
            cursor = block.next;
        }
        None
    }

    /// Start of the block containing `addr`.
    #[must_use]
    pub fn get_block_start_from_address(&self, addr: GuestAddr) -> Option<GuestAddr> {
        self.block_at(addr).map(|id| self.at(id).start)
    }

    /// Size of the block containing `addr`.
    #[must_use]
    pub fn get_block_size_from_address(&self, addr: GuestAddr) -> Option<u32> {
        self.block_at(addr).map(|id| self.at(id).size)
    }

    /// Tag of the block containing `addr`.
    #[must_use]
    pub fn get_block_tag(&self, addr: GuestAddr) -> Option<&str> {
        self.block_at(addr).map(|id| self.at(id).tag())
    }

    /// Returns `true` if the block containing `addr` is free.
    #[must_use]
    pub fn is_block_free(&self, addr: GuestAddr) -> bool {
        match self.block_at(addr) {
            Some(id) => !self.at(id).taken,
            None => {
                error!("Bogus address {addr:08x} for is_block_free");
                false
            }
        }
    }

    /// Largest allocation [`BlockAllocator::alloc`] could satisfy right now.
    #[must_use]
    pub fn get_largest_free_block_size(&self) -> u32 {
        self.iter()
            .filter(|block| !block.taken)
            .map(|block| {
                // Unaligned starts lose the bytes up to the next grain.
                let offset = (self.grain - block.start % self.grain) % self.grain;
                block.size.saturating_sub(offset)
            })
            .max()
            .unwrap_or(0)
    }

    /// Sum of all free blocks.
    #[must_use]
    pub fn get_total_free_bytes(&self) -> u32 {
        let sum: u32 = self
            .iter()
            .filter(|block| !block.taken)
            .map(Block::size)
            .sum();
        if sum & (self.grain - 1) != 0 {
            warn!(
                "GetTotalFreeBytes: free size {sum:08x} does not align to grain {:08x}.",
                self.grain
            );
        }
        sum
    }

    /// Log every block at debug level.
    pub fn list_blocks(&self) {
        debug!("-----------");
        for block in self.iter() {
            debug!(
                "Block: {:08x} - {:08x} size {:08x} taken={} tag={}",
                block.start,
                block.end(),
                block.size,
                u8::from(block.taken),
                block.tag
            );
        }
        debug!("-----------");
    }

    /// Look for blocks outside the managed range. Violations are logged, never repaired.
    ///
    /// Returns `true` if all blocks are fine.
    pub fn check_blocks(&self) -> bool {
        let range_end = u64::from(self.range_start) + u64::from(self.range_size);
        let mut ok = true;
        for block in self.iter() {
            if block.start > BOGUS_BLOCK_START {
                error!("Bogus block in allocator: {:08x}", block.start);
                ok = false;
            }
            if block.start < self.range_start
                || u64::from(block.start) + u64::from(block.size) > range_end
            {
                error!(
                    "Bogus block in allocator: {:08x} - {:08x} outside {:08x} - {range_end:08x}",
                    block.start,
                    u64::from(block.start) + u64::from(block.size),
                    self.range_start
                );
                ok = false;
            }
        }
        ok
    }

    /// Write all blocks as a `BlockAllocator` section.
    pub fn save_state(&self, writer: &mut StateWriter) -> Result<(), Error> {
        writer.section("BlockAllocator", 1)?;
        writer.write(&i32::try_from(self.len())?)?;
        for block in self.iter() {
            writer.section("Block", 1)?;
            writer.write(&(block.start, block.size, block.taken))?;
            writer.write(block.tag.as_padded_bytes())?;
        }
        writer.write(&(self.range_start, self.range_size, self.grain))?;
        Ok(())
    }

    /// Replace all blocks with the `BlockAllocator` section at the reader's position.
    ///
    /// Nothing changes if the section cannot be decoded or its blocks do not tile the
    /// stored range. Restoring is not reported to the notifier.
    pub fn load_state(&mut self, reader: &mut StateReader<'_>) -> Result<(), Error> {
        reader.section("BlockAllocator", 1, 1)?;
        let count: i32 = reader.read()?;
        let count = BlockId::try_from(count)
            .map_err(|_| Error::invalid_snapshot(format!("bad block count {count}")))?;

        let mut blocks = Vec::with_capacity((count as usize).min(0x1000));
        for id in 0..count {
            reader.section("Block", 1, 1)?;
            let (start, size, taken): (u32, u32, bool) = reader.read()?;
            let tag: [u8; BLOCK_TAG_SIZE] = reader.read()?;
            blocks.push(Block {
                start,
                size,
                taken,
                tag: BlockTag::from_nul_padded(&tag),
                prev: id.checked_sub(1),
                next: (id + 1 < count).then_some(id + 1),
            });
        }
        let (range_start, range_size, grain): (u32, u32, u32) = reader.read()?;

        if !grain.is_power_of_two() {
            return Err(Error::invalid_snapshot(format!("grain {grain:#x} is not a power of two")));
        }
        if u64::from(range_start) + u64::from(range_size) > u64::from(GuestAddr::MAX) {
            return Err(Error::invalid_snapshot(format!(
                "range {range_start:08x} + {range_size:08x} overflows"
            )));
        }
        let mut expected_start = u64::from(range_start);
        let mut prev_free = false;
        for block in &blocks {
            if u64::from(block.start) != expected_start {
                return Err(Error::invalid_snapshot(format!(
                    "block at {:08x}, expected {expected_start:08x}",
                    block.start
                )));
            }
            if block.size == 0 {
                return Err(Error::invalid_snapshot(format!(
                    "empty block at {:08x}",
                    block.start
                )));
            }
            if prev_free && !block.taken {
                return Err(Error::invalid_snapshot(format!(
                    "free block at {:08x} was never merged with the one below",
                    block.start
                )));
            }
            prev_free = !block.taken;
            expected_start += u64::from(block.size);
        }
        if !blocks.is_empty() && expected_start != u64::from(range_start) + u64::from(range_size) {
            return Err(Error::invalid_snapshot(format!(
                "blocks end at {expected_start:08x}, range ends at {:08x}",
                u64::from(range_start) + u64::from(range_size)
            )));
        }

        self.bottom = (count > 0).then_some(0);
        self.top = count.checked_sub(1);
        self.blocks = blocks;
        self.free_slots.clear();
        self.range_start = range_start;
        self.range_size = range_size;
        self.grain = grain;
        debug!("Loaded {count} blocks for {range_start:08x} - {expected_start:08x}");
        Ok(())
    }
}
