//! # slab
//! A [`SlabMap`] partitions the whole tracked guest address range into
//! non-overlapping slabs, each carrying one set of provenance attributes.
//! Marking a range splits slabs at the range boundaries, stamps the covered
//! slabs, then coalesces equal neighbours again, so the number of slabs stays
//! proportional to the number of distinct provenance changes.
//!
//! Slabs live in an arena and are linked by index. A fixed table of slice
//! heads maps every `SLICE_SIZE` chunk of the address space to the slab
//! containing the chunk's first byte, and a last-found cache catches
//! ascending access patterns.

use core::{cell::Cell, fmt};

use guestmem_bolts::{tag::FixedTag, BoundedTag, Error, StateReader, StateWriter};
use log::error;

use crate::{GuestAddr, MemBlockFlags, MemBlockInfo};

/// Size of the tracked guest address range.
pub const MAX_SIZE: u32 = 0x4000_0000;
/// Number of entries in the lookup table.
pub const SLICES: u32 = 65536;
/// Bytes covered by one lookup table entry.
pub const SLICE_SIZE: u32 = MAX_SIZE / SLICES;

/// Storage size of a slab tag, terminator included.
pub const SLAB_TAG_SIZE: usize = 128;
/// The tag stored with every slab.
pub type SlabTag = BoundedTag<SLAB_TAG_SIZE>;

const LEGACY_TAG_SIZE: usize = 32;

type SlabId = u32;

/// A maximal address range with one set of provenance attributes.
#[derive(Debug, Clone)]
pub struct Slab {
    start: GuestAddr,
    end: GuestAddr,
    ticks: u64,
    pc: GuestAddr,
    allocated: bool,
    tag: SlabTag,
    prev: Option<SlabId>,
    next: Option<SlabId>,
}

impl Slab {
    fn untouched(start: GuestAddr, end: GuestAddr) -> Self {
        Self {
            start,
            end,
            ticks: 0,
            pc: 0,
            allocated: false,
            tag: SlabTag::empty(),
            prev: None,
            next: None,
        }
    }

    /// First byte of the slab.
    #[must_use]
    pub fn start(&self) -> GuestAddr {
        self.start
    }

    /// One past the last byte of the slab.
    #[must_use]
    pub fn end(&self) -> GuestAddr {
        self.end
    }

    /// Latest timestamp among the events folded into this slab.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Program counter of the event that produced this slab, `0` if untouched.
    #[must_use]
    pub fn pc(&self) -> GuestAddr {
        self.pc
    }

    /// Whether the range is currently allocated.
    #[must_use]
    pub fn allocated(&self) -> bool {
        self.allocated
    }

    /// Who produced the contents.
    #[must_use]
    pub fn tag(&self) -> &str {
        self.tag.as_str()
    }

    /// A slab is interesting once something touched it.
    #[must_use]
    pub fn is_interesting(&self) -> bool {
        self.pc != 0 || !self.tag.is_empty()
    }

    /// Timestamps are not part of equality.
    fn same(&self, other: &Self) -> bool {
        self.allocated == other.allocated && self.pc == other.pc && self.tag == other.tag
    }

    fn to_info(&self, flags: MemBlockFlags) -> MemBlockInfo {
        MemBlockInfo {
            flags,
            start: self.start,
            size: self.end - self.start,
            ticks: self.ticks,
            pc: self.pc,
            tag: self.tag.as_str().into(),
            allocated: self.allocated,
        }
    }
}

/// Interval map from guest addresses to provenance, see the module docs.
pub struct SlabMap {
    slabs: Vec<Slab>,
    free_slots: Vec<SlabId>,
    first: SlabId,
    last_find: Cell<SlabId>,
    heads: Box<[SlabId]>,
}

impl fmt::Debug for SlabMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabMap")
            .field("slabs", &self.len())
            .field("free_slots", &self.free_slots.len())
            .field("first", &self.first)
            .field("last_find", &self.last_find.get())
            .finish_non_exhaustive()
    }
}

impl Default for SlabMap {
    fn default() -> Self {
        Self::new()
    }
}

/// End of `[addr, addr + size)`, clamped to the tracked range.
#[inline]
fn clamp_end(addr: GuestAddr, size: u32) -> GuestAddr {
    (u64::from(addr) + u64::from(size)).min(u64::from(MAX_SIZE)) as GuestAddr
}

/// Point every slice whose first byte lies in `[start, end)` at `id`.
fn fill_heads(heads: &mut [SlabId], id: SlabId, start: GuestAddr, end: GuestAddr) {
    let slice = start / SLICE_SIZE;
    let end_slice = (end - 1) / SLICE_SIZE;

    // The first slice only belongs to us if we start exactly on it.
    if start == slice * SLICE_SIZE {
        heads[slice as usize] = id;
    }
    for head in &mut heads[slice as usize + 1..=end_slice as usize] {
        *head = id;
    }
}

impl SlabMap {
    /// Create a map with one untouched slab spanning the whole range.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slabs: vec![Slab::untouched(0, MAX_SIZE)],
            free_slots: Vec::new(),
            first: 0,
            last_find: Cell::new(0),
            heads: vec![0; SLICES as usize].into_boxed_slice(),
        }
    }

    /// Discard all provenance and go back to a single untouched slab.
    pub fn reset(&mut self) {
        self.slabs.clear();
        self.slabs.push(Slab::untouched(0, MAX_SIZE));
        self.free_slots.clear();
        self.first = 0;
        self.last_find.set(0);
        self.heads.fill(0);
    }

    /// Number of live slabs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slabs.len() - self.free_slots.len()
    }

    /// A map always holds at least one slab.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate all slabs in address order.
    #[must_use]
    pub fn iter(&self) -> Slabs<'_> {
        Slabs {
            map: self,
            cursor: Some(self.first),
        }
    }

    #[inline]
    fn at(&self, id: SlabId) -> &Slab {
        &self.slabs[id as usize]
    }

    #[inline]
    fn at_mut(&mut self, id: SlabId) -> &mut Slab {
        &mut self.slabs[id as usize]
    }

    /// Stamp `[addr, addr + size)` with the given provenance.
    ///
    /// A `pc` of `0` keeps the existing `ticks`/`pc` and only updates the allocated
    /// flag, and a missing `tag` keeps the existing tag; frees use this to remember
    /// who owned the memory last. Returns `false` if no part of the range is tracked.
    pub fn mark(
        &mut self,
        addr: GuestAddr,
        size: u32,
        ticks: u64,
        pc: GuestAddr,
        allocated: bool,
        tag: Option<&str>,
    ) -> bool {
        if size == 0 {
            return false;
        }
        let end = clamp_end(addr, size);
        let mut cursor = self.find_slab(addr);
        let mut first_match = None;

        while let Some(mut id) = cursor {
            if self.at(id).start >= end {
                break;
            }
            if self.at(id).start < addr {
                // The tail is the part we want.
                id = self.split(id, addr - self.at(id).start);
            }
            if self.at(id).end > end {
                self.split(id, end - self.at(id).start);
            }

            let slab = self.at_mut(id);
            slab.allocated = allocated;
            if pc != 0 {
                slab.ticks = ticks;
                slab.pc = pc;
            }
            if let Some(tag) = tag {
                slab.tag.set(tag);
            }
            cursor = slab.next;
            first_match.get_or_insert(id);
        }

        match first_match {
            Some(id) => {
                self.merge_range(id, end);
                true
            }
            None => false,
        }
    }

    /// Append one [`MemBlockInfo`] per interesting slab overlapping `[addr, addr + size)`.
    ///
    /// Returns `true` if anything was appended.
    pub fn find(
        &self,
        flags: MemBlockFlags,
        addr: GuestAddr,
        size: u32,
        results: &mut Vec<MemBlockInfo>,
    ) -> bool {
        let end = clamp_end(addr, size);
        let mut cursor = self.find_slab(addr);
        let mut found = false;
        while let Some(id) = cursor {
            let slab = self.at(id);
            if slab.start >= end {
                break;
            }
            if slab.is_interesting() {
                results.push(slab.to_info(flags));
                found = true;
            }
            cursor = slab.next;
        }
        found
    }

    /// The tag of the lowest interesting slab overlapping `[addr, addr + size)`.
    ///
    /// The borrow ties the result to this map, so it cannot outlive the next [`SlabMap::mark`].
    #[must_use]
    pub fn fast_find_write_tag(&self, addr: GuestAddr, size: u32) -> Option<&str> {
        let end = clamp_end(addr, size);
        let mut cursor = self.find_slab(addr);
        while let Some(id) = cursor {
            let slab = self.at(id);
            if slab.start >= end {
                break;
            }
            if slab.is_interesting() {
                return Some(slab.tag.as_str());
            }
            cursor = slab.next;
        }
        None
    }

    /// The slab containing `addr`, if it is inside the tracked range.
    #[must_use]
    pub fn slab_at(&self, addr: GuestAddr) -> Option<&Slab> {
        self.find_slab(addr).map(|id| self.at(id))
    }

    fn find_slab(&self, addr: GuestAddr) -> Option<SlabId> {
        if addr >= MAX_SIZE {
            return None;
        }
        // Jump ahead using the index.
        let mut id = self.heads[(addr / SLICE_SIZE) as usize];
        // We often move forward, so check the last find.
        let last = self.last_find.get();
        let last_start = self.at(last).start;
        if last_start > self.at(id).start && last_start <= addr {
            id = last;
        }

        loop {
            let slab = self.at(id);
            if slab.start > addr {
                return None;
            }
            if slab.end > addr {
                self.last_find.set(id);
                return Some(id);
            }
            id = slab.next?;
        }
    }

    fn alloc_slot(&mut self, slab: Slab) -> SlabId {
        if let Some(id) = self.free_slots.pop() {
            *self.at_mut(id) = slab;
            id
        } else {
            self.slabs.push(slab);
            (self.slabs.len() - 1) as SlabId
        }
    }

    fn release(&mut self, id: SlabId) {
        let slab = self.at_mut(id);
        slab.prev = None;
        slab.next = None;
        self.free_slots.push(id);
    }

    /// Cut `id` after `size` bytes, returning the new tail slab.
    fn split(&mut self, id: SlabId, size: u32) -> SlabId {
        let slab = self.at(id);
        let tail = Slab {
            start: slab.start + size,
            end: slab.end,
            ticks: slab.ticks,
            pc: slab.pc,
            allocated: slab.allocated,
            tag: slab.tag,
            prev: Some(id),
            next: slab.next,
        };
        let (tail_start, tail_end, after) = (tail.start, tail.end, tail.next);

        let tail_id = self.alloc_slot(tail);
        if let Some(after) = after {
            self.at_mut(after).prev = Some(tail_id);
        }
        let slab = self.at_mut(id);
        slab.next = Some(tail_id);
        slab.end = tail_start;

        fill_heads(&mut self.heads, tail_id, tail_start, tail_end);
        tail_id
    }

    /// Coalesce equal neighbours from the slab before `first` up to the one starting at `end`.
    fn merge_range(&mut self, first: SlabId, end: GuestAddr) {
        let mut id = self.at(first).prev.unwrap_or(first);
        while let Some(next) = self.at(id).next {
            if self.at(id).same(self.at(next)) {
                self.merge(id, next);
                continue;
            }
            if self.at(next).start >= end {
                break;
            }
            id = next;
        }
    }

    /// Fold the neighbour `b` into `a`.
    fn merge(&mut self, a: SlabId, b: SlabId) {
        let absorbed = self.at(b).clone();

        if self.at(a).next == Some(b) {
            debug_assert_eq!(self.at(a).end, absorbed.start);
            let slab = self.at_mut(a);
            slab.end = absorbed.end;
            slab.next = absorbed.next;
            if let Some(next) = absorbed.next {
                self.at_mut(next).prev = Some(a);
            }
        } else if self.at(a).prev == Some(b) {
            debug_assert_eq!(absorbed.end, self.at(a).start);
            let slab = self.at_mut(a);
            slab.start = absorbed.start;
            slab.prev = absorbed.prev;
            match absorbed.prev {
                Some(prev) => self.at_mut(prev).next = Some(a),
                None => self.first = a,
            }
        } else {
            error!("Refusing to merge slabs {a} and {b}: not adjacent");
            return;
        }

        // Take over the index entries b had.
        let (start, end) = (self.at(a).start, self.at(a).end);
        fill_heads(&mut self.heads, a, start, end);

        let slab = self.at_mut(a);
        if absorbed.ticks > slab.ticks {
            slab.ticks = absorbed.ticks;
            slab.pc = absorbed.pc;
        }
        if self.last_find.get() == b {
            self.last_find.set(a);
        }
        self.release(b);
    }

    /// Walk the whole structure and verify the partition and index invariants.
    ///
    /// This is `O(slabs + SLICES)`, meant for tests and debug builds.
    pub fn check_consistency(&self) -> Result<(), String> {
        let mut expected_start = 0;
        let mut prev = None;
        let mut count = 0;
        let mut cursor = Some(self.first);
        while let Some(id) = cursor {
            let slab = self.at(id);
            if slab.start != expected_start || slab.end <= slab.start {
                return Err(format!(
                    "slab {id} spans {:#010x}..{:#010x}, expected start {expected_start:#010x}",
                    slab.start, slab.end
                ));
            }
            if slab.prev != prev {
                return Err(format!("slab {id} has a broken prev link"));
            }
            if let Some(next) = slab.next {
                if self.at(next).same(slab) {
                    return Err(format!("slab {id} and {next} should have been merged"));
                }
            }
            expected_start = slab.end;
            prev = Some(id);
            count += 1;
            cursor = slab.next;
        }
        if expected_start != MAX_SIZE {
            return Err(format!("slabs end at {expected_start:#010x}"));
        }
        if count != self.len() {
            return Err(format!("{count} linked slabs, {} live", self.len()));
        }
        for (slice, &id) in self.heads.iter().enumerate() {
            let addr = slice as u32 * SLICE_SIZE;
            let slab = self.at(id);
            if slab.start > addr || slab.end <= addr {
                return Err(format!("head {slice} points at slab {id}, not containing {addr:#010x}"));
            }
        }
        Ok(())
    }

    /// Write this map as a `MemSlabMap` section.
    pub fn save_state(&self, writer: &mut StateWriter) -> Result<(), Error> {
        writer.section("MemSlabMap", 1)?;
        writer.write(&i32::try_from(self.len())?)?;
        for slab in self {
            writer.section("MemSlabMapSlab", 3)?;
            writer.write(&(slab.start, slab.end, slab.ticks, slab.pc, slab.allocated))?;
            writer.write(&FixedTag(slab.tag))?;
        }
        Ok(())
    }

    /// Replace this map with the `MemSlabMap` section at the reader's position.
    ///
    /// The new arena and index are fully built before anything is replaced, so a
    /// failed restore leaves the current contents intact.
    pub fn load_state(&mut self, reader: &mut StateReader<'_>) -> Result<(), Error> {
        reader.section("MemSlabMap", 1, 1)?;
        let count: i32 = reader.read()?;
        let count = SlabId::try_from(count)
            .ok()
            .filter(|&count| count > 0)
            .ok_or_else(|| Error::invalid_snapshot(format!("bad slab count {count}")))?;

        let mut slabs = Vec::with_capacity((count as usize).min(SLICES as usize));
        let mut heads = vec![0; SLICES as usize].into_boxed_slice();
        let mut expected_start = 0;
        for id in 0..count {
            let version = reader.section("MemSlabMapSlab", 1, 3)?;
            let (start, end, ticks, pc, allocated): (u32, u32, u64, u32, bool) = reader.read()?;
            let tag = match version {
                1 => SlabTag::new(&reader.read::<String>()?),
                2 => SlabTag::from_nul_padded(&reader.read::<[u8; LEGACY_TAG_SIZE]>()?),
                _ => reader.read::<FixedTag<SLAB_TAG_SIZE>>()?.0,
            };

            if start != expected_start || end <= start || end > MAX_SIZE {
                return Err(Error::invalid_snapshot(format!(
                    "slab {id} spans {start:#010x}..{end:#010x}, expected start {expected_start:#010x}"
                )));
            }
            expected_start = end;

            fill_heads(&mut heads, id, start, end);
            slabs.push(Slab {
                start,
                end,
                ticks,
                pc,
                allocated,
                tag,
                prev: id.checked_sub(1),
                next: (id + 1 < count).then_some(id + 1),
            });
        }
        if expected_start != MAX_SIZE {
            return Err(Error::invalid_snapshot(format!(
                "slabs end at {expected_start:#010x}, expected {MAX_SIZE:#010x}"
            )));
        }

        self.slabs = slabs;
        self.free_slots.clear();
        self.first = 0;
        self.last_find.set(0);
        self.heads = heads;
        Ok(())
    }
}

/// Iterator over the slabs of a [`SlabMap`], in address order.
#[derive(Debug)]
pub struct Slabs<'a> {
    map: &'a SlabMap,
    cursor: Option<SlabId>,
}

impl<'a> Iterator for Slabs<'a> {
    type Item = &'a Slab;

    fn next(&mut self) -> Option<Self::Item> {
        let slab = self.map.at(self.cursor?);
        self.cursor = slab.next;
        Some(slab)
    }
}

impl<'a> IntoIterator for &'a SlabMap {
    type Item = &'a Slab;
    type IntoIter = Slabs<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use guestmem_bolts::{Error, StateReader, StateWriter};

    use super::{SlabMap, MAX_SIZE, SLICE_SIZE};
    use crate::{MemBlockFlags, MemBlockInfo};

    fn find(map: &SlabMap, addr: u32, size: u32) -> Vec<MemBlockInfo> {
        let mut results = vec![];
        map.find(MemBlockFlags::WRITE, addr, size, &mut results);
        results
    }

    fn spans(map: &SlabMap) -> Vec<(u32, u32, u32, String)> {
        map.iter()
            .map(|s| (s.start(), s.end(), s.pc(), s.tag().to_string()))
            .collect()
    }

    /// Small deterministic generator, good enough to shuffle test ranges.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u32 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) as u32
        }
    }

    #[test]
    fn test_overlapping_same_attributes_coalesce() {
        let mut map = SlabMap::new();
        assert!(map.mark(0x1000, 0x100, 1, 0xAAAA, true, Some("Alloc1")));
        assert!(map.mark(0x1080, 0x100, 2, 0xAAAA, true, Some("Alloc1")));

        let results = find(&map, 0x1000, 0x200);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].start, 0x1000);
        assert_eq!(results[0].end(), 0x1180);
        assert_eq!(results[0].tag, "Alloc1");
        assert_eq!(results[0].ticks, 2);
        map.check_consistency().unwrap();
    }

    #[test]
    fn test_nested_mark_splits_in_three() {
        let mut map = SlabMap::new();
        map.mark(0x2000, 0x200, 1, 1, true, Some("A"));
        map.mark(0x2080, 0x40, 2, 2, true, Some("B"));

        let results = find(&map, 0x2000, 0x200);
        let got: Vec<_> = results
            .iter()
            .map(|r| (r.start, r.end(), r.tag.as_str()))
            .collect();
        assert_eq!(
            got,
            vec![
                (0x2000, 0x2080, "A"),
                (0x2080, 0x20C0, "B"),
                (0x20C0, 0x2200, "A"),
            ]
        );
        map.check_consistency().unwrap();
    }

    #[test]
    fn test_adjacent_ranges() {
        let mut map = SlabMap::new();
        map.mark(0x4000, 0x100, 1, 0x10, false, Some("X"));
        map.mark(0x4100, 0x100, 1, 0x10, false, Some("X"));
        assert_eq!(find(&map, 0x4000, 0x200).len(), 1);

        let mut map = SlabMap::new();
        map.mark(0x4000, 0x100, 1, 0x10, false, Some("X"));
        map.mark(0x4100, 0x100, 1, 0x20, false, Some("X"));
        assert_eq!(find(&map, 0x4000, 0x200).len(), 2);
    }

    #[test]
    fn test_mark_twice_is_idempotent() {
        let mut once = SlabMap::new();
        once.mark(0x8000, 0x1234, 5, 0x99, true, Some("Twice"));

        let mut twice = SlabMap::new();
        twice.mark(0x8000, 0x1234, 5, 0x99, true, Some("Twice"));
        twice.mark(0x8000, 0x1234, 5, 0x99, true, Some("Twice"));

        assert_eq!(spans(&once), spans(&twice));
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn test_zero_pc_keeps_provenance() {
        let mut map = SlabMap::new();
        map.mark(0x10000, 0x800, 7, 0x0880_1234, true, Some("Module"));
        map.mark(0x10000, 0x800, 9, 0, false, None);

        let slab = map.slab_at(0x10400).unwrap();
        assert!(!slab.allocated());
        assert_eq!(slab.pc(), 0x0880_1234);
        assert_eq!(slab.ticks(), 7);
        assert_eq!(slab.tag(), "Module");
    }

    #[test]
    fn test_free_merges_with_right_neighbour() {
        let mut map = SlabMap::new();
        map.mark(0x1000, 0x100, 1, 1, true, Some("X"));
        map.mark(0x1100, 0x100, 1, 2, true, Some("X"));
        map.mark(0x1200, 0x100, 1, 2, false, Some("X"));
        map.mark(0x1000, 0x200, 2, 0, false, None);
        map.check_consistency().unwrap();

        let results = find(&map, 0x1000, 0x300);
        assert_eq!(results.len(), 2);
        assert_eq!((results[1].start, results[1].end()), (0x1100, 0x1300));
    }

    #[test]
    fn test_merge_keeps_latest_ticks() {
        let mut map = SlabMap::new();
        map.mark(0x3000, 0x100, 10, 0x44, true, Some("T"));
        map.mark(0x3100, 0x100, 30, 0x44, true, Some("T"));
        map.mark(0x3200, 0x100, 20, 0x44, true, Some("T"));

        let results = find(&map, 0x3000, 0x300);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].ticks, 30);
    }

    #[test]
    fn test_untouched_is_never_reported() {
        let mut map = SlabMap::new();
        assert_eq!(map.fast_find_write_tag(0x5000, 0x1000), None);
        assert!(find(&map, 0, MAX_SIZE).is_empty());

        map.mark(0x5800, 0x10, 1, 0x77, true, Some("Late"));
        assert_eq!(map.fast_find_write_tag(0x5000, 0x1000), Some("Late"));
        assert_eq!(map.fast_find_write_tag(0x5000, 0x800), None);
    }

    #[test]
    fn test_out_of_range() {
        let mut map = SlabMap::new();
        assert!(!map.mark(MAX_SIZE, 0x100, 1, 1, true, Some("Nope")));
        assert!(!map.mark(0x1000, 0, 1, 1, true, Some("Empty")));
        assert!(find(&map, MAX_SIZE + 0x1000, 0x10).is_empty());
        assert_eq!(map.fast_find_write_tag(u32::MAX, 1), None);
        assert_eq!(map.len(), 1);

        // Straddling the end only stamps the tracked part.
        assert!(map.mark(MAX_SIZE - 0x10, 0x100, 1, 1, true, Some("Edge")));
        let results = find(&map, MAX_SIZE - 0x10, 0x100);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].end(), MAX_SIZE);
        map.check_consistency().unwrap();
    }

    #[test]
    fn test_spanning_many_slices() {
        let mut map = SlabMap::new();
        map.mark(SLICE_SIZE / 2, SLICE_SIZE * 40, 1, 0x100, true, Some("Big"));
        map.mark(SLICE_SIZE * 10, SLICE_SIZE * 3 + 7, 2, 0x200, true, Some("Hole"));
        map.check_consistency().unwrap();

        let slab = map.slab_at(SLICE_SIZE * 12).unwrap();
        assert_eq!(slab.tag(), "Hole");
        let slab = map.slab_at(SLICE_SIZE * 30).unwrap();
        assert_eq!(slab.tag(), "Big");

        // Restoring the middle merges everything back into one slab.
        map.mark(SLICE_SIZE * 10, SLICE_SIZE * 3 + 7, 2, 0x100, true, Some("Big"));
        map.check_consistency().unwrap();
        assert_eq!(find(&map, 0, MAX_SIZE).len(), 1);
    }

    #[test]
    fn test_partition_holds_under_random_marks() {
        let mut map = SlabMap::new();
        let mut rng = Lcg(0x5eed);
        let tags = ["", "Alloc", "Write", "Tex"];
        for i in 0..2000 {
            let addr = rng.next() % 0x0100_0000;
            let size = rng.next() % 0x4000 + 1;
            let pc = rng.next() % 3;
            let tag = tags[(rng.next() % 4) as usize];
            let allocated = rng.next() % 2 == 0;
            let tag = if rng.next() % 5 == 0 { None } else { Some(tag) };
            map.mark(addr, size, i, pc, allocated, tag);
        }
        map.check_consistency().unwrap();

        // Random lookups agree with a linear walk.
        for _ in 0..500 {
            let addr = rng.next() % 0x0100_0000;
            let expected = map.iter().find(|s| s.start() <= addr && addr < s.end()).unwrap();
            let found = map.slab_at(addr).unwrap();
            assert_eq!(found.start(), expected.start());
        }
    }

    #[test]
    fn test_reset() {
        let mut map = SlabMap::new();
        map.mark(0x1000, 0x100, 1, 1, true, Some("Gone"));
        assert_eq!(map.len(), 3);
        map.reset();
        assert_eq!(map.len(), 1);
        assert!(find(&map, 0, MAX_SIZE).is_empty());
        map.check_consistency().unwrap();
    }

    #[test]
    fn test_state_roundtrip() {
        let mut map = SlabMap::new();
        map.mark(0x1000, 0x100, 1, 0xAAAA, true, Some("Alloc1"));
        map.mark(0x0880_0000, 0x4000, 2, 0x0880_0100, false, Some("Module"));
        map.mark(0x0880_1000, 0x40, 3, 0x0880_0200, true, None);

        let mut writer = StateWriter::new();
        map.save_state(&mut writer).unwrap();
        let bytes = writer.into_bytes();

        let mut restored = SlabMap::new();
        restored.mark(0x2000, 0x10, 9, 9, true, Some("Overwritten"));
        restored.load_state(&mut StateReader::new(&bytes)).unwrap();
        restored.check_consistency().unwrap();

        for addr in [0, 0x1000, 0x10ff, 0x2000, 0x0880_0000, 0x0880_1020, 0x0880_3fff] {
            assert_eq!(find(&map, addr, 0x200), find(&restored, addr, 0x200));
        }
        assert_eq!(spans(&map), spans(&restored));
    }

    fn legacy_state(version: u8) -> Vec<u8> {
        let mut writer = StateWriter::new();
        writer.section("MemSlabMap", 1).unwrap();
        writer.write(&3_i32).unwrap();
        let slabs: [(u32, u32, u32, &str); 3] = [
            (0, 0x1000, 0, ""),
            (0x1000, 0x2000, 0x42, "Legacy"),
            (0x2000, MAX_SIZE, 0, ""),
        ];
        for (start, end, pc, tag) in slabs {
            writer.section("MemSlabMapSlab", version).unwrap();
            writer.write(&(start, end, 1_u64, pc, pc != 0)).unwrap();
            if version == 1 {
                writer.write(tag).unwrap();
            } else {
                let mut raw = [0_u8; 32];
                raw[..tag.len()].copy_from_slice(tag.as_bytes());
                writer.write(&raw).unwrap();
            }
        }
        writer.into_bytes()
    }

    #[test]
    fn test_load_legacy_versions() {
        for version in [1, 2] {
            let bytes = legacy_state(version);
            let mut map = SlabMap::new();
            map.load_state(&mut StateReader::new(&bytes)).unwrap();
            map.check_consistency().unwrap();
            assert_eq!(map.fast_find_write_tag(0, 0x3000), Some("Legacy"));
        }
    }

    #[test]
    fn test_load_rejects_gaps() {
        let mut writer = StateWriter::new();
        writer.section("MemSlabMap", 1).unwrap();
        writer.write(&2_i32).unwrap();
        for (start, end) in [(0_u32, 0x1000_u32), (0x2000, MAX_SIZE)] {
            writer.section("MemSlabMapSlab", 3).unwrap();
            writer.write(&(start, end, 0_u64, 0_u32, false)).unwrap();
            writer
                .write(&guestmem_bolts::tag::FixedTag(super::SlabTag::empty()))
                .unwrap();
        }
        let bytes = writer.into_bytes();

        let mut map = SlabMap::new();
        map.mark(0x1000, 0x10, 1, 1, true, Some("Kept"));
        let err = map.load_state(&mut StateReader::new(&bytes)).unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(..)));
        // The failed restore left the old contents alone.
        assert_eq!(map.fast_find_write_tag(0x1000, 0x10), Some("Kept"));
    }
}
