//! The [`MemInfo`] context: the pending queue, the four provenance indices and
//! the background worker applying one to the other.
//!
//! Two locks guard the state. The producer lock covers the pending queue and is
//! held only long enough to push or to swap the queue out. The index lock covers
//! the four [`SlabMap`]s and is held by flushes and queries. Whoever needs both
//! takes the index lock first: the only way to reach the pending batch is
//! [`Shared::take_pending`], which demands the locked indices as proof.

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
};

use guestmem_bolts::{Error, StateReader, StateWriter};
use log::{debug, info, trace, warn};

use crate::{
    hooks::{GuestClock, MemCheckHook, NopMemCheck, SystemClock},
    normalize_address,
    pending::{PendingNotify, PendingQueue, PendingWindows},
    slab::{SlabMap, SlabTag},
    GuestAddr, MemBlockFlags, MemBlockInfo, MemInfoConfig, MemNotify,
};

/// Writes tagged with this are zero fills, a worse source of truth than the allocation.
const MEM_INIT_TAG: &str = "MemInit";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The four provenance indices.
#[derive(Debug, Default)]
pub struct MemMaps {
    alloc: SlabMap,
    sub_alloc: SlabMap,
    write: SlabMap,
    texture: SlabMap,
}

impl MemMaps {
    /// The indices selected by `flags`, in lookup order.
    fn by_flag(&self, flags: MemBlockFlags) -> impl Iterator<Item = (MemBlockFlags, &SlabMap)> {
        [
            (MemBlockFlags::ALLOC, &self.alloc),
            (MemBlockFlags::SUB_ALLOC, &self.sub_alloc),
            (MemBlockFlags::WRITE, &self.write),
            (MemBlockFlags::TEXTURE, &self.texture),
        ]
        .into_iter()
        .filter(move |(flag, _)| flags.contains(*flag))
    }

    fn find(&self, flags: MemBlockFlags, start: GuestAddr, size: u32) -> Vec<MemBlockInfo> {
        let mut results = vec![];
        for (flag, map) in self.by_flag(flags) {
            map.find(flag, start, size, &mut results);
        }
        results
    }

    fn fast_find_write_tag(&self, flags: MemBlockFlags, start: GuestAddr, size: u32) -> Option<&str> {
        self.by_flag(flags)
            .find_map(|(_, map)| map.fast_find_write_tag(start, size))
    }

    /// Render a tag for `[start, start + size)` from what the indices know.
    fn format_write_tag(&self, prefix: &str, start: GuestAddr, size: u32) -> String {
        if let Some(tag) = self.fast_find_write_tag(MemBlockFlags::WRITE, start, size) {
            if tag != MEM_INIT_TAG {
                return format!("{prefix}{tag}");
            }
        }
        // VRAM is rarely written tagged, the texture or allocation is a better guess.
        if let Some(tag) =
            self.fast_find_write_tag(MemBlockFlags::ALLOC | MemBlockFlags::TEXTURE, start, size)
        {
            return format!("{prefix}{tag}");
        }
        format!("{prefix}{start:08x}_size_{size:08x}")
    }

    fn apply(&mut self, event: &PendingNotify) {
        let PendingNotify {
            flags,
            start,
            size,
            ticks,
            pc,
            ..
        } = *event;
        let tag = event.tag.as_str();

        if let Some(src) = event.copy_src {
            let tag = self.format_write_tag(tag, src, size);
            self.write.mark(start, size, ticks, pc, true, Some(&tag));
            return;
        }

        if flags.contains(MemBlockFlags::ALLOC) {
            self.alloc.mark(start, size, ticks, pc, true, Some(tag));
        } else if flags.contains(MemBlockFlags::FREE) {
            // Keep who owned it last.
            self.alloc.mark(start, size, ticks, 0, false, None);
            self.sub_alloc.mark(start, size, ticks, 0, false, None);
        }
        if flags.contains(MemBlockFlags::SUB_ALLOC) {
            self.sub_alloc.mark(start, size, ticks, pc, true, Some(tag));
        } else if flags.contains(MemBlockFlags::SUB_FREE) {
            self.sub_alloc.mark(start, size, ticks, 0, false, None);
        }
        if flags.contains(MemBlockFlags::TEXTURE) {
            self.texture.mark(start, size, ticks, pc, true, Some(tag));
        }
        if flags.contains(MemBlockFlags::WRITE) {
            self.write.mark(start, size, ticks, pc, true, Some(tag));
        }
    }

    fn maps(&self) -> [&SlabMap; 4] {
        [&self.alloc, &self.sub_alloc, &self.write, &self.texture]
    }

    fn maps_mut(&mut self) -> [&mut SlabMap; 4] {
        [
            &mut self.alloc,
            &mut self.sub_alloc,
            &mut self.write,
            &mut self.texture,
        ]
    }

    #[cfg(feature = "consistency_checks")]
    fn check_consistency(&self) {
        for (flag, map) in self.by_flag(MemBlockFlags::all()) {
            if let Err(err) = map.check_consistency() {
                log::error!("{flag:?} index is inconsistent: {err}");
            }
        }
    }
}

#[derive(Debug, Default)]
struct WorkerSignal {
    pending: bool,
    stop: bool,
}

#[derive(Debug)]
struct Shared {
    config: MemInfoConfig,
    maps: Mutex<MemMaps>,
    pending: Mutex<PendingQueue>,
    windows: PendingWindows,
    signal: Mutex<WorkerSignal>,
    wake: Condvar,
}

impl Shared {
    /// Swap the pending batch out. Taking `_maps` keeps the lock order.
    fn take_pending(&self, _maps: &mut MemMaps) -> Vec<PendingNotify> {
        let mut pending = lock(&self.pending);
        let batch = pending.take();
        self.windows.reset();
        batch
    }

    fn flush_locked(&self, maps: &mut MemMaps) {
        let batch = self.take_pending(maps);
        if batch.is_empty() {
            return;
        }
        trace!("Applying {} pending memory notifications", batch.len());
        for event in &batch {
            maps.apply(event);
        }
        #[cfg(feature = "consistency_checks")]
        maps.check_consistency();
    }

    fn flush(&self) {
        let mut maps = lock(&self.maps);
        self.flush_locked(&mut maps);
    }

    /// Lock the indices, flushing first if a pending event may touch `[start, start + size)`.
    fn maps_for(&self, start: GuestAddr, size: u32, flush: bool) -> MutexGuard<'_, MemMaps> {
        let mut maps = lock(&self.maps);
        if flush && self.windows.overlaps(start, size) {
            self.flush_locked(&mut maps);
        }
        maps
    }

    fn wake_worker(&self) {
        lock(&self.signal).pending = true;
        self.wake.notify_one();
    }

    fn worker_loop(&self) {
        info!("Memory info flush worker started");
        loop {
            let stop = {
                let mut signal = lock(&self.signal);
                while !signal.pending && !signal.stop {
                    signal = self
                        .wake
                        .wait(signal)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                signal.pending = false;
                signal.stop
            };
            // Also the final flush when stopping.
            self.flush();
            if stop {
                break;
            }
        }
        info!("Memory info flush worker stopped");
    }
}

/// Records the provenance of guest memory.
///
/// Notifications may come from any thread. They are queued and applied in
/// batches, by the background worker once enough piled up, or right before a
/// query that could observe them. Dropping the context stops the worker after
/// one final flush.
pub struct MemInfo {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    detailed: AtomicBool,
    detailed_override: AtomicUsize,
    clock: Box<dyn GuestClock>,
    memcheck: Box<dyn MemCheckHook>,
}

impl fmt::Debug for MemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemInfo")
            .field("shared", &self.shared)
            .field("detailed", &self.detailed)
            .field("detailed_override", &self.detailed_override)
            .finish_non_exhaustive()
    }
}

impl MemInfo {
    /// Create a new context using the host clock and no memchecks.
    pub fn new(config: MemInfoConfig) -> Result<Self, Error> {
        Self::with_hooks(config, SystemClock::new(), NopMemCheck)
    }

    /// Create a new context reporting time through `clock` and checking accesses with `memcheck`.
    pub fn with_hooks<C, M>(config: MemInfoConfig, clock: C, memcheck: M) -> Result<Self, Error>
    where
        C: GuestClock + 'static,
        M: MemCheckHook + 'static,
    {
        let shared = Arc::new(Shared {
            maps: Mutex::new(MemMaps::default()),
            pending: Mutex::new(PendingQueue::new(config.pending_capacity)),
            windows: PendingWindows::new(),
            signal: Mutex::new(WorkerSignal::default()),
            wake: Condvar::new(),
            config,
        });

        let worker = if shared.config.flush_thread {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("MemInfoFlush".into())
                .spawn(move || worker_shared.worker_loop())
                .map_err(|err| Error::unknown(format!("Could not spawn flush worker: {err}")))?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            detailed: AtomicBool::new(shared.config.detailed),
            shared,
            worker: Mutex::new(worker),
            detailed_override: AtomicUsize::new(0),
            clock: Box::new(clock),
            memcheck: Box::new(memcheck),
        })
    }

    /// The configuration this context was created with.
    #[must_use]
    pub fn config(&self) -> &MemInfoConfig {
        &self.shared.config
    }

    /// Turn detailed tracking on or off.
    pub fn set_detailed(&self, detailed: bool) {
        self.detailed.store(detailed, Ordering::Relaxed);
    }

    /// Request detailed tracking until the matching [`MemInfo::release_detailed`].
    pub fn override_detailed(&self) {
        self.detailed_override.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one request made through [`MemInfo::override_detailed`].
    pub fn release_detailed(&self) {
        let released = self
            .detailed_override
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
        if released.is_err() {
            warn!("release_detailed called without a matching override_detailed");
        }
    }

    /// Returns `true` if events of `size` bytes are tracked currently.
    #[must_use]
    pub fn is_detailed(&self, size: u32) -> bool {
        self.detailed.load(Ordering::Relaxed)
            || self.detailed_override.load(Ordering::Relaxed) > 0
            || size >= self.shared.config.min_tracked_size
    }

    fn tracks(&self, flags: MemBlockFlags, size: u32) -> bool {
        flags != MemBlockFlags::READ
            && (flags.contains(MemBlockFlags::WRITE) || self.is_detailed(size))
    }

    /// Queue `event`, then wake the worker or flush inline if the queue got long.
    fn enqueue(&self, event: PendingNotify) {
        let (start, size) = (event.start, event.size);
        let len = {
            let mut pending = lock(&self.shared.pending);
            let len = pending.push(event);
            self.shared.windows.widen(start, size);
            len
        };

        if len > self.shared.config.flush_threshold {
            if self.has_worker() {
                self.shared.wake_worker();
            } else if len > self.shared.config.pending_capacity {
                self.shared.flush();
            }
        }
    }

    fn has_worker(&self) -> bool {
        lock(&self.worker).is_some()
    }

    /// Report `[start, start + size)` as touched at the current pc.
    pub fn notify(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, tag: &str) {
        self.notify_pc(flags, start, size, self.clock.pc(), tag);
    }

    /// Report `[start, start + size)` as touched by the instruction at `pc`.
    ///
    /// Memchecks run for writes and reads, unless `SKIP_MEMCHECK` is set,
    /// whether or not the event itself is tracked.
    pub fn notify_pc(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, pc: GuestAddr, tag: &str) {
        if size == 0 {
            return;
        }
        let start = normalize_address(start);

        if self.tracks(flags, size) {
            self.enqueue(PendingNotify::new(
                flags,
                start,
                size,
                self.clock.ticks(),
                pc,
                tag,
            ));
        }

        if !flags.contains(MemBlockFlags::SKIP_MEMCHECK) {
            if flags.contains(MemBlockFlags::WRITE) {
                self.memcheck.exec_mem_check(start, true, size, pc, tag);
            } else if flags.contains(MemBlockFlags::READ) {
                self.memcheck.exec_mem_check(start, false, size, pc, tag);
            }
        }
    }

    /// Report that `size` bytes were copied from `src` to `dest`.
    ///
    /// The destination is tagged `prefix` followed by whatever the source was
    /// tagged with at the time the copy is applied.
    pub fn notify_copy(&self, dest: GuestAddr, src: GuestAddr, size: u32, prefix: &str) {
        if size == 0 {
            return;
        }

        if self.memcheck.has_mem_checks() {
            // Checks need the real tag now, this costs a flush.
            let tag = self.format_write_tag_at(prefix, src, size);
            self.notify(MemBlockFlags::READ, src, size, &tag);
            self.notify(MemBlockFlags::WRITE, dest, size, &tag);
        } else if self.tracks(MemBlockFlags::WRITE, size) {
            self.enqueue(PendingNotify::copy(
                normalize_address(dest),
                normalize_address(src),
                size,
                self.clock.ticks(),
                self.clock.pc(),
                prefix,
            ));
        }
    }

    /// All provenance known for `[start, start + size)`, from every index.
    #[must_use]
    pub fn find(&self, start: GuestAddr, size: u32) -> Vec<MemBlockInfo> {
        self.find_by_flag(MemBlockFlags::all(), start, size)
    }

    /// Provenance for `[start, start + size)` from the indices selected by `flags`.
    #[must_use]
    pub fn find_by_flag(&self, flags: MemBlockFlags, start: GuestAddr, size: u32) -> Vec<MemBlockInfo> {
        let start = normalize_address(start);
        let maps = self.shared.maps_for(start, size, true);
        maps.find(flags, start, size)
    }

    /// Call `f` with the first tag found for `[start, start + size)`, without copying it.
    ///
    /// The index lock is held while `f` runs, so `f` must not call back into this context.
    pub fn with_write_tag<R, F>(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, f: F) -> R
    where
        F: FnOnce(Option<&str>) -> R,
    {
        let start = normalize_address(start);
        let maps = self.shared.maps_for(start, size, true);
        f(maps.fast_find_write_tag(flags, start, size))
    }

    /// The first tag found for `[start, start + size)`, scanning alloc, sub-alloc, write
    /// and texture indices in that order, as far as `flags` selects them.
    #[must_use]
    pub fn find_write_tag(&self, flags: MemBlockFlags, start: GuestAddr, size: u32) -> Option<String> {
        self.with_write_tag(flags, start, size, |tag| tag.map(str::to_string))
    }

    /// Describe where the contents of `[start, start + size)` came from, prefixed with `prefix`.
    ///
    /// Falls back to the address and size if nothing is known. The result fits a slab tag.
    #[must_use]
    pub fn format_write_tag_at(&self, prefix: &str, start: GuestAddr, size: u32) -> String {
        let start = normalize_address(start);
        let maps = self.shared.maps_for(start, size, true);
        let tag = maps.format_write_tag(prefix, start, size);
        SlabTag::new(&tag).as_str().into()
    }

    /// Apply all pending events now.
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Number of events waiting for a flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Forget all provenance, including anything still pending.
    pub fn reset(&self) {
        let mut maps = lock(&self.shared.maps);
        drop(self.shared.take_pending(&mut maps));
        for map in maps.maps_mut() {
            map.reset();
        }
    }

    /// Write all provenance as a `MemBlockInfo` section.
    pub fn save_state(&self, writer: &mut StateWriter) -> Result<(), Error> {
        let mut maps = lock(&self.shared.maps);
        self.shared.flush_locked(&mut maps);

        writer.section("MemBlockInfo", 1)?;
        for map in maps.maps() {
            map.save_state(writer)?;
        }
        debug!("Saved memory info, {} bytes of state so far", writer.len());
        Ok(())
    }

    /// Replace all provenance with the `MemBlockInfo` section at the reader's position.
    ///
    /// Nothing changes if the section cannot be decoded.
    pub fn load_state(&self, reader: &mut StateReader<'_>) -> Result<(), Error> {
        let version = reader.section("MemBlockInfo", 0, 1)?;
        let mut restored = MemMaps::default();
        if version >= 1 {
            for map in restored.maps_mut() {
                map.load_state(reader)?;
            }
        }

        let mut maps = lock(&self.shared.maps);
        // Whatever was pending describes the state we are leaving.
        self.shared.flush_locked(&mut maps);
        *maps = restored;
        debug!("Loaded memory info (version {version})");
        Ok(())
    }

    /// Stop the worker after one final flush and wait for it.
    ///
    /// Also happens on drop. Calling this more than once is fine.
    pub fn shutdown(&self) {
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        {
            let mut signal = lock(&self.shared.signal);
            signal.stop = true;
        }
        self.shared.wake.notify_one();
        if handle.join().is_err() {
            warn!("Memory info flush worker panicked");
        }
    }
}

impl Drop for MemInfo {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MemNotify for MemInfo {
    fn notify(&self, flags: MemBlockFlags, start: GuestAddr, size: u32, tag: &str) {
        MemInfo::notify(self, flags, start, size, tag);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::MemInfo;
    use crate::{ManualClock, MemBlockFlags, MemInfoConfig};

    fn meminfo(detailed: bool) -> (MemInfo, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1, 0x0880_0000));
        let config = MemInfoConfig::builder()
            .detailed(detailed)
            .flush_thread(false)
            .build();
        let info = MemInfo::with_hooks(config, Arc::clone(&clock), crate::NopMemCheck).unwrap();
        (info, clock)
    }

    #[test]
    fn test_free_keeps_previous_owner() {
        let (info, clock) = meminfo(true);
        info.notify_pc(MemBlockFlags::ALLOC, 0x0880_0000, 0x1000, 0x0880_0100, "Heap");
        clock.advance(10);
        info.notify_pc(MemBlockFlags::FREE, 0x0880_0000, 0x1000, 0x0880_0200, "");

        let found = info.find_by_flag(MemBlockFlags::ALLOC, 0x0880_0000, 0x1000);
        assert_eq!(found.len(), 1);
        assert!(!found[0].allocated);
        assert_eq!(found[0].tag, "Heap");
        assert_eq!(found[0].pc, 0x0880_0100);
    }

    #[test]
    fn test_sub_alloc_and_texture() {
        let (info, _clock) = meminfo(true);
        info.notify_pc(MemBlockFlags::SUB_ALLOC, 0x0890_0000, 0x40, 0x10, "Pool");
        info.notify_pc(MemBlockFlags::TEXTURE, 0x0400_0000, 0x8000, 0x20, "Tex");

        let found = info.find(0x0890_0000, 0x40);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].flags, MemBlockFlags::SUB_ALLOC);

        // Looked up through a VRAM mirror.
        let found = info.find_by_flag(MemBlockFlags::TEXTURE, 0x0460_0000, 0x10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tag, "Tex");

        info.notify_pc(MemBlockFlags::SUB_FREE, 0x0890_0000, 0x40, 0x30, "");
        let found = info.find(0x0890_0000, 0x40);
        assert!(!found[0].allocated);
    }

    #[test]
    fn test_detailed_override() {
        let (info, _clock) = meminfo(false);
        info.notify_pc(MemBlockFlags::ALLOC, 0x0880_0000, 0x10, 1, "Small");
        assert_eq!(info.pending_len(), 0);

        info.override_detailed();
        info.override_detailed();
        info.release_detailed();
        info.notify_pc(MemBlockFlags::ALLOC, 0x0880_0000, 0x10, 1, "Small");
        assert_eq!(info.pending_len(), 1);

        info.release_detailed();
        info.release_detailed();
        assert!(!info.is_detailed(0x10));
        assert!(info.is_detailed(0x100));
    }

    #[test]
    fn test_reset() {
        let (info, _clock) = meminfo(true);
        info.notify_pc(MemBlockFlags::WRITE, 0x0880_0000, 0x10, 1, "Gone");
        info.flush();
        info.notify_pc(MemBlockFlags::WRITE, 0x0880_1000, 0x10, 1, "Pending");
        info.reset();
        assert_eq!(info.pending_len(), 0);
        assert!(info.find(0x0880_0000, 0x2000).is_empty());
    }

    #[test]
    fn test_shutdown_twice() {
        let info = MemInfo::new(MemInfoConfig::default()).unwrap();
        info.notify_pc(MemBlockFlags::WRITE, 0x0880_0000, 0x10, 1, "Last");
        info.shutdown();
        assert_eq!(info.pending_len(), 0);
        info.shutdown();
    }
}
