//! Buffer cache: a bounded pool of sector-sized buffers with LRU eviction,
//! pin/unpin, dirty tracking and write-back.
//!
//! The reference implementation hands callers a raw pointer into a slot
//! and threads a global pool through every call. Here the pool lives
//! behind an `Rc<RefCell<_>>` so a [`BufHandle`] can be held across
//! further cache operations (as the block map must: inode, indirection
//! and data sector may all be pinned at once) without the borrow
//! checker treating that as aliasing. Single-threaded only, matching
//! §5 of the design: there is no `Send`/`Sync` story here.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use array_macro::array;

use crate::error::fatal;
use crate::storage::Storage;
use crate::word::{SectorId, MAX_BUFFERS};

/// Identifies a cached buffer. Stale handles (referring to a slot that
/// has since been evicted and reused for a different sector) are
/// detected via the generation counter and treated as a fatal
/// programming error rather than silently misread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufHandle {
    slot: usize,
    generation: u64,
}

struct Slot {
    in_use: bool,
    dirty: bool,
    pinned: u32,
    lba: SectorId,
    generation: u64,
    data: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Slot {
    fn empty(sector_size: usize) -> Self {
        Slot {
            in_use: false,
            dirty: false,
            pinned: 0,
            lba: 0,
            generation: 0,
            data: vec![0u8; sector_size],
            prev: None,
            next: None,
        }
    }
}

struct Inner {
    slots: Vec<Slot>,
    /// MRU end of the in-use list.
    head: Option<usize>,
    /// LRU end of the in-use list.
    tail: Option<usize>,
    index: HashMap<SectorId, usize>,
    sector_size: usize,
}

impl Inner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn write_back(&mut self, storage: &mut Storage, idx: usize) {
        if self.slots[idx].dirty {
            storage.write(self.slots[idx].lba, &self.slots[idx].data);
            self.slots[idx].dirty = false;
        }
    }

    /// Finds a free slot, or evicts the LRU-most unpinned in-use slot.
    /// Fatal if every in-use slot is pinned.
    fn claim_slot(&mut self, storage: &mut Storage) -> usize {
        if let Some(idx) = self.slots.iter().position(|s| !s.in_use) {
            return idx;
        }
        let mut cur = self.tail;
        while let Some(idx) = cur {
            if self.slots[idx].pinned == 0 {
                self.write_back(storage, idx);
                self.index.remove(&self.slots[idx].lba);
                self.unlink(idx);
                self.slots[idx].in_use = false;
                self.slots[idx].generation = self.slots[idx].generation.wrapping_add(1);
                return idx;
            }
            cur = self.slots[idx].prev;
        }
        fatal("buffer cache exhausted: every buffer is pinned");
    }

    fn acquire(&mut self, storage: &mut Storage, lba: SectorId, dirty: bool, blind: bool) -> usize {
        if let Some(&idx) = self.index.get(&lba) {
            self.move_to_front(idx);
            if dirty {
                self.slots[idx].dirty = true;
            }
            return idx;
        }
        let idx = self.claim_slot(storage);
        {
            let slot = &mut self.slots[idx];
            slot.in_use = true;
            slot.lba = lba;
            slot.pinned = 0;
            slot.dirty = dirty || blind;
        }
        if !blind {
            let (size, lba_local) = (self.sector_size, lba);
            let mut buf = std::mem::take(&mut self.slots[idx].data);
            if buf.len() != size {
                buf.resize(size, 0);
            }
            storage.read(lba_local, &mut buf);
            self.slots[idx].data = buf;
        }
        self.index.insert(lba, idx);
        self.push_front(idx);
        idx
    }

    fn handle_of(&self, idx: usize) -> BufHandle {
        BufHandle {
            slot: idx,
            generation: self.slots[idx].generation,
        }
    }

    fn resolve(&self, h: BufHandle) -> usize {
        let slot = self
            .slots
            .get(h.slot)
            .unwrap_or_else(|| fatal("buffer handle out of range"));
        if !slot.in_use || slot.generation != h.generation {
            fatal("stale buffer handle: slot was recycled");
        }
        h.slot
    }
}

/// A bounded pool of sector-sized buffers, cheaply cloneable (an `Rc`
/// handle to shared interior state) so that multiple [`BufHandle`]s can
/// stay pinned across further cache calls.
#[derive(Clone)]
pub struct BufferCache(Rc<RefCell<Inner>>);

impl BufferCache {
    /// Builds the pool at the fixed size the filesystem always mounts
    /// with, `MAX_BUFFERS` slots laid out with `array!` exactly as the
    /// teacher's own fixed-size pools (its process table, its CPU array)
    /// are built.
    pub fn new(sector_size: usize) -> Self {
        let slots: [Slot; MAX_BUFFERS] = array![_ => Slot::empty(sector_size); MAX_BUFFERS];
        Self::from_slots(slots.into(), sector_size)
    }

    /// Like [`Self::new`] but with an explicit capacity, for exercising
    /// eviction behavior at pool sizes other than `MAX_BUFFERS`.
    #[cfg(test)]
    fn with_capacity(capacity: usize, sector_size: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot::empty(sector_size)).collect();
        Self::from_slots(slots, sector_size)
    }

    fn from_slots(slots: Vec<Slot>, sector_size: usize) -> Self {
        BufferCache(Rc::new(RefCell::new(Inner {
            slots,
            head: None,
            tail: None,
            index: HashMap::new(),
            sector_size,
        })))
    }

    /// Returns the buffer for `lba`, promoting it to MRU. Reads through
    /// to `storage` on a cache miss.
    pub fn read_lba(&self, storage: &mut Storage, lba: SectorId) -> BufHandle {
        let mut inner = self.0.borrow_mut();
        let idx = inner.acquire(storage, lba, false, false);
        inner.handle_of(idx)
    }

    /// Like [`Self::read_lba`] but also marks the buffer dirty.
    pub fn read_lba_for_write(&self, storage: &mut Storage, lba: SectorId) -> BufHandle {
        let mut inner = self.0.borrow_mut();
        let idx = inner.acquire(storage, lba, true, false);
        inner.handle_of(idx)
    }

    /// Reserves a dirty buffer for `lba` without reading it from
    /// storage. The caller must overwrite the full sector before the
    /// buffer can be evicted or flushed.
    pub fn write_lba(&self, storage: &mut Storage, lba: SectorId) -> BufHandle {
        let mut inner = self.0.borrow_mut();
        let idx = inner.acquire(storage, lba, true, true);
        inner.handle_of(idx)
    }

    pub fn pin(&self, h: BufHandle) {
        let mut inner = self.0.borrow_mut();
        let idx = inner.resolve(h);
        inner.slots[idx].pinned += 1;
    }

    pub fn unpin(&self, h: BufHandle) {
        let mut inner = self.0.borrow_mut();
        let idx = inner.resolve(h);
        if inner.slots[idx].pinned == 0 {
            fatal("unpin of a buffer with pin count 0");
        }
        inner.slots[idx].pinned -= 1;
    }

    /// Pins `h` and returns a guard that unpins it on drop, regardless
    /// of which exit path is taken.
    pub fn pin_scope(&self, h: BufHandle) -> scopeguard::ScopeGuard<BufHandle, impl FnOnce(BufHandle)> {
        self.pin(h);
        let cache = self.clone();
        scopeguard::guard(h, move |h| cache.unpin(h))
    }

    pub fn set_dirty(&self, h: BufHandle) {
        let mut inner = self.0.borrow_mut();
        let idx = inner.resolve(h);
        inner.slots[idx].dirty = true;
    }

    pub fn is_dirty(&self, h: BufHandle) -> bool {
        let inner = self.0.borrow();
        inner.slots[inner.resolve(h)].dirty
    }

    pub fn is_pinned(&self, h: BufHandle) -> bool {
        let inner = self.0.borrow();
        inner.slots[inner.resolve(h)].pinned > 0
    }

    pub fn lba_of(&self, h: BufHandle) -> SectorId {
        let inner = self.0.borrow();
        inner.slots[inner.resolve(h)].lba
    }

    /// Runs `f` over the buffer's data.
    pub fn with<R>(&self, h: BufHandle, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.0.borrow();
        let idx = inner.resolve(h);
        f(&inner.slots[idx].data)
    }

    /// Runs `f` over the buffer's data, mutably. Does not itself mark
    /// the buffer dirty -- callers that mutate through a handle that
    /// was not already acquired for write must call [`Self::set_dirty`].
    pub fn with_mut<R>(&self, h: BufHandle, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.0.borrow_mut();
        let idx = inner.resolve(h);
        f(&mut inner.slots[idx].data)
    }

    /// Writes `h` back to storage if dirty; clears the dirty bit.
    pub fn flush(&self, storage: &mut Storage, h: BufHandle) {
        let mut inner = self.0.borrow_mut();
        let idx = inner.resolve(h);
        inner.write_back(storage, idx);
    }

    /// Flushes and detaches every cached buffer. Fatal if any buffer
    /// is still pinned: this is also the postcondition the test suite
    /// checks between externally visible operations.
    pub fn flush_all(&self, storage: &mut Storage) {
        let mut inner = self.0.borrow_mut();
        let in_use: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, _)| i)
            .collect();
        for idx in &in_use {
            if inner.slots[*idx].pinned != 0 {
                fatal("flush_all: a buffer is still pinned");
            }
        }
        for idx in in_use {
            inner.write_back(storage, idx);
            let lba = inner.slots[idx].lba;
            inner.index.remove(&lba);
            inner.unlink(idx);
            inner.slots[idx].in_use = false;
            inner.slots[idx].generation = inner.slots[idx].generation.wrapping_add(1);
        }
    }

    /// Writes back every dirty buffer but keeps them cached.
    pub fn flush_all_no_rm(&self, storage: &mut Storage) {
        let mut inner = self.0.borrow_mut();
        let in_use: Vec<usize> = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.in_use)
            .map(|(i, _)| i)
            .collect();
        for idx in in_use {
            inner.write_back(storage, idx);
        }
    }

    /// True iff no buffer in the pool is pinned. Invariant checked by
    /// the test suite between externally visible filesystem operations.
    pub fn all_unpinned(&self) -> bool {
        let inner = self.0.borrow();
        inner.slots.iter().all(|s| s.pinned == 0)
    }

    /// Number of currently cached (in-use) buffers.
    pub fn cached_count(&self) -> usize {
        let inner = self.0.borrow();
        inner.slots.iter().filter(|s| s.in_use).count()
    }

    /// The MRU-ordered set of cached sectors, head first. For tests.
    pub fn cached_lbas_mru_order(&self) -> Vec<SectorId> {
        let inner = self.0.borrow();
        let mut out = Vec::new();
        let mut cur = inner.head;
        while let Some(idx) = cur {
            out.push(inner.slots[idx].lba);
            cur = inner.slots[idx].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::SECTOR_SIZE;

    fn setup(pool: usize, sectors: u64) -> (BufferCache, Storage) {
        (
            BufferCache::with_capacity(pool, SECTOR_SIZE),
            Storage::new_memory(sectors, SECTOR_SIZE),
        )
    }

    #[test]
    fn write_lba_then_flush_all_is_visible_through_storage() {
        let (cache, mut storage) = setup(16, 64);
        let h = cache.write_lba(&mut storage, 5);
        cache.with_mut(h, |d| d.fill(0xAB));
        cache.flush_all(&mut storage);

        let mut out = vec![0u8; SECTOR_SIZE];
        storage.read(5, &mut out);
        assert!(out.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn successive_reads_return_same_buffer() {
        let (cache, mut storage) = setup(16, 64);
        let a = cache.read_lba(&mut storage, 3);
        let b = cache.read_lba(&mut storage, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn lru_eviction_writes_back_dirty_victims() {
        let (cache, mut storage) = setup(16, 64);
        for lba in 0..32u32 {
            let h = cache.read_lba_for_write(&mut storage, lba as SectorId);
            cache.with_mut(h, |d| d.fill(lba as u8));
        }
        assert_eq!(cache.cached_count(), 16);
        for lba in 16..32u32 {
            let mut out = vec![0u8; SECTOR_SIZE];
            storage.read(lba as SectorId, &mut out);
            assert!(out.iter().all(|&b| b == lba as u8));
        }
    }

    #[test]
    fn pinned_buffers_survive_eviction_pressure() {
        let (cache, mut storage) = setup(16, 128);
        let pinned: Vec<_> = (0..5u32)
            .map(|lba| {
                let h = cache.read_lba(&mut storage, lba as SectorId);
                cache.pin(h);
                h
            })
            .collect();
        for lba in 5..55u32 {
            cache.read_lba(&mut storage, lba as SectorId);
        }
        for h in &pinned {
            assert!(cache.is_pinned(*h));
        }
        for h in pinned {
            cache.unpin(h);
        }
    }

    #[test]
    #[should_panic]
    fn flush_all_with_pinned_buffer_is_fatal() {
        let (cache, mut storage) = setup(4, 16);
        let h = cache.read_lba(&mut storage, 0);
        cache.pin(h);
        cache.flush_all(&mut storage);
    }

    #[test]
    #[should_panic]
    fn unpin_without_pin_is_fatal() {
        let (cache, mut storage) = setup(4, 16);
        let h = cache.read_lba(&mut storage, 0);
        cache.unpin(h);
    }

    #[test]
    #[should_panic]
    fn using_a_stale_handle_after_eviction_is_fatal() {
        let (cache, mut storage) = setup(2, 16);
        let h = cache.read_lba(&mut storage, 0);
        cache.read_lba(&mut storage, 1);
        cache.read_lba(&mut storage, 2);
        cache.with(h, |_| ());
    }
}
