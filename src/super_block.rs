//! Superblock and free-sector manager.
//!
//! The free sector set is the disjoint union of the superblock's cached
//! `free[1..nfree]` array and a singly-linked chain of `FreeArray` nodes
//! rooted at `free[0]`, each node itself a free sector reused to carry
//! the next batch of ids. `alloc_sector`/`free_sector` shuffle sectors
//! between the two without ever materializing the whole free set in
//! memory at once.

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{fatal, FsError, FsResult};
use crate::fs::Filesystem;
use crate::word::{LeId, SectorId, FREE_ARRAY_CAP, FS_MAGIC, INVALID_SECTOR};

/// Free slot 0 of a [`FreeArray`] is reserved for `chain_next`, so the
/// cached-sector stack itself holds at most this many entries.
const FREE_STACK_CAP: usize = FREE_ARRAY_CAP - 1;

/// Shared on-disk shape of the superblock's free-sector cache and of
/// every chain node stored out in the free region.
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct FreeArray {
    nfree: LeId,
    free: [LeId; FREE_ARRAY_CAP],
}

impl FreeArray {
    fn empty() -> Self {
        FreeArray {
            nfree: LeId::new(0),
            free: [LeId::new(0); FREE_ARRAY_CAP],
        }
    }

    fn nfree(&self) -> usize {
        self.nfree.get() as usize
    }

    fn chain_next(&self) -> SectorId {
        self.free[0].get()
    }

    fn set_chain_next(&mut self, next: SectorId) {
        self.free[0] = LeId::new(next);
    }

    fn cached(&self, slot: usize) -> SectorId {
        self.free[slot].get()
    }

    fn set_cached(&mut self, slot: usize, value: SectorId) {
        self.free[slot] = LeId::new(value);
    }

    fn set_nfree(&mut self, n: usize) {
        assert!(n < FREE_ARRAY_CAP, "nfree must stay below K");
        self.nfree = LeId::new(n as SectorId);
    }

    /// The cached free sectors as a push/pop stack, top last -- decoded
    /// from the packed `free[1..=nfree]` slots (`free[0]` stays put, it
    /// belongs to `chain_next`). Mirrors the teacher's own split between
    /// a packed on-disk header and an `ArrayVec` working copy of it
    /// (e.g. `LogHeader` vs. `Log::bufs`).
    fn stack(&self) -> ArrayVec<SectorId, FREE_STACK_CAP> {
        (1..=self.nfree()).map(|slot| self.cached(slot)).collect()
    }

    fn set_stack(&mut self, stack: &ArrayVec<SectorId, FREE_STACK_CAP>) {
        self.set_nfree(stack.len());
        for (i, &sector) in stack.iter().enumerate() {
            self.set_cached(i + 1, sector);
        }
    }
}

#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Superblock {
    magic: [u8; 4],
    isize_sectors: LeId,
    fsize_sectors: LeId,
    free: FreeArray,
    ninode: LeId,
    inode_cache: [LeId; FREE_ARRAY_CAP],
    lock: u8,
    modified: u8,
    time: [LeId; 2],
}

pub const SUPERBLOCK_SIZE: usize = core::mem::size_of::<Superblock>();

static_assertions::const_assert!(SUPERBLOCK_SIZE <= crate::word::SECTOR_SIZE);

impl Superblock {
    pub fn new(isize_sectors: u32, fsize_sectors: u32) -> Self {
        Superblock {
            magic: FS_MAGIC,
            isize_sectors: LeId::new(isize_sectors as SectorId),
            fsize_sectors: LeId::new(fsize_sectors as SectorId),
            free: FreeArray::empty(),
            ninode: LeId::new(0),
            inode_cache: [LeId::new(0); FREE_ARRAY_CAP],
            lock: 0,
            modified: 0,
            time: [LeId::new(0); 2],
        }
    }

    pub fn isize_sectors(&self) -> u32 {
        self.isize_sectors.get() as u32
    }

    pub fn fsize_sectors(&self) -> u32 {
        self.fsize_sectors.get() as u32
    }

    pub fn check_magic(&self) {
        if self.magic != FS_MAGIC {
            fatal("superblock signature mismatch: not an OFS image");
        }
    }

    pub(crate) fn cached_ninode(&self) -> usize {
        self.ninode.get() as usize
    }

    fn inode_hints(&self) -> ArrayVec<u32, FREE_ARRAY_CAP> {
        (0..self.cached_ninode())
            .map(|i| self.inode_cache[i].get() as u32)
            .collect()
    }

    fn set_inode_hints(&mut self, hints: &ArrayVec<u32, FREE_ARRAY_CAP>) {
        self.ninode = LeId::new(hints.len() as SectorId);
        for (i, &id) in hints.iter().enumerate() {
            self.inode_cache[i] = LeId::new(id as SectorId);
        }
    }

    pub(crate) fn push_inode_hint(&mut self, id: u32) {
        let mut hints = self.inode_hints();
        if hints.try_push(id).is_ok() {
            self.set_inode_hints(&hints);
        }
    }

    pub(crate) fn pop_inode_hint(&mut self) -> Option<u32> {
        let mut hints = self.inode_hints();
        let popped = hints.pop();
        if popped.is_some() {
            self.set_inode_hints(&hints);
        }
        popped
    }

    pub(crate) fn clear_inode_hints(&mut self) {
        self.ninode = LeId::new(0);
    }
}

fn read_from(bytes: &[u8]) -> Superblock {
    *LayoutVerified::<&[u8], Superblock>::new(&bytes[..SUPERBLOCK_SIZE])
        .unwrap_or_else(|| fatal("superblock sector is misaligned"))
}

fn write_into(bytes: &mut [u8], sb: &Superblock) {
    bytes[..SUPERBLOCK_SIZE].copy_from_slice(sb.as_bytes());
}

impl Filesystem {
    pub(crate) fn read_superblock(&mut self) -> Superblock {
        let h = self.cache.read_lba(&mut self.storage, self.ctx.superblock_sector);
        self.cache.with(h, read_from)
    }

    /// Overwrites the superblock sector outright, bypassing the usual
    /// read-modify-write. Used once, at format time.
    pub(crate) fn write_superblock_raw(&mut self, sb: &Superblock) {
        let h = self.cache.write_lba(&mut self.storage, self.ctx.superblock_sector);
        self.cache.with_mut(h, |bytes| write_into(bytes, sb));
    }

    pub(crate) fn write_superblock<R>(&mut self, f: impl FnOnce(&mut Superblock) -> R) -> R {
        let h = self
            .cache
            .read_lba_for_write(&mut self.storage, self.ctx.superblock_sector);
        let mut ret = None;
        self.cache.with_mut(h, |bytes| {
            let mut sb = read_from(bytes);
            ret = Some(f(&mut sb));
            write_into(bytes, &sb);
        });
        ret.unwrap()
    }

    /// Allocates a free data sector, or `Err(FsError::NoSpace)` if the
    /// disk is full. LIFO within a single cache refill; across refills
    /// the order follows the chain's construction history.
    pub fn alloc_sector(&mut self) -> FsResult<SectorId> {
        enum Step {
            FromCache(SectorId),
            Full,
            ChainHead(SectorId),
        }

        let step = self.write_superblock(|sb| {
            let mut stack = sb.free.stack();
            if let Some(sector) = stack.pop() {
                sb.free.set_stack(&stack);
                return Step::FromCache(sector);
            }
            let head = sb.free.chain_next();
            if head == INVALID_SECTOR {
                return Step::Full;
            }
            Step::ChainHead(head)
        });

        match step {
            Step::FromCache(sector) => Ok(sector),
            Step::Full => Err(FsError::NoSpace),
            Step::ChainHead(head) => {
                // The chain head itself becomes the allocated sector;
                // the FreeArray payload stored there replenishes the
                // superblock's cache, deallocating the node from the
                // chain in the same stroke.
                let node = self.read_free_array_node(head);
                self.write_superblock(|sb| sb.free = node);
                Ok(head)
            }
        }
    }

    /// Returns `sector_id` to the free pool.
    pub fn free_sector(&mut self, sector_id: SectorId) {
        enum Step {
            Cached,
            Spill(FreeArray),
        }

        let step = self.write_superblock(|sb| {
            let mut stack = sb.free.stack();
            if stack.try_push(sector_id).is_ok() {
                sb.free.set_stack(&stack);
                Step::Cached
            } else {
                Step::Spill(sb.free)
            }
        });

        if let Step::Spill(node) = step {
            // The newly freed sector becomes a new chain node: its
            // payload is the superblock's old free-array, copied
            // verbatim (including its old free[0] chain pointer).
            self.write_free_array_node(sector_id, &node);
            self.write_superblock(|sb| {
                sb.free = FreeArray::empty();
                sb.free.set_chain_next(sector_id);
            });
        }
    }

    fn read_free_array_node(&mut self, sector: SectorId) -> FreeArray {
        let h = self.cache.read_lba(&mut self.storage, sector);
        self.cache.with(h, |bytes| {
            *LayoutVerified::<&[u8], FreeArray>::new(&bytes[..core::mem::size_of::<FreeArray>()])
                .unwrap_or_else(|| fatal("free-array node is misaligned"))
        })
    }

    fn write_free_array_node(&mut self, sector: SectorId, node: &FreeArray) {
        let h = self.cache.write_lba(&mut self.storage, sector);
        self.cache.with_mut(h, |bytes| {
            bytes.fill(0);
            bytes[..core::mem::size_of::<FreeArray>()].copy_from_slice(node.as_bytes());
        });
    }
}
