//! Inodes: per-sector packed file descriptors with a free-inode hint
//! cache in the superblock.
//!
//! Inode ids are dense and zero-based; `inode_location` in
//! [`crate::context::Context`] maps an id to `(sector, slot)`.

use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{fatal, FsError, FsResult};
use crate::fs::Filesystem;
use crate::word::{InodeId, LeHalfId, LeId, RawHalfId, RawId, ADDR_LEN, INVALID_INODE, INVALID_SECTOR};

bitflags::bitflags! {
    /// Single-bit fields of the packed `flags` word. Bit positions are
    /// anchored at the top of the word and scale with W: for W=2 they
    /// match the reference implementation's `0x8000`/`0x6000`/…
    /// constants exactly; for W=4 the same bits are used one word
    /// wider, leaving the extra middle bits reserved. The low 9 bits
    /// are always the rwx permission triples, regardless of W.
    pub struct Flags: RawId {
        const IN_USE      = 1 << (RawId::BITS - 1);
        const LARGE       = 1 << (RawId::BITS - 4);
        const SET_UID     = 1 << (RawId::BITS - 5);
        const SET_GID     = 1 << (RawId::BITS - 6);
        const OWNER_READ  = 1 << 8;
        const OWNER_WRITE = 1 << 7;
        const OWNER_EXEC  = 1 << 6;
        const GROUP_READ  = 1 << 5;
        const GROUP_WRITE = 1 << 4;
        const GROUP_EXEC  = 1 << 3;
        const OTHER_READ  = 1 << 2;
        const OTHER_WRITE = 1 << 1;
        const OTHER_EXEC  = 1;
    }
}

/// The 2-bit file-type field, one notch below the `IN_USE` bit.
const TYPE_MASK: RawId = 0b11 << (RawId::BITS - 3);
const PERM_MASK: RawId = 0x1FF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Char,
    Dir,
    Block,
}

impl FileType {
    fn from_bits(bits: RawId) -> Self {
        match (bits & TYPE_MASK) >> (RawId::BITS - 3) {
            0b00 => FileType::File,
            0b01 => FileType::Char,
            0b10 => FileType::Dir,
            0b11 => FileType::Block,
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> RawId {
        let v: RawId = match self {
            FileType::File => 0b00,
            FileType::Char => 0b01,
            FileType::Dir => 0b10,
            FileType::Block => 0b11,
        };
        v << (RawId::BITS - 3)
    }
}

/// On-disk packed inode.
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Inode {
    flags: LeId,
    nlinks: LeHalfId,
    uid: LeHalfId,
    gid: LeHalfId,
    size0: LeHalfId,
    size1: LeId,
    addr: [LeId; ADDR_LEN],
    actime: [LeId; 2],
    modtime: [LeId; 2],
}

pub const INODE_SIZE: usize = core::mem::size_of::<Inode>();

impl Inode {
    pub fn zeroed() -> Self {
        Inode {
            flags: LeId::new(0),
            nlinks: LeHalfId::new(0),
            uid: LeHalfId::new(0),
            gid: LeHalfId::new(0),
            size0: LeHalfId::new(0),
            size1: LeId::new(0),
            addr: [LeId::new(INVALID_SECTOR); ADDR_LEN],
            actime: [LeId::new(0); 2],
            modtime: [LeId::new(0); 2],
        }
    }

    fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags.get())
    }

    fn set_flags(&mut self, flags: Flags) {
        self.flags = LeId::new(flags.bits());
    }

    pub fn in_use(&self) -> bool {
        self.flags().contains(Flags::IN_USE)
    }

    pub(crate) fn set_in_use(&mut self, value: bool) {
        let mut f = self.flags();
        f.set(Flags::IN_USE, value);
        self.set_flags(f);
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_bits(self.flags.get())
    }

    pub fn set_type(&mut self, typ: FileType) {
        let mut bits = self.flags.get();
        bits &= !TYPE_MASK;
        bits |= typ.to_bits();
        self.flags = LeId::new(bits);
    }

    pub fn is_large(&self) -> bool {
        self.flags().contains(Flags::LARGE)
    }

    pub fn set_large(&mut self, large: bool) {
        let mut f = self.flags();
        f.set(Flags::LARGE, large);
        self.set_flags(f);
    }

    pub fn permissions(&self) -> u16 {
        (self.flags.get() & PERM_MASK) as u16
    }

    pub fn set_permissions(&mut self, perm: u16) {
        let mut bits = self.flags.get();
        bits &= !PERM_MASK;
        bits |= perm as RawId & PERM_MASK;
        self.flags = LeId::new(bits);
    }

    pub fn nlinks(&self) -> RawHalfId {
        self.nlinks.get()
    }

    pub fn set_nlinks(&mut self, n: RawHalfId) {
        self.nlinks = LeHalfId::new(n);
    }

    pub fn uid(&self) -> RawHalfId {
        self.uid.get()
    }

    pub fn gid(&self) -> RawHalfId {
        self.gid.get()
    }

    /// High half of the size field is a halfword, so its shift matches
    /// the reference implementation's `sizeof(word_t) * 8`, not a fixed
    /// byte width -- it moves from 8 to 16 bits under the `word32`
    /// feature along with everything else `RawId`-shaped.
    pub fn size(&self) -> u64 {
        ((self.size0.get() as u64) << RawId::BITS) | self.size1.get() as u64
    }

    pub fn set_size(&mut self, size: u64) {
        self.size0 = LeHalfId::new((size >> RawId::BITS) as RawHalfId);
        self.size1 = LeId::new(size as RawId);
    }

    pub fn addr(&self, i: usize) -> RawId {
        self.addr[i].get()
    }

    pub fn set_addr(&mut self, i: usize, value: RawId) {
        self.addr[i] = LeId::new(value);
    }

    fn mark_allocated(&mut self) {
        *self = Inode::zeroed();
        let mut f = self.flags();
        f.insert(Flags::IN_USE);
        self.set_flags(f);
    }

    fn clear_in_use(&mut self) {
        let mut f = self.flags();
        f.remove(Flags::IN_USE);
        self.set_flags(f);
    }
}

fn read_from(bytes: &[u8]) -> Inode {
    *LayoutVerified::<&[u8], Inode>::new(&bytes[..INODE_SIZE])
        .unwrap_or_else(|| fatal("inode sector slot is misaligned"))
}

fn write_into(bytes: &mut [u8], inode: &Inode) {
    bytes[..INODE_SIZE].copy_from_slice(inode.as_bytes());
}

impl Filesystem {
    pub fn read_inode(&mut self, id: InodeId) -> Inode {
        self.check_inode_range(id);
        let (sector, slot) = self.ctx.inode_location(id as u32);
        let h = self.cache.read_lba(&mut self.storage, sector);
        self.cache.with(h, |bytes| {
            read_from(&bytes[slot * INODE_SIZE..(slot + 1) * INODE_SIZE])
        })
    }

    pub fn write_inode<R>(&mut self, id: InodeId, f: impl FnOnce(&mut Inode) -> R) -> R {
        self.check_inode_range(id);
        let (sector, slot) = self.ctx.inode_location(id as u32);
        let h = self.cache.read_lba_for_write(&mut self.storage, sector);
        let mut ret = None;
        self.cache.with_mut(h, |bytes| {
            let region = &mut bytes[slot * INODE_SIZE..(slot + 1) * INODE_SIZE];
            let mut inode = read_from(region);
            ret = Some(f(&mut inode));
            write_into(region, &inode);
        });
        ret.unwrap()
    }

    fn check_inode_range(&self, id: InodeId) {
        if id == INVALID_INODE || id as u32 >= self.ctx.total_inodes {
            fatal(format_args!("inode id {id} is out of range"));
        }
    }

    /// Scans the inode region from the start, refilling the
    /// superblock's free-inode hint cache with up to K free ids.
    fn refill_inode_hints(&mut self) {
        let mut found = Vec::new();
        for id in 0..self.ctx.total_inodes {
            if found.len() >= crate::word::FREE_ARRAY_CAP - 1 {
                break;
            }
            if !self.read_inode(id as InodeId).in_use() {
                found.push(id);
            }
        }
        self.write_superblock(|sb| {
            sb.clear_inode_hints();
            for id in &found {
                sb.push_inode_hint(*id);
            }
        });
    }

    /// Allocates a free inode, or `Err(FsError::NoInode)` if none remain.
    pub fn alloc_inode(&mut self) -> FsResult<InodeId> {
        let cached = self.write_superblock(|sb| sb.pop_inode_hint());
        let id = match cached {
            Some(id) => id,
            None => {
                self.refill_inode_hints();
                match self.write_superblock(|sb| sb.pop_inode_hint()) {
                    Some(id) => id,
                    None => return Err(FsError::NoInode),
                }
            }
        };

        self.write_inode(id as InodeId, |inode| {
            if inode.in_use() {
                fatal("alloc_inode: cached free id is already in use");
            }
            inode.mark_allocated();
        });
        Ok(id as InodeId)
    }

    /// Frees `id`. The superblock's hint cache is a best-effort cache:
    /// authoritative state lives in the inode's own `IN_USE` bit.
    pub fn free_inode(&mut self, id: InodeId) {
        self.write_inode(id, |inode| {
            if !inode.in_use() {
                fatal("free_inode: inode is not in use");
            }
            inode.clear_in_use();
        });
        self.write_superblock(|sb| {
            if sb.cached_ninode() < crate::word::FREE_ARRAY_CAP {
                sb.push_inode_hint(id as u32);
            }
        });
    }
}
