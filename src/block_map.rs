//! Block map: translates a file-sector index into a disk sector via the
//! inode's direct table, a single level of indirection, and a second
//! level of indirection for very large files.
//!
//! Unlike the reference implementation, callers here never hold a raw
//! pointer into a cache slot across an allocation call: inodes are
//! read and written as owned copies via [`Filesystem::read_inode`] /
//! [`Filesystem::write_inode`], and the one place where a sector's
//! contents really must stay put across a nested [`Filesystem::alloc_sector`]
//! call -- resolving a slot inside an indirection sector -- pins the
//! buffer for exactly that span with [`crate::buffer::BufferCache::pin_scope`].

use zerocopy::{AsBytes, LayoutVerified};

use crate::error::FsResult;
use crate::fs::Filesystem;
use crate::inode::Inode;
use crate::word::{InodeId, LeId, SectorId, ADDR_LEN, INVALID_SECTOR, SECTOR_SIZE};

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotKind {
    Indirection,
    Data,
}

fn read_id_slot(bytes: &[u8], index: usize) -> SectorId {
    let width = core::mem::size_of::<LeId>();
    let raw = &bytes[index * width..(index + 1) * width];
    LayoutVerified::<&[u8], LeId>::new(raw)
        .expect("slice has exactly one id's worth of bytes")
        .get()
}

fn write_id_slot(bytes: &mut [u8], index: usize, value: SectorId) {
    let width = core::mem::size_of::<LeId>();
    let region = &mut bytes[index * width..(index + 1) * width];
    region.copy_from_slice(LeId::new(value).as_bytes());
}

impl Filesystem {
    fn init_indirection_sector(&mut self, sector: SectorId) {
        let h = self.cache.write_lba(&mut self.storage, sector);
        self.cache.with_mut(h, |bytes| {
            let width = core::mem::size_of::<LeId>();
            for chunk in bytes.chunks_exact_mut(width) {
                chunk.copy_from_slice(LeId::new(INVALID_SECTOR).as_bytes());
            }
        });
    }

    /// Reads the id at `id_index` inside `container` without
    /// allocating; `INVALID_SECTOR` signals a hole.
    fn read_slot(&mut self, container: SectorId, id_index: usize) -> SectorId {
        let h = self.cache.read_lba(&mut self.storage, container);
        self.cache.with(h, |bytes| read_id_slot(bytes, id_index))
    }

    /// Reads the id stored at `id_index` inside `container`; if it is
    /// `INVALID_SECTOR`, allocates a sector and writes the new id back
    /// before returning it. The buffer holding `container` is pinned
    /// for the whole call so the nested [`Filesystem::alloc_sector`]
    /// can never evict it out from under the pending write-back.
    fn read_or_alloc_slot(&mut self, container: SectorId, id_index: usize, kind: SlotKind) -> FsResult<SectorId> {
        let h = self.cache.read_lba_for_write(&mut self.storage, container);
        let guard = self.cache.pin_scope(h);
        let existing = self.cache.with(*guard, |bytes| read_id_slot(bytes, id_index));
        if existing != INVALID_SECTOR {
            return Ok(existing);
        }
        let new_sector = self.alloc_sector()?;
        if kind == SlotKind::Indirection {
            self.init_indirection_sector(new_sector);
        }
        self.cache
            .with_mut(*guard, |bytes| write_id_slot(bytes, id_index, new_sector));
        Ok(new_sector)
    }

    /// Resolves a file-sector index to a disk sector, without
    /// allocating. Returns `None` for a hole.
    pub fn get_file_sector(&mut self, inode_id: InodeId, byte_offset: u64) -> Option<SectorId> {
        assert_eq!(
            byte_offset % SECTOR_SIZE as u64,
            0,
            "byte_offset must be sector-aligned"
        );
        let i = byte_offset / SECTOR_SIZE as u64;
        let inode = self.read_inode(inode_id);
        self.resolve_read(&inode, i)
    }

    /// Resolves a file-sector index to a disk sector, allocating
    /// sectors (and indirection levels) as needed so that the index is
    /// uniquely bound to a disk sector on return.
    pub fn get_file_sector_for_write(&mut self, inode_id: InodeId, byte_offset: u64) -> FsResult<SectorId> {
        assert_eq!(
            byte_offset % SECTOR_SIZE as u64,
            0,
            "byte_offset must be sector-aligned"
        );
        let i = byte_offset / SECTOR_SIZE as u64;
        let inode = self.read_inode(inode_id);

        if !inode.is_large() {
            if i < ADDR_LEN as u64 {
                let existing = inode.addr(i as usize);
                if existing != INVALID_SECTOR {
                    return Ok(existing);
                }
                let sector = self.alloc_sector()?;
                self.write_inode(inode_id, |ino| ino.set_addr(i as usize, sector));
                return Ok(sector);
            }
            self.convert_to_large(inode_id, &inode)?;
        }

        let inode = self.read_inode(inode_id);
        self.resolve_write(inode_id, &inode, i)
    }

    /// Promotes a small file to large: allocates one indirection
    /// sector, copies `addr[0..A-1]` into its first A slots (the rest
    /// left `INVALID`), then rewrites the inode to point at it through
    /// `addr[0]` with the large flag set.
    fn convert_to_large(&mut self, inode_id: InodeId, inode: &Inode) -> FsResult<()> {
        let indirection = self.alloc_sector()?;
        self.init_indirection_sector(indirection);
        let h = self.cache.read_lba_for_write(&mut self.storage, indirection);
        self.cache.with_mut(h, |bytes| {
            for k in 0..ADDR_LEN {
                write_id_slot(bytes, k, inode.addr(k));
            }
        });
        self.write_inode(inode_id, |ino| {
            for k in 0..ADDR_LEN {
                ino.set_addr(k, INVALID_SECTOR);
            }
            ino.set_addr(0, indirection);
            ino.set_large(true);
        });
        Ok(())
    }

    /// Resolves an addr-table top-level slot (`addr[slot]`) for the
    /// write path, allocating an indirection sector and writing it back
    /// into the inode if the slot was a hole.
    fn resolve_top_for_write(&mut self, inode_id: InodeId, inode: &Inode, slot: usize) -> FsResult<SectorId> {
        let existing = inode.addr(slot);
        if existing != INVALID_SECTOR {
            return Ok(existing);
        }
        let sector = self.alloc_sector()?;
        self.init_indirection_sector(sector);
        self.write_inode(inode_id, |ino| ino.set_addr(slot, sector));
        Ok(sector)
    }

    fn resolve_read(&mut self, inode: &Inode, i: u64) -> Option<SectorId> {
        let ids = self.ctx.id_per_indir_sector as u64;

        if !inode.is_large() {
            if i >= ADDR_LEN as u64 {
                return None;
            }
            let sector = inode.addr(i as usize);
            return (sector != INVALID_SECTOR).then_some(sector);
        }

        let j = i / ids;

        if j < ADDR_LEN as u64 - 1 {
            let k = (i % ids) as usize;
            let indir = inode.addr(j as usize);
            if indir == INVALID_SECTOR {
                return None;
            }
            let id = self.read_slot(indir, k);
            return (id != INVALID_SECTOR).then_some(id);
        }

        // Extra-large range: a second level of indirection hanging off
        // addr[A-1].
        let i2 = i - self.ctx.extra_large_start_sector;
        let j2 = (i2 / ids) as usize;
        let k2 = (i2 % ids) as usize;
        if j2 as u64 >= ids {
            return None;
        }

        let top = inode.addr(ADDR_LEN - 1);
        if top == INVALID_SECTOR {
            return None;
        }
        let mid = self.read_slot(top, j2);
        if mid == INVALID_SECTOR {
            return None;
        }
        let id = self.read_slot(mid, k2);
        (id != INVALID_SECTOR).then_some(id)
    }

    fn resolve_write(&mut self, inode_id: InodeId, inode: &Inode, i: u64) -> FsResult<SectorId> {
        let ids = self.ctx.id_per_indir_sector as u64;
        let j = i / ids;

        if j < ADDR_LEN as u64 - 1 {
            let k = (i % ids) as usize;
            let indir = self.resolve_top_for_write(inode_id, inode, j as usize)?;
            return self.read_or_alloc_slot(indir, k, SlotKind::Data);
        }

        // Extra-large range: a second level of indirection hanging off
        // addr[A-1].
        let i2 = i - self.ctx.extra_large_start_sector;
        let j2 = (i2 / ids) as usize;
        let k2 = (i2 % ids) as usize;

        let top = self.resolve_top_for_write(inode_id, inode, ADDR_LEN - 1)?;
        let mid = self.read_or_alloc_slot(top, j2, SlotKind::Indirection)?;
        self.read_or_alloc_slot(mid, k2, SlotKind::Data)
    }
}

#[cfg(test)]
mod tests {
    use crate::fs::Filesystem;
    use crate::word::{ids_per_sector, ADDR_LEN, SECTOR_SIZE};

    fn fresh_fs() -> (Filesystem, crate::word::InodeId) {
        let mut fs = Filesystem::format_memory(16, 400);
        let inode_id = fs.alloc_inode().unwrap();
        (fs, inode_id)
    }

    #[test]
    fn direct_sectors_round_trip() {
        let (mut fs, id) = fresh_fs();
        let a = fs.get_file_sector_for_write(id, 0).unwrap();
        let b = fs.get_file_sector_for_write(id, 1 * SECTOR_SIZE as u64).unwrap();
        assert_ne!(a, b);
        assert_eq!(fs.get_file_sector(id, 0), Some(a));
        assert_eq!(fs.get_file_sector(id, 1 * SECTOR_SIZE as u64), Some(b));
    }

    #[test]
    fn unwritten_sector_is_a_hole() {
        let (mut fs, id) = fresh_fs();
        fs.get_file_sector_for_write(id, 0).unwrap();
        assert_eq!(fs.get_file_sector(id, 3 * SECTOR_SIZE as u64), None);
    }

    #[test]
    fn crossing_direct_boundary_promotes_to_large() {
        let (mut fs, id) = fresh_fs();
        for idx in 0..ADDR_LEN as u64 + 2 {
            fs.get_file_sector_for_write(id, idx * SECTOR_SIZE as u64).unwrap();
        }
        let inode = fs.read_inode(id);
        assert!(inode.is_large());
        for idx in 0..ADDR_LEN as u64 + 2 {
            assert!(fs.get_file_sector(id, idx * SECTOR_SIZE as u64).is_some());
        }
    }

    #[test]
    fn extra_large_range_is_reachable() {
        let (mut fs, id) = fresh_fs();
        let ids = ids_per_sector() as u64;
        let extra_large_start = (ADDR_LEN as u64 - 1) * ids;
        let offset = extra_large_start * SECTOR_SIZE as u64;
        let sector = fs.get_file_sector_for_write(id, offset).unwrap();
        assert_eq!(fs.get_file_sector(id, offset), Some(sector));
        let inode = fs.read_inode(id);
        assert!(inode.is_large());
    }

    #[test]
    fn exhausting_the_disk_reports_no_space() {
        let mut fs = Filesystem::format_memory(4, 64);
        let id = fs.alloc_inode().unwrap();
        let mut last = Ok(0);
        for idx in 0..64u64 {
            last = fs.get_file_sector_for_write(id, idx * SECTOR_SIZE as u64);
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last, Err(crate::error::FsError::NoSpace));
    }
}
