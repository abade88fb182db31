//! Top-level filesystem handle: owns the storage, the buffer cache and
//! the mount-time geometry, and ties the superblock, inode and
//! directory subsystems together through `format`/`mount`.

use std::io;
use std::path::Path;

use crate::buffer::BufferCache;
use crate::context::Context;
use crate::inode::FileType;
use crate::storage::Storage;
use crate::super_block::Superblock;
use crate::word::{InodeId, SECTOR_SIZE};
use crate::word::FS_SB_SECTOR;

/// The root directory is always inode 0, matching the reference
/// implementation's bootstrap convention.
pub const ROOT_INODE: InodeId = 0;

pub struct Filesystem {
    pub(crate) storage: Storage,
    pub(crate) cache: BufferCache,
    pub(crate) ctx: Context,
}

impl Filesystem {
    /// Builds a fresh, heap-backed filesystem image: `total_sectors`
    /// sectors total, of which `isize_sectors` are given to the inode
    /// region. The remainder (minus the superblock sector) becomes the
    /// free-sector pool. Initializes the root directory at inode 0.
    pub fn format_memory(isize_sectors: u32, total_sectors: u64) -> Self {
        let storage = Storage::new_memory(total_sectors, SECTOR_SIZE);
        Self::format(storage, isize_sectors)
    }

    /// Like [`Self::format_memory`] but backed by a host file.
    pub fn format_file(path: impl AsRef<Path>, isize_sectors: u32, total_sectors: u64) -> Self {
        let storage = Storage::open_file(path, total_sectors, SECTOR_SIZE);
        Self::format(storage, isize_sectors)
    }

    fn format(storage: Storage, isize_sectors: u32) -> Self {
        use crate::word::SectorId;

        let total_sectors = storage.sector_count() as SectorId;
        let inode_region_start: SectorId = FS_SB_SECTOR + 1;
        let free_region_start: SectorId = inode_region_start + isize_sectors as SectorId;
        assert!(
            free_region_start < total_sectors,
            "disk too small to hold the requested inode region"
        );
        let fsize_sectors = total_sectors as u32 - free_region_start as u32;

        let cache = BufferCache::new(SECTOR_SIZE);
        let ctx = Context::derive(FS_SB_SECTOR, isize_sectors, fsize_sectors);
        let mut fs = Filesystem { storage, cache, ctx };

        fs.write_superblock_raw(&Superblock::new(isize_sectors, fsize_sectors));

        for sector in inode_region_start..free_region_start {
            let h = fs.cache.write_lba(&mut fs.storage, sector);
            fs.cache.with_mut(h, |bytes| bytes.fill(0));
        }
        fs.cache.flush_all(&mut fs.storage);

        // Ascending order keeps the first K-1 sectors in the
        // superblock's cache and chains the rest, so early allocations
        // hand out low sector numbers first.
        for sector in free_region_start..total_sectors {
            fs.free_sector(sector);
        }

        fs.init_root_directory();
        fs.cache.flush_all(&mut fs.storage);
        fs
    }

    /// Mounts an existing heap-backed image (as produced by, e.g., a
    /// prior [`Self::format_memory`] whose buffers were flushed out).
    pub fn mount_memory(total_sectors: u64) -> Self {
        Self::mount(Storage::new_memory(total_sectors, SECTOR_SIZE))
    }

    /// Mounts an existing disk image file of `total_sectors` sectors.
    pub fn mount_file(path: impl AsRef<Path>, total_sectors: u64) -> io::Result<Self> {
        Ok(Self::mount(Storage::open_file(path, total_sectors, SECTOR_SIZE)))
    }

    fn mount(storage: Storage) -> Self {
        let cache = BufferCache::new(SECTOR_SIZE);
        let placeholder_ctx = Context::derive(FS_SB_SECTOR, 0, 0);
        let mut fs = Filesystem {
            storage,
            cache,
            ctx: placeholder_ctx,
        };
        let sb = fs.read_superblock();
        sb.check_magic();
        fs.ctx = Context::derive(FS_SB_SECTOR, sb.isize_sectors(), sb.fsize_sectors());
        fs
    }

    /// Flushes every dirty buffer to storage, asserting (via
    /// [`BufferCache::flush_all`]) that nothing is left pinned.
    pub fn sync(&mut self) {
        self.cache.flush_all(&mut self.storage);
    }

    /// The `[start, end)` sector range of the free-data region, for
    /// callers that want to check an allocated sector's provenance.
    pub fn free_sector_range(&self) -> (crate::word::SectorId, crate::word::SectorId) {
        (self.ctx.free_region_start, self.ctx.free_region_end)
    }

    /// Total number of inode slots carved out at format time.
    pub fn total_inodes(&self) -> u32 {
        self.ctx.total_inodes
    }

    fn init_root_directory(&mut self) {
        self.write_inode(ROOT_INODE, |ino| {
            ino.set_in_use(true);
            ino.set_type(FileType::Dir);
            ino.set_permissions(0o755);
            ino.set_nlinks(2);
        });

        let dot = self
            .add_dir_entry(ROOT_INODE)
            .expect("a freshly formatted root directory always has room for two entries");
        self.set_dir_name(dot, ".", true)
            .expect("\".\" passes the reserved-name check");
        self.set_dir_inode(dot, ROOT_INODE);

        let dotdot = self
            .add_dir_entry(ROOT_INODE)
            .expect("a freshly formatted root directory always has room for two entries");
        self.set_dir_name(dotdot, "..", true)
            .expect("\"..\" passes the reserved-name check");
        self.set_dir_inode(dotdot, ROOT_INODE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_initializes_root_with_dot_entries() {
        let mut fs = Filesystem::format_memory(4, 512);
        let inode = fs.read_inode(ROOT_INODE);
        assert!(inode.in_use());
        assert_eq!(inode.file_type(), FileType::Dir);

        let entries = fs.dir_entries(ROOT_INODE);
        assert_eq!(entries.len(), 2);
        let names: Vec<&[u8]> = entries.iter().map(|(_, n)| n.as_slice()).collect();
        assert!(names.contains(&b".".as_slice()));
        assert!(names.contains(&b"..".as_slice()));
        for (id, _) in &entries {
            assert_eq!(*id, ROOT_INODE);
        }
    }

    #[test]
    fn allocated_inodes_never_reuse_root() {
        let mut fs = Filesystem::format_memory(4, 512);
        for _ in 0..10 {
            let id = fs.alloc_inode().expect("plenty of inodes available");
            assert_ne!(id, ROOT_INODE);
        }
    }

    #[test]
    fn alloc_sector_never_returns_a_sector_outside_the_free_region() {
        let mut fs = Filesystem::format_memory(4, 512);
        let free_start = fs.ctx.free_region_start;
        let free_end = fs.ctx.free_region_end;
        let mut seen = std::collections::HashSet::new();
        while let Ok(s) = fs.alloc_sector() {
            assert!(s >= free_start && s < free_end);
            assert!(seen.insert(s), "allocator returned the same sector twice");
        }
    }
}
