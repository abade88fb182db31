//! Directory entries: a packed `(inode, name)` pair repeated across a
//! directory's data sectors, and the name-validation rules applied
//! before a slot is bound to a name.

use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::error::{FsError, FsResult};
use crate::fs::Filesystem;
use crate::word::{InodeId, LeId, NAME_LEN, SECTOR_SIZE};

/// On-disk directory entry: an inode id plus a fixed-width, nul-padded
/// name. `inode == INVALID_INODE` marks a free slot.
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct DirEntry {
    inode: LeId,
    name: [u8; NAME_LEN],
}

pub const DIR_ENTRY_SIZE: usize = core::mem::size_of::<DirEntry>();

impl DirEntry {
    fn free() -> Self {
        DirEntry {
            inode: LeId::new(crate::word::INVALID_INODE),
            name: [0; NAME_LEN],
        }
    }

    pub fn inode(&self) -> InodeId {
        self.inode.get()
    }

    pub fn is_free(&self) -> bool {
        self.inode() == crate::word::INVALID_INODE
    }

    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &self.name[..len]
    }
}

/// A directory entry's location: which sector of the directory's file
/// and which slot within that sector.
#[derive(Clone, Copy)]
pub struct DirSlot {
    pub inode_id: InodeId,
    pub sector_index: u64,
    pub slot: usize,
}

fn read_entry(bytes: &[u8], slot: usize) -> DirEntry {
    *LayoutVerified::<&[u8], DirEntry>::new(&bytes[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE])
        .unwrap_or_else(|| crate::error::fatal("directory entry slot is misaligned"))
}

fn write_entry(bytes: &mut [u8], slot: usize, entry: &DirEntry) {
    bytes[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE].copy_from_slice(entry.as_bytes());
}

/// Is `c` one of the characters permitted in a directory entry name?
fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'.' | b'-' | b'_' | b' ')
}

impl Filesystem {
    /// Finds (or creates) a free directory slot for a new entry and
    /// returns its location with the inode field left `INVALID` --
    /// callers bind a name to it with [`Filesystem::set_dir_name`] and
    /// then write the real inode id once it is known.
    ///
    /// Scans existing sectors from the last one backwards; if none has
    /// a free slot, extends the directory by one sector, initializing
    /// every entry in it to free.
    pub fn add_dir_entry(&mut self, dir_inode_id: InodeId) -> FsResult<DirSlot> {
        let dir_per_sector = self.ctx.dir_per_sector;
        let size = self.read_inode(dir_inode_id).size();
        let sector_count = size / SECTOR_SIZE as u64;

        if sector_count > 0 {
            for sector_index in (0..sector_count).rev() {
                let lba = self
                    .get_file_sector(dir_inode_id, sector_index * SECTOR_SIZE as u64)
                    .unwrap_or_else(|| crate::error::fatal("directory sector vanished mid-scan"));
                let h = self.cache.read_lba_for_write(&mut self.storage, lba);
                let free_slot = self.cache.with(h, |bytes| {
                    (0..dir_per_sector).find(|&slot| read_entry(bytes, slot).is_free())
                });
                if let Some(slot) = free_slot {
                    return Ok(DirSlot {
                        inode_id: dir_inode_id,
                        sector_index,
                        slot,
                    });
                }
            }
        }

        let new_index = sector_count;
        let lba = self.get_file_sector_for_write(dir_inode_id, new_index * SECTOR_SIZE as u64)?;
        let h = self.cache.write_lba(&mut self.storage, lba);
        self.cache.with_mut(h, |bytes| {
            for slot in 0..dir_per_sector {
                write_entry(bytes, slot, &DirEntry::free());
            }
        });
        self.write_inode(dir_inode_id, |ino| {
            ino.set_size((new_index + 1) * SECTOR_SIZE as u64);
        });

        Ok(DirSlot {
            inode_id: dir_inode_id,
            sector_index: new_index,
            slot: 0,
        })
    }

    /// Binds `name` to `slot`'s entry. `allow_all_dot` permits the
    /// reserved `.`/`..` names; everywhere else they are rejected, as
    /// is a name that is entirely spaces or contains a character
    /// outside `[A-Za-z0-9.-_ ]`.
    pub fn set_dir_name(&mut self, slot: DirSlot, name: &str, allow_all_dot: bool) -> FsResult<()> {
        let bytes = name.as_bytes();
        if bytes.len() > NAME_LEN {
            return Err(FsError::NameTooLong);
        }
        if bytes.iter().any(|&c| !is_name_char(c)) {
            return Err(FsError::IllegalChar);
        }
        let all_dots = !bytes.is_empty() && bytes.iter().all(|&c| c == b'.');
        if all_dots && !allow_all_dot {
            return Err(FsError::IllegalName);
        }
        if bytes.iter().all(|&c| c == b' ') {
            return Err(FsError::IllegalName);
        }

        let lba = self
            .get_file_sector(slot.inode_id, slot.sector_index * SECTOR_SIZE as u64)
            .unwrap_or_else(|| crate::error::fatal("set_dir_name: directory sector vanished"));
        let h = self.cache.read_lba_for_write(&mut self.storage, lba);
        self.cache.with_mut(h, |sector_bytes| {
            let mut entry = read_entry(sector_bytes, slot.slot);
            entry.name = [0; NAME_LEN];
            entry.name[..bytes.len()].copy_from_slice(bytes);
            write_entry(sector_bytes, slot.slot, &entry);
        });
        Ok(())
    }

    /// Writes the inode id into a slot previously returned by
    /// [`Filesystem::add_dir_entry`].
    pub fn set_dir_inode(&mut self, slot: DirSlot, inode_id: InodeId) {
        let lba = self
            .get_file_sector(slot.inode_id, slot.sector_index * SECTOR_SIZE as u64)
            .unwrap_or_else(|| crate::error::fatal("set_dir_inode: directory sector vanished"));
        let h = self.cache.read_lba_for_write(&mut self.storage, lba);
        self.cache.with_mut(h, |sector_bytes| {
            let mut entry = read_entry(sector_bytes, slot.slot);
            entry.inode = LeId::new(inode_id);
            write_entry(sector_bytes, slot.slot, &entry);
        });
    }

    /// Iterates every non-free entry of a directory, in on-disk order.
    pub fn dir_entries(&mut self, dir_inode_id: InodeId) -> Vec<(InodeId, Vec<u8>)> {
        let dir_per_sector = self.ctx.dir_per_sector;
        let size = self.read_inode(dir_inode_id).size();
        let sector_count = size / SECTOR_SIZE as u64;
        let mut out = Vec::new();
        for sector_index in 0..sector_count {
            let Some(lba) = self.get_file_sector(dir_inode_id, sector_index * SECTOR_SIZE as u64) else {
                continue;
            };
            let h = self.cache.read_lba(&mut self.storage, lba);
            let entries: Vec<DirEntry> = self.cache.with(h, |bytes| {
                (0..dir_per_sector).map(|slot| read_entry(bytes, slot)).collect()
            });
            for entry in entries {
                if !entry.is_free() {
                    out.push((entry.inode(), entry.name_bytes().to_vec()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use crate::error::FsError;
    use crate::fs::{Filesystem, ROOT_INODE};

    #[test]
    fn a_plain_name_is_accepted() {
        let mut fs = Filesystem::format_memory(4, 512);
        let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
        assert!(fs.set_dir_name(slot, "file1", false).is_ok());
        fs.set_dir_inode(slot, ROOT_INODE);
        assert!(fs
            .dir_entries(ROOT_INODE)
            .iter()
            .any(|(_, n)| n.as_slice() == b"file1"));
    }

    #[test]
    fn all_dots_is_illegal_unless_allowed() {
        let mut fs = Filesystem::format_memory(4, 512);
        let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
        assert_eq!(fs.set_dir_name(slot, "...", false), Err(FsError::IllegalName));
        assert!(fs.set_dir_name(slot, "...", true).is_ok());
    }

    #[test]
    fn all_spaces_is_always_illegal() {
        let mut fs = Filesystem::format_memory(4, 512);
        let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
        assert_eq!(fs.set_dir_name(slot, "   ", true), Err(FsError::IllegalName));
    }

    #[test]
    fn a_path_separator_is_an_illegal_character() {
        let mut fs = Filesystem::format_memory(4, 512);
        let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
        assert_eq!(fs.set_dir_name(slot, "a/b", false), Err(FsError::IllegalChar));
    }

    #[test]
    fn a_name_longer_than_n_is_rejected() {
        let mut fs = Filesystem::format_memory(4, 512);
        let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
        let too_long = "a".repeat(crate::word::NAME_LEN + 2);
        assert_eq!(fs.set_dir_name(slot, &too_long, false), Err(FsError::NameTooLong));
    }

    #[test]
    fn a_fresh_slot_starts_with_an_invalid_inode() {
        let mut fs = Filesystem::format_memory(4, 512);
        let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
        let lba = fs
            .get_file_sector(slot.inode_id, slot.sector_index * crate::word::SECTOR_SIZE as u64)
            .unwrap();
        let h = fs.cache.read_lba(&mut fs.storage, lba);
        let entry = fs.cache.with(h, |bytes| super::read_entry(bytes, slot.slot));
        assert!(entry.is_free());
    }

    #[test]
    fn exhausting_a_tiny_directory_extends_by_a_sector() {
        let mut fs = Filesystem::format_memory(4, 512);
        let size_before = fs.read_inode(ROOT_INODE).size();
        let per_sector = fs.dir_entries(ROOT_INODE).len();
        let free_slots = (crate::word::SECTOR_SIZE / super::DIR_ENTRY_SIZE) - per_sector;
        for i in 0..free_slots {
            let slot = fs.add_dir_entry(ROOT_INODE).unwrap();
            fs.set_dir_name(slot, &format!("f{i}"), false).unwrap();
            fs.set_dir_inode(slot, ROOT_INODE);
        }
        assert_eq!(fs.read_inode(ROOT_INODE).size(), size_before);

        let overflow = fs.add_dir_entry(ROOT_INODE).unwrap();
        assert_eq!(
            fs.read_inode(ROOT_INODE).size(),
            size_before + crate::word::SECTOR_SIZE as u64
        );
        fs.set_dir_name(overflow, "overflow", false).unwrap();
    }
}
