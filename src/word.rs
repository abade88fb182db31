//! On-disk word width (W).
//!
//! The reference implementation picks the width of sector ids, inode ids
//! and directory-entry names at compile time via `WORD_SIZE`. We mirror
//! that with the `word32` feature: default is the 16-bit layout (W=2,
//! 512-byte sectors), `--features word32` selects the 32-bit layout
//! (W=4, 4096-byte sectors).

use zerocopy::byteorder::LittleEndian;
use zerocopy::{AsBytes, FromBytes, Unaligned};

cfg_if::cfg_if! {
    if #[cfg(feature = "word32")] {
        /// Raw host-endian representation of a sector or inode id.
        pub type RawId = u32;
        /// Little-endian on-disk representation of a sector or inode id.
        pub type LeId = zerocopy::byteorder::U32<LittleEndian>;
        /// Raw host-endian representation of a "halfword" field.
        pub type RawHalfId = u16;
        type LeHalfIdInner = zerocopy::byteorder::U16<LittleEndian>;
        /// Bytes per sector.
        pub const SECTOR_SIZE: usize = 4096;
        /// Bytes available for a directory-entry name.
        pub const NAME_LEN: usize = 28;
    } else {
        /// Raw host-endian representation of a sector or inode id.
        pub type RawId = u16;
        /// Little-endian on-disk representation of a sector or inode id.
        pub type LeId = zerocopy::byteorder::U16<LittleEndian>;
        /// Raw host-endian representation of a "halfword" field.
        pub type RawHalfId = u8;
        type LeHalfIdInner = u8;
        /// Bytes per sector.
        pub const SECTOR_SIZE: usize = 512;
        /// Bytes available for a directory-entry name.
        pub const NAME_LEN: usize = 14;
    }
}

/// Little-endian on-disk representation of a "halfword" inode field
/// (`nlinks`, `uid`, `gid`, `size0`): half the width of [`LeId`], matching
/// the reference implementation's `halfword_t` -- `uint8_t` under W=2,
/// `uint16_t` under W=4.
#[derive(Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct LeHalfId(LeHalfIdInner);

impl LeHalfId {
    pub fn new(v: RawHalfId) -> Self {
        cfg_if::cfg_if! {
            if #[cfg(feature = "word32")] {
                LeHalfId(zerocopy::byteorder::U16::new(v))
            } else {
                LeHalfId(v)
            }
        }
    }

    pub fn get(self) -> RawHalfId {
        cfg_if::cfg_if! {
            if #[cfg(feature = "word32")] {
                self.0.get()
            } else {
                self.0
            }
        }
    }
}

/// Disk sector address (LBA).
pub type SectorId = RawId;

/// Dense zero-based inode identifier.
pub type InodeId = RawId;

/// Sector 0 is the boot sector and is never handed out as a data sector,
/// so it doubles as the "no sector" sentinel.
pub const INVALID_SECTOR: SectorId = 0;

/// All-ones sentinel: "no inode".
pub const INVALID_INODE: InodeId = RawId::MAX;

/// K: number of cached free-sector ids a superblock carries directly.
pub const FREE_ARRAY_CAP: usize = 100;

/// A: number of address slots in an inode.
pub const ADDR_LEN: usize = 8;

/// Number of sector ids that fit in one indirection sector.
pub const fn ids_per_sector() -> usize {
    SECTOR_SIZE / core::mem::size_of::<LeId>()
}

/// Size of the buffer-cache pool.
pub const MAX_BUFFERS: usize = 16;

/// Fixed sector holding the superblock.
pub const FS_SB_SECTOR: SectorId = 1;

/// On-disk magic, matches the reference implementation's signature.
pub const FS_MAGIC: [u8; 4] = *b"WZQ\0";
