//! Fixed-sector-size storage: a tagged variant over a memory-backed and a
//! file-backed disk image, in place of the reference implementation's
//! function-pointer vtable.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::fatal;
use crate::word::SectorId;

/// A block-addressable container of `sector_count` sectors of
/// `sector_size` bytes each.
pub enum Storage {
    Memory(MemoryStorage),
    File(FileStorage),
}

pub struct MemoryStorage {
    sector_size: usize,
    sector_count: u64,
    data: Vec<u8>,
}

pub struct FileStorage {
    sector_size: usize,
    sector_count: u64,
    file: File,
}

impl Storage {
    /// Allocates a heap-backed disk image of `sector_count` sectors.
    pub fn new_memory(sector_count: u64, sector_size: usize) -> Self {
        let len = (sector_count as usize)
            .checked_mul(sector_size)
            .unwrap_or_else(|| fatal("storage size overflow"));
        Storage::Memory(MemoryStorage {
            sector_size,
            sector_count,
            data: vec![0u8; len],
        })
    }

    /// Maps a host file as a disk image. The file is created and sized
    /// to `sector_count * sector_size` bytes if it does not already
    /// hold that much data.
    pub fn open_file(path: impl AsRef<Path>, sector_count: u64, sector_size: usize) -> Self {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .unwrap_or_else(|e| fatal(format_args!("failed to open disk image: {e}")));
        let len = sector_count * sector_size as u64;
        file.set_len(file.metadata().map(|m| m.len()).unwrap_or(0).max(len))
            .unwrap_or_else(|e| fatal(format_args!("failed to size disk image: {e}")));
        Storage::File(FileStorage {
            sector_size,
            sector_count,
            file,
        })
    }

    pub fn sector_size(&self) -> usize {
        match self {
            Storage::Memory(m) => m.sector_size,
            Storage::File(f) => f.sector_size,
        }
    }

    pub fn sector_count(&self) -> u64 {
        match self {
            Storage::Memory(m) => m.sector_count,
            Storage::File(f) => f.sector_count,
        }
    }

    fn check_lba(&self, lba: SectorId) {
        if lba as u64 >= self.sector_count() {
            fatal(format_args!(
                "invalid LBA for storage access: {lba} (sector_count={})",
                self.sector_count()
            ));
        }
    }

    /// Reads exactly `sector_size()` bytes from `lba` into `out`.
    pub fn read(&mut self, lba: SectorId, out: &mut [u8]) {
        self.check_lba(lba);
        let size = self.sector_size();
        assert_eq!(out.len(), size, "read buffer must be exactly one sector");
        match self {
            Storage::Memory(m) => {
                let off = lba as usize * size;
                out.copy_from_slice(&m.data[off..off + size]);
            }
            Storage::File(f) => {
                f.file
                    .seek(SeekFrom::Start(lba as u64 * size as u64))
                    .unwrap_or_else(|e| fatal(format_args!("seek failed: {e}")));
                f.file
                    .read_exact(out)
                    .unwrap_or_else(|e| fatal(format_args!("read failed: {e}")));
            }
        }
    }

    /// Writes exactly `sector_size()` bytes from `data` to `lba`.
    pub fn write(&mut self, lba: SectorId, data: &[u8]) {
        self.check_lba(lba);
        let size = self.sector_size();
        assert_eq!(data.len(), size, "write buffer must be exactly one sector");
        match self {
            Storage::Memory(m) => {
                let off = lba as usize * size;
                m.data[off..off + size].copy_from_slice(data);
            }
            Storage::File(f) => {
                f.file
                    .seek(SeekFrom::Start(lba as u64 * size as u64))
                    .unwrap_or_else(|e| fatal(format_args!("seek failed: {e}")));
                f.file
                    .write_all(data)
                    .unwrap_or_else(|e| fatal(format_args!("write failed: {e}")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::SECTOR_SIZE;

    #[test]
    fn round_trip_every_sector() {
        let mut storage = Storage::new_memory(2880, SECTOR_SIZE);
        let mut buf = vec![0u8; SECTOR_SIZE];
        for i in 0..2880u32 {
            buf.fill(i as u8);
            storage.write(i as SectorId, &buf);
        }
        for i in 0..2880u32 {
            let mut out = vec![0u8; SECTOR_SIZE];
            storage.read(i as SectorId, &mut out);
            assert!(out.iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    #[should_panic]
    fn out_of_range_lba_is_fatal() {
        let mut storage = Storage::new_memory(4, SECTOR_SIZE);
        let mut buf = vec![0u8; SECTOR_SIZE];
        storage.read(4, &mut buf);
    }
}
