//! A simulated UNIX System V "Old File System": block storage, a
//! write-back buffer cache with LRU eviction and pinning, and the
//! metadata layer (superblock, free-sector pool, inodes, block map and
//! directories) built on top of it.
//!
//! The word size `W` (2 or 4 bytes) that sizes on-disk ids is chosen at
//! compile time; see [`word`]. Enable the `word32` feature for W=4.

pub mod block_map;
pub mod buffer;
pub mod context;
pub mod dir;
pub mod error;
pub mod fs;
pub mod inode;
pub mod path;
pub mod storage;
pub mod super_block;
pub mod word;

pub use error::{FsError, FsResult};
pub use fs::{Filesystem, ROOT_INODE};
