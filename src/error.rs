//! Error handling: returned codes for recoverable, user-facing failures,
//! and `fatal!`-style panics for broken invariants.
//!
//! The reference implementation's `fatal_error()` prints and calls
//! `exit(1)`; here an invariant violation is a programming error, so we
//! panic instead (§7 class 2). Resource exhaustion and name-validation
//! failures (§7 class 1) are returned as [`FsError`].

use std::fmt;

/// Recoverable, user-facing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// `alloc_sector` found no free sector.
    NoSpace,
    /// `alloc_inode` found no free inode.
    NoInode,
    /// A directory-entry name exceeds [`crate::word::NAME_LEN`].
    NameTooLong,
    /// A directory-entry name contains a character outside
    /// `[A-Za-z0-9] . - _ ` or space.
    IllegalChar,
    /// A directory-entry name is all dots or all spaces.
    IllegalName,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NoSpace => "no free sector",
            FsError::NoInode => "no free inode",
            FsError::NameTooLong => "directory entry name too long",
            FsError::IllegalChar => "directory entry name has an illegal character",
            FsError::IllegalName => "directory entry name is illegal",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FsError {}

pub type FsResult<T> = Result<T, FsError>;

/// Aborts the process after reporting a broken invariant.
///
/// Mirrors the reference implementation's `fatal_error()`: there is no
/// recovery path for these conditions, only a loud failure.
#[track_caller]
pub fn fatal(msg: impl fmt::Display) -> ! {
    panic!("ofs: fatal: {msg}");
}
