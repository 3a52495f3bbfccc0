//! EmberFS, an embedded flash file system
//!
//! Features:
//! - block-chain allocation with a single on-flash table
//! - page cache with erase-aware write-back
//! - next-fit allocation and deleted-page recycling to spread wear
//! - sizes recovered from the chain after power loss mid-write
//! - nested directories and a listing API
//! - a legacy integer call surface over one process-wide default engine
//!
//! The engine itself is an explicit handle: construct a [`FileSystem`] over
//! anything implementing [`FlashDevice`] and pass it where it is needed.
//! The [`legacy`] module preserves the old convention (integer handles and
//! status codes, a global default instance) for callers that depend on it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod cache;
mod dir;
mod file;
mod fs;
mod table;

pub mod flash;
pub mod legacy;

pub use cache::CacheStats;
pub use dir::MAX_NAME_LEN;
pub use file::File;
pub use flash::{FlashDevice, FlashError, Geometry, RamFlash};
pub use fs::{
    EntryInfo, Fd, FileSystem, FsStats, OpenFlags, SeekWhence, MAX_OPEN_FILES,
};

/// File system error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No engine available to serve the call
    NotReady,
    /// Empty path, empty component or non-printable name
    InvalidPath,
    /// Name longer than a directory entry can hold
    NameTooLong,
    /// No such file or directory
    NotFound,
    /// Target already exists
    AlreadyExists,
    /// A path component is not a directory
    NotADirectory,
    /// The target is a directory
    IsADirectory,
    /// Directory still has entries
    DirectoryNotEmpty,
    /// No free or reclaimable blocks left
    NoSpace,
    /// Not an open file handle
    BadDescriptor,
    /// Operation not permitted by the open flags
    AccessDenied,
    /// Seek target outside the file
    InvalidOffset,
    /// The file is already open, or the resource is busy
    InUse,
    /// Open file table is full
    TooManyOpenFiles,
    /// No valid volume on the device
    Corrupt,
    /// Device shape the engine cannot use
    BadGeometry,
    /// Flash layer failure
    Flash(FlashError),
}

impl From<FlashError> for FsError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotReady => write!(f, "no file system installed"),
            Self::InvalidPath => write!(f, "invalid path"),
            Self::NameTooLong => write!(f, "name too long"),
            Self::NotFound => write!(f, "not found"),
            Self::AlreadyExists => write!(f, "already exists"),
            Self::NotADirectory => write!(f, "not a directory"),
            Self::IsADirectory => write!(f, "is a directory"),
            Self::DirectoryNotEmpty => write!(f, "directory not empty"),
            Self::NoSpace => write!(f, "no space left on volume"),
            Self::BadDescriptor => write!(f, "bad file handle"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::InvalidOffset => write!(f, "offset outside file"),
            Self::InUse => write!(f, "in use"),
            Self::TooManyOpenFiles => write!(f, "too many open files"),
            Self::Corrupt => write!(f, "no valid file system"),
            Self::BadGeometry => write!(f, "unusable device geometry"),
            Self::Flash(e) => write!(f, "flash error: {}", e),
        }
    }
}
