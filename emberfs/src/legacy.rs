//! Legacy forwarding surface
//!
//! The old calling convention: integer file handles, integer status codes,
//! one process-wide default file system. Every function here performs a
//! single delegated call on that default engine and hands back its result
//! unchanged; no validation, transformation or side effect happens in this
//! layer.
//!
//! The default engine is installed exactly once with [`install`] and never
//! reassigned. New code should construct a [`FileSystem`] and pass it
//! around instead; this module exists for callers that cannot change.

use alloc::boxed::Box;
use spin::{Mutex, Once};

use crate::flash::FlashDevice;
use crate::fs::{FileSystem, OpenFlags, SeekWhence};
use crate::FsError;

/// Open for reading
pub const READ: u32 = OpenFlags::READ.bits();
/// Open for writing
pub const WRITE: u32 = OpenFlags::WRITE.bits();
/// Create the file if missing
pub const CREATE: u32 = OpenFlags::CREATE.bits();

/// Seek from the start of the file
pub const SEEK_SET: u8 = 0;
/// Seek relative to the current offset
pub const SEEK_CUR: u8 = 1;
/// Seek from the end of the file
pub const SEEK_END: u8 = 2;

/// Success
pub const OK: i32 = 0;
/// Invalid path, name or parameter
pub const ERR_INVALID: i32 = -1;
/// No such file or directory
pub const ERR_NOT_FOUND: i32 = -2;
/// The volume is full
pub const ERR_NO_SPACE: i32 = -3;
/// Not an open file handle
pub const ERR_BAD_DESCRIPTOR: i32 = -4;
/// Operation not permitted by the open flags
pub const ERR_ACCESS_DENIED: i32 = -5;
/// File is open, or the default engine is already installed
pub const ERR_IN_USE: i32 = -6;
/// Target already exists
pub const ERR_EXISTS: i32 = -7;
/// Path component is not a directory, or the target is one
pub const ERR_NOT_DIRECTORY: i32 = -8;
/// Directory still has entries
pub const ERR_DIR_NOT_EMPTY: i32 = -9;
/// Open file table is full
pub const ERR_TOO_MANY_OPEN: i32 = -10;
/// Seek target outside the file
pub const ERR_INVALID_OFFSET: i32 = -11;
/// No valid volume on the device
pub const ERR_CORRUPT: i32 = -12;
/// The flash device failed
pub const ERR_FLASH: i32 = -13;
/// No default engine installed yet
pub const ERR_NOT_READY: i32 = -14;

/// The status code a given engine error forwards as
pub fn error_code(err: &FsError) -> i32 {
    match err {
        FsError::InvalidPath | FsError::NameTooLong | FsError::BadGeometry => ERR_INVALID,
        FsError::NotFound => ERR_NOT_FOUND,
        FsError::NoSpace => ERR_NO_SPACE,
        FsError::BadDescriptor => ERR_BAD_DESCRIPTOR,
        FsError::AccessDenied => ERR_ACCESS_DENIED,
        FsError::InUse => ERR_IN_USE,
        FsError::AlreadyExists => ERR_EXISTS,
        FsError::NotADirectory | FsError::IsADirectory => ERR_NOT_DIRECTORY,
        FsError::DirectoryNotEmpty => ERR_DIR_NOT_EMPTY,
        FsError::TooManyOpenFiles => ERR_TOO_MANY_OPEN,
        FsError::InvalidOffset => ERR_INVALID_OFFSET,
        FsError::Corrupt => ERR_CORRUPT,
        FsError::Flash(_) => ERR_FLASH,
        FsError::NotReady => ERR_NOT_READY,
    }
}

/// The process-wide default engine, set once and never reassigned
static DEFAULT_FS: Once<Mutex<FileSystem<Box<dyn FlashDevice>>>> = Once::new();

/// Install the default engine on the given device.
///
/// Mounts the volume found there, or formats the device when it has none.
/// Returns `ERR_IN_USE` when a default engine already exists; the existing
/// one is left untouched.
pub fn install(device: Box<dyn FlashDevice>) -> i32 {
    if DEFAULT_FS.is_completed() {
        return ERR_IN_USE;
    }
    match DEFAULT_FS.try_call_once(|| FileSystem::mount_or_format(device).map(Mutex::new)) {
        Ok(_) => OK,
        Err(e) => error_code(&e),
    }
}

/// Whether a default engine has been installed
pub fn installed() -> bool {
    DEFAULT_FS.is_completed()
}

fn with_fs<F>(f: F) -> i32
where
    F: FnOnce(&mut FileSystem<Box<dyn FlashDevice>>) -> i32,
{
    match DEFAULT_FS.get() {
        Some(fs) => f(&mut *fs.lock()),
        None => ERR_NOT_READY,
    }
}

fn fd_index(fd: i32) -> Result<usize, i32> {
    usize::try_from(fd).map_err(|_| ERR_BAD_DESCRIPTOR)
}

/// Open a file; returns a handle (>= 0) or a negative status code
pub fn open(filename: &str, flags: u32) -> i32 {
    with_fs(|fs| {
        match fs.open(filename, OpenFlags::from_bits_truncate(flags)) {
            Ok(fd) => fd as i32,
            Err(e) => error_code(&e),
        }
    })
}

/// Write pending state for the handle back to flash, leaving it open
pub fn flush(fd: i32) -> i32 {
    let fd = match fd_index(fd) {
        Ok(fd) => fd,
        Err(code) => return code,
    };
    with_fs(|fs| match fs.flush(fd) {
        Ok(()) => OK,
        Err(e) => error_code(&e),
    })
}

/// Close the handle, releasing it for future `open` calls
pub fn close(fd: i32) -> i32 {
    let fd = match fd_index(fd) {
        Ok(fd) => fd,
        Err(code) => return code,
    };
    with_fs(|fs| match fs.close(fd) {
        Ok(()) => OK,
        Err(e) => error_code(&e),
    })
}

/// Move the handle's offset; returns the new offset or a negative code
pub fn seek(fd: i32, offset: i32, whence: u8) -> i32 {
    let fd = match fd_index(fd) {
        Ok(fd) => fd,
        Err(code) => return code,
    };
    let whence = match whence {
        SEEK_SET => SeekWhence::Start,
        SEEK_CUR => SeekWhence::Current,
        SEEK_END => SeekWhence::End,
        _ => return ERR_INVALID,
    };
    with_fs(|fs| match fs.seek(fd, offset, whence) {
        Ok(pos) => pos as i32,
        Err(e) => error_code(&e),
    })
}

/// Read into `buf` from the handle's offset; returns the bytes read
pub fn read(fd: i32, buf: &mut [u8]) -> i32 {
    let fd = match fd_index(fd) {
        Ok(fd) => fd,
        Err(code) => return code,
    };
    with_fs(|fs| match fs.read(fd, buf) {
        Ok(n) => n as i32,
        Err(e) => error_code(&e),
    })
}

/// Write `buf` at the handle's offset; returns the bytes written
pub fn write(fd: i32, buf: &[u8]) -> i32 {
    let fd = match fd_index(fd) {
        Ok(fd) => fd,
        Err(code) => return code,
    };
    with_fs(|fs| match fs.write(fd, buf) {
        Ok(n) => n as i32,
        Err(e) => error_code(&e),
    })
}

/// Remove a file or empty directory
pub fn remove(filename: &str) -> i32 {
    with_fs(|fs| match fs.remove(filename) {
        Ok(()) => OK,
        Err(e) => error_code(&e),
    })
}

/// Create a directory at the given path
pub fn create_directory(path: &str) -> i32 {
    with_fs(|fs| match fs.create_directory(path) {
        Ok(()) => OK,
        Err(e) => error_code(&e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;

    // The default engine is process-wide, so the whole lifecycle runs in
    // one test to keep ordering deterministic.
    #[test]
    fn test_legacy_surface() {
        // Nothing installed yet
        assert_eq!(open("a", READ), ERR_NOT_READY);
        assert_eq!(remove("a"), ERR_NOT_READY);
        assert!(!installed());

        assert_eq!(install(Box::new(RamFlash::new(64, 1024))), OK);
        assert!(installed());
        assert_eq!(install(Box::new(RamFlash::new(64, 1024))), ERR_IN_USE);

        // Create, write, reposition, read back
        let fd = open("banner.txt", READ | WRITE | CREATE);
        assert!(fd >= 0);
        assert_eq!(write(fd, b"ember file system"), 17);
        assert_eq!(seek(fd, 0, SEEK_SET), 0);
        let mut buf = [0u8; 5];
        assert_eq!(read(fd, &mut buf), 5);
        assert_eq!(&buf, b"ember");
        assert_eq!(seek(fd, -6, SEEK_END), 11);
        let mut buf = [0u8; 16];
        assert_eq!(read(fd, &mut buf), 6);
        assert_eq!(&buf[..6], b"system");

        // Pass-through of engine errors, unchanged
        assert_eq!(seek(fd, 99, SEEK_CUR), ERR_INVALID_OFFSET);
        assert_eq!(seek(fd, 0, 9), ERR_INVALID);
        assert_eq!(open("banner.txt", READ), ERR_IN_USE);
        assert_eq!(remove("banner.txt"), ERR_IN_USE);
        assert_eq!(flush(fd), OK);
        assert_eq!(close(fd), OK);
        assert_eq!(close(fd), ERR_BAD_DESCRIPTOR);
        assert_eq!(read(-1, &mut buf), ERR_BAD_DESCRIPTOR);

        // Directories through the legacy surface
        assert_eq!(create_directory("data"), OK);
        assert_eq!(create_directory("data"), ERR_EXISTS);
        let fd = open("data/s.bin", WRITE | CREATE);
        assert!(fd >= 0);
        assert_eq!(close(fd), OK);
        assert_eq!(remove("data"), ERR_DIR_NOT_EMPTY);
        assert_eq!(remove("data/s.bin"), OK);
        assert_eq!(remove("data"), OK);

        assert_eq!(open("missing", READ), ERR_NOT_FOUND);
        assert_eq!(remove("banner.txt"), OK);
    }

    #[test]
    fn test_error_codes_are_negative_and_distinct() {
        let codes = [
            ERR_INVALID,
            ERR_NOT_FOUND,
            ERR_NO_SPACE,
            ERR_BAD_DESCRIPTOR,
            ERR_ACCESS_DENIED,
            ERR_IN_USE,
            ERR_EXISTS,
            ERR_NOT_DIRECTORY,
            ERR_DIR_NOT_EMPTY,
            ERR_TOO_MANY_OPEN,
            ERR_INVALID_OFFSET,
            ERR_CORRUPT,
            ERR_FLASH,
            ERR_NOT_READY,
        ];
        for (i, &a) in codes.iter().enumerate() {
            assert!(a < 0);
            for &b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(error_code(&FsError::NotFound), ERR_NOT_FOUND);
        assert_eq!(error_code(&FsError::IsADirectory), ERR_NOT_DIRECTORY);
    }
}
