//! Typed file handles
//!
//! `File` wraps an open descriptor together with the engine borrow it needs,
//! closes itself on drop and plugs the file system into the `embedded-io`
//! traits so generic drivers and formatters can write straight to a file.

use embedded_io::{ErrorKind, ErrorType, Read, Seek, SeekFrom, Write};

use crate::flash::FlashDevice;
use crate::fs::{Fd, FileSystem, OpenFlags, SeekWhence};
use crate::FsError;

/// An open file borrowing the engine that owns it
pub struct File<'a, D: FlashDevice> {
    fs: &'a mut FileSystem<D>,
    fd: Fd,
}

impl<D: FlashDevice> FileSystem<D> {
    /// `open`, wrapped in a handle that closes itself
    pub fn open_file(&mut self, path: &str, flags: OpenFlags) -> Result<File<'_, D>, FsError> {
        let fd = self.open(path, flags)?;
        Ok(File { fs: self, fd })
    }
}

impl<'a, D: FlashDevice> File<'a, D> {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        self.fs.read(self.fd, buf)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, FsError> {
        self.fs.write(self.fd, data)
    }

    /// Write the whole buffer or fail
    pub fn write_all(&mut self, mut data: &[u8]) -> Result<(), FsError> {
        while !data.is_empty() {
            let n = self.fs.write(self.fd, data)?;
            if n == 0 {
                return Err(FsError::NoSpace);
            }
            data = &data[n..];
        }
        Ok(())
    }

    pub fn seek(&mut self, offset: i32, whence: SeekWhence) -> Result<u32, FsError> {
        self.fs.seek(self.fd, offset, whence)
    }

    pub fn position(&self) -> u32 {
        self.fs.position(self.fd).unwrap_or(0)
    }

    pub fn len(&self) -> u32 {
        self.fs.file_length(self.fd).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commit size and data to flash, keeping the file open
    pub fn sync(&mut self) -> Result<(), FsError> {
        self.fs.flush(self.fd)
    }

    /// Close explicitly to observe the result; dropping closes too
    pub fn close(mut self) -> Result<(), FsError> {
        let result = self.fs.close(self.fd);
        core::mem::forget(self);
        result
    }
}

impl<'a, D: FlashDevice> Drop for File<'a, D> {
    fn drop(&mut self) {
        let _ = self.fs.close(self.fd);
    }
}

impl embedded_io::Error for FsError {
    fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound => ErrorKind::NotFound,
            FsError::AccessDenied | FsError::InUse => ErrorKind::PermissionDenied,
            FsError::AlreadyExists => ErrorKind::AlreadyExists,
            FsError::NoSpace => ErrorKind::OutOfMemory,
            FsError::InvalidPath
            | FsError::NameTooLong
            | FsError::InvalidOffset
            | FsError::BadDescriptor
            | FsError::BadGeometry => ErrorKind::InvalidInput,
            FsError::Corrupt => ErrorKind::InvalidData,
            _ => ErrorKind::Other,
        }
    }
}

impl<'a, D: FlashDevice> ErrorType for File<'a, D> {
    type Error = FsError;
}

impl<'a, D: FlashDevice> Read for File<'a, D> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.fs.read(self.fd, buf)
    }
}

impl<'a, D: FlashDevice> Write for File<'a, D> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.fs.write(self.fd, buf)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.fs.flush(self.fd)
    }
}

impl<'a, D: FlashDevice> Seek for File<'a, D> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, Self::Error> {
        let (offset, whence) = match pos {
            SeekFrom::Start(n) => (
                i32::try_from(n).map_err(|_| FsError::InvalidOffset)?,
                SeekWhence::Start,
            ),
            SeekFrom::Current(n) => (
                i32::try_from(n).map_err(|_| FsError::InvalidOffset)?,
                SeekWhence::Current,
            ),
            SeekFrom::End(n) => (
                i32::try_from(n).map_err(|_| FsError::InvalidOffset)?,
                SeekWhence::End,
            ),
        };
        self.fs.seek(self.fd, offset, whence).map(u64::from)
    }
}
