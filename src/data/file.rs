use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::unistd::{self, Whence};

use super::DataSource;
use crate::sys;

/// Data backed by an owned file. Supports the full interface; the file is
/// closed on release.
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub fn new(file: File) -> FileSource {
        FileSource {file}
    }
}

impl DataSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

/// Data backed by a borrowed kernel fd. The caller keeps the fd open for the
/// whole lifetime of the object. Seeking works iff the fd is seekable.
pub struct FdSource {
    fd: RawFd,
}

impl FdSource {
    pub fn new(fd: RawFd) -> FdSource {
        FdSource {fd}
    }

    fn borrow(&self) -> BorrowedFd<'_> {
        unsafe {
            BorrowedFd::borrow_raw(self.fd)
        }
    }
}

impl DataSource for FdSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        sys::read_retry(self.borrow(), buf).map_err(io::Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        sys::write_retry(self.borrow(), buf).map_err(io::Error::from)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => (offset as i64, Whence::SeekSet),
            SeekFrom::Current(offset) => (offset, Whence::SeekCur),
            SeekFrom::End(offset) => (offset, Whence::SeekEnd),
        };

        unistd::lseek(self.borrow(), offset, whence)
            .map(|offset| offset as u64)
            .map_err(io::Error::from)
    }
}
