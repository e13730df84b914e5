use std::io::{self, SeekFrom};

use super::DataSource;

pub type ReadCallback = Box<dyn FnMut(&mut [u8]) -> io::Result<usize> + Send>;
pub type WriteCallback = Box<dyn FnMut(&[u8]) -> io::Result<usize> + Send>;
pub type SeekCallback = Box<dyn FnMut(SeekFrom) -> io::Result<u64> + Send>;
pub type ReleaseCallback = Box<dyn FnOnce() + Send>;

/// Caller supplied I/O callbacks. Any of them may be omitted, in which case
/// the corresponding operation reports not-supported.
#[derive(Default)]
pub struct Callbacks {
    pub read: Option<ReadCallback>,
    pub write: Option<WriteCallback>,
    pub seek: Option<SeekCallback>,
    pub release: Option<ReleaseCallback>,
}

pub struct CallbackSource {
    callbacks: Callbacks,
}

impl CallbackSource {
    pub fn new(callbacks: Callbacks) -> CallbackSource {
        CallbackSource {callbacks}
    }
}

impl DataSource for CallbackSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.callbacks.read {
            Some(ref mut read) => read(buf),
            None => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.callbacks.write {
            Some(ref mut write) => write(buf),
            None => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self.callbacks.seek {
            Some(ref mut seek) => seek(pos),
            None => Err(io::ErrorKind::Unsupported.into()),
        }
    }

    fn release(&mut self, _sensitive: bool) {
        if let Some(release) = self.callbacks.release.take() {
            release();
        }
    }
}
