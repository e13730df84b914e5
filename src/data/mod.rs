mod callbacks;
mod file;
mod mem;

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::core::{Error, ErrorKind, ErrorSource, EmptyResult, OpResult};

pub use self::callbacks::{Callbacks, ReadCallback, WriteCallback, SeekCallback, ReleaseCallback};

/// Standard transfer buffer size when the data object doesn't configure one.
pub const DEFAULT_BUFFER_SIZE: usize = 512;
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Data passing hint forwarded to operations which care about the payload
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    None,
    Binary,
    Base64,
    Armor,
    Url,
    Pem,
    Mime,
}

/// The byte source/sink interface the engine driver pumps against. Sources
/// don't have to support every operation: the defaults report not-supported,
/// which is what callback-backed objects with missing callbacks rely on.
pub trait DataSource {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn release(&mut self, _sensitive: bool) {
    }

    /// The underlying kernel fd when there is one, allowing the driver to
    /// splice the object directly to the child.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    #[doc(hidden)]
    fn take_memory(&mut self) -> Option<Vec<u8>> {
        None
    }
}

struct Properties {
    blankout: Arc<AtomicBool>,
}

lazy_static! {
    // The process-wide property table. Keeping it outside of the objects
    // allows status handlers to poison a data object they don't own a
    // reference to (the owner may live on another thread).
    static ref PROPERTY_TABLE: Mutex<HashMap<u64, Properties>> =
        Mutex::new(HashMap::with_capacity(32));
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Suppresses all future reads of the data object with the passed serial
/// number. Returns false when the object is already gone, which callers
/// deliberately ignore.
pub fn set_blankout(serial: u64) -> bool {
    let table = PROPERTY_TABLE.lock().unwrap();
    match table.get(&serial) {
        Some(properties) => {
            properties.blankout.store(true, Ordering::Relaxed);
            true
        },
        None => false,
    }
}

pub fn get_blankout(serial: u64) -> bool {
    let table = PROPERTY_TABLE.lock().unwrap();
    table.get(&serial).is_some_and(|properties| properties.blankout.load(Ordering::Relaxed))
}

/// A polymorphic byte source/sink handed to operations. Owns its backing
/// source and a unique serial number in the process-wide property table.
pub struct Data {
    source: Box<dyn DataSource + Send>,
    serial: u64,
    blankout: Arc<AtomicBool>,
    encoding: Encoding,
    file_name: Option<String>,
    size_hint: Option<u64>,
    sensitive: bool,
    io_buffer_size: usize,
}

impl Data {
    pub fn from_source<S: DataSource + Send + 'static>(source: S) -> Data {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        let blankout = Arc::new(AtomicBool::new(false));

        PROPERTY_TABLE.lock().unwrap().insert(serial, Properties {
            blankout: blankout.clone(),
        });

        Data {
            source: Box::new(source),
            serial, blankout,
            encoding: Encoding::default(),
            file_name: None,
            size_hint: None,
            sensitive: false,
            io_buffer_size: 0,
        }
    }

    /// An empty growable in-memory sink.
    pub fn new() -> Data {
        Data::from_source(mem::MemSource::new())
    }

    pub fn from_vec(buffer: Vec<u8>) -> Data {
        Data::from_source(mem::MemSource::with_buffer(buffer))
    }

    pub fn from_bytes(buffer: &[u8]) -> Data {
        Data::from_vec(buffer.to_vec())
    }

    pub fn from_file(file: std::fs::File) -> Data {
        Data::from_source(file::FileSource::new(file))
    }

    /// Wraps a caller-owned fd. The fd must stay valid for the lifetime of
    /// the object and is not closed on release.
    pub fn from_fd(fd: RawFd) -> Data {
        Data::from_source(file::FdSource::new(fd))
    }

    pub fn from_callbacks(callbacks: callbacks::Callbacks) -> Data {
        Data::from_source(callbacks::CallbackSource::new(callbacks))
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn read(&mut self, buf: &mut [u8]) -> OpResult<usize> {
        if self.blankout.load(Ordering::Relaxed) {
            return Ok(0);
        }

        loop {
            match self.source.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => return result.map_err(Error::from),
            }
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> OpResult<usize> {
        loop {
            match self.source.write(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                result => return result.map_err(Error::from),
            }
        }
    }

    pub fn write_all(&mut self, mut buf: &[u8]) -> EmptyResult {
        while !buf.is_empty() {
            let size = self.write(buf)?;
            if size == 0 {
                return Err(Error::new(ErrorKind::Io, ErrorSource::Library));
            }
            buf = &buf[size..];
        }
        Ok(())
    }

    pub fn seek(&mut self, pos: SeekFrom) -> OpResult<u64> {
        self.source.seek(pos).map_err(Error::from)
    }

    pub fn rewind(&mut self) -> EmptyResult {
        self.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// The underlying kernel fd for fd- and file-backed objects.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.source.raw_fd()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn set_file_name<N: Into<String>>(&mut self, name: N) {
        self.file_name = Some(name.into());
    }

    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    pub fn set_size_hint(&mut self, size: u64) {
        self.size_hint = Some(size);
    }

    pub fn sensitive(&self) -> bool {
        self.sensitive
    }

    /// Marks the object as carrying sensitive payload: all internal buffers
    /// are zeroed before they are released.
    pub fn set_sensitive(&mut self, sensitive: bool) {
        self.sensitive = sensitive;
    }

    /// Configures the transfer buffer size used by the engine driver for
    /// this object. May be set only once. Values are capped at 1 MiB,
    /// values below the default fall back to the default, and the result is
    /// rounded up to a full KiB.
    pub fn set_io_buffer_size(&mut self, size: usize) -> EmptyResult {
        if self.io_buffer_size != 0 {
            return Err(Error::library(ErrorKind::Conflict));
        }

        let size = if size > MAX_BUFFER_SIZE {
            MAX_BUFFER_SIZE
        } else if size < DEFAULT_BUFFER_SIZE {
            0
        } else {
            size
        };

        self.io_buffer_size = size.div_ceil(1024) * 1024;
        Ok(())
    }

    pub(crate) fn transfer_buffer_size(&self) -> usize {
        match self.io_buffer_size {
            0 => DEFAULT_BUFFER_SIZE,
            size => size,
        }
    }

    /// Consumes the object and returns the accumulated bytes for in-memory
    /// objects. A blanked out object yields no data.
    pub fn into_bytes(mut self) -> Option<Vec<u8>> {
        let buffer = self.source.take_memory()?;
        if self.blankout.load(Ordering::Relaxed) {
            return Some(Vec::new());
        }
        Some(buffer)
    }
}

impl Default for Data {
    fn default() -> Data {
        Data::new()
    }
}

impl Drop for Data {
    fn drop(&mut self) {
        self.source.release(self.sensitive);
        PROPERTY_TABLE.lock().unwrap().remove(&self.serial);
    }
}

/// Zeroes a buffer in a way the compiler can't optimize away.
pub(crate) fn wipe(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        unsafe {
            std::ptr::write_volatile(byte, 0);
        }
    }
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}
