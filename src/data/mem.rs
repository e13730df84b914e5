use std::cmp;
use std::io::{self, SeekFrom};

use super::{DataSource, wipe};

const INITIAL_ALLOC: usize = 512;

/// Growable in-memory source/sink. Writes grow the buffer with exponential
/// backoff: when doubling can't be satisfied by the allocator, retry with
/// just enough room for the write at hand.
pub struct MemSource {
    buffer: Vec<u8>,
    offset: usize,
}

impl MemSource {
    pub fn new() -> MemSource {
        MemSource {buffer: Vec::new(), offset: 0}
    }

    pub fn with_buffer(buffer: Vec<u8>) -> MemSource {
        MemSource {buffer, offset: 0}
    }

    fn reserve(&mut self, additional: usize) -> io::Result<()> {
        let needed = self.offset + additional;
        if needed <= self.buffer.capacity() {
            return Ok(());
        }

        let greedy = cmp::max(cmp::max(2 * self.buffer.capacity(), INITIAL_ALLOC), needed);
        if self.buffer.try_reserve_exact(greedy - self.buffer.len()).is_err() {
            self.buffer.try_reserve_exact(needed - self.buffer.len()).map_err(|_| {
                io::Error::from(io::ErrorKind::OutOfMemory)
            })?;
        }

        Ok(())
    }
}

impl DataSource for MemSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let amount = cmp::min(self.buffer.len() - self.offset, buf.len());
        buf[..amount].copy_from_slice(&self.buffer[self.offset..self.offset + amount]);
        self.offset += amount;
        Ok(amount)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.reserve(buf.len())?;

        let overwrite = cmp::min(self.buffer.len() - self.offset, buf.len());
        self.buffer[self.offset..self.offset + overwrite].copy_from_slice(&buf[..overwrite]);
        self.buffer.extend_from_slice(&buf[overwrite..]);

        self.offset += buf.len();
        Ok(buf.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let length = self.buffer.len() as i64;
        let offset = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.offset as i64 + offset,
            SeekFrom::End(offset) => length + offset,
        };

        if offset < 0 || offset > length {
            return Err(io::ErrorKind::InvalidInput.into());
        }

        self.offset = offset as usize;
        Ok(self.offset as u64)
    }

    fn release(&mut self, sensitive: bool) {
        if sensitive {
            wipe(&mut self.buffer);
        }
    }

    fn take_memory(&mut self) -> Option<Vec<u8>> {
        Some(std::mem::take(&mut self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_seek() {
        let mut source = MemSource::with_buffer(b"Hallo Leute\n".to_vec());

        let mut buf = [0; 6];
        assert_eq!(source.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"Hallo ");

        assert_eq!(source.seek(SeekFrom::Start(0)).unwrap(), 0);
        assert_eq!(source.write(b"hallo").unwrap(), 5);
        assert_eq!(source.seek(SeekFrom::End(-6)).unwrap(), 6);

        let mut rest = Vec::new();
        loop {
            let mut buf = [0; 4];
            match source.read(&mut buf).unwrap() {
                0 => break,
                size => rest.extend_from_slice(&buf[..size]),
            }
        }
        assert_eq!(rest, b"Leute\n");

        assert_eq!(source.take_memory().unwrap(), b"hallo Leute\n");
    }

    #[test]
    fn growth() {
        let mut source = MemSource::new();

        source.write(b"x").unwrap();
        assert_eq!(source.buffer.capacity(), INITIAL_ALLOC);

        source.write(&[0; INITIAL_ALLOC]).unwrap();
        assert_eq!(source.buffer.capacity(), 2 * INITIAL_ALLOC);

        source.write(&[0; 8192]).unwrap();
        assert_eq!(source.buffer.capacity(), 1 + INITIAL_ALLOC + 8192);
    }

    #[test]
    fn seek_bounds() {
        let mut source = MemSource::with_buffer(vec![0; 10]);
        assert!(source.seek(SeekFrom::Start(11)).is_err());
        assert!(source.seek(SeekFrom::Current(-1)).is_err());
        assert!(source.seek(SeekFrom::End(1)).is_err());
        assert_eq!(source.seek(SeekFrom::End(0)).unwrap(), 10);
    }
}
