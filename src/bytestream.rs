use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;

/// Buffer size for the chunked zero read/write loops.
pub const CHUNK_SIZE: usize = 512;

/// Thin positioned-I/O layer over the open device handle.
///
/// Reserved regions are validated and emitted through `read_is_zero` and
/// `seek_write_zero`, which stream through a fixed buffer so a multi-megabyte
/// padding region never has to exist in memory.
pub struct ByteStream {
    file: File,
}

impl ByteStream {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Byte length of the underlying stream, by seeking to its end.
    pub fn len(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::End(0))?)
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Fill `buf` from the current position.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn seek_read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.seek(offset)?;
        self.read_exact(buf)
    }

    pub fn seek_write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// True if every byte in `[offset, offset + count)` is zero.
    pub fn read_is_zero(&mut self, offset: u64, count: u64) -> Result<bool> {
        let mut buf = [0u8; CHUNK_SIZE];
        self.seek(offset)?;
        let mut remaining = count;
        while remaining > 0 {
            let step = remaining.min(CHUNK_SIZE as u64) as usize;
            self.file.read_exact(&mut buf[..step])?;
            if buf[..step].iter().any(|&b| b != 0) {
                return Ok(false);
            }
            remaining -= step as u64;
        }
        Ok(true)
    }

    /// Write `count` zero bytes starting at `offset`.
    pub fn seek_write_zero(&mut self, offset: u64, count: u64) -> Result<()> {
        let buf = [0u8; CHUNK_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        let mut remaining = count;
        while remaining > 0 {
            let step = remaining.min(CHUNK_SIZE as u64) as usize;
            self.file.write_all(&buf[..step])?;
            remaining -= step as u64;
        }
        Ok(())
    }

    /// Copy `count` bytes from `from` to `to`, chunk by chunk. The regions
    /// must not overlap.
    pub fn copy_within(&mut self, from: u64, to: u64, count: u64) -> Result<()> {
        let mut buf = [0u8; CHUNK_SIZE];
        let mut done = 0u64;
        while done < count {
            let step = (count - done).min(CHUNK_SIZE as u64) as usize;
            self.seek_read(from + done, &mut buf[..step])?;
            self.seek_write(to + done, &buf[..step])?;
            done += step as u64;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }
}
