//! The byte-addressable `Storage` contract (§6.1) — the one external
//! collaborator this crate depends on and does not implement as part of the
//! core, plus two concrete implementations used by the test suite and CLI.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A byte-addressable backing store. Implementations must zero-fill newly
/// grown bytes on `resize` and must fail (rather than short-read/short-write)
/// if a `read`/`write` cannot be satisfied in full.
pub trait Storage {
    fn size(&self) -> u64;
    fn read(&mut self, position: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write(&mut self, position: u64, buf: &[u8]) -> io::Result<()>;
    fn resize(&mut self, new_size: u64) -> io::Result<()>;
}

/// An in-memory `Storage`, used by the unit and scenario test suites.
#[derive(Default)]
pub struct MemStorage {
    data: Vec<u8>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }
}

impl Storage for MemStorage {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, position: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = position as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "overflow"))?;
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of storage",
            ));
        }
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write(&mut self, position: u64, buf: &[u8]) -> io::Result<()> {
        let start = position as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "overflow"))?;
        if end > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past end of storage",
            ));
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn resize(&mut self, new_size: u64) -> io::Result<()> {
        self.data.resize(new_size as usize, 0);
        Ok(())
    }
}

/// A `Storage` backed by a regular OS file, for `nestfs-cli` and for tests
/// that want to exercise on-disk reopen behavior.
pub struct FileStorage {
    file: File,
    size: u64,
}

impl FileStorage {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Storage for FileStorage {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, position: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.read_exact(buf)
    }

    fn write(&mut self, position: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(buf)
    }

    fn resize(&mut self, new_size: u64) -> io::Result<()> {
        self.file.set_len(new_size)?;
        self.size = new_size;
        Ok(())
    }
}

/// Reads a `Pod` struct out of `storage` at `position`.
pub(crate) fn read_pod<T: bytemuck::Pod, S: Storage + ?Sized>(
    storage: &mut S,
    position: u64,
) -> io::Result<T> {
    let mut value = T::zeroed();
    let bytes = bytemuck::bytes_of_mut(&mut value);
    storage.read(position, bytes)?;
    Ok(value)
}

/// Writes a `Pod` struct into `storage` at `position`.
pub(crate) fn write_pod<T: bytemuck::Pod, S: Storage + ?Sized>(
    storage: &mut S,
    position: u64,
    value: &T,
) -> io::Result<()> {
    storage.write(position, bytemuck::bytes_of(value))
}
